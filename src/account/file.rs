//! File-backed account store.
//!
//! Accounts live in memory and are persisted as a single YAML document on
//! every mutation. Good for small shards and for tests, which usually run
//! it without a backing path.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{Account, AccountDb, START_ACCOUNT_NUM};

struct Inner {
    accounts: HashMap<u32, Account>,
    next_id: u32,
}

pub struct FileAccountDb {
    path: Option<PathBuf>,
    case_sensitive: bool,
    inner: Mutex<Inner>,
}

impl FileAccountDb {
    /// In-memory store with no persistence.
    pub fn memory(case_sensitive: bool) -> Self {
        Self {
            path: None,
            case_sensitive,
            inner: Mutex::new(Inner {
                accounts: HashMap::new(),
                next_id: START_ACCOUNT_NUM,
            }),
        }
    }

    /// Open (or initialize) a store backed by `path`.
    pub fn open<P: AsRef<Path>>(path: P, case_sensitive: bool) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut accounts = HashMap::new();
        let mut next_id = START_ACCOUNT_NUM;

        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let list: Vec<Account> = serde_yaml::from_str(&contents)?;
            for acc in list {
                next_id = next_id.max(acc.account_id + 1);
                accounts.insert(acc.account_id, acc);
            }
        }
        tracing::info!(
            "[account] [file_open] path={} accounts={}",
            path.display(),
            accounts.len()
        );

        Ok(Self {
            path: Some(path),
            case_sensitive,
            inner: Mutex::new(Inner { accounts, next_id }),
        })
    }

    /// Insert an account keeping its id as-is. Used for seeding server
    /// ('S') accounts, whose ids must stay below the roster size.
    pub async fn insert(&self, account: Account) {
        let mut inner = self.inner.lock().await;
        inner.next_id = inner.next_id.max(account.account_id + 1).max(START_ACCOUNT_NUM);
        inner.accounts.insert(account.account_id, account);
        self.persist(&inner);
    }

    fn persist(&self, inner: &Inner) {
        let Some(path) = &self.path else {
            return;
        };
        let mut list: Vec<&Account> = inner.accounts.values().collect();
        list.sort_by_key(|a| a.account_id);
        match serde_yaml::to_string(&list) {
            Ok(doc) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).ok();
                }
                if let Err(e) = std::fs::write(path, doc) {
                    tracing::error!("[account] [file_write_failed] path={} err={}", path.display(), e);
                }
            }
            Err(e) => tracing::error!("[account] [file_encode_failed] err={}", e),
        }
    }

    fn name_matches(&self, a: &str, b: &str) -> bool {
        if self.case_sensitive {
            a == b
        } else {
            a.eq_ignore_ascii_case(b)
        }
    }
}

#[async_trait]
impl AccountDb for FileAccountDb {
    async fn load_by_id(&self, account_id: u32) -> Option<Account> {
        self.inner.lock().await.accounts.get(&account_id).cloned()
    }

    async fn load_by_name(&self, userid: &str) -> Option<Account> {
        let inner = self.inner.lock().await;
        inner
            .accounts
            .values()
            .find(|a| self.name_matches(&a.userid, userid))
            .cloned()
    }

    async fn create(&self, mut account: Account) -> Option<u32> {
        let mut inner = self.inner.lock().await;
        if inner
            .accounts
            .values()
            .any(|a| self.name_matches(&a.userid, &account.userid))
        {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        account.account_id = id;
        inner.accounts.insert(id, account);
        self.persist(&inner);
        Some(id)
    }

    async fn save(&self, account: &Account) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.accounts.contains_key(&account.account_id) {
            return false;
        }
        inner.accounts.insert(account.account_id, account.clone());
        self.persist(&inner);
        true
    }

    async fn iter(&self) -> Vec<Account> {
        let inner = self.inner.lock().await;
        let mut list: Vec<Account> = inner.accounts.values().cloned().collect();
        list.sort_by_key(|a| a.account_id);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(userid: &str) -> Account {
        Account {
            account_id: 0,
            userid: userid.to_string(),
            pass: "secret".into(),
            sex: 'M',
            level: 0,
            state: 0,
            email: "a@a.com".into(),
            expiration_time: 0,
            unban_time: 0,
            lastlogin: "-".into(),
            last_ip: "-".into(),
            logincount: 0,
            account_reg2: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_create_assigns_user_range_ids() {
        let db = FileAccountDb::memory(true);
        let a = db.create(sample("alice")).await.unwrap();
        let b = db.create(sample("bob")).await.unwrap();
        assert!(a >= START_ACCOUNT_NUM);
        assert_eq!(b, a + 1);
    }

    #[tokio::test]
    async fn test_create_refuses_duplicate_name() {
        let db = FileAccountDb::memory(true);
        db.create(sample("alice")).await.unwrap();
        assert!(db.create(sample("alice")).await.is_none());
    }

    #[tokio::test]
    async fn test_case_insensitive_lookup() {
        let db = FileAccountDb::memory(false);
        db.create(sample("Alice")).await.unwrap();
        assert!(db.load_by_name("alice").await.is_some());
        assert!(db.load_by_name("ALICE").await.is_some());

        let strict = FileAccountDb::memory(true);
        strict.create(sample("Alice")).await.unwrap();
        assert!(strict.load_by_name("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_save_requires_existing() {
        let db = FileAccountDb::memory(true);
        let id = db.create(sample("alice")).await.unwrap();
        let mut acc = db.load_by_id(id).await.unwrap();
        acc.logincount = 7;
        assert!(db.save(&acc).await);
        assert_eq!(db.load_by_id(id).await.unwrap().logincount, 7);

        let mut ghost = sample("ghost");
        ghost.account_id = 1;
        assert!(!db.save(&ghost).await);
    }

    #[tokio::test]
    async fn test_persist_round_trip() {
        let dir = std::env::temp_dir().join("yggdrasil_file_db_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("accounts.yaml");
        std::fs::remove_file(&path).ok();

        let id = {
            let db = FileAccountDb::open(&path, true).unwrap();
            db.create(sample("alice")).await.unwrap()
        };

        let db = FileAccountDb::open(&path, true).unwrap();
        let acc = db.load_by_id(id).await.unwrap();
        assert_eq!(acc.userid, "alice");
        // ids keep advancing past reloaded records
        let next = db.create(sample("bob")).await.unwrap();
        assert!(next > id);

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_insert_keeps_low_server_ids() {
        let db = FileAccountDb::memory(true);
        let mut srv = sample("charserver");
        srv.account_id = 5;
        srv.sex = 'S';
        db.insert(srv).await;
        assert_eq!(db.load_by_id(5).await.unwrap().sex, 'S');
        // user creation is unaffected
        assert!(db.create(sample("alice")).await.unwrap() >= START_ACCOUNT_NUM);
    }
}
