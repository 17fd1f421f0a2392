//! Account records and the pluggable account store.
//!
//! The core only ever talks to [`AccountDb`]; the file-backed and
//! SQL-backed variants live in the submodules. Store failures are
//! indistinguishable from "record not found" and are never retried.

pub mod file;
pub mod sql;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// User accounts are assigned ids starting here; smaller ids are reserved
/// for server ('S') accounts, whose id doubles as their roster slot.
pub const START_ACCOUNT_NUM: u32 = 2_000_000;

/// Maximum number of account-scoped registry pairs.
pub const ACCOUNT_REG2_NUM: usize = 16;

/// Userids are at most 23 bytes (24 with the wire NUL).
pub const NAME_LENGTH: usize = 24;

/// Placeholder address given to accounts created without an e-mail.
pub const DEFAULT_EMAIL: &str = "a@a.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: u32,
    pub userid: String,
    /// Cleartext, or the hex MD5 of it when `use_MD5_passwords` is set.
    pub pass: String,
    /// 'M', 'F', or 'S' for server accounts.
    pub sex: char,
    pub level: u8,
    /// 0 = OK; a nonzero state n is reported to the client as code n-1.
    pub state: u32,
    pub email: String,
    /// Unix seconds; 0 = never expires.
    pub expiration_time: i64,
    /// Unix seconds; 0 = not banned.
    pub unban_time: i64,
    pub lastlogin: String,
    pub last_ip: String,
    pub logincount: u32,
    #[serde(default)]
    pub account_reg2: Vec<(String, String)>,
}

impl Account {
    pub fn has_default_email(&self) -> bool {
        self.email.is_empty() || self.email == DEFAULT_EMAIL
    }
}

/// The capability set the core depends on. Creation assigns and returns
/// the new id (>= [`START_ACCOUNT_NUM`]).
#[async_trait]
pub trait AccountDb: Send + Sync {
    async fn load_by_id(&self, account_id: u32) -> Option<Account>;
    async fn load_by_name(&self, userid: &str) -> Option<Account>;
    async fn create(&self, account: Account) -> Option<u32>;
    async fn save(&self, account: &Account) -> bool;
    async fn iter(&self) -> Vec<Account>;
}

/// Minimal e-mail sanity check: 3..=39 bytes, one well-placed '@', no
/// spaces, semicolons, dot adjacency around the '@', or control
/// characters.
pub fn email_check(email: &str) -> bool {
    let len = email.len();
    if !(3..=39).contains(&len) {
        return false;
    }
    let bytes = email.as_bytes();
    let Some(at) = email.rfind('@') else {
        return false;
    };
    if at == 0 || at == len - 1 || bytes[len - 1] == b'.' {
        return false;
    }
    if bytes[at - 1] == b'.' || bytes[at + 1] == b'.' {
        return false;
    }
    if email.contains(' ') || email.contains(';') {
        return false;
    }
    !bytes.iter().any(|&b| b < 0x20)
}
