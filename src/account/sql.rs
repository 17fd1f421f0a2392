//! MySQL-backed account store.
//!
//! Expects the classic `login` table plus an `acc_reg2` key/value table.
//! Query failures surface as "not found"; callers never retry.

use async_trait::async_trait;
use sqlx::MySqlPool;

use super::{Account, AccountDb, START_ACCOUNT_NUM};

pub struct SqlAccountDb {
    pool: MySqlPool,
    case_sensitive: bool,
}

type AccountRow = (
    u32,    // account_id
    String, // userid
    String, // user_pass
    String, // sex
    u8,     // level
    u32,    // state
    String, // email
    i64,    // expiration_time
    i64,    // unban_time
    String, // lastlogin
    String, // last_ip
    u32,    // logincount
);

const ACCOUNT_COLUMNS: &str = "`account_id`, `userid`, `user_pass`, `sex`, `level`, `state`, \
     `email`, `expiration_time`, `unban_time`, `lastlogin`, `last_ip`, `logincount`";

impl SqlAccountDb {
    pub fn new(pool: MySqlPool, case_sensitive: bool) -> Self {
        Self { pool, case_sensitive }
    }

    async fn finish(&self, row: AccountRow) -> Account {
        let account_reg2: Vec<(String, String)> = sqlx::query_as(
            "SELECT `str`, `value` FROM `acc_reg2` WHERE `account_id` = ? ORDER BY `str`",
        )
        .bind(row.0)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        Account {
            account_id: row.0,
            userid: row.1,
            pass: row.2,
            sex: row.3.chars().next().unwrap_or('M'),
            level: row.4,
            state: row.5,
            email: row.6,
            expiration_time: row.7,
            unban_time: row.8,
            lastlogin: row.9,
            last_ip: row.10,
            logincount: row.11,
            account_reg2,
        }
    }

    async fn save_reg2(&self, account: &Account) {
        let _ = sqlx::query("DELETE FROM `acc_reg2` WHERE `account_id` = ?")
            .bind(account.account_id)
            .execute(&self.pool)
            .await;
        for (key, value) in &account.account_reg2 {
            let _ = sqlx::query(
                "INSERT INTO `acc_reg2` (`account_id`, `str`, `value`) VALUES (?, ?, ?)",
            )
            .bind(account.account_id)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await;
        }
    }
}

#[async_trait]
impl AccountDb for SqlAccountDb {
    async fn load_by_id(&self, account_id: u32) -> Option<Account> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM `login` WHERE `account_id` = ?"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .unwrap_or(None);
        match row {
            Some(row) => Some(self.finish(row).await),
            None => None,
        }
    }

    async fn load_by_name(&self, userid: &str) -> Option<Account> {
        // collation usually handles case; BINARY forces it when required
        let query = if self.case_sensitive {
            format!("SELECT {ACCOUNT_COLUMNS} FROM `login` WHERE BINARY `userid` = ?")
        } else {
            format!("SELECT {ACCOUNT_COLUMNS} FROM `login` WHERE `userid` = ?")
        };
        let row: Option<AccountRow> = sqlx::query_as(&query)
            .bind(userid)
            .fetch_optional(&self.pool)
            .await
            .unwrap_or(None);
        match row {
            Some(row) => Some(self.finish(row).await),
            None => None,
        }
    }

    async fn create(&self, account: Account) -> Option<u32> {
        let next: Option<(Option<u32>,)> =
            sqlx::query_as("SELECT MAX(`account_id`) FROM `login`")
                .fetch_optional(&self.pool)
                .await
                .unwrap_or(None);
        let account_id = next
            .and_then(|(max,)| max)
            .map(|max| max + 1)
            .unwrap_or(START_ACCOUNT_NUM)
            .max(START_ACCOUNT_NUM);

        let result = sqlx::query(
            "INSERT INTO `login` (`account_id`, `userid`, `user_pass`, `sex`, `level`, `state`, \
             `email`, `expiration_time`, `unban_time`, `lastlogin`, `last_ip`, `logincount`) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account_id)
        .bind(&account.userid)
        .bind(&account.pass)
        .bind(account.sex.to_string())
        .bind(account.level)
        .bind(account.state)
        .bind(&account.email)
        .bind(account.expiration_time)
        .bind(account.unban_time)
        .bind(&account.lastlogin)
        .bind(&account.last_ip)
        .bind(account.logincount)
        .execute(&self.pool)
        .await;

        result.ok().map(|_| account_id)
    }

    async fn save(&self, account: &Account) -> bool {
        let result = sqlx::query(
            "UPDATE `login` SET `userid` = ?, `user_pass` = ?, `sex` = ?, `level` = ?, \
             `state` = ?, `email` = ?, `expiration_time` = ?, `unban_time` = ?, \
             `lastlogin` = ?, `last_ip` = ?, `logincount` = ? WHERE `account_id` = ?",
        )
        .bind(&account.userid)
        .bind(&account.pass)
        .bind(account.sex.to_string())
        .bind(account.level)
        .bind(account.state)
        .bind(&account.email)
        .bind(account.expiration_time)
        .bind(account.unban_time)
        .bind(&account.lastlogin)
        .bind(&account.last_ip)
        .bind(account.logincount)
        .bind(account.account_id)
        .execute(&self.pool)
        .await;

        let ok = result.map(|r| r.rows_affected() > 0).unwrap_or(false);
        if ok {
            self.save_reg2(account).await;
        }
        ok
    }

    async fn iter(&self) -> Vec<Account> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM `login` ORDER BY `account_id`"
        ))
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            accounts.push(self.finish(row).await);
        }
        accounts
    }
}

#[cfg(test)]
mod tests {
    // SQL integration tests require a live DATABASE_URL; skipped in CI.
    // Behavior shared with the file variant is covered in account/file.rs.
}
