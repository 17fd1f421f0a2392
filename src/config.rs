//! Login server configuration.
//!
//! Parses the legacy `key: value` configuration format: one setting per
//! line, `//` comments, and `import: path` includes. Unknown keys are
//! ignored so the same file can be shared with other servers.

use anyhow::{Context, Result};
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

/// Which account store variant to open at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    File,
    Sql,
}

#[derive(Debug, Clone)]
pub struct LoginConfig {
    pub bind_ip: Ipv4Addr,
    pub login_port: u16,
    pub log_login: bool,
    /// Allow inline account creation via the `_M`/`_F` userid suffix.
    pub new_account: bool,
    /// Initial validity (seconds) of auto-registered accounts; -1 = unlimited.
    pub start_limited_time: i64,
    pub check_client_version: bool,
    pub client_version_to_connect: u32,
    pub use_md5_passwords: bool,
    pub min_level_to_connect: u8,
    /// strftime-style format used for ban timestamps sent to clients.
    pub date_format: String,
    pub console: bool,
    pub case_sensitive: bool,
    /// Registration flood protection: at most `allowed_regs` creations
    /// per `time_allowed` seconds.
    pub allowed_regs: u32,
    pub time_allowed: u32,
    pub online_check: bool,
    pub use_dnsbl: bool,
    /// Comma-separated DNSBL zones.
    pub dnsbl_servers: String,
    /// Interval (ms) between 0x2735 broadcasts; 0 disables them.
    pub ip_sync_interval: u64,

    pub ipban: bool,
    pub dynamic_pass_failure_ban: bool,
    /// Failure window, minutes.
    pub dynamic_pass_failure_ban_interval: u32,
    pub dynamic_pass_failure_ban_limit: u32,
    /// Ban duration, minutes.
    pub dynamic_pass_failure_ban_duration: u32,

    pub account_storage: StorageBackend,
    pub accounts_file: String,

    pub sql_ip: String,
    pub sql_port: u16,
    pub sql_id: String,
    pub sql_pw: String,
    pub sql_db: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            bind_ip: Ipv4Addr::UNSPECIFIED,
            login_port: 6900,
            log_login: true,
            new_account: true,
            start_limited_time: -1,
            check_client_version: false,
            client_version_to_connect: 20,
            use_md5_passwords: false,
            min_level_to_connect: 0,
            date_format: "%Y-%m-%d %H:%M:%S".to_string(),
            console: false,
            case_sensitive: true,
            allowed_regs: 1,
            time_allowed: 10,
            online_check: true,
            use_dnsbl: false,
            dnsbl_servers: String::new(),
            ip_sync_interval: 0,
            ipban: true,
            dynamic_pass_failure_ban: true,
            dynamic_pass_failure_ban_interval: 5,
            dynamic_pass_failure_ban_limit: 7,
            dynamic_pass_failure_ban_duration: 5,
            account_storage: StorageBackend::File,
            accounts_file: "save/accounts.yaml".to_string(),
            sql_ip: "127.0.0.1".to_string(),
            sql_port: 3306,
            sql_id: String::new(),
            sql_pw: String::new(),
            sql_db: String::new(),
        }
    }
}

/// Parse a boolean switch the way the old servers did: `on`/`yes`/`true`
/// and nonzero numbers are true, everything else is false.
pub fn config_switch(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "on" | "yes" | "true")
        || value.parse::<i64>().map(|n| n != 0).unwrap_or(false)
}

impl LoginConfig {
    /// Load configuration from a file, following `import:` lines.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = LoginConfig::default();
        config.read_into(path.as_ref())?;
        Ok(config)
    }

    /// Parse configuration from a string (imports are not followed).
    pub fn from_str(contents: &str) -> Self {
        let mut config = LoginConfig::default();
        config.apply_lines(contents, None);
        config
    }

    fn read_into(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config file: {}", path.display()))?;
        tracing::info!("[config] [read] file={}", path.display());
        self.apply_lines(&contents, Some(path));
        Ok(())
    }

    fn apply_lines(&mut self, contents: &str, origin: Option<&Path>) {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            self.apply(key.trim(), value.trim(), origin);
        }
    }

    fn apply(&mut self, key: &str, value: &str, origin: Option<&Path>) {
        match key.to_ascii_lowercase().as_str() {
            "bind_ip" => match value.parse() {
                Ok(ip) => self.bind_ip = ip,
                Err(_) => tracing::warn!("[config] [bad_value] key=bind_ip value={}", value),
            },
            "login_port" => set_num(&mut self.login_port, key, value),
            "log_login" => self.log_login = config_switch(value),
            "new_account" => self.new_account = config_switch(value),
            "start_limited_time" => set_num(&mut self.start_limited_time, key, value),
            "check_client_version" => self.check_client_version = config_switch(value),
            "client_version_to_connect" => {
                set_num(&mut self.client_version_to_connect, key, value)
            }
            "use_md5_passwords" => self.use_md5_passwords = config_switch(value),
            "min_level_to_connect" => set_num(&mut self.min_level_to_connect, key, value),
            "date_format" => self.date_format = value.to_string(),
            "console" => self.console = config_switch(value),
            "case_sensitive" => self.case_sensitive = config_switch(value),
            "allowed_regs" => set_num(&mut self.allowed_regs, key, value),
            "time_allowed" => set_num(&mut self.time_allowed, key, value),
            "online_check" => self.online_check = config_switch(value),
            "use_dnsbl" => self.use_dnsbl = config_switch(value),
            "dnsbl_servers" => self.dnsbl_servers = value.to_string(),
            // the file carries minutes, we keep milliseconds
            "ip_sync_interval" => match value.parse::<u64>() {
                Ok(minutes) => self.ip_sync_interval = minutes * 60 * 1000,
                Err(_) => {
                    tracing::warn!("[config] [bad_value] key=ip_sync_interval value={}", value)
                }
            },
            "ipban" => self.ipban = config_switch(value),
            "dynamic_pass_failure_ban" => self.dynamic_pass_failure_ban = config_switch(value),
            "dynamic_pass_failure_ban_interval" => {
                set_num(&mut self.dynamic_pass_failure_ban_interval, key, value)
            }
            "dynamic_pass_failure_ban_limit" => {
                set_num(&mut self.dynamic_pass_failure_ban_limit, key, value)
            }
            "dynamic_pass_failure_ban_duration" => {
                set_num(&mut self.dynamic_pass_failure_ban_duration, key, value)
            }
            "account_storage" => match value.to_ascii_lowercase().as_str() {
                "file" | "txt" => self.account_storage = StorageBackend::File,
                "sql" => self.account_storage = StorageBackend::Sql,
                _ => tracing::warn!("[config] [bad_value] key=account_storage value={}", value),
            },
            "accounts_file" => self.accounts_file = value.to_string(),
            "sql_ip" => self.sql_ip = value.to_string(),
            "sql_port" => set_num(&mut self.sql_port, key, value),
            "sql_id" => self.sql_id = value.to_string(),
            "sql_pw" => self.sql_pw = value.to_string(),
            "sql_db" => self.sql_db = value.to_string(),
            "import" => {
                let target = match origin.and_then(|p| p.parent()) {
                    Some(dir) if !value.starts_with('/') => dir.join(value),
                    _ => Path::new(value).to_path_buf(),
                };
                if let Err(e) = self.read_into(&target) {
                    tracing::warn!("[config] [import_failed] file={} err={}", value, e);
                }
            }
            _ => {}
        }
    }
}

fn set_num<T: std::str::FromStr>(slot: &mut T, key: &str, value: &str) {
    match value.parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!("[config] [bad_value] key={} value={}", key, value),
    }
}
