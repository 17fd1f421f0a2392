//! Credential verification and the client authentication pipeline.

use md5::{Digest, Md5};
use rand::RngExt;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use super::{unix_now, LoginState};
use crate::account::{Account, DEFAULT_EMAIL, START_ACCOUNT_NUM};
use crate::network::dnsbl;

/// Challenge clients may answer with MD5(key‖pass) or MD5(pass‖key);
/// both accept bits are set for the 0x01dd login variant.
pub const PASSWORD_ENC_BOTH: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmittedPassword {
    Clear(String),
    Digest([u8; 16]),
}

/// Per-connection login state gathered while parsing packets.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub userid: String,
    pub passwd: SubmittedPassword,
    pub passwdenc: u8,
    pub version: u32,
    /// Challenge key issued on 0x01db, 12..=15 bytes of [1,255].
    pub md5_key: Vec<u8>,
    pub account_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: char,
    pub level: u8,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            userid: String::new(),
            passwd: SubmittedPassword::Clear(String::new()),
            passwdenc: 0,
            version: 0,
            md5_key: Vec::new(),
            account_id: 0,
            login_id1: 0,
            login_id2: 0,
            sex: 'M',
            level: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted,
    Refused(u8),
}

pub fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// MD5 over `head‖tail` compared against a submitted digest.
/// The concatenation is built in a 64-byte working buffer, so over-long
/// input truncates at 63 bytes before hashing; reproduced on purpose.
pub fn check_encrypted(head: &[u8], tail: &[u8], digest: &[u8; 16]) -> bool {
    let mut work = [0u8; 63];
    let mut len = 0;
    for &b in head.iter().chain(tail.iter()) {
        if len == work.len() {
            break;
        }
        work[len] = b;
        len += 1;
    }
    Md5::digest(&work[..len])[..] == digest[..]
}

/// Verify a submitted password against the stored one.
/// `passwdenc` 0 means cleartext equality; otherwise bit 0 accepts the
/// key-first digest and bit 1 the key-last digest.
pub fn check_password(
    md5_key: &[u8],
    passwdenc: u8,
    submitted: &SubmittedPassword,
    refpass: &str,
) -> bool {
    match submitted {
        SubmittedPassword::Clear(pass) => passwdenc == 0 && pass == refpass,
        SubmittedPassword::Digest(digest) => {
            passwdenc != 0
                && (((passwdenc & 0x01) != 0 && check_encrypted(md5_key, refpass.as_bytes(), digest))
                    || ((passwdenc & 0x02) != 0
                        && check_encrypted(refpass.as_bytes(), md5_key, digest)))
        }
    }
}

/// Process-wide registration flood window: at most `allowed_regs`
/// creations per `time_allowed` seconds. The window starts lazily on the
/// first creation after expiry.
#[derive(Debug, Default)]
pub struct RegThrottle {
    num_regs: u32,
    window_until: Option<Instant>,
}

impl RegThrottle {
    pub fn allow(&self, allowed: u32, now: Instant) -> bool {
        match self.window_until {
            Some(until) if now < until => self.num_regs < allowed,
            _ => true,
        }
    }

    pub fn note_creation(&mut self, window: Duration, now: Instant) {
        match self.window_until {
            Some(until) if now < until => {}
            _ => {
                self.num_regs = 0;
                self.window_until = Some(now + window);
            }
        }
        self.num_regs += 1;
    }
}

/// Create an account for the `_M`/`_F` inline registration path.
/// Returns the refusal code, or None when the account was created.
async fn mmo_auth_new(state: &LoginState, userid: &str, passwd: &str, sex: char) -> Option<u8> {
    let mut throttle = state.reg_throttle.lock().await;
    let now = Instant::now();
    if !throttle.allow(state.config.allowed_regs, now) {
        tracing::info!("[login] [register_throttled] user={}", userid);
        return Some(3);
    }

    if state.accounts.load_by_name(userid).await.is_some() {
        tracing::info!("[login] [register_collision] user={}", userid);
        return Some(1);
    }

    let pass = if state.config.use_md5_passwords {
        md5_hex(passwd)
    } else {
        passwd.to_string()
    };
    let expiration_time = if state.config.start_limited_time != -1 {
        unix_now() + state.config.start_limited_time
    } else {
        0
    };
    let account = Account {
        account_id: 0,
        userid: userid.to_string(),
        pass,
        sex,
        level: 0,
        state: 0,
        email: DEFAULT_EMAIL.to_string(),
        expiration_time,
        unban_time: 0,
        lastlogin: "-".to_string(),
        last_ip: "-".to_string(),
        logincount: 0,
        account_reg2: Vec::new(),
    };

    match state.accounts.create(account).await {
        Some(account_id) => {
            tracing::info!("[login] [register] user={} id={} sex={}", userid, account_id, sex);
            throttle.note_creation(Duration::from_secs(state.config.time_allowed as u64), now);
            None
        }
        None => Some(3),
    }
}

/// The ordered authentication pipeline. On success the session carries
/// fresh login ids and the account's identity; the account record is
/// updated and written back.
pub async fn mmo_auth(state: &LoginState, sd: &mut SessionData, ip: Ipv4Addr) -> AuthOutcome {
    use AuthOutcome::Refused;

    if state.config.use_dnsbl
        && dnsbl::is_blacklisted(state.resolver.as_ref(), &state.config.dnsbl_servers, ip).await
    {
        return Refused(3);
    }

    if state.config.check_client_version && sd.version != state.config.client_version_to_connect {
        return Refused(5);
    }

    // inline registration: "<name>_M" / "<name>_F" with a cleartext password
    if state.config.new_account {
        if let SubmittedPassword::Clear(pass) = sd.passwd.clone() {
            let bytes = sd.userid.clone().into_bytes();
            let len = bytes.len();
            if len > 2
                && !pass.is_empty()
                && sd.passwdenc == 0
                && bytes[len - 2] == b'_'
                && matches!(bytes[len - 1], b'F' | b'f' | b'M' | b'm')
            {
                let sex = (bytes[len - 1] as char).to_ascii_uppercase();
                sd.userid.truncate(len - 2);
                let userid = sd.userid.clone();
                if let Some(code) = mmo_auth_new(state, &userid, &pass, sex).await {
                    return Refused(code);
                }
            }
        }
    }

    let Some(mut acc) = state.accounts.load_by_name(&sd.userid).await else {
        tracing::info!("[login] [unknown_account] user={} ip={}", sd.userid, ip);
        return Refused(0);
    };

    let submitted = match &sd.passwd {
        SubmittedPassword::Clear(pass) if state.config.use_md5_passwords => {
            SubmittedPassword::Clear(md5_hex(pass))
        }
        other => other.clone(),
    };
    if !check_password(&sd.md5_key, sd.passwdenc, &submitted, &acc.pass) {
        tracing::info!("[login] [bad_password] user={} ip={}", sd.userid, ip);
        return Refused(1);
    }

    if acc.expiration_time != 0 && acc.expiration_time < unix_now() {
        tracing::info!("[login] [expired] user={} ip={}", sd.userid, ip);
        return Refused(2);
    }

    if acc.unban_time != 0 && acc.unban_time > unix_now() {
        tracing::info!("[login] [banned] user={} until={} ip={}", sd.userid, acc.unban_time, ip);
        return Refused(6);
    }

    if acc.state != 0 {
        tracing::info!("[login] [state_refusal] user={} state={} ip={}", sd.userid, acc.state, ip);
        return Refused(acc.state.saturating_sub(1).min(u8::MAX as u32) as u8);
    }

    tracing::info!("[login] [accepted] user={} id={} ip={}", sd.userid, acc.account_id, ip);

    sd.account_id = acc.account_id;
    sd.login_id1 = rand::rng().random();
    sd.login_id2 = rand::rng().random();
    sd.sex = acc.sex;
    sd.level = acc.level;

    acc.lastlogin = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    acc.last_ip = ip.to_string();
    acc.unban_time = 0;
    acc.logincount += 1;
    state.accounts.save(&acc).await;

    if sd.sex != 'S' && sd.account_id < START_ACCOUNT_NUM {
        tracing::warn!(
            "[login] [low_account_id] user={} id={} expected>={}",
            sd.userid,
            sd.account_id,
            START_ACCOUNT_NUM
        );
    }

    AuthOutcome::Accepted
}
