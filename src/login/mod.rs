//! Login server core: authentication authority, one-time ticket issuer,
//! and online-presence bookkeeper for the attached char-servers.
//!
//! A single [`LoginState`] owns every mutable table; connection tasks and
//! timers receive it as an `Arc` and never reach into globals.

pub mod auth;
pub mod client;
pub mod interserver;
pub mod packet;

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::account::file::FileAccountDb;
use crate::account::AccountDb;
use crate::config::LoginConfig;
use crate::network::dnsbl::{HostResolver, TokioResolver};
use crate::network::ipban::IpBanList;
use crate::network::subnet::SubnetList;
use self::auth::RegThrottle;

/// Size of the char-server roster; slot index == server account id.
pub const MAX_SERVERS: usize = 30;

/// Lifetime of an unredeemed auth ticket and of a login-only presence.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// One-time auth ticket, redeemable by exactly one char-server.
/// Redemption must match every field byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthNode {
    pub account_id: u32,
    pub login_id1: u32,
    pub login_id2: u32,
    pub sex: char,
    pub ip: Ipv4Addr,
}

/// Where an online account currently lives.
/// `char_server`: -1 = authed but not yet on a char-server,
/// -2 = orphaned by a char-server disconnect, >= 0 = attached slot.
#[derive(Debug)]
pub struct OnlineLoginData {
    pub account_id: u32,
    pub char_server: i32,
    pub waiting_disconnect: Option<u64>,
}

pub struct CharServerSlot {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub users: u32,
    pub maintenance: u16,
    pub new_server: u16,
    /// Writer channel; the peer's writer task drains it in order.
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct LoginState {
    pub config: LoginConfig,
    pub accounts: Arc<dyn AccountDb>,
    pub subnets: SubnetList,
    pub resolver: Arc<dyn HostResolver>,
    /// account_id -> unredeemed ticket
    pub auth_db: Mutex<HashMap<u32, AuthNode>>,
    /// account_id -> presence
    pub online_db: Mutex<HashMap<u32, OnlineLoginData>>,
    pub servers: Mutex<[Option<CharServerSlot>; MAX_SERVERS]>,
    pub ipban: Mutex<IpBanList>,
    pub reg_throttle: Mutex<RegThrottle>,
    next_timer_id: AtomicU64,
}

impl LoginState {
    pub fn new(config: LoginConfig, accounts: Arc<dyn AccountDb>, subnets: SubnetList) -> Self {
        let ipban = IpBanList::from_config(&config);
        Self {
            config,
            accounts,
            subnets,
            resolver: Arc::new(TokioResolver),
            auth_db: Mutex::new(HashMap::new()),
            online_db: Mutex::new(HashMap::new()),
            servers: Mutex::new(std::array::from_fn(|_| None)),
            ipban: Mutex::new(ipban),
            reg_throttle: Mutex::new(RegThrottle::default()),
            next_timer_id: AtomicU64::new(1),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// In-memory state for tests: empty file store, default config.
    pub fn test_only() -> Self {
        Self::new(
            LoginConfig::default(),
            Arc::new(FileAccountDb::memory(true)),
            SubnetList::default(),
        )
    }

    // ---------------------------------------------------------------
    // Online presence
    // ---------------------------------------------------------------

    /// Attach (or create) the presence for `account_id` and cancel any
    /// pending disconnect timer. No-op unless `online_check` is set.
    pub async fn add_online_user(&self, char_server: i32, account_id: u32) {
        if !self.config.online_check {
            return;
        }
        let mut online = self.online_db.lock().await;
        let entry = online.entry(account_id).or_insert(OnlineLoginData {
            account_id,
            char_server: -1,
            waiting_disconnect: None,
        });
        entry.char_server = char_server;
        entry.waiting_disconnect = None;
    }

    pub async fn remove_online_user(&self, account_id: u32) {
        if !self.config.online_check {
            return;
        }
        self.online_db.lock().await.remove(&account_id);
    }

    /// `server == -1`: detach everyone (login-only, timers cancelled).
    /// Otherwise orphan every presence attached to that slot.
    pub async fn set_offline(&self, server: i32) {
        let mut online = self.online_db.lock().await;
        for entry in online.values_mut() {
            if server == -1 {
                entry.char_server = -1;
                entry.waiting_disconnect = None;
            } else if entry.char_server == server {
                entry.char_server = -2;
            }
        }
    }

    /// Drop presences orphaned by a vanished char-server.
    pub async fn online_data_cleanup(&self) {
        let mut online = self.online_db.lock().await;
        let before = online.len();
        online.retain(|_, entry| entry.char_server != -2);
        let dropped = before - online.len();
        if dropped > 0 {
            tracing::info!("[login] [presence_cleanup] dropped={}", dropped);
        }
    }

    /// Arm the AUTH_TIMEOUT disconnect timer for `account_id` unless one
    /// is already pending. The fired handler tolerates the presence
    /// having vanished or the timer having been superseded.
    pub async fn schedule_waiting_disconnect(state: &Arc<Self>, account_id: u32) {
        let timer_id = state.next_timer_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut online = state.online_db.lock().await;
            let Some(entry) = online.get_mut(&account_id) else {
                return;
            };
            if entry.waiting_disconnect.is_some() {
                return;
            }
            entry.waiting_disconnect = Some(timer_id);
        }
        let state = Arc::clone(state);
        tokio::spawn(async move {
            tokio::time::sleep(AUTH_TIMEOUT).await;
            LoginState::waiting_disconnect_timer(&state, account_id, timer_id).await;
        });
    }

    async fn waiting_disconnect_timer(state: &Arc<Self>, account_id: u32, timer_id: u64) {
        {
            let mut online = state.online_db.lock().await;
            match online.get(&account_id) {
                Some(entry) if entry.waiting_disconnect == Some(timer_id) => {
                    online.remove(&account_id);
                }
                _ => return,
            }
        }
        state.auth_db.lock().await.remove(&account_id);
        tracing::info!("[login] [auth_timeout] account={}", account_id);
    }

    // ---------------------------------------------------------------
    // Char-server roster
    // ---------------------------------------------------------------

    /// Fan a frame out to every connected char-server except `exclude`
    /// ("wos": without our self). Returns how many were reached.
    pub async fn charif_sendallwos(&self, exclude: Option<usize>, buf: &[u8]) -> usize {
        let servers = self.servers.lock().await;
        let mut count = 0;
        for (slot, entry) in servers.iter().enumerate() {
            if Some(slot) == exclude {
                continue;
            }
            if let Some(server) = entry {
                if server.tx.send(buf.to_vec()).is_ok() {
                    count += 1;
                }
            }
        }
        count
    }

    // ---------------------------------------------------------------
    // Accept loop and periodic tasks
    // ---------------------------------------------------------------

    pub async fn run(state: Arc<Self>) -> Result<()> {
        let bind = format!("{}:{}", state.config.bind_ip, state.config.login_port);
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Cannot bind login socket: {}", bind))?;
        tracing::info!("[login] [ready] addr={}", bind);

        Self::spawn_periodic_tasks(&state);

        loop {
            let (stream, peer) = listener.accept().await?;
            let s = Arc::clone(&state);
            tokio::spawn(async move {
                LoginState::handle_new_connection(s, stream, peer).await;
            });
        }
    }

    pub async fn handle_new_connection(state: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        client::handle_session(state, stream, peer).await;
    }

    fn spawn_periodic_tasks(state: &Arc<Self>) {
        // orphaned-presence sweep
        {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(600));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    state.online_data_cleanup().await;
                }
            });
        }
        // expired IP-ban sweep
        {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    state.ipban.lock().await.sweep();
                }
            });
        }
        // WAN address re-resolution prompt
        if state.config.ip_sync_interval > 0 {
            let state = Arc::clone(state);
            let every = Duration::from_millis(state.config.ip_sync_interval);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    tracing::info!("[login] [ip_sync] broadcasting");
                    state
                        .charif_sendallwos(None, &packet::build_ip_sync_request())
                        .await;
                }
            });
        }
    }
}

/// Fire-and-forget login log sink.
pub fn login_log(state: &LoginState, ip: Ipv4Addr, who: &str, code: i32, message: &str) {
    if state.config.log_login {
        tracing::info!("[login] [log] ip={} user={} code={} msg={}", ip, who, code, message);
    }
}
