//! Packet parsing for unpromoted sessions.
//!
//! A freshly accepted connection has no role: the first recognized opcode
//! decides whether it is a game client or a char-server. Client sessions
//! end after their single login result; a successful 0x2710 handshake
//! promotes the session to the char-server parser instead.

use bytes::BytesMut;
use rand::RngExt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::auth::{mmo_auth, AuthOutcome, SessionData, SubmittedPassword, PASSWORD_ENC_BOTH};
use super::interserver;
use super::packet::{self, ServerListEntry};
use super::{login_log, CharServerSlot, LoginState, MAX_SERVERS};
use crate::account::NAME_LENGTH;

/// What the dispatcher decided about the session's future.
enum Flow {
    Continue,
    Close,
    Promote(PromotedChar),
}

/// A session that just became a char-server: its roster slot is claimed
/// and `rx` feeds the writer task.
pub struct PromotedChar {
    pub slot: usize,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub async fn handle_session(state: Arc<LoginState>, mut stream: TcpStream, peer: SocketAddr) {
    let IpAddr::V4(ip) = peer.ip() else {
        return; // the wire protocol only carries IPv4 addresses
    };

    let mut buf = BytesMut::with_capacity(1024);
    let mut sd = SessionData::default();

    loop {
        loop {
            match packet::next_frame(&mut buf, packet::login_frame_len) {
                Ok(Some(frame)) => {
                    match dispatch(&state, &mut stream, &mut sd, &frame, ip).await {
                        Flow::Continue => {}
                        Flow::Close => return,
                        Flow::Promote(promoted) => {
                            interserver::serve_char_server(state, stream, buf, promoted).await;
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::info!("[login] [abnormal_end] ip={} err={}", ip, e);
                    return;
                }
            }
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

async fn dispatch(
    state: &Arc<LoginState>,
    stream: &mut TcpStream,
    sd: &mut SessionData,
    frame: &[u8],
    ip: Ipv4Addr,
) -> Flow {
    let command = packet::read_u16(frame, 0);
    match command {
        // keepalives
        0x0200 | 0x0204 => Flow::Continue,

        // challenge key request
        0x01db => {
            sd.md5_key = generate_md5_key();
            let _ = stream.write_all(&packet::build_md5_key_reply(&sd.md5_key)).await;
            Flow::Continue
        }

        // client login, cleartext password
        0x0064 | 0x0277 | 0x02b0 => {
            sd.version = packet::read_u32(frame, 2);
            sd.userid = packet::read_str(frame, 6, NAME_LENGTH);
            sd.passwd = SubmittedPassword::Clear(packet::read_str(frame, 30, NAME_LENGTH));
            sd.passwdenc = 0;
            tracing::info!("[login] [connect_request] user={} ip={}", sd.userid, ip);
            handle_login(state, stream, sd, ip).await;
            Flow::Close
        }

        // client login, md5 challenge response
        0x01dd => {
            sd.version = packet::read_u32(frame, 2);
            sd.userid = packet::read_str(frame, 6, NAME_LENGTH);
            let mut digest = [0u8; 16];
            digest.copy_from_slice(&frame[30..46]);
            sd.passwd = SubmittedPassword::Digest(digest);
            sd.passwdenc = PASSWORD_ENC_BOTH;
            tracing::info!("[login] [connect_request_enc] user={} ip={}", sd.userid, ip);
            handle_login(state, stream, sd, ip).await;
            Flow::Close
        }

        // char-server handshake
        0x2710 => dispatch_char_handshake(state, stream, sd, frame, ip).await,

        // server version query
        0x7530 => {
            let _ = stream.write_all(&packet::build_version_reply()).await;
            Flow::Continue
        }

        // administration login: permanently disabled
        0x7918 => {
            tracing::info!("[login] [admin_refused] ip={}", ip);
            let _ = stream.write_all(&packet::build_admin_refused()).await;
            Flow::Continue
        }

        _ => Flow::Continue, // unreachable: the codec rejects unknown opcodes
    }
}

/// 12..=15 bytes, each in [1,255].
fn generate_md5_key() -> Vec<u8> {
    let mut rng = rand::rng();
    let len = 12 + rng.random_range(0..4);
    (0..len).map(|_| rng.random_range(1..=255u8)).collect()
}

async fn handle_login(
    state: &Arc<LoginState>,
    stream: &mut TcpStream,
    sd: &mut SessionData,
    ip: Ipv4Addr,
) {
    if state.config.ipban && state.ipban.lock().await.is_banned(u32::from(ip)) {
        login_log(state, ip, &sd.userid, 3, "ip banned");
        let _ = stream.write_all(&packet::build_auth_failed(3, "")).await;
        return;
    }

    match mmo_auth(state, sd, ip).await {
        AuthOutcome::Accepted => login_auth_ok(state, stream, sd, ip).await,
        AuthOutcome::Refused(code) => login_auth_failed(state, stream, sd, ip, code).await,
    }
}

/// Server list entries for a client at `client_ip`, with the subnet
/// remap applied: a LAN client is told the LAN-facing char address.
pub async fn server_list_entries(state: &LoginState, client_ip: Ipv4Addr) -> Vec<ServerListEntry> {
    let remap = state.subnets.lan_subnetcheck(u32::from(client_ip));
    let servers = state.servers.lock().await;
    servers
        .iter()
        .flatten()
        .map(|server| ServerListEntry {
            ip: remap.map(u32::to_be_bytes).unwrap_or_else(|| server.ip.octets()),
            port: server.port,
            name: server.name.clone(),
            users: server.users as u16,
            maintenance: server.maintenance,
            new_server: server.new_server,
        })
        .collect()
}

async fn login_auth_ok(
    state: &Arc<LoginState>,
    stream: &mut TcpStream,
    sd: &mut SessionData,
    ip: Ipv4Addr,
) {
    if sd.level < state.config.min_level_to_connect {
        tracing::info!(
            "[login] [below_min_level] user={} level={} min={}",
            sd.userid,
            sd.level,
            state.config.min_level_to_connect
        );
        let _ = stream.write_all(&packet::build_server_closed(1)).await;
        return;
    }

    let entries = server_list_entries(state, ip).await;
    if entries.is_empty() {
        tracing::info!("[login] [no_char_server] user={}", sd.userid);
        let _ = stream.write_all(&packet::build_server_closed(1)).await;
        return;
    }

    if state.config.online_check {
        let char_server = {
            let online = state.online_db.lock().await;
            online.get(&sd.account_id).map(|entry| entry.char_server)
        };
        match char_server {
            Some(server) if server > -1 => {
                // already playing somewhere: ask every char-server to
                // kick the account and refuse this attempt
                tracing::info!("[login] [already_online] user={} server={}", sd.userid, server);
                state
                    .charif_sendallwos(None, &packet::build_kick_notify(sd.account_id))
                    .await;
                LoginState::schedule_waiting_disconnect(state, sd.account_id).await;
                let _ = stream.write_all(&packet::build_auth_failed(8, "")).await;
                return;
            }
            Some(_) => {
                // authed earlier but never reached a char-server: the
                // stale ticket and presence give way to this login
                state.auth_db.lock().await.remove(&sd.account_id);
                state.remove_online_user(sd.account_id).await;
            }
            None => {}
        }
    }

    login_log(state, ip, &sd.userid, 100, "login ok");
    if sd.level > 0 {
        tracing::info!("[login] [gm_connect] user={} level={}", sd.userid, sd.level);
    }

    let reply =
        packet::build_server_list(sd.login_id1, sd.account_id, sd.login_id2, sd.sex, &entries);
    let _ = stream.write_all(&reply).await;

    state.auth_db.lock().await.insert(
        sd.account_id,
        super::AuthNode {
            account_id: sd.account_id,
            login_id1: sd.login_id1,
            login_id2: sd.login_id2,
            sex: sd.sex,
            ip,
        },
    );

    if state.config.online_check {
        state.add_online_user(-1, sd.account_id).await;
        LoginState::schedule_waiting_disconnect(state, sd.account_id).await;
    }
}

async fn login_auth_failed(
    state: &Arc<LoginState>,
    stream: &mut TcpStream,
    sd: &SessionData,
    ip: Ipv4Addr,
    result: u8,
) {
    if state.config.log_login {
        let error = match result {
            0 => "Unregistered ID.",
            1 => "Incorrect Password.",
            2 => "Account Expired.",
            3 => "Rejected from server.",
            4 => "Blocked by GM.",
            5 => "Not latest game EXE.",
            6 => "Banned.",
            7 => "Server Over-population.",
            8 => "Account limit from company",
            9 => "Ban by DBA",
            10 => "Email not confirmed",
            11 => "Ban by GM",
            12 => "Working in DB",
            13 => "Self Lock",
            14 | 15 => "Not Permitted Group",
            99 => "Account gone.",
            100 => "Login info remains.",
            101 => "Hacking investigation.",
            102 => "Bug investigation.",
            103 => "Deleting char.",
            104 => "Deleting spouse char.",
            _ => "Unknown Error.",
        };
        login_log(state, ip, &sd.userid, result as i32, error);
    }

    if result == 1 && state.config.ipban && state.config.dynamic_pass_failure_ban {
        state.ipban.lock().await.record_failure(u32::from(ip));
    }

    let unban_text = if result == 6 {
        let unban_time = state
            .accounts
            .load_by_name(&sd.userid)
            .await
            .map(|acc| acc.unban_time)
            .unwrap_or(0);
        format_unban_time(&state.config.date_format, unban_time)
    } else {
        String::new()
    };
    let _ = stream.write_all(&packet::build_auth_failed(result, &unban_text)).await;
}

/// Render an unban timestamp for the 20-byte field of the 0x6a frame.
pub fn format_unban_time(date_format: &str, unban_time: i64) -> String {
    use chrono::TimeZone;
    let mut text = chrono::Local
        .timestamp_opt(unban_time.max(0), 0)
        .single()
        .map(|dt| dt.format(date_format).to_string())
        .unwrap_or_default();
    text.truncate(19);
    text
}

async fn dispatch_char_handshake(
    state: &Arc<LoginState>,
    stream: &mut TcpStream,
    sd: &mut SessionData,
    frame: &[u8],
    ip: Ipv4Addr,
) -> Flow {
    sd.userid = packet::read_str(frame, 2, NAME_LENGTH);
    sd.passwd = SubmittedPassword::Clear(packet::read_str(frame, 26, NAME_LENGTH));
    sd.passwdenc = 0;
    sd.version = state.config.client_version_to_connect; // servers skip the gate

    let server_ip = Ipv4Addr::new(frame[54], frame[55], frame[56], frame[57]);
    let server_port = u16::from_be_bytes([frame[58], frame[59]]);
    let server_name = packet::read_str(frame, 60, 20);
    let maintenance = packet::read_u16(frame, 82);
    let new_server = packet::read_u16(frame, 84);

    tracing::info!(
        "[login] [char_handshake] name={} addr={}:{} account={} ip={}",
        server_name,
        server_ip,
        server_port,
        sd.userid,
        ip
    );
    login_log(
        state,
        ip,
        &sd.userid,
        100,
        &format!("charserver - {}@{}:{}", server_name, server_ip, server_port),
    );

    let result = mmo_auth(state, sd, ip).await;
    if result == AuthOutcome::Accepted && sd.sex == 'S' && (sd.account_id as usize) < MAX_SERVERS {
        let slot = sd.account_id as usize;
        let mut servers = state.servers.lock().await;
        if servers[slot].is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            servers[slot] = Some(CharServerSlot {
                name: server_name.clone(),
                ip: server_ip,
                port: server_port,
                users: 0,
                maintenance,
                new_server,
                tx,
            });
            drop(servers);
            tracing::info!("[login] [char_server_accepted] name={} slot={}", server_name, slot);
            let _ = stream.write_all(&packet::build_handshake_result(0)).await;
            return Flow::Promote(PromotedChar { slot, rx });
        }
    }

    tracing::info!("[login] [char_server_refused] name={}", server_name);
    let _ = stream.write_all(&packet::build_handshake_result(3)).await;
    Flow::Continue
}
