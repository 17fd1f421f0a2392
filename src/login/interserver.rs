//! Packet parsing for promoted char-server sessions.
//!
//! A char-server connection lives until it drops: its frames drive ticket
//! redemption, account mutations, and the online-presence registry, and
//! most mutations fan out to the other attached char-servers. An unknown
//! opcode is fatal for the connection.

use bytes::BytesMut;
use chrono::{Duration as ChronoDuration, Months, TimeZone};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::client::PromotedChar;
use super::packet;
use super::{login_log, unix_now, LoginState};
use crate::account::{email_check, ACCOUNT_REG2_NUM};

pub async fn serve_char_server(
    state: Arc<LoginState>,
    stream: TcpStream,
    mut buf: BytesMut,
    promoted: PromotedChar,
) {
    let slot = promoted.slot;
    let mut rx = promoted.rx;
    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if write_half.write_all(&msg).await.is_err() {
                break;
            }
        }
    });

    // every fresh char-server gets the GM table
    send_gm_accounts(&state, Some(slot)).await;

    'session: loop {
        loop {
            match packet::next_frame(&mut buf, packet::char_frame_len) {
                Ok(Some(frame)) => parse_fromchar(&state, slot, &frame).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!("[login] [char_protocol_error] slot={} err={}", slot, e);
                    break 'session;
                }
            }
        }
        match read_half.read_buf(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }

    let name = {
        let mut servers = state.servers.lock().await;
        servers[slot].take().map(|s| s.name).unwrap_or_default()
    };
    tracing::info!("[login] [char_server_disconnect] name={} slot={}", name, slot);
    // orphan this slot's players; the periodic sweep finalizes them
    state.set_offline(slot as i32).await;
    writer.abort();
}

async fn send_to_slot(state: &LoginState, slot: usize, buf: Vec<u8>) {
    let servers = state.servers.lock().await;
    if let Some(Some(server)) = servers.get(slot) {
        let _ = server.tx.send(buf);
    }
}

async fn slot_name(state: &LoginState, slot: usize) -> String {
    let servers = state.servers.lock().await;
    servers
        .get(slot)
        .and_then(|s| s.as_ref())
        .map(|s| s.name.clone())
        .unwrap_or_default()
}

async fn slot_ip(state: &LoginState, slot: usize) -> Ipv4Addr {
    let servers = state.servers.lock().await;
    servers
        .get(slot)
        .and_then(|s| s.as_ref())
        .map(|s| s.ip)
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Rebuild the GM table from the account store and hand it to one
/// char-server, or to all of them.
pub async fn send_gm_accounts(state: &LoginState, target: Option<usize>) {
    let gms: Vec<(u32, u8)> = state
        .accounts
        .iter()
        .await
        .into_iter()
        .filter(|acc| acc.level > 0)
        .map(|acc| (acc.account_id, acc.level))
        .collect();
    let buf = packet::build_gm_list(&gms);
    match target {
        Some(slot) => send_to_slot(state, slot, buf).await,
        None => {
            state.charif_sendallwos(None, &buf).await;
        }
    }
}

pub async fn parse_fromchar(state: &Arc<LoginState>, slot: usize, frame: &[u8]) {
    let command = packet::read_u16(frame, 0);
    match command {
        // reload and rebroadcast the GM table
        0x2709 => {
            let name = slot_name(state, slot).await;
            tracing::info!("[login] [gm_reload] from={}", name);
            login_log(state, slot_ip(state, slot).await, &name, 0, "GM reload request");
            send_gm_accounts(state, None).await;
        }

        0x2712 => redeem_ticket(state, slot, frame).await,

        // world user count
        0x2714 => {
            let users = packet::read_u32(frame, 2);
            let mut servers = state.servers.lock().await;
            if let Some(Some(server)) = servers.get_mut(slot) {
                if server.users != users {
                    tracing::info!("[login] [user_count] name={} users={}", server.name, users);
                    server.users = users;
                }
            }
        }

        // set e-mail, only allowed while the current one is the default
        0x2715 => {
            let account_id = packet::read_u32(frame, 2);
            let email = packet::read_str(frame, 6, 40);
            if !email_check(&email) {
                tracing::info!("[login] [email_set_refused] account={} reason=invalid", account_id);
            } else {
                match state.accounts.load_by_id(account_id).await {
                    Some(mut acc) if acc.has_default_email() => {
                        acc.email = email;
                        state.accounts.save(&acc).await;
                        tracing::info!("[login] [email_set] account={}", account_id);
                    }
                    _ => tracing::info!(
                        "[login] [email_set_refused] account={} reason=not_default",
                        account_id
                    ),
                }
            }
        }

        // e-mail / expiration lookup
        0x2716 => {
            let account_id = packet::read_u32(frame, 2);
            let (email, expiration) = match state.accounts.load_by_id(account_id).await {
                Some(acc) => (acc.email, acc.expiration_time),
                None => {
                    tracing::info!("[login] [account_info_missing] account={}", account_id);
                    (String::new(), 0)
                }
            };
            send_to_slot(
                state,
                slot,
                packet::build_account_info_reply(account_id, &email, expiration),
            )
            .await;
        }

        0x2719 => send_to_slot(state, slot, packet::build_pong()).await,

        // change e-mail, old address must match
        0x2722 => {
            let account_id = packet::read_u32(frame, 2);
            let actual_email = packet::read_str(frame, 6, 40);
            let new_email = packet::read_str(frame, 46, 40);
            if !email_check(&actual_email) || !email_check(&new_email) {
                tracing::info!("[login] [email_change_refused] account={} reason=invalid", account_id);
            } else if new_email.eq_ignore_ascii_case(crate::account::DEFAULT_EMAIL) {
                tracing::info!("[login] [email_change_refused] account={} reason=default", account_id);
            } else {
                match state.accounts.load_by_id(account_id).await {
                    None => tracing::info!(
                        "[login] [email_change_refused] account={} reason=missing",
                        account_id
                    ),
                    Some(mut acc) => {
                        if !acc.email.eq_ignore_ascii_case(&actual_email) {
                            tracing::info!(
                                "[login] [email_change_refused] account={} reason=mismatch",
                                account_id
                            );
                        } else {
                            acc.email = new_email;
                            state.accounts.save(&acc).await;
                            tracing::info!("[login] [email_change] account={}", account_id);
                        }
                    }
                }
            }
        }

        // account state change
        0x2724 => {
            let account_id = packet::read_u32(frame, 2);
            let new_state = packet::read_u32(frame, 6);
            match state.accounts.load_by_id(account_id).await {
                None => tracing::info!("[login] [state_change_missing] account={}", account_id),
                Some(acc) if acc.state == new_state => {
                    tracing::info!("[login] [state_unchanged] account={} state={}", account_id, new_state)
                }
                Some(mut acc) => {
                    tracing::info!("[login] [state_change] account={} state={}", account_id, new_state);
                    acc.state = new_state;
                    state.accounts.save(&acc).await;
                    if new_state != 0 {
                        state
                            .charif_sendallwos(
                                None,
                                &packet::build_state_broadcast(account_id, 0, new_state),
                            )
                            .await;
                    }
                }
            }
        }

        0x2725 => ban_account(state, slot, frame).await,

        // sex flip, refused for server accounts
        0x2727 => {
            let account_id = packet::read_u32(frame, 2);
            match state.accounts.load_by_id(account_id).await {
                None => tracing::info!("[login] [sex_change_missing] account={}", account_id),
                Some(acc) if acc.sex == 'S' => {
                    tracing::info!("[login] [sex_change_refused] account={} reason=server", account_id)
                }
                Some(mut acc) => {
                    let sex = if acc.sex == 'M' { 'F' } else { 'M' };
                    tracing::info!("[login] [sex_change] account={} sex={}", account_id, sex);
                    acc.sex = sex;
                    state.accounts.save(&acc).await;
                    state
                        .charif_sendallwos(
                            None,
                            &packet::build_sex_broadcast(account_id, packet::sex_char2num(sex)),
                        )
                        .await;
                }
            }
        }

        // replace the account registry and tell the other char-servers
        0x2728 => {
            let total = (packet::read_u16(frame, 2) as usize).min(frame.len());
            let account_id = packet::read_u32(frame, 4);
            match state.accounts.load_by_id(account_id).await {
                None => tracing::info!("[login] [reg2_missing] account={}", account_id),
                Some(mut acc) => {
                    acc.account_reg2 = parse_reg2_pairs(&frame[..total]);
                    state.accounts.save(&acc).await;
                    tracing::info!(
                        "[login] [reg2_update] account={} pairs={}",
                        account_id,
                        acc.account_reg2.len()
                    );
                    // forward as 0x2729, reusing the incoming frame
                    let mut forward = frame[..total].to_vec();
                    packet::put_u16(&mut forward, 0, 0x2729);
                    state.charif_sendallwos(Some(slot), &forward).await;
                }
            }
        }

        // unban
        0x272a => {
            let account_id = packet::read_u32(frame, 2);
            match state.accounts.load_by_id(account_id).await {
                None => tracing::info!("[login] [unban_missing] account={}", account_id),
                Some(acc) if acc.unban_time == 0 => {
                    tracing::info!("[login] [unban_noop] account={}", account_id)
                }
                Some(mut acc) => {
                    tracing::info!("[login] [unban] account={}", account_id);
                    acc.unban_time = 0;
                    state.accounts.save(&acc).await;
                }
            }
        }

        // presence: account entered this world
        0x272b => {
            state
                .add_online_user(slot as i32, packet::read_u32(frame, 2))
                .await;
        }

        // presence: account left
        0x272c => {
            state.remove_online_user(packet::read_u32(frame, 2)).await;
        }

        // full presence resync for this slot
        0x272d => {
            if state.config.online_check {
                let total = (packet::read_u16(frame, 2) as usize).min(frame.len());
                state.set_offline(slot as i32).await;
                let users = packet::read_u16(frame, 4) as usize;
                for i in 0..users {
                    let off = 6 + i * 4;
                    if off + 4 > total {
                        break;
                    }
                    state
                        .add_online_user(slot as i32, packet::read_u32(frame, off))
                        .await;
                }
            }
        }

        // registry contents for one character
        0x272e => {
            let account_id = packet::read_u32(frame, 2);
            let char_id = packet::read_u32(frame, 6);
            let pairs = state
                .accounts
                .load_by_id(account_id)
                .await
                .map(|acc| acc.account_reg2)
                .unwrap_or_default();
            send_to_slot(state, slot, packet::build_reg2_notify(account_id, char_id, &pairs)).await;
        }

        // WAN address update
        0x2736 => {
            let ip = Ipv4Addr::new(frame[2], frame[3], frame[4], frame[5]);
            let mut servers = state.servers.lock().await;
            if let Some(Some(server)) = servers.get_mut(slot) {
                tracing::info!("[login] [wan_update] name={} ip={}", server.name, ip);
                server.ip = ip;
            }
        }

        // everyone on this slot is gone
        0x2737 => {
            tracing::info!("[login] [set_all_offline] slot={}", slot);
            state.set_offline(slot as i32).await;
        }

        _ => {
            // the codec only admits listed opcodes
            tracing::error!("[login] [char_unknown_opcode] slot={} op=0x{:04x}", slot, command);
        }
    }
}

/// 0x2712: redeem a one-time ticket. Every field must match; a match
/// consumes the ticket before the ack leaves, so replays refuse.
async fn redeem_ticket(state: &Arc<LoginState>, slot: usize, frame: &[u8]) {
    let account_id = packet::read_u32(frame, 2);
    let login_id1 = packet::read_u32(frame, 6);
    let login_id2 = packet::read_u32(frame, 10);
    let sex = packet::sex_num2char(frame[14]);
    let ip = Ipv4Addr::new(frame[15], frame[16], frame[17], frame[18]);

    let matched = {
        let mut auth_db = state.auth_db.lock().await;
        match auth_db.get(&account_id) {
            Some(node)
                if node.account_id == account_id
                    && node.login_id1 == login_id1
                    && node.login_id2 == login_id2
                    && node.sex == sex
                    && node.ip == ip =>
            {
                auth_db.remove(&account_id);
                true
            }
            _ => false,
        }
    };

    let reply = if matched {
        let (email, expiration) = match state.accounts.load_by_id(account_id).await {
            Some(acc) => (acc.email, acc.expiration_time),
            None => (String::new(), 0),
        };
        packet::build_redeem_reply(account_id, login_id1, login_id2, true, &email, expiration)
    } else {
        tracing::info!(
            "[login] [ticket_refused] account={} from={}",
            account_id,
            slot_name(state, slot).await
        );
        packet::build_redeem_reply(account_id, login_id1, login_id2, false, "", 0)
    };
    send_to_slot(state, slot, reply).await;
}

/// 0x2725: extend a ban by a broken-down-time delta. The base is the
/// current unban time when still in the future, otherwise now; a result
/// that would not ban at all is rejected without touching the store.
async fn ban_account(state: &Arc<LoginState>, slot: usize, frame: &[u8]) {
    let account_id = packet::read_u32(frame, 2);
    let year = packet::read_u16(frame, 6) as i16;
    let month = packet::read_u16(frame, 8) as i16;
    let mday = packet::read_u16(frame, 10) as i16;
    let hour = packet::read_u16(frame, 12) as i16;
    let min = packet::read_u16(frame, 14) as i16;
    let sec = packet::read_u16(frame, 16) as i16;

    let Some(mut acc) = state.accounts.load_by_id(account_id).await else {
        tracing::info!("[login] [ban_missing] account={}", account_id);
        return;
    };

    let now = unix_now();
    let base = if acc.unban_time == 0 || acc.unban_time < now {
        now
    } else {
        acc.unban_time
    };
    match apply_ban_delta(base, year, month, mday, hour, min, sec) {
        Some(timestamp) if timestamp > now => {
            tracing::info!("[login] [ban] account={} until={}", account_id, timestamp);
            acc.unban_time = timestamp;
            state.accounts.save(&acc).await;
            state
                .charif_sendallwos(
                    None,
                    &packet::build_state_broadcast(account_id, 1, timestamp as u32),
                )
                .await;
        }
        _ => {
            tracing::info!(
                "[login] [ban_rejected] account={} from={}",
                account_id,
                slot_name(state, slot).await
            );
        }
    }
}

/// Broken-down-time arithmetic in local time, like the old mktime-based
/// path: months carry into years, day/time deltas are exact seconds.
pub fn apply_ban_delta(
    base: i64,
    year: i16,
    month: i16,
    mday: i16,
    hour: i16,
    min: i16,
    sec: i16,
) -> Option<i64> {
    let dt = chrono::Local.timestamp_opt(base, 0).single()?;
    let months = year as i32 * 12 + month as i32;
    let dt = if months >= 0 {
        dt.checked_add_months(Months::new(months as u32))?
    } else {
        dt.checked_sub_months(Months::new(months.unsigned_abs()))?
    };
    let dt = dt
        + ChronoDuration::days(mday as i64)
        + ChronoDuration::hours(hour as i64)
        + ChronoDuration::minutes(min as i64)
        + ChronoDuration::seconds(sec as i64);
    Some(dt.timestamp())
}

/// NUL-delimited (key, value) pairs starting at offset 13, capped at
/// [`ACCOUNT_REG2_NUM`]; keys cap at 31 bytes, values at 255.
fn parse_reg2_pairs(frame: &[u8]) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut p = 13;
    while pairs.len() < ACCOUNT_REG2_NUM && p < frame.len() {
        let Some((key, next)) = take_cstr(frame, p, 31) else {
            break;
        };
        let Some((value, next)) = take_cstr(frame, next, 255) else {
            break;
        };
        p = next;
        if !key.is_empty() {
            pairs.push((key, value));
        }
    }
    pairs
}

fn take_cstr(buf: &[u8], start: usize, cap: usize) -> Option<(String, usize)> {
    if start >= buf.len() {
        return None;
    }
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| start + i)
        .unwrap_or(buf.len());
    let text: String = String::from_utf8_lossy(&buf[start..end])
        .chars()
        .filter(|&c| c >= ' ')
        .take(cap)
        .collect();
    Some((text, end + 1))
}
