//! Frame codec and packet builders.
//!
//! Frames carry a 16-bit little-endian opcode at offset 0. Most are
//! fixed-size; variable ones carry a 16-bit total length at offset 2.
//! Nothing is dispatched until a whole frame is buffered. Strings on the
//! wire are fixed-width and NUL-padded; control characters are stripped
//! from anything that came from the network.

use bytes::BytesMut;

/// How to size a frame, looked up by opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLen {
    Fixed(usize),
    /// u16 total length at offset 2, header inclusive.
    Variable,
    /// 0x7918: 28 bytes when the mode word at offset 2 is zero, else 20.
    AdminLogin,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("unknown opcode 0x{0:04x}")]
    UnknownOpcode(u16),
    #[error("bad length {len} for opcode 0x{op:04x}")]
    BadLength { op: u16, len: usize },
}

/// Opcode table for unpromoted sessions (clients and would-be char-servers).
pub fn login_frame_len(op: u16) -> Option<FrameLen> {
    Some(match op {
        0x0064 => FrameLen::Fixed(55), // login, cleartext password
        0x01dd => FrameLen::Fixed(47), // login, md5 digest
        0x0277 => FrameLen::Fixed(84), // login, newer client
        0x02b0 => FrameLen::Fixed(85), // login, newer client
        0x01db => FrameLen::Fixed(2),  // challenge key request
        0x0200 => FrameLen::Fixed(26), // keepalive
        0x0204 => FrameLen::Fixed(18), // keepalive (hashed userid)
        0x2710 => FrameLen::Fixed(86), // char-server handshake
        0x7530 => FrameLen::Fixed(2),  // version query
        0x7918 => FrameLen::AdminLogin,
        _ => return None,
    })
}

/// Opcode table for promoted char-server sessions.
pub fn char_frame_len(op: u16) -> Option<FrameLen> {
    Some(match op {
        0x2709 => FrameLen::Fixed(2),  // reload GM table
        0x2712 => FrameLen::Fixed(19), // redeem auth ticket
        0x2714 => FrameLen::Fixed(6),  // user count update
        0x2715 => FrameLen::Fixed(46), // set e-mail (from default)
        0x2716 => FrameLen::Fixed(6),  // e-mail/expiration request
        0x2719 => FrameLen::Fixed(2),  // ping
        0x2722 => FrameLen::Fixed(86), // change e-mail
        0x2724 => FrameLen::Fixed(10), // state update
        0x2725 => FrameLen::Fixed(18), // ban with time delta
        0x2727 => FrameLen::Fixed(6),  // sex flip
        0x2728 => FrameLen::Variable,  // account_reg2 replace
        0x272a => FrameLen::Fixed(6),  // unban
        0x272b => FrameLen::Fixed(6),  // mark online
        0x272c => FrameLen::Fixed(6),  // mark offline
        0x272d => FrameLen::Variable,  // online list resync
        0x272e => FrameLen::Fixed(10), // account_reg2 request
        0x2736 => FrameLen::Fixed(6),  // WAN IP update
        0x2737 => FrameLen::Fixed(2),  // set all offline
        _ => return None,
    })
}

/// Extract one whole frame from `buf`, if enough bytes are buffered.
pub fn next_frame(
    buf: &mut BytesMut,
    frame_len: fn(u16) -> Option<FrameLen>,
) -> Result<Option<Vec<u8>>, PacketError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let op = read_u16(buf, 0);
    let expected = match frame_len(op) {
        Some(FrameLen::Fixed(n)) => n,
        Some(FrameLen::Variable) => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let len = read_u16(buf, 2) as usize;
            if len < 4 {
                return Err(PacketError::BadLength { op, len });
            }
            len
        }
        Some(FrameLen::AdminLogin) => {
            if buf.len() < 4 {
                return Ok(None);
            }
            if read_u16(buf, 2) == 0 {
                28
            } else {
                20
            }
        }
        None => return Err(PacketError::UnknownOpcode(op)),
    };
    if buf.len() < expected {
        return Ok(None);
    }
    Ok(Some(buf.split_to(expected).to_vec()))
}

pub fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Read a fixed-width NUL-padded string, stripping control characters.
pub fn read_str(buf: &[u8], off: usize, width: usize) -> String {
    let field = &buf[off..off + width];
    let end = field.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8_lossy(&field[..end])
        .chars()
        .filter(|&c| c >= ' ')
        .collect()
}

pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// Write a string into a fixed-width NUL-padded field.
pub fn put_str(buf: &mut [u8], off: usize, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(width);
    buf[off..off + n].copy_from_slice(&bytes[..n]);
}

pub fn sex_num2char(n: u8) -> char {
    match n {
        0 => 'F',
        1 => 'M',
        _ => 'S',
    }
}

pub fn sex_char2num(c: char) -> u8 {
    match c {
        'F' => 0,
        'M' => 1,
        _ => 2,
    }
}

/// One entry of the 0x69 server list.
#[derive(Debug, Clone)]
pub struct ServerListEntry {
    /// Advertised address octets, already subnet-remapped.
    pub ip: [u8; 4],
    pub port: u16,
    pub name: String,
    pub users: u16,
    pub maintenance: u16,
    pub new_server: u16,
}

/// 0x01dc: challenge key handed to the client.
pub fn build_md5_key_reply(key: &[u8]) -> Vec<u8> {
    let total = 4 + key.len();
    let mut buf = vec![0u8; total];
    put_u16(&mut buf, 0, 0x01dc);
    put_u16(&mut buf, 2, total as u16);
    buf[4..].copy_from_slice(key);
    buf
}

/// 0x69: login accepted, with one 32-byte entry per char-server.
pub fn build_server_list(
    login_id1: u32,
    account_id: u32,
    login_id2: u32,
    sex: char,
    entries: &[ServerListEntry],
) -> Vec<u8> {
    let total = 47 + 32 * entries.len();
    let mut buf = vec![0u8; total];
    put_u16(&mut buf, 0, 0x0069);
    put_u16(&mut buf, 2, total as u16);
    put_u32(&mut buf, 4, login_id1);
    put_u32(&mut buf, 8, account_id);
    put_u32(&mut buf, 12, login_id2);
    // offsets 16..46 were once client ip and last-login; now always zero
    buf[46] = sex_char2num(sex);
    for (n, entry) in entries.iter().enumerate() {
        let off = 47 + n * 32;
        buf[off..off + 4].copy_from_slice(&entry.ip);
        // legacy quirk: the port travels little-endian in a network-order slot
        put_u16(&mut buf, off + 4, entry.port);
        put_str(&mut buf, off + 6, &entry.name, 20);
        put_u16(&mut buf, off + 26, entry.users);
        put_u16(&mut buf, off + 28, entry.maintenance);
        put_u16(&mut buf, off + 30, entry.new_server);
    }
    buf
}

/// 0x6a: login refused. `unban_text` rides along only with code 6.
pub fn build_auth_failed(result: u8, unban_text: &str) -> Vec<u8> {
    let mut buf = vec![0u8; 23];
    put_u16(&mut buf, 0, 0x006a);
    buf[2] = result;
    if result == 6 {
        put_str(&mut buf, 3, unban_text, 19);
    }
    buf
}

/// 0x81: connection-level refusal (1 = server closed, 8 = still recognized).
pub fn build_server_closed(code: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    put_u16(&mut buf, 0, 0x0081);
    buf[2] = code;
    buf
}

/// 0x2711: char-server handshake verdict (0 = accepted, 3 = refused).
pub fn build_handshake_result(code: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    put_u16(&mut buf, 0, 0x2711);
    buf[2] = code;
    buf
}

/// 0x2713: ticket redemption verdict.
pub fn build_redeem_reply(
    account_id: u32,
    login_id1: u32,
    login_id2: u32,
    accepted: bool,
    email: &str,
    expiration_time: i64,
) -> Vec<u8> {
    let mut buf = vec![0u8; 59];
    put_u16(&mut buf, 0, 0x2713);
    put_u32(&mut buf, 2, account_id);
    put_u32(&mut buf, 6, login_id1);
    put_u32(&mut buf, 10, login_id2);
    buf[14] = if accepted { 0 } else { 1 };
    if accepted {
        put_str(&mut buf, 15, email, 40);
        put_u32(&mut buf, 55, expiration_time as u32);
    }
    buf
}

/// 0x2717: e-mail and expiration for one account.
pub fn build_account_info_reply(account_id: u32, email: &str, expiration_time: i64) -> Vec<u8> {
    let mut buf = vec![0u8; 50];
    put_u16(&mut buf, 0, 0x2717);
    put_u32(&mut buf, 2, account_id);
    put_str(&mut buf, 6, email, 40);
    put_u32(&mut buf, 46, expiration_time as u32);
    buf
}

/// 0x2718: ping answer.
pub fn build_pong() -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    put_u16(&mut buf, 0, 0x2718);
    buf
}

/// 0x2723: sex changed, fanned out to every char-server.
pub fn build_sex_broadcast(account_id: u32, sex_num: u8) -> Vec<u8> {
    let mut buf = vec![0u8; 7];
    put_u16(&mut buf, 0, 0x2723);
    put_u32(&mut buf, 2, account_id);
    buf[6] = sex_num;
    buf
}

/// 0x2729 (type 1): account_reg2 contents as NUL-delimited pairs.
pub fn build_reg2_notify(account_id: u32, char_id: u32, pairs: &[(String, String)]) -> Vec<u8> {
    let mut buf = vec![0u8; 13];
    put_u32(&mut buf, 4, account_id);
    put_u32(&mut buf, 8, char_id);
    buf[12] = 1;
    for (key, value) in pairs {
        if key.is_empty() || buf.len() >= 9000 {
            continue;
        }
        buf.extend_from_slice(key.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    let total = buf.len() as u16;
    put_u16(&mut buf, 0, 0x2729);
    put_u16(&mut buf, 2, total);
    buf
}

/// 0x2731: account state / ban change (kind 0 = state, 1 = ban date).
pub fn build_state_broadcast(account_id: u32, kind: u8, value: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 11];
    put_u16(&mut buf, 0, 0x2731);
    put_u32(&mut buf, 2, account_id);
    buf[6] = kind;
    put_u32(&mut buf, 7, value);
    buf
}

/// 0x2732: GM accounts table, five bytes per entry.
pub fn build_gm_list(entries: &[(u32, u8)]) -> Vec<u8> {
    let total = 4 + 5 * entries.len();
    let mut buf = vec![0u8; total];
    put_u16(&mut buf, 0, 0x2732);
    put_u16(&mut buf, 2, total as u16);
    for (n, (account_id, level)) in entries.iter().enumerate() {
        let off = 4 + n * 5;
        put_u32(&mut buf, off, *account_id);
        buf[off + 4] = *level;
    }
    buf
}

/// 0x2734: kick request for an already-online account.
pub fn build_kick_notify(account_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; 6];
    put_u16(&mut buf, 0, 0x2734);
    put_u32(&mut buf, 2, account_id);
    buf
}

/// 0x2735: prompt char-servers to re-resolve their WAN address.
pub fn build_ip_sync_request() -> Vec<u8> {
    let mut buf = vec![0u8; 2];
    put_u16(&mut buf, 0, 0x2735);
    buf
}

pub const SERVER_VERSION_MAJOR: u8 = 1;
pub const SERVER_VERSION_MINOR: u8 = 0;
pub const SERVER_VERSION_REVISION: u8 = 0;
pub const SERVER_RELEASE_FLAG: u8 = 1;
pub const SERVER_OFFICIAL_FLAG: u8 = 1;
pub const SERVER_TYPE_LOGIN: u8 = 0x01;
pub const SERVER_MOD_VERSION: u16 = 0;

/// 0x7531: fixed version information block.
pub fn build_version_reply() -> Vec<u8> {
    let mut buf = vec![0u8; 10];
    put_u16(&mut buf, 0, 0x7531);
    buf[2] = SERVER_VERSION_MAJOR;
    buf[3] = SERVER_VERSION_MINOR;
    buf[4] = SERVER_VERSION_REVISION;
    buf[5] = SERVER_RELEASE_FLAG;
    buf[6] = SERVER_OFFICIAL_FLAG;
    buf[7] = SERVER_TYPE_LOGIN;
    put_u16(&mut buf, 8, SERVER_MOD_VERSION);
    buf
}

/// 0x7919: administration login verdict; remote administration is
/// permanently disabled, so this always carries 1.
pub fn build_admin_refused() -> Vec<u8> {
    let mut buf = vec![0u8; 3];
    put_u16(&mut buf, 0, 0x7919);
    buf[2] = 1;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_frame_waits_for_whole_frame() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xdb, 0x01]); // 0x01db needs 2 bytes exactly
        let frame = next_frame(&mut buf, login_frame_len).unwrap().unwrap();
        assert_eq!(frame, vec![0xdb, 0x01]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_next_frame_partial_fixed() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x64, 0x00, 0x14]); // 0x0064 needs 55
        assert!(next_frame(&mut buf, login_frame_len).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_next_frame_two_buffered_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xdb, 0x01, 0x30, 0x75]);
        assert_eq!(
            next_frame(&mut buf, login_frame_len).unwrap().unwrap(),
            vec![0xdb, 0x01]
        );
        assert_eq!(
            next_frame(&mut buf, login_frame_len).unwrap().unwrap(),
            vec![0x30, 0x75]
        );
    }

    #[test]
    fn test_next_frame_unknown_opcode() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0xff, 0xee]);
        assert!(matches!(
            next_frame(&mut buf, login_frame_len),
            Err(PacketError::UnknownOpcode(0xeeff))
        ));
    }

    #[test]
    fn test_next_frame_variable() {
        let mut buf = BytesMut::new();
        // 0x2728 with total length 10
        buf.extend_from_slice(&[0x28, 0x27, 0x0a, 0x00, 1, 2, 3, 4, 5]);
        assert!(next_frame(&mut buf, char_frame_len).unwrap().is_none());
        buf.extend_from_slice(&[6]);
        let frame = next_frame(&mut buf, char_frame_len).unwrap().unwrap();
        assert_eq!(frame.len(), 10);
    }

    #[test]
    fn test_next_frame_variable_bad_length() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x28, 0x27, 0x02, 0x00]);
        assert!(matches!(
            next_frame(&mut buf, char_frame_len),
            Err(PacketError::BadLength { op: 0x2728, len: 2 })
        ));
    }

    #[test]
    fn test_admin_login_frame_sizes() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x18, 0x79, 0x00, 0x00]);
        buf.extend_from_slice(&[0u8; 24]);
        let frame = next_frame(&mut buf, login_frame_len).unwrap().unwrap();
        assert_eq!(frame.len(), 28);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x18, 0x79, 0x01, 0x00]);
        buf.extend_from_slice(&[0u8; 16]);
        let frame = next_frame(&mut buf, login_frame_len).unwrap().unwrap();
        assert_eq!(frame.len(), 20);
    }

    #[test]
    fn test_read_str_strips_controls_and_padding() {
        let mut buf = vec![0u8; 12];
        buf[2..9].copy_from_slice(b"ab\x01cd\x1fe");
        assert_eq!(read_str(&buf, 2, 10), "abcde");
    }

    #[test]
    fn test_sex_round_trip() {
        for c in ['M', 'F', 'S'] {
            assert_eq!(sex_num2char(sex_char2num(c)), c);
        }
    }

    #[test]
    fn test_build_server_list_layout() {
        let entries = [ServerListEntry {
            ip: [10, 0, 0, 5],
            port: 6121,
            name: "Asgard".to_string(),
            users: 42,
            maintenance: 0,
            new_server: 1,
        }];
        let buf = build_server_list(0x11223344, 2000000, 0x55667788, 'M', &entries);
        assert_eq!(buf.len(), 47 + 32);
        assert_eq!(read_u16(&buf, 0), 0x0069);
        assert_eq!(read_u16(&buf, 2) as usize, buf.len());
        assert_eq!(read_u32(&buf, 4), 0x11223344);
        assert_eq!(read_u32(&buf, 8), 2000000);
        assert_eq!(read_u32(&buf, 12), 0x55667788);
        assert_eq!(buf[46], 1); // 'M'
        assert_eq!(&buf[47..51], &[10, 0, 0, 5]);
        assert_eq!(read_u16(&buf, 51), 6121); // little-endian port quirk
        assert_eq!(read_str(&buf, 53, 20), "Asgard");
        assert_eq!(read_u16(&buf, 73), 42);
        assert_eq!(read_u16(&buf, 77), 1);
    }

    #[test]
    fn test_build_auth_failed_ban_text_only_on_six() {
        let banned = build_auth_failed(6, "2026-08-01 10:00:00");
        assert_eq!(banned.len(), 23);
        assert_eq!(banned[2], 6);
        assert_eq!(read_str(&banned, 3, 20), "2026-08-01 10:00:00");

        let plain = build_auth_failed(1, "2026-08-01 10:00:00");
        assert_eq!(plain[2], 1);
        assert!(plain[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_build_redeem_reply() {
        let ok = build_redeem_reply(7, 1, 2, true, "a@a.com", 1234);
        assert_eq!(ok.len(), 59);
        assert_eq!(ok[14], 0);
        assert_eq!(read_str(&ok, 15, 40), "a@a.com");
        assert_eq!(read_u32(&ok, 55), 1234);

        let refused = build_redeem_reply(7, 1, 2, false, "", 0);
        assert_eq!(refused[14], 1);
    }

    #[test]
    fn test_build_reg2_notify_pairs() {
        let pairs = vec![
            ("quest".to_string(), "42".to_string()),
            ("flag".to_string(), "on".to_string()),
        ];
        let buf = build_reg2_notify(9, 150000, &pairs);
        assert_eq!(read_u16(&buf, 0), 0x2729);
        assert_eq!(read_u16(&buf, 2) as usize, buf.len());
        assert_eq!(read_u32(&buf, 4), 9);
        assert_eq!(read_u32(&buf, 8), 150000);
        assert_eq!(buf[12], 1);
        assert_eq!(&buf[13..], b"quest\x0042\x00flag\x00on\x00");
    }

    #[test]
    fn test_build_gm_list() {
        let buf = build_gm_list(&[(2000001, 99), (2000002, 60)]);
        assert_eq!(buf.len(), 14);
        assert_eq!(read_u16(&buf, 2), 14);
        assert_eq!(read_u32(&buf, 4), 2000001);
        assert_eq!(buf[8], 99);
        assert_eq!(read_u32(&buf, 9), 2000002);
        assert_eq!(buf[13], 60);
    }
}
