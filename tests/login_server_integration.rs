use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use yggdrasil::account::file::FileAccountDb;
use yggdrasil::account::{Account, AccountDb};
use yggdrasil::config::LoginConfig;
use yggdrasil::login::{CharServerSlot, LoginState};
use yggdrasil::network::subnet::SubnetList;

fn test_config() -> LoginConfig {
    let mut config = LoginConfig::default();
    config.allowed_regs = 1;
    config.time_allowed = 10;
    config
}

fn account(userid: &str, pass: &str) -> Account {
    Account {
        account_id: 0,
        userid: userid.to_string(),
        pass: pass.to_string(),
        sex: 'M',
        level: 0,
        state: 0,
        email: "user@example.com".to_string(),
        expiration_time: 0,
        unban_time: 0,
        lastlogin: "-".to_string(),
        last_ip: "-".to_string(),
        logincount: 0,
        account_reg2: Vec::new(),
    }
}

async fn start_test_server(state: Arc<LoginState>) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, peer) = listener.accept().await.unwrap();
            let s = Arc::clone(&state);
            tokio::spawn(async move {
                LoginState::handle_new_connection(s, stream, peer).await;
            });
        }
    });

    addr
}

async fn setup(config: LoginConfig) -> (Arc<LoginState>, Arc<FileAccountDb>, std::net::SocketAddr) {
    let db = Arc::new(FileAccountDb::memory(true));
    let state = Arc::new(LoginState::new(config, db.clone(), SubnetList::default()));
    let addr = start_test_server(Arc::clone(&state)).await;
    (state, db, addr)
}

/// Register a fake char-server roster entry; returns its outgoing frames.
async fn register_slot(
    state: &LoginState,
    slot: usize,
    ip: Ipv4Addr,
) -> mpsc::UnboundedReceiver<Vec<u8>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut servers = state.servers.lock().await;
    servers[slot] = Some(CharServerSlot {
        name: format!("world{slot}"),
        ip,
        port: 6121,
        users: 0,
        maintenance: 0,
        new_server: 0,
        tx,
    });
    rx
}

/// 0x0064: plain client login.
fn login_frame(userid: &str, pass: &str) -> Vec<u8> {
    let mut frame = vec![0u8; 55];
    frame[0..2].copy_from_slice(&0x0064u16.to_le_bytes());
    frame[6..6 + userid.len()].copy_from_slice(userid.as_bytes());
    frame[30..30 + pass.len()].copy_from_slice(pass.as_bytes());
    frame
}

/// 0x2710: char-server handshake.
fn char_handshake_frame(userid: &str, pass: &str, ip: [u8; 4], port: u16, name: &str) -> Vec<u8> {
    let mut frame = vec![0u8; 86];
    frame[0..2].copy_from_slice(&0x2710u16.to_le_bytes());
    frame[2..2 + userid.len()].copy_from_slice(userid.as_bytes());
    frame[26..26 + pass.len()].copy_from_slice(pass.as_bytes());
    frame[54..58].copy_from_slice(&ip);
    frame[58..60].copy_from_slice(&port.to_be_bytes());
    frame[60..60 + name.len()].copy_from_slice(name.as_bytes());
    frame
}

/// Read one reply frame, sizing it by opcode.
async fn read_reply(stream: &mut TcpStream) -> Vec<u8> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await.unwrap();
    let opcode = u16::from_le_bytes(head);
    let mut frame = head.to_vec();
    let rest = match opcode {
        0x0069 | 0x01dc | 0x2732 => {
            let mut len = [0u8; 2];
            stream.read_exact(&mut len).await.unwrap();
            frame.extend_from_slice(&len);
            u16::from_le_bytes(len) as usize - 4
        }
        0x006a => 21,
        0x0081 => 1,
        0x2711 => 1,
        0x2713 => 57,
        0x2718 => 0,
        0x7531 => 8,
        other => panic!("unexpected reply opcode 0x{other:04x}"),
    };
    let mut body = vec![0u8; rest];
    stream.read_exact(&mut body).await.unwrap();
    frame.extend_from_slice(&body);
    frame
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[tokio::test]
async fn test_auto_register_with_no_char_server() {
    let (_state, db, addr) = setup(test_config()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("alice_F", "secret")).await.unwrap();

    // authentication succeeded but no char-server is attached
    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x0081);
    assert_eq!(reply[2], 1);

    let acc = db.load_by_name("alice").await.unwrap();
    assert_eq!(acc.sex, 'F');
    assert_eq!(acc.logincount, 1, "authentication itself succeeded");
}

#[tokio::test]
async fn test_duplicate_login_kick() {
    let (state, db, addr) = setup(test_config()).await;
    let bob = db.create(account("bob", "pw")).await.unwrap();
    let mut slot_rx = register_slot(&state, 5, Ipv4Addr::new(203, 0, 113, 5)).await;
    state.add_online_user(5, bob).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("bob", "pw")).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x006a);
    assert_eq!(reply[2], 8);

    // every char-server was asked to kick bob
    let kick = slot_rx.recv().await.unwrap();
    assert_eq!(u16::from_le_bytes([kick[0], kick[1]]), 0x2734);
    assert_eq!(u32_at(&kick, 2), bob);

    // no ticket was created for the rejected attempt
    assert!(!state.auth_db.lock().await.contains_key(&bob));
}

#[tokio::test]
async fn test_ban_refusal_carries_timestamp() {
    let (state, db, addr) = setup(test_config()).await;
    let mut acc = account("carol", "pw");
    let unban_time = chrono::Local::now().timestamp() + 3600;
    acc.unban_time = unban_time;
    let id = db.create(acc).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("carol", "pw")).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x006a);
    assert_eq!(reply[2], 6);

    let text_end = reply[3..23].iter().position(|&b| b == 0).unwrap_or(20) + 3;
    let text = std::str::from_utf8(&reply[3..text_end]).unwrap();
    let expected = yggdrasil::login::client::format_unban_time(
        &state.config.date_format,
        unban_time,
    );
    assert_eq!(text, expected);

    // a refusal never mutates the record
    let stored = db.load_by_id(id).await.unwrap();
    assert_eq!(stored.unban_time, unban_time);
    assert_eq!(stored.logincount, 0);
}

#[tokio::test]
async fn test_subnet_remap_in_server_list() {
    let db = Arc::new(FileAccountDb::memory(true));
    let mut subnets = SubnetList::default();
    // loopback clients are "on the LAN" of char address 127.0.0.5
    subnets.push(SubnetList::parse_entry("255.0.0.0:127.0.0.5:127.0.0.6").unwrap());
    let state = Arc::new(LoginState::new(test_config(), db.clone(), subnets));
    let addr = start_test_server(Arc::clone(&state)).await;

    db.create(account("dave", "pw")).await.unwrap();
    let _rx = register_slot(&state, 0, Ipv4Addr::new(203, 0, 113, 5)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("dave", "pw")).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x0069);
    assert_eq!(reply.len(), 47 + 32);
    assert_eq!(&reply[47..51], &[127, 0, 0, 5], "LAN address advertised");
}

#[tokio::test]
async fn test_char_handshake_then_ticket_redemption() {
    let (state, db, addr) = setup(test_config()).await;

    let mut server_acc = account("charserver", "srvpw");
    server_acc.account_id = 3;
    server_acc.sex = 'S';
    db.insert(server_acc).await;
    db.create(account("erin", "pw")).await.unwrap();

    // char-server connects and is promoted into slot 3
    let mut charsrv = TcpStream::connect(addr).await.unwrap();
    charsrv
        .write_all(&char_handshake_frame("charserver", "srvpw", [203, 0, 113, 5], 6121, "Asgard"))
        .await
        .unwrap();
    let verdict = read_reply(&mut charsrv).await;
    assert_eq!(u16::from_le_bytes([verdict[0], verdict[1]]), 0x2711);
    assert_eq!(verdict[2], 0);

    // it immediately receives the (empty) GM table
    let gm_table = read_reply(&mut charsrv).await;
    assert_eq!(u16::from_le_bytes([gm_table[0], gm_table[1]]), 0x2732);
    assert_eq!(gm_table.len(), 4);

    // a client logs in and receives the one-entry server list
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("erin", "pw")).await.unwrap();
    let list = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([list[0], list[1]]), 0x0069);
    assert_eq!(list.len(), 47 + 32);
    let login_id1 = u32_at(&list, 4);
    let account_id = u32_at(&list, 8);
    let login_id2 = u32_at(&list, 12);

    // first redemption with matching fields is accepted
    let mut redeem = vec![0u8; 19];
    redeem[0..2].copy_from_slice(&0x2712u16.to_le_bytes());
    redeem[2..6].copy_from_slice(&account_id.to_le_bytes());
    redeem[6..10].copy_from_slice(&login_id1.to_le_bytes());
    redeem[10..14].copy_from_slice(&login_id2.to_le_bytes());
    redeem[14] = 1; // 'M'
    redeem[15..19].copy_from_slice(&[127, 0, 0, 1]);
    charsrv.write_all(&redeem).await.unwrap();

    let ack = read_reply(&mut charsrv).await;
    assert_eq!(u16::from_le_bytes([ack[0], ack[1]]), 0x2713);
    assert_eq!(u32_at(&ack, 2), account_id);
    assert_eq!(ack[14], 0);
    let email_end = ack[15..55].iter().position(|&b| b == 0).unwrap_or(40) + 15;
    assert_eq!(&ack[15..email_end], b"user@example.com");

    // the ticket is single-use
    charsrv.write_all(&redeem).await.unwrap();
    let ack = read_reply(&mut charsrv).await;
    assert_eq!(ack[14], 1);
}

#[tokio::test]
async fn test_char_handshake_refused_for_non_server_account() {
    let (_state, db, addr) = setup(test_config()).await;
    db.create(account("mallory", "pw")).await.unwrap(); // sex 'M', huge id

    let mut charsrv = TcpStream::connect(addr).await.unwrap();
    charsrv
        .write_all(&char_handshake_frame("mallory", "pw", [203, 0, 113, 5], 6121, "Rogue"))
        .await
        .unwrap();
    let verdict = read_reply(&mut charsrv).await;
    assert_eq!(u16::from_le_bytes([verdict[0], verdict[1]]), 0x2711);
    assert_eq!(verdict[2], 3);
}

#[tokio::test]
async fn test_challenge_login_round_trip() {
    use md5::{Digest, Md5};

    let (state, db, addr) = setup(test_config()).await;
    db.create(account("frank", "hunter2")).await.unwrap();
    let _rx = register_slot(&state, 0, Ipv4Addr::new(203, 0, 113, 5)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&0x01dbu16.to_le_bytes()).await.unwrap();
    let key_reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([key_reply[0], key_reply[1]]), 0x01dc);
    let key = &key_reply[4..];
    assert!((12..=15).contains(&key.len()));

    // MD5(key || password) through the 0x01dd variant
    let mut input = key.to_vec();
    input.extend_from_slice(b"hunter2");
    let digest = Md5::digest(&input);

    let mut frame = vec![0u8; 47];
    frame[0..2].copy_from_slice(&0x01ddu16.to_le_bytes());
    frame[6..11].copy_from_slice(b"frank");
    frame[30..46].copy_from_slice(&digest);
    client.write_all(&frame).await.unwrap();

    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x0069, "challenge response accepted");
}

#[tokio::test]
async fn test_version_query() {
    let (_state, _db, addr) = setup(test_config()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&0x7530u16.to_le_bytes()).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x7531);
    assert_eq!(reply.len(), 10);
}

#[tokio::test]
async fn test_unknown_opcode_drops_connection() {
    let (_state, _db, addr) = setup(test_config()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0xad, 0xde]).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap(), 0, "server hung up");
}

#[tokio::test]
async fn test_wrong_password_then_ip_ban() {
    let mut config = test_config();
    config.dynamic_pass_failure_ban_limit = 2;
    let (_state, db, addr) = setup(config).await;
    db.create(account("grace", "right")).await.unwrap();

    for _ in 0..2 {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&login_frame("grace", "wrong")).await.unwrap();
        let reply = read_reply(&mut client).await;
        assert_eq!(reply[2], 1);
    }

    // third attempt, even with the right password, hits the dynamic ban
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame("grace", "right")).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(u16::from_le_bytes([reply[0], reply[1]]), 0x006a);
    assert_eq!(reply[2], 3);
}
