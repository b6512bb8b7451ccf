//! End-to-end scenarios over loopback sockets: one hub, real protocol
//! traffic, three client dialects driven by hand.

use std::sync::Arc;
use std::time::Duration;

use dchub_proto::Cid;
use dchub_server::config::{Value, CONFIG_NMDC_REDIRECT_TLS, CONFIG_ZLIB_LEVEL};
use dchub_server::{Config, Hub, HubOptions, MemoryDatabase, Server, UserDatabase, UserRecord};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const STEP: Duration = Duration::from_secs(5);

async fn start_hub<F>(configure: F) -> (std::net::SocketAddr, Arc<Hub>)
where
    F: FnOnce(&Config, &mut HubOptions, &MemoryDatabase),
{
    let conf = Config::new();
    let mut opts = HubOptions::default();
    let db = MemoryDatabase::new();
    configure(&conf, &mut opts, &db);
    let hub = Hub::new(conf, opts, Arc::new(db));
    let server = Server::bind(Arc::clone(&hub), "127.0.0.1:0").await.expect("bind");
    let addr = server.local_addr().expect("local addr");
    tokio::spawn(server.run());
    (addr, hub)
}

/// A test client reading delimiter-framed commands.
struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
    delim: u8,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr, delim: u8) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        Client { stream, buf: Vec::new(), delim }
    }

    async fn send(&mut self, data: &str) {
        self.stream.write_all(data.as_bytes()).await.expect("send");
    }

    /// Next non-empty frame, without its delimiter.
    async fn frame(&mut self) -> String {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == self.delim) {
                let mut frame: Vec<u8> = self.buf.drain(..=i).collect();
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                if frame.is_empty() {
                    continue; // keep-alive
                }
                return String::from_utf8_lossy(&frame).into_owned();
            }
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(STEP, self.stream.read(&mut chunk))
                .await
                .expect("read timed out")
                .expect("read");
            assert!(n > 0, "connection closed while waiting for a frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read frames until one starts with `prefix`.
    async fn expect(&mut self, prefix: &str) -> String {
        loop {
            let frame = self.frame().await;
            if frame.starts_with(prefix) {
                return frame;
            }
        }
    }

    /// The connection must close without further traffic we care about.
    async fn expect_close(&mut self) {
        loop {
            let mut chunk = [0u8; 4096];
            let n = tokio::time::timeout(STEP, self.stream.read(&mut chunk))
                .await
                .expect("peer did not close")
                .expect("read");
            if n == 0 {
                return;
            }
        }
    }
}

/// Wait for the roster to reflect a finished acceptance; the last
/// handshake lines are enqueued slightly before the roster entry is
/// installed, so tests poll instead of racing it.
async fn wait_online(hub: &Arc<Hub>, nick: &str) -> dchub_server::PeerRef {
    let deadline = tokio::time::Instant::now() + STEP;
    loop {
        if let Some(p) = hub.roster().by_name(nick) {
            return p;
        }
        assert!(tokio::time::Instant::now() < deadline, "{nick} never joined");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn nmdc_connect(addr: std::net::SocketAddr) -> Client {
    let mut c = Client::connect(addr, b'|').await;
    c.expect("$Lock ").await;
    c
}

async fn nmdc_login(addr: std::net::SocketAddr, nick: &str) -> Client {
    let mut c = nmdc_connect(addr).await;
    c.send(&format!("$Key anykey|$ValidateNick {nick}|")).await;
    c.expect("$Hello ").await;
    c.send(&format!(
        "$Version 1,0091|$GetNickList|$MyINFO $ALL {nick} <client V:1> $ $100$email$0$|"
    ))
    .await;
    c.expect("$NickList ").await;
    c
}

// S1: NMDC join and chat.
#[tokio::test]
async fn nmdc_join_and_chat() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;

    let mut alice = nmdc_login(addr, "alice").await;
    wait_online(&hub, "alice").await;

    let mut bob = nmdc_login(addr, "bob").await;
    // Alice sees bob join via his MyINFO broadcast.
    let join = alice.expect("$MyINFO $ALL bob").await;
    assert!(join.contains("$MyINFO $ALL bob"), "{join:?}");

    alice.send("<alice> hello|").await;
    let chat = bob.expect("<alice>").await;
    assert_eq!(chat, "<alice> hello");
}

// S1 addendum: the nick list includes the joiner.
#[tokio::test]
async fn nmdc_nicklist_contains_self() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut c = nmdc_connect(addr).await;
    c.send("$Key k|$ValidateNick alice|").await;
    c.expect("$Hello ").await;
    c.send("$Version 1,0091|$GetNickList|$MyINFO $ALL alice <client V:1> $ $100$email$0$|")
        .await;
    let list = c.expect("$NickList ").await;
    assert!(list.contains("alice$$"), "{list:?}");
    let info = c.expect("$MyINFO $ALL alice").await;
    assert!(info.contains("$0$"), "{info:?}");
}

// S2: ADC handshake with TIGR missing.
#[tokio::test]
async fn adc_missing_tigr_is_rejected() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;
    let mut c = Client::connect(addr, b'\n').await;
    c.send("HSUP ADBASE\n").await;
    let sta = c.expect("ISTA ").await;
    assert!(sta.starts_with("ISTA 141 "), "{sta:?}");
    assert!(sta.contains("TIGR"), "{sta:?}");
    c.expect_close().await;
    assert_eq!(hub.roster().len(), 0, "no join may be broadcast");
}

fn adc_identity(seed: u8) -> (Cid, Cid) {
    let pid = Cid([seed; 24]);
    (pid, Cid::from_pid(&pid))
}

async fn adc_start(addr: std::net::SocketAddr) -> (Client, String) {
    let mut c = Client::connect(addr, b'\n').await;
    c.send("HSUP ADBASE ADTIGR\n").await;
    c.expect("ISUP ").await;
    let sid_line = c.expect("ISID ").await;
    let sid = sid_line.trim_start_matches("ISID ").trim().to_string();
    (c, sid)
}

async fn adc_login(addr: std::net::SocketAddr, nick: &str, seed: u8) -> (Client, String) {
    let (mut c, sid) = adc_start(addr).await;
    let (pid, cid) = adc_identity(seed);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NI{nick} SL1 SS1024 SUTCP4\n",
        cid.to_base32(),
        pid.to_base32()
    ))
    .await;
    c.expect("IINF ").await;
    // Own INF echo confirms acceptance.
    c.expect(&format!("BINF {sid}")).await;
    (c, sid)
}

// S3: nick collision across protocols.
#[tokio::test]
async fn nick_collision_across_protocols() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;

    let _bob_nmdc = nmdc_login(addr, "bob").await;
    let sid_before = wait_online(&hub, "bob").await.sid();

    let (mut c, sid) = adc_start(addr).await;
    let (pid, cid) = adc_identity(7);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NIbob\n",
        cid.to_base32(),
        pid.to_base32()
    ))
    .await;
    let sta = c.expect("ISTA ").await;
    assert!(sta.starts_with("ISTA 124 "), "{sta:?}");
    c.expect_close().await;

    let bob = hub.roster().by_name("bob").expect("bob must stay online");
    assert_eq!(bob.sid(), sid_before, "survivor keeps its SID");
    assert_eq!(hub.roster().len(), 1);
}

// ADC PID/CID mismatch is status 27.
#[tokio::test]
async fn adc_pid_mismatch_rejected() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let (mut c, sid) = adc_start(addr).await;
    let (pid, _) = adc_identity(1);
    let wrong = Cid([0xAA; 24]);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NIeve\n",
        wrong.to_base32(),
        pid.to_base32()
    ))
    .await;
    let sta = c.expect("ISTA ").await;
    assert!(sta.starts_with("ISTA 227 "), "{sta:?}");
    c.expect_close().await;
}

// An all-zero PID is refused even when the CID derivation matches.
#[tokio::test]
async fn adc_zero_pid_rejected() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;
    let (mut c, sid) = adc_start(addr).await;
    let pid = Cid([0; 24]);
    let cid = Cid::from_pid(&pid);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NIeve\n",
        cid.to_base32(),
        pid.to_base32()
    ))
    .await;
    let sta = c.expect("ISTA ").await;
    assert!(sta.starts_with("ISTA 227 "), "{sta:?}");
    c.expect_close().await;
    assert_eq!(hub.roster().len(), 0);
}

// Cross-protocol chat: ADC speaker, NMDC listener.
#[tokio::test]
async fn adc_chat_reaches_nmdc_peer() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let (mut bob, sid) = adc_login(addr, "bob", 3).await;

    bob.send(&format!("BMSG {sid} hi\\sthere\n")).await;
    let chat = alice.expect("<bob>").await;
    assert_eq!(chat, "<bob> hi there");
}

// ADC password login: IGPA nonce, Tiger proof in HPAS.
#[tokio::test]
async fn adc_password_proof() {
    let (addr, hub) = start_hub(|_, _, db| {
        db.put_user(
            "carol",
            &UserRecord { pass: Some("secret".to_string()), ..UserRecord::default() },
        )
        .unwrap();
    })
    .await;

    let (mut c, sid) = adc_start(addr).await;
    let (pid, cid) = adc_identity(5);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NIcarol\n",
        cid.to_base32(),
        pid.to_base32()
    ))
    .await;
    let gpa = c.expect("IGPA ").await;
    let nonce = data_encoding::BASE32_NOPAD
        .decode(gpa.trim_start_matches("IGPA ").trim().as_bytes())
        .expect("nonce decodes");
    let mut data = b"secret".to_vec();
    data.extend_from_slice(&nonce);
    let proof = data_encoding::BASE32_NOPAD.encode(&dchub_proto::tiger_digest(&data));
    c.send(&format!("HPAS {proof}\n")).await;
    c.expect("IINF ").await;
    wait_online(&hub, "carol").await;
}

// Wrong ADC password proof is status 23.
#[tokio::test]
async fn adc_bad_password_rejected() {
    let (addr, hub) = start_hub(|_, _, db| {
        db.put_user(
            "carol",
            &UserRecord { pass: Some("secret".to_string()), ..UserRecord::default() },
        )
        .unwrap();
    })
    .await;

    let (mut c, sid) = adc_start(addr).await;
    let (pid, cid) = adc_identity(6);
    c.send(&format!(
        "BINF {sid} ID{} PD{} NIcarol\n",
        cid.to_base32(),
        pid.to_base32()
    ))
    .await;
    c.expect("IGPA ").await;
    let proof = data_encoding::BASE32_NOPAD.encode(&[0u8; 24]);
    c.send(&format!("HPAS {proof}\n")).await;
    let sta = c.expect("ISTA ").await;
    assert!(sta.starts_with("ISTA 223 "), "{sta:?}");
    assert!(hub.roster().by_name("carol").is_none());
}

// NMDC password round: $GetPass / $MyPass / $BadPass.
#[tokio::test]
async fn nmdc_password_login() {
    let (addr, hub) = start_hub(|_, _, db| {
        db.put_user(
            "reg",
            &UserRecord { pass: Some("hunter2".to_string()), ..UserRecord::default() },
        )
        .unwrap();
    })
    .await;

    let mut c = nmdc_connect(addr).await;
    c.send("$Key k|$ValidateNick reg|").await;
    c.expect("$GetPass").await;
    c.send("$MyPass hunter2|").await;
    c.expect("$Hello ").await;
    c.send("$Version 1,0091|$GetNickList|$MyINFO $ALL reg <client V:1> $ $100$e$0$|")
        .await;
    c.expect("$NickList ").await;
    wait_online(&hub, "reg").await;

    let mut bad = nmdc_connect(addr).await;
    bad.send("$Key k|$ValidateNick reg2|").await;
    // Unregistered nick: no password round.
    bad.expect("$Hello ").await;
}

#[tokio::test]
async fn nmdc_wrong_password_rejected() {
    let (addr, hub) = start_hub(|_, _, db| {
        db.put_user(
            "reg",
            &UserRecord { pass: Some("hunter2".to_string()), ..UserRecord::default() },
        )
        .unwrap();
    })
    .await;

    let mut c = nmdc_connect(addr).await;
    c.send("$Key k|$ValidateNick reg|").await;
    c.expect("$GetPass").await;
    c.send("$MyPass wrong|").await;
    c.expect("$BadPass").await;
    c.expect_close().await;
    assert!(hub.roster().by_name("reg").is_none());
}

// S4: IRC bridge.
#[tokio::test]
async fn irc_bridge_join_and_chat() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;

    let mut carol = Client::connect(addr, b'\n').await;
    carol.send("NICK carol\r\nUSER c 0 * :c\r\n").await;
    for num in ["001", "002", "003", "004", "005"] {
        let line = carol.frame().await;
        assert!(line.contains(num), "expected numeric {num}, got {line:?}");
    }
    carol.send("JOIN #hub\r\n").await;
    let echo = carol.expect(":carol!").await;
    assert!(echo.contains("JOIN #hub"), "{echo:?}");
    let synthetic = carol.expect(":alice!").await;
    assert!(synthetic.contains("JOIN #hub"), "{synthetic:?}");
    wait_online(&hub, "carol").await;

    // NMDC chat reaches the IRC client as a PRIVMSG to #hub.
    alice.send("<alice> hi|").await;
    let msg = carol.expect(":alice!").await;
    assert!(msg.contains("PRIVMSG #hub :hi"), "{msg:?}");

    // And the other way around.
    carol.send("PRIVMSG #hub :hello from irc\r\n").await;
    let chat = alice.expect("<carol>").await;
    assert_eq!(chat, "<carol> hello from irc");
}

// IRC nick collision gets numeric 433 and a retry.
#[tokio::test]
async fn irc_nick_collision_433() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;
    let _alice = nmdc_login(addr, "alice").await;

    let mut c = Client::connect(addr, b'\n').await;
    c.send("NICK alice\r\nUSER a 0 * :a\r\n").await;
    let err = c.expect(":").await;
    assert!(err.contains(" 433 "), "{err:?}");
    c.send("NICK carol\r\n").await;
    let welcome = c.expect(":").await;
    assert!(welcome.contains(" 001 "), "{welcome:?}");
    c.send("JOIN #hub\r\n").await;
    c.expect(":carol!").await;
    wait_online(&hub, "carol").await;
}

// S6: redirect rule, no join broadcast.
#[tokio::test]
async fn nmdc_redirect_to_tls() {
    let (addr, hub) = start_hub(|conf, opts, _| {
        conf.set(CONFIG_NMDC_REDIRECT_TLS, Value::Bool(true), false);
        opts.tls_addr = Some("tls.example.org:1412".to_string());
    })
    .await;

    let mut c = nmdc_connect(addr).await;
    c.send("$Key k|$ValidateNick mover|").await;
    c.expect("$Hello ").await;
    c.send("$Version 1,0091|$GetNickList|$MyINFO $ALL mover <client V:1> $ $100$e$0$|")
        .await;
    let mv = c.expect("$ForceMove ").await;
    assert_eq!(mv, "$ForceMove nmdcs://tls.example.org:1412");
    c.expect_close().await;
    assert!(hub.roster().by_name("mover").is_none(), "no join after a redirect");
    assert_eq!(hub.roster().len(), 0);
}

// Leaves are broadcast: $Quit to NMDC, PART to IRC.
#[tokio::test]
async fn leave_broadcasts() {
    let (addr, hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let bob = nmdc_login(addr, "bob").await;
    alice.expect("$MyINFO $ALL bob").await;

    drop(bob); // closes the socket
    let quit = alice.expect("$Quit ").await;
    assert_eq!(quit, "$Quit bob");
    // Eventually consistent: the roster entry is gone once the
    // broadcast arrived.
    assert!(hub.roster().by_name("bob").is_none());
}

// Private messages, NMDC to NMDC.
#[tokio::test]
async fn nmdc_private_message() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let mut bob = nmdc_login(addr, "bob").await;
    alice.expect("$MyINFO $ALL bob").await;

    alice.send("$To: bob From: alice $<alice> psst|").await;
    let pm = bob.expect("$To: ").await;
    assert_eq!(pm, "$To: bob From: alice $<alice> psst");
}

// Unknown command prefix gets a hub reply, not a broadcast.
#[tokio::test]
async fn unknown_command_reply() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let mut bob = nmdc_login(addr, "bob").await;
    alice.expect("$MyINFO $ALL bob").await;

    alice.send("<alice> !definitelynotacommand|").await;
    let reply = alice.expect("<hub>").await;
    assert!(reply.contains("unknown command"), "{reply:?}");

    // The command line never reaches other peers; a normal line does.
    alice.send("<alice> after|").await;
    let chat = bob.expect("<alice>").await;
    assert_eq!(chat, "<alice> after");
}

// NMDC search relay, active and passive, and SR routing.
#[tokio::test]
async fn nmdc_search_relay() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let mut bob = nmdc_login(addr, "bob").await;
    alice.expect("$MyINFO $ALL bob").await;

    alice.send("$Search Hub:alice F?T?0?1?iso|").await;
    let search = bob.expect("$Search ").await;
    assert_eq!(search, "$Search Hub:alice F?T?0?1?iso");

    // Bob answers with a passive result addressed to alice.
    bob.send("$SR bob files\\stuff.iso\x05123 1/1\x05Hub (127.0.0.1:411)\x05alice|")
        .await;
    let sr = alice.expect("$SR ").await;
    assert!(sr.starts_with("$SR bob "), "{sr:?}");
    assert!(!sr.contains("\x05alice"), "target nick must be stripped: {sr:?}");
}

// ConnectToMe relay between NMDC peers.
#[tokio::test]
async fn nmdc_connect_to_me_relay() {
    let (addr, _hub) = start_hub(|_, _, _| {}).await;
    let mut alice = nmdc_login(addr, "alice").await;
    let mut bob = nmdc_login(addr, "bob").await;
    alice.expect("$MyINFO $ALL bob").await;

    alice.send("$ConnectToMe bob 127.0.0.1:3000|").await;
    let ctm = bob.expect("$ConnectToMe ").await;
    assert_eq!(ctm, "$ConnectToMe bob 127.0.0.1:3000");
}

// Zlib: after $ZOn everything downstream is compressed.
#[tokio::test]
async fn nmdc_zlib_downstream() {
    let (addr, _hub) = start_hub(|conf, _, _| {
        conf.set(CONFIG_ZLIB_LEVEL, Value::Int(6), false);
    })
    .await;

    let mut c = nmdc_connect(addr).await;
    c.send("$Key k|$ValidateNick zuser|").await;
    c.expect("$Hello ").await;
    c.send("$Version 1,0091|$GetNickList|$MyINFO $ALL zuser <client V:1> $ $100$e$0$|")
        .await;
    // Frames arrive until the $ZOn sentinel; after it the stream is
    // a zlib stream, which we inflate manually here.
    c.expect("$ZOn").await;
    let mut z = flate2::Decompress::new(true);
    let mut plain = Vec::new();
    let mut chunk = [0u8; 4096];
    // Leftover bytes already read past the sentinel are compressed.
    let mut pending = std::mem::take(&mut c.buf);
    loop {
        if !pending.is_empty() {
            let mut out = [0u8; 16 * 1024];
            let before_in = z.total_in();
            let before_out = z.total_out();
            z.decompress(&pending, &mut out, flate2::FlushDecompress::None).expect("inflate");
            let consumed = (z.total_in() - before_in) as usize;
            let wrote = (z.total_out() - before_out) as usize;
            plain.extend_from_slice(&out[..wrote]);
            pending.drain(..consumed);
        }
        if plain.windows(9).any(|w| w == b"$NickList") {
            break;
        }
        let n = tokio::time::timeout(STEP, c.stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .expect("read");
        assert!(n > 0, "closed before the nick list");
        pending.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&plain);
    assert!(text.contains("$NickList zuser$$"), "{text:?}");
}
