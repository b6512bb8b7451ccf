//! NMDC protocol handler: lock/key handshake, session loop and the
//! NMDC peer implementation.
//!
//! Login sequence (hub side):
//!
//! 1. hub: `$Lock <random> Pk=...` — client: `$Supports`, `$Key`,
//!    `$ValidateNick <nick>`
//! 2. nick policy check, ban/private checks, roster reservation
//!    (`$ValidateDenide` on collision), `$GetPass`/`$MyPass`/`$BadPass`
//!    for registered nicks
//! 3. hub: `$Hello <nick>` — client: `$Version`, `$GetNickList`,
//!    `$MyINFO`
//! 4. hub: `$HubName`, MOTD, optional `$ZOn`, bulk `$NickList` /
//!    `$OpList` / per-peer `$MyINFO`
//! 5. redirect rules may pre-empt acceptance with `$ForceMove`
//! 6. acceptance: roster entry installed, join broadcast

use std::sync::{Arc, RwLock};
use std::time::Duration;

use dchub_proto::nmdc::{ClientTag, Message, MyInfo, SearchAddr, UserMode};
use dchub_proto::Software;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::conn::{run_writer, LineReader, Outbound, TextCodec, WriteMode};
use crate::error::HubError;
use crate::hub::Hub;
use crate::peer::{
    BasePeer, Caps, ConnInfo, Peer, PeerRef, Protocol, SearchPayload, SearchRequest, SearchResult,
    UserInfo,
};
use crate::room::{ChatMessage, Room};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_EVERY: Duration = Duration::from_secs(120);

/// NMDC status-flag bit advertising TLS transfer support.
const FLAG_TLS: u8 = 0x10;

/// Extensions the hub advertises in `$Supports`.
const HUB_SUPPORTS: &[&str] = &["NoHello", "NoGetINFO", "TTHSearch", "ZPipe0"];

/// Serve one NMDC connection to completion.
pub(crate) async fn serve(
    hub: &Arc<Hub>,
    stream: TcpStream,
    cinfo: ConnInfo,
) -> Result<(), HubError> {
    let (rd, wr) = stream.into_split();
    let codec = Arc::new(TextCodec::new(encoding_rs::WINDOWS_1252, hub.fallback_encoding()));
    let (tx, rx) = mpsc::channel(hub.options().outbound_queue);
    let (close_tx, close_rx) = watch::channel(false);
    let writer = tokio::spawn(run_writer(wr, rx, WriteMode::Nmdc(Arc::clone(&codec)), close_rx));
    let mut reader = LineReader::new(rd, b'|', dchub_proto::nmdc::MAX_LINE);

    let res = match handshake(hub, &mut reader, &codec, &tx, close_tx, cinfo).await {
        Ok(Some(peer)) => {
            let peer_ref: PeerRef = peer.clone();
            let res = session(hub, &peer, &mut reader, &codec).await;
            hub.leave(&peer_ref, res.as_ref().err().map(|_| "error").or(Some("quit")));
            peer.base.shutdown();
            res
        },
        Ok(None) => Ok(()), // redirected before acceptance
        Err(e) => Err(e),
    };
    let _ = writer.await;
    res
}

/// Read one decoded message during the handshake.
async fn read_msg(
    reader: &mut LineReader,
    codec: &TextCodec,
    timeout: Duration,
) -> Result<Message, HubError> {
    loop {
        let Some(line) = reader.read_line(Some(timeout)).await? else {
            return Err(HubError::Handshake("connection closed during login".to_string()));
        };
        if line.is_empty() {
            continue; // keep-alive
        }
        let text = codec.decode(&line);
        return Ok(Message::decode(&text)?);
    }
}

fn send_msg(tx: &mpsc::Sender<Outbound>, m: &Message) -> Result<(), HubError> {
    let mut line = String::new();
    m.encode(&mut line)?;
    tx.try_send(Outbound::Line(line)).map_err(|_| HubError::PeerClosed)
}

fn random_lock() -> String {
    let mut rng = rand::thread_rng();
    let mut lock = String::from("EXTENDEDPROTOCOL");
    for _ in 0..16 {
        let c = rng.gen_range(b'A'..=b'Z');
        lock.push(c as char);
    }
    lock
}

async fn handshake(
    hub: &Arc<Hub>,
    reader: &mut LineReader,
    codec: &TextCodec,
    tx: &mpsc::Sender<Outbound>,
    close_tx: watch::Sender<bool>,
    cinfo: ConnInfo,
) -> Result<Option<Arc<NmdcPeer>>, HubError> {
    let soft = hub.soft().clone();
    send_msg(tx, &Message::Lock {
        lock: random_lock(),
        pk: format!("{}/{}", soft.name, soft.version),
    })?;

    // LOCK_SENT -> KEY_RECV -> VALIDATE
    let mut key_seen = false;
    let nick = loop {
        match read_msg(reader, codec, HANDSHAKE_TIMEOUT).await? {
            Message::Supports { .. } => {
                send_msg(tx, &Message::Supports {
                    features: HUB_SUPPORTS.iter().map(|s| s.to_string()).collect(),
                })?;
            },
            Message::Key { .. } => key_seen = true,
            Message::ValidateNick { nick } => break nick,
            other => {
                return Err(HubError::Handshake(format!(
                    "expected $Key/$ValidateNick, got {other:?}"
                )));
            },
        }
    };
    if !key_seen {
        return Err(HubError::Handshake("$ValidateNick before $Key".to_string()));
    }

    hub.validate_nick(&nick)?;
    let rec = hub.get_user(&nick)?;
    if let Some(rec) = &rec {
        if rec.is_banned() {
            send_msg(tx, &Message::ChatMsg {
                nick: hub.config().bot_name(),
                text: "you are banned from this hub".to_string(),
                me: false,
            })?;
            return Err(HubError::Banned);
        }
    }
    if hub.config().is_private() && rec.is_none() {
        send_msg(tx, &Message::ChatMsg {
            nick: hub.config().bot_name(),
            text: "this hub is for registered users only".to_string(),
            me: false,
        })?;
        return Err(HubError::RegisteredOnly);
    }

    let res = match hub.reserve_name(&nick) {
        Ok(res) => res,
        Err(HubError::NickTaken) => {
            send_msg(tx, &Message::ValidateDenide { nick: nick.clone() })?;
            return Err(HubError::NickTaken);
        },
        Err(e) => return Err(e),
    };

    if let Some(rec) = &rec {
        if let Some(pass) = &rec.pass {
            send_msg(tx, &Message::GetPass)?;
            match read_msg(reader, codec, HANDSHAKE_TIMEOUT).await? {
                Message::MyPass { pass: given } if &given == pass => {},
                Message::MyPass { .. } => {
                    send_msg(tx, &Message::BadPass)?;
                    return Err(HubError::WrongPassword);
                },
                other => {
                    return Err(HubError::Handshake(format!("expected $MyPass, got {other:?}")));
                },
            }
        }
    }

    let sid = hub.roster().alloc_sid();
    let peer = Arc::new(NmdcPeer {
        base: BasePeer::new(hub, sid, None, cinfo.clone(), Protocol::Nmdc, tx.clone(), close_tx),
        myinfo: RwLock::new(MyInfo::default()),
    });
    peer.base.set_name(&nick);
    peer.base.set_profile(rec.as_ref().and_then(|r| r.profile.clone()));

    send_msg(tx, &Message::Hello { nick: nick.clone() })?;

    // MYINFO state: $Version / $GetNickList / $MyINFO in any order.
    loop {
        match read_msg(reader, codec, HANDSHAKE_TIMEOUT).await? {
            Message::Version { .. } | Message::GetNickList | Message::Supports { .. } => {},
            Message::MyInfo(info) => {
                if info.nick != nick {
                    return Err(HubError::Handshake("MyINFO nick mismatch".to_string()));
                }
                peer.apply_myinfo(info);
                break;
            },
            other => {
                return Err(HubError::Handshake(format!("expected $MyINFO, got {other:?}")));
            },
        }
    }

    send_msg(tx, &Message::HubName { name: hub.config().name() })?;
    let topic = hub.config().topic();
    if !topic.is_empty() {
        send_msg(tx, &Message::HubTopic { topic })?;
    }

    let peer_ref: PeerRef = peer.clone();
    if let Some(motd) = hub.motd_for(&peer_ref) {
        send_msg(tx, &Message::ChatMsg { nick: hub.config().bot_name(), text: motd, me: false })?;
    }

    // Redirect rules pre-empt acceptance: no join is broadcast.
    if !cinfo.secure && hub.config().redirect_nmdc_tls() {
        if let Some(url) = hub.nmdcs_url() {
            send_msg(tx, &Message::ForceMove { addr: url })?;
            peer.base.shutdown();
            return Ok(None);
        }
    }
    if hub.config().redirect_nmdc_adc() {
        send_msg(tx, &Message::ForceMove { addr: hub.adc_url() })?;
        peer.base.shutdown();
        return Ok(None);
    }

    // Everything after this point may be compressed.
    let zlib = hub.config().zlib_level();
    if zlib > 0 {
        peer.base.send_zon(zlib)?;
    }

    send_peer_lists(hub, &peer)?;

    hub.accept_peer(&peer_ref, res)?;
    Ok(Some(peer))
}

/// Send `$NickList`, `$OpList` and the per-peer `$MyINFO` bulk, plus the
/// new peer's own info echo.
fn send_peer_lists(hub: &Arc<Hub>, peer: &Arc<NmdcPeer>) -> Result<(), HubError> {
    let peers = hub.roster().peers();
    let mut nicks: Vec<String> = peers.iter().map(|p| p.name()).collect();
    nicks.push(peer.base.name());
    peer.send(&Message::NickList { nicks })?;

    let mut ops: Vec<String> = peers.iter().filter(|p| hub.is_op(p)).map(|p| p.name()).collect();
    let self_ref: PeerRef = peer.clone();
    if hub.is_op(&self_ref) {
        ops.push(peer.base.name());
    }
    if !ops.is_empty() {
        peer.send(&Message::OpList { nicks: ops })?;
    }

    for p in &peers {
        peer.send(&Message::MyInfo(myinfo_for(p)))?;
    }
    peer.send(&Message::MyInfo(peer.myinfo()))?;
    Ok(())
}

/// Session loop after acceptance.
async fn session(
    hub: &Arc<Hub>,
    peer: &Arc<NmdcPeer>,
    reader: &mut LineReader,
    codec: &TextCodec,
) -> Result<(), HubError> {
    let peer_ref: PeerRef = peer.clone();
    let mut keepalive = tokio::time::interval(KEEPALIVE_EVERY);
    keepalive.tick().await;
    loop {
        let line = tokio::select! {
            () = peer.base.closed() => return Ok(()),
            _ = keepalive.tick() => {
                let _ = peer.base.send_line("|".to_string());
                continue;
            },
            line = reader.read_line(Some(IDLE_TIMEOUT)) => match line? {
                Some(line) => line,
                None => return Ok(()), // EOF
            },
        };
        if line.is_empty() {
            continue; // client keep-alive
        }
        let text = codec.decode(&line);
        match Message::decode(&text)? {
            Message::ChatMsg { nick, text, me } => {
                if nick != peer.base.name() {
                    tracing::debug!(claimed = %nick, "chat with foreign nick dropped");
                    continue;
                }
                hub.handle_chat(&peer_ref, text, me);
            },
            Message::PrivateTo { to, text, me, .. } => {
                hub.handle_private(&peer_ref, &to, text, me);
            },
            Message::GetNickList => {
                // Re-sync: fresh lists on request.
                let _ = send_peer_lists(hub, peer);
            },
            Message::MyInfo(info) => {
                if info.nick != peer.base.name() {
                    return Err(HubError::Handshake("MyINFO nick mismatch".to_string()));
                }
                peer.apply_myinfo(info);
                hub.broadcast_update(&peer_ref);
            },
            Message::Search { addr, spec } => {
                // Passive return addresses are pinned to the sender.
                let addr = match addr {
                    SearchAddr::Passive(_) => SearchAddr::Passive(peer.base.name()),
                    active => active,
                };
                let req = SearchRequest {
                    origin_sid: peer.base.sid,
                    origin_name: peer.base.name(),
                    payload: SearchPayload::Nmdc { addr, spec },
                };
                hub.relay_search(&peer_ref, &req);
            },
            Message::Sr { from, data, target: Some(target) } => {
                if from != peer.base.name() {
                    continue;
                }
                if let Some(p) = hub.roster().by_name(&target) {
                    let _ = p.search_result(&SearchResult::Nmdc { from, data });
                }
            },
            Message::Sr { .. } => {},
            Message::ConnectToMe { target, addr, secure } => {
                if let Some(p) = hub.roster().by_name(&target) {
                    let token = format!("{:x}", rand::random::<u64>());
                    let _ = p.connect_to(&peer_ref, &addr, &token, secure);
                }
            },
            Message::RevConnectToMe { from, to } => {
                if from != peer.base.name() {
                    continue;
                }
                if let Some(p) = hub.roster().by_name(&to) {
                    let token = format!("{:x}", rand::random::<u64>());
                    let _ = p.rev_connect_to(&peer_ref, &token, false);
                }
            },
            Message::ZOn => {
                // Client-side compression switch; one-shot per stream.
                reader.enable_zlib()?;
            },
            Message::Quit { .. } => return Ok(()),
            Message::Unknown { cmd, .. } => {
                tracing::debug!(cmd = %cmd, "unhandled NMDC command");
            },
            other => {
                tracing::debug!(msg = ?other, "unexpected NMDC message in session");
            },
        }
    }
}

/// Build an NMDC MyINFO for any peer, whatever protocol it speaks.
fn myinfo_for(p: &PeerRef) -> MyInfo {
    let u = p.user_info();
    let mode = if u.caps.active { UserMode::Active } else { UserMode::Passive };
    let tag = ClientTag {
        client: if u.app.name.is_empty() {
            Software { name: "unknown".to_string(), version: String::new() }
        } else {
            u.app.clone()
        },
        mode: Some(mode),
        hubs: (1, 0, 0),
        slots: u.slots,
    };
    let mut flag = u.flag;
    if u.caps.tls {
        flag |= FLAG_TLS;
    }
    MyInfo {
        nick: u.name,
        desc: u.desc,
        tag: Some(tag.to_string()),
        conn: u.conn,
        flag,
        email: u.email,
        share: u.share,
    }
}

/// An NMDC peer.
pub(crate) struct NmdcPeer {
    base: BasePeer,
    myinfo: RwLock<MyInfo>,
}

impl NmdcPeer {
    fn send(&self, m: &Message) -> Result<(), HubError> {
        let mut line = String::new();
        m.encode(&mut line)?;
        self.base.send_line(line)
    }

    fn myinfo(&self) -> MyInfo {
        self.myinfo.read().expect("myinfo lock poisoned").clone()
    }

    /// Store a client `$MyINFO` and derive the neutral user info.
    fn apply_myinfo(&self, info: MyInfo) {
        let tag = info.client_tag();
        let user = UserInfo {
            name: info.nick.clone(),
            desc: info.desc.clone(),
            app: tag.as_ref().map(|t| t.client.clone()).unwrap_or_default(),
            email: info.email.clone(),
            share: info.share,
            slots: tag.as_ref().map_or(0, |t| t.slots),
            caps: Caps {
                active: tag.as_ref().and_then(|t| t.mode) == Some(UserMode::Active),
                ipv4: true,
                ipv6: false,
                tls: info.flag & FLAG_TLS != 0,
                file_list: true,
                segmented: false,
            },
            conn: info.conn.clone(),
            flag: info.flag & !FLAG_TLS,
        };
        self.base.set_user(user);
        *self.myinfo.write().expect("myinfo lock poisoned") = info;
    }
}

impl Peer for NmdcPeer {
    fn base(&self) -> &BasePeer {
        &self.base
    }

    fn user_info(&self) -> UserInfo {
        self.base.user()
    }

    fn peers_join(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send(&Message::MyInfo(myinfo_for(p)))?;
        }
        Ok(())
    }

    fn peers_update(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        self.peers_join(peers)
    }

    fn peers_leave(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send(&Message::Quit { nick: p.name() })?;
        }
        Ok(())
    }

    fn chat_msg(&self, room: &Room, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        if room.is_global() {
            if msg.me {
                let line =
                    format!("* {} {}|", dchub_proto::nmdc::escape(&msg.name), dchub_proto::nmdc::escape(&msg.text));
                return self.base.send_line(line);
            }
            return self.send(&Message::ChatMsg {
                nick: msg.name.clone(),
                text: msg.text.clone(),
                me: false,
            });
        }
        // Named rooms surface as private messages from the room.
        self.send(&Message::PrivateTo {
            to: self.base.name(),
            from: room.name().to_string(),
            nick: from.name(),
            text: msg.text.clone(),
            me: msg.me,
        })
    }

    fn private_msg(&self, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        self.send(&Message::PrivateTo {
            to: self.base.name(),
            from: from.name(),
            nick: msg.name.clone(),
            text: msg.text.clone(),
            me: msg.me,
        })
    }

    fn hub_chat_msg(&self, msg: &ChatMessage) -> Result<(), HubError> {
        self.send(&Message::ChatMsg { nick: msg.name.clone(), text: msg.text.clone(), me: false })
    }

    fn join_room(&self, _room: &Room) -> Result<(), HubError> {
        Ok(())
    }

    fn leave_room(&self, _room: &Room) -> Result<(), HubError> {
        Ok(())
    }

    fn connect_to(
        &self,
        _from: &PeerRef,
        addr: &str,
        _token: &str,
        secure: bool,
    ) -> Result<(), HubError> {
        self.send(&Message::ConnectToMe {
            target: self.base.name(),
            addr: addr.to_string(),
            secure,
        })
    }

    fn rev_connect_to(&self, from: &PeerRef, _token: &str, _secure: bool) -> Result<(), HubError> {
        self.send(&Message::RevConnectToMe { from: from.name(), to: self.base.name() })
    }

    fn search(&self, req: &SearchRequest) -> Result<(), HubError> {
        match &req.payload {
            SearchPayload::Nmdc { addr, spec } => self.send(&Message::Search {
                addr: addr.clone(),
                spec: spec.clone(),
            }),
            // ADC searches are not translated; unsupported combination.
            SearchPayload::Adc { .. } => Ok(()),
        }
    }

    fn search_result(&self, res: &SearchResult) -> Result<(), HubError> {
        match res {
            SearchResult::Nmdc { from, data } => self.send(&Message::Sr {
                from: from.clone(),
                data: data.clone(),
                target: None,
            }),
            SearchResult::Adc { .. } => Ok(()),
        }
    }

    fn redirect(&self, addr: &str) -> Result<(), HubError> {
        self.send(&Message::ForceMove { addr: addr.to_string() })?;
        self.base.shutdown();
        Ok(())
    }
}
