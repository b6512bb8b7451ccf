//! ADC protocol handler: SUP/SID/INF handshake, session routing and the
//! ADC peer implementation.
//!
//! Phases follow the ADC specification: PROTOCOL (feature negotiation,
//! SID assignment), IDENTIFY (`BINF` with PID/CID proof and nick),
//! optional VERIFY (`IGPA`/`HPAS` Tiger password proof), then NORMAL.
//! Direct and echo packets are routed structurally; bodies are decoded
//! only when the hub itself needs their contents.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use dchub_proto::adc::{
    ChatMsg, ConnectToMe, GetPassword, Packet, PacketKind, Password, Quit, RevConnectToMe,
    Severity, SidAssign, Status, Supported, UserInfo as AdcInfo, CMD_CTM, CMD_INF, CMD_MSG,
    CMD_PAS, CMD_QUI, CMD_RCM, CMD_RES, CMD_SCH, CMD_STA, CMD_SUP,
};
use dchub_proto::{tiger_digest, Cid, Features};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::conn::{run_writer, LineReader, Outbound, WriteMode};
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

/// Features the hub itself supports.
const HUB_FEATURES: &[&str] = &["BASE", "BAS0", "TIGR"];

/// TLS transfer protocol label.
const PROTO_ADCS: &str = "ADCS/0.10";
/// Plain transfer protocol label.
const PROTO_ADC: &str = "ADC/1.0";

/// Serve one ADC connection to completion.
pub(crate) async fn serve(
    hub: &Arc<Hub>,
    stream: TcpStream,
    cinfo: ConnInfo,
) -> Result<(), HubError> {
    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::channel(hub.options().outbound_queue);
    let (close_tx, close_rx) = watch::channel(false);
    let writer = tokio::spawn(run_writer(wr, rx, WriteMode::Plain, close_rx));
    let mut reader = LineReader::new(rd, b'\n', dchub_proto::adc::MAX_LINE);

    let res = match handshake(hub, &mut reader, &tx, close_tx, cinfo).await {
        Ok(Some(peer)) => {
            let peer_ref: PeerRef = peer.clone();
            let res = session(hub, &peer, &mut reader).await;
            hub.leave(&peer_ref, res.as_ref().err().map(|_| "error").or(Some("quit")));
            peer.base.shutdown();
            res
        },
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    let _ = writer.await;
    res
}

async fn read_packet(
    reader: &mut LineReader,
    timeout: Duration,
) -> Result<Option<Packet>, HubError> {
    loop {
        let Some(line) = reader.read_line(Some(timeout)).await? else {
            return Ok(None);
        };
        if line.is_empty() {
            continue; // keep-alive
        }
        let text = std::str::from_utf8(&line)
            .map_err(|_| HubError::Protocol(dchub_proto::ProtocolError::InvalidUtf8))?;
        return Ok(Some(Packet::decode(text)?));
    }
}

fn send_packet(tx: &mpsc::Sender<Outbound>, p: &Packet) -> Result<(), HubError> {
    let mut line = String::new();
    p.encode(&mut line)?;
    tx.try_send(Outbound::Line(line)).map_err(|_| HubError::PeerClosed)
}

fn send_status(
    tx: &mpsc::Sender<Outbound>,
    sev: Severity,
    code: u8,
    msg: &str,
) -> Result<(), HubError> {
    send_packet(tx, &Status { sev, code, msg: msg.to_string() }.to_packet(PacketKind::Info))
}

async fn handshake(
    hub: &Arc<Hub>,
    reader: &mut LineReader,
    tx: &mpsc::Sender<Outbound>,
    close_tx: watch::Sender<bool>,
    cinfo: ConnInfo,
) -> Result<Option<Arc<AdcPeer>>, HubError> {
    // PROTOCOL: client leads with HSUP.
    let Some(sup) = read_packet(reader, HANDSHAKE_TIMEOUT).await? else {
        return Err(HubError::Handshake("connection closed during login".to_string()));
    };
    if sup.kind != PacketKind::Hub || sup.cmd != CMD_SUP {
        return Err(HubError::Handshake(format!("expected HSUP, got {}", sup.cmd_str())));
    }
    let sup = Supported::decode(&sup)?;
    let hub_features = Features::from_iter(HUB_FEATURES.iter().copied());
    let mutual = hub_features.intersect(&sup.add);
    if !mutual.has("BASE") && !mutual.has("BAS0") {
        send_status(tx, Severity::Recoverable, 41, "BASE is required")?;
        return Err(HubError::Handshake("client does not support BASE".to_string()));
    }
    if !mutual.has("TIGR") {
        send_status(tx, Severity::Recoverable, 41, "TIGR is required")?;
        return Err(HubError::Handshake("client does not support TIGR".to_string()));
    }

    send_packet(tx, &Supported { add: hub_features, remove: Features::new() }
        .to_packet(PacketKind::Info))?;
    let sid = hub.roster().alloc_sid();
    send_packet(tx, &SidAssign { sid }.to_packet())?;

    // IDENTIFY: client broadcasts its INF with PD and ID.
    let Some(pkt) = read_packet(reader, HANDSHAKE_TIMEOUT).await? else {
        return Err(HubError::Handshake("connection closed during identify".to_string()));
    };
    if pkt.cmd != CMD_INF || !matches!(pkt.kind, PacketKind::Broadcast { .. }) {
        return Err(HubError::Handshake(format!("expected BINF, got {}", pkt.cmd_str())));
    }
    let inf = AdcInfo::decode(&pkt)?;
    let (Some(pid), Some(id)) = (inf.pid, inf.id) else {
        send_status(tx, Severity::Fatal, 27, "PID and ID are required")?;
        return Err(HubError::Handshake("BINF without PID/ID".to_string()));
    };
    if pid.is_zero() || id.is_zero() {
        send_status(tx, Severity::Fatal, 27, "PID must not be empty")?;
        return Err(HubError::Handshake("zero PID/CID".to_string()));
    }
    if Cid::from_pid(&pid) != id {
        send_status(tx, Severity::Fatal, 27, "PID does not match CID")?;
        return Err(HubError::Handshake("PID/CID mismatch".to_string()));
    }
    let Some(nick) = inf.nick.clone().filter(|n| !n.is_empty()) else {
        send_status(tx, Severity::Fatal, 21, "nick is required")?;
        return Err(HubError::Handshake("BINF without a nick".to_string()));
    };
    if let Err(e) = hub.validate_nick(&nick) {
        send_status(tx, Severity::Fatal, 21, &e.to_string())?;
        return Err(e);
    }

    let rec = hub.get_user(&nick)?;
    if let Some(rec) = &rec {
        if rec.is_banned() {
            send_status(tx, Severity::Fatal, 30, "you are banned from this hub")?;
            return Err(HubError::Banned);
        }
    }
    if hub.config().is_private() && rec.is_none() {
        send_status(tx, Severity::Fatal, 26, "registered users only")?;
        return Err(HubError::RegisteredOnly);
    }
    if hub.roster().cid_in_use(&id) {
        send_status(tx, Severity::Fatal, 22, "CID is already in use")?;
        return Err(HubError::CidTaken);
    }

    let res = match hub.reserve_name(&nick) {
        Ok(res) => res,
        Err(HubError::NickTaken) => {
            send_status(tx, Severity::Recoverable, 24, "nick is already taken")?;
            return Err(HubError::NickTaken);
        },
        Err(e) => return Err(e),
    };

    // VERIFY: Tiger password proof for registered users.
    if let Some(pass) = rec.as_ref().and_then(|r| r.pass.clone()) {
        let mut nonce = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut nonce);
        send_packet(tx, &GetPassword { nonce: nonce.to_vec() }.to_packet())?;
        let Some(pkt) = read_packet(reader, HANDSHAKE_TIMEOUT).await? else {
            return Err(HubError::Handshake("connection closed during verify".to_string()));
        };
        if pkt.cmd != CMD_PAS {
            return Err(HubError::Handshake(format!("expected HPAS, got {}", pkt.cmd_str())));
        }
        let given = Password::decode(&pkt)?;
        let mut data = pass.into_bytes();
        data.extend_from_slice(&nonce);
        if tiger_digest(&data).as_slice() != given.proof.as_slice() {
            send_status(tx, Severity::Fatal, 23, "bad password")?;
            return Err(HubError::WrongPassword);
        }
    }

    let peer = Arc::new(AdcPeer {
        base: BasePeer::new(hub, sid, Some(id), cinfo.clone(), Protocol::Adc, tx.clone(), close_tx),
        inf: RwLock::new(AdcInfo::default()),
    });
    peer.base.set_name(&nick);
    peer.base.set_profile(rec.as_ref().and_then(|r| r.profile.clone()));
    peer.apply_inf(inf);

    // Redirect rule: plain connections move to the TLS endpoint before
    // any join is broadcast.
    if !cinfo.secure && hub.config().redirect_adc_tls() {
        if let Some(url) = hub.adcs_url() {
            let mut qui = Quit::new(sid);
            qui.redirect = Some(url);
            send_packet(tx, &qui.to_packet())?;
            peer.base.shutdown();
            return Ok(None);
        }
    }

    // Hub info, the current user list, then the peer's own INF echo.
    send_packet(tx, &hub_inf(hub).to_packet(PacketKind::Info))?;
    let peer_ref: PeerRef = peer.clone();
    if let Some(motd) = hub.motd_for(&peer_ref) {
        send_packet(tx, &ChatMsg { text: motd, me: false, pm: None }.to_packet(PacketKind::Info))?;
    }
    for p in hub.roster().peers() {
        send_packet(tx, &adc_inf_for(&p).to_packet(PacketKind::Broadcast { from: p.sid() }))?;
    }
    send_packet(
        tx,
        &adc_inf_for(&peer_ref).to_packet(PacketKind::Broadcast { from: sid }),
    )?;

    hub.accept_peer(&peer_ref, res)?;
    Ok(Some(peer))
}

/// Session loop after NORMAL.
async fn session(
    hub: &Arc<Hub>,
    peer: &Arc<AdcPeer>,
    reader: &mut LineReader,
) -> Result<(), HubError> {
    let peer_ref: PeerRef = peer.clone();
    let sid = peer.base.sid;
    let mut keepalive = tokio::time::interval(KEEPALIVE_EVERY);
    keepalive.tick().await;
    loop {
        let pkt = tokio::select! {
            () = peer.base.closed() => return Ok(()),
            _ = keepalive.tick() => {
                let _ = peer.base.send_line("\n".to_string());
                continue;
            },
            pkt = read_packet(reader, IDLE_TIMEOUT) => match pkt? {
                Some(pkt) => pkt,
                None => return Ok(()),
            },
        };

        if let Some(from) = pkt.kind.source() {
            if from != sid {
                return Err(HubError::Handshake("packet with a foreign source SID".to_string()));
            }
        }

        match (&pkt.kind, pkt.cmd) {
            (PacketKind::Broadcast { .. }, CMD_INF) => {
                let update = AdcInfo::decode(&pkt)?;
                if update.pid.is_some() {
                    return Err(HubError::Handshake("PD outside IDENTIFY".to_string()));
                }
                peer.merge_inf(update);
                hub.broadcast_update(&peer_ref);
            },
            (PacketKind::Broadcast { .. }, CMD_MSG) => {
                let msg = ChatMsg::decode(&pkt)?;
                hub.handle_chat(&peer_ref, msg.text, msg.me);
            },
            (PacketKind::Direct { to, .. } | PacketKind::Echo { to, .. }, CMD_MSG) => {
                let msg = ChatMsg::decode(&pkt)?;
                if matches!(pkt.kind, PacketKind::Echo { .. }) {
                    let _ = peer.send_packet_ref(&pkt);
                }
                let Some(target) = hub.roster().by_sid(*to) else { continue };
                hub.handle_private(&peer_ref, &target.name(), msg.text, msg.me);
            },
            (PacketKind::Broadcast { .. } | PacketKind::Feature { .. }, CMD_SCH) => {
                let req = SearchRequest {
                    origin_sid: sid,
                    origin_name: peer.base.name(),
                    payload: SearchPayload::Adc { packet: pkt.clone() },
                };
                hub.relay_search(&peer_ref, &req);
            },
            (PacketKind::Direct { to, .. }, CMD_RES) => {
                if let Some(target) = hub.roster().by_sid(*to) {
                    let _ = target.search_result(&SearchResult::Adc { packet: pkt.clone() });
                }
            },
            (PacketKind::Direct { to, .. } | PacketKind::Echo { to, .. }, CMD_CTM) => {
                let ctm = ConnectToMe::decode(&pkt)?;
                let Some(target) = hub.roster().by_sid(*to) else { continue };
                let addr = format!("{}:{}", peer.base.cinfo.remote.ip(), ctm.port);
                let secure = ctm.proto.starts_with("ADCS");
                let _ = target.connect_to(&peer_ref, &addr, &ctm.token, secure);
            },
            (PacketKind::Direct { to, .. } | PacketKind::Echo { to, .. }, CMD_RCM) => {
                let rcm = RevConnectToMe::decode(&pkt)?;
                let Some(target) = hub.roster().by_sid(*to) else { continue };
                let secure = rcm.proto.starts_with("ADCS");
                let _ = target.rev_connect_to(&peer_ref, &rcm.token, secure);
            },
            (PacketKind::Hub, CMD_SUP) => {
                // Feature updates after login are acknowledged silently.
            },
            (PacketKind::Hub, CMD_QUI) | (PacketKind::Broadcast { .. }, CMD_QUI) => {
                return Ok(());
            },
            (_, CMD_STA) => {
                let st = Status::decode(&pkt)?;
                tracing::debug!(code = st.code, msg = %st.msg, "client status");
            },
            _ => {
                tracing::debug!(cmd = pkt.cmd_str(), "unhandled ADC packet");
            },
        }
    }
}

/// Hub identity as an `IINF`.
fn hub_inf(hub: &Arc<Hub>) -> AdcInfo {
    let soft = hub.soft().clone();
    AdcInfo {
        nick: Some(hub.config().name()),
        desc: Some(hub.config().desc()),
        app: Some(soft.name),
        version: Some(soft.version),
        ctype: Some(32),
        ..AdcInfo::default()
    }
}

/// Build an ADC INF for any peer, whatever protocol it speaks.
fn adc_inf_for(p: &PeerRef) -> AdcInfo {
    let u = p.user_info();
    let mut features = Features::new();
    if u.caps.active && u.caps.ipv4 {
        features.insert("TCP4".to_string());
    }
    if u.caps.ipv6 {
        features.insert("TCP6".to_string());
    }
    if u.caps.segmented {
        features.insert("SEGA".to_string());
    }
    if u.caps.tls {
        features.insert("ADCS".to_string());
    }
    let ip4 = match p.remote_addr().ip() {
        std::net::IpAddr::V4(ip) => Some(ip.to_string()),
        std::net::IpAddr::V6(_) => None,
    };
    AdcInfo {
        id: p.cid(),
        nick: Some(u.name),
        desc: if u.desc.is_empty() { None } else { Some(u.desc) },
        share: Some(u.share),
        slots: Some(u.slots),
        hubs_normal: Some(1),
        features,
        app: if u.app.name.is_empty() { None } else { Some(u.app.name) },
        version: if u.app.version.is_empty() { None } else { Some(u.app.version) },
        ip4,
        email: if u.email.is_empty() { None } else { Some(u.email) },
        ..AdcInfo::default()
    }
}

/// An ADC peer.
pub(crate) struct AdcPeer {
    base: BasePeer,
    inf: RwLock<AdcInfo>,
}

impl AdcPeer {
    fn send_packet_ref(&self, p: &Packet) -> Result<(), HubError> {
        let mut line = String::new();
        p.encode(&mut line)?;
        self.base.send_line(line)
    }

    fn features(&self) -> Features {
        self.inf.read().expect("inf lock poisoned").features.clone()
    }

    /// Replace the stored INF wholesale (IDENTIFY).
    fn apply_inf(&self, mut inf: AdcInfo) {
        inf.pid = None; // never echoed
        self.update_user(&inf);
        *self.inf.write().expect("inf lock poisoned") = inf;
    }

    /// Merge a partial INF update (NORMAL state).
    fn merge_inf(&self, update: AdcInfo) {
        let mut inf = self.inf.write().expect("inf lock poisoned");
        merge_adc_inf(&mut inf, update);
        let merged = inf.clone();
        drop(inf);
        self.update_user(&merged);
    }

    fn update_user(&self, inf: &AdcInfo) {
        let user = UserInfo {
            name: self.base.name(),
            desc: inf.desc.clone().unwrap_or_default(),
            app: dchub_proto::Software {
                name: inf.app.clone().unwrap_or_default(),
                version: inf.version.clone().unwrap_or_default(),
            },
            email: inf.email.clone().unwrap_or_default(),
            share: inf.share.unwrap_or(0),
            slots: inf.slots.unwrap_or(0),
            caps: Caps {
                active: inf.features.has("TCP4") || inf.features.has("TCP6"),
                ipv4: inf.ip4.is_some() || inf.features.has("TCP4"),
                ipv6: inf.ip6.is_some() || inf.features.has("TCP6"),
                tls: inf.features.has("ADCS") || self.base.cinfo.secure,
                file_list: true,
                segmented: inf.features.has("SEGA"),
            },
            ..UserInfo::default()
        };
        self.base.set_user(user);
    }
}

/// Overlay `update`'s present fields onto `inf`.
fn merge_adc_inf(inf: &mut AdcInfo, update: AdcInfo) {
    macro_rules! take {
        ($field:ident) => {
            if update.$field.is_some() {
                inf.$field = update.$field;
            }
        };
    }
    take!(nick);
    take!(desc);
    take!(share);
    take!(share_files);
    take!(slots);
    take!(hubs_normal);
    take!(hubs_reg);
    take!(hubs_op);
    take!(app);
    take!(version);
    take!(ip4);
    take!(ip6);
    take!(udp4);
    take!(email);
    take!(ctype);
    if !update.features.is_empty() {
        inf.features = update.features;
    }
    for (k, v) in update.extra {
        if let Some(slot) = inf.extra.iter_mut().find(|(ek, _)| *ek == k) {
            slot.1 = v;
        } else {
            inf.extra.push((k, v));
        }
    }
}

impl Peer for AdcPeer {
    fn base(&self) -> &BasePeer {
        &self.base
    }

    fn user_info(&self) -> UserInfo {
        self.base.user()
    }

    fn peers_join(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send_packet_ref(
                &adc_inf_for(p).to_packet(PacketKind::Broadcast { from: p.sid() }),
            )?;
        }
        Ok(())
    }

    fn peers_update(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        self.peers_join(peers)
    }

    fn peers_leave(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send_packet_ref(&Quit::new(p.sid()).to_packet())?;
        }
        Ok(())
    }

    fn chat_msg(&self, room: &Room, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        if room.is_global() {
            return self.send_packet_ref(
                &ChatMsg { text: msg.text.clone(), me: msg.me, pm: None }
                    .to_packet(PacketKind::Broadcast { from: from.sid() }),
            );
        }
        // Named rooms surface as private messages from the sender.
        self.send_packet_ref(
            &ChatMsg { text: msg.text.clone(), me: msg.me, pm: Some(from.sid()) }.to_packet(
                PacketKind::Direct { from: from.sid(), to: self.base.sid },
            ),
        )
    }

    fn private_msg(&self, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        self.send_packet_ref(
            &ChatMsg { text: msg.text.clone(), me: msg.me, pm: Some(from.sid()) }.to_packet(
                PacketKind::Direct { from: from.sid(), to: self.base.sid },
            ),
        )
    }

    fn hub_chat_msg(&self, msg: &ChatMessage) -> Result<(), HubError> {
        self.send_packet_ref(
            &ChatMsg { text: msg.text.clone(), me: false, pm: None }.to_packet(PacketKind::Info),
        )
    }

    fn join_room(&self, _room: &Room) -> Result<(), HubError> {
        Ok(())
    }

    fn leave_room(&self, _room: &Room) -> Result<(), HubError> {
        Ok(())
    }

    fn connect_to(
        &self,
        from: &PeerRef,
        addr: &str,
        token: &str,
        secure: bool,
    ) -> Result<(), HubError> {
        let port = addr.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()).unwrap_or(0);
        if port == 0 {
            return Ok(());
        }
        let proto = if secure { PROTO_ADCS } else { PROTO_ADC };
        self.send_packet_ref(
            &ConnectToMe { proto: proto.to_string(), port, token: token.to_string() }.to_packet(
                PacketKind::Direct { from: from.sid(), to: self.base.sid },
            ),
        )
    }

    fn rev_connect_to(&self, from: &PeerRef, token: &str, secure: bool) -> Result<(), HubError> {
        let proto = if secure { PROTO_ADCS } else { PROTO_ADC };
        self.send_packet_ref(
            &RevConnectToMe { proto: proto.to_string(), token: token.to_string() }.to_packet(
                PacketKind::Direct { from: from.sid(), to: self.base.sid },
            ),
        )
    }

    fn search(&self, req: &SearchRequest) -> Result<(), HubError> {
        match &req.payload {
            SearchPayload::Adc { packet } => {
                if let PacketKind::Feature { sel, .. } = &packet.kind {
                    let features = self.features();
                    for s in sel {
                        if s.require != features.has(&s.tag) {
                            return Ok(()); // selector mismatch, not for us
                        }
                    }
                }
                self.send_packet_ref(packet)
            },
            // NMDC searches are not translated; unsupported combination.
            SearchPayload::Nmdc { .. } => Ok(()),
        }
    }

    fn search_result(&self, res: &SearchResult) -> Result<(), HubError> {
        match res {
            SearchResult::Adc { packet } => self.send_packet_ref(packet),
            SearchResult::Nmdc { .. } => Ok(()),
        }
    }

    fn redirect(&self, addr: &str) -> Result<(), HubError> {
        let mut qui = Quit::new(self.base.sid);
        qui.redirect = Some(addr.to_string());
        self.send_packet_ref(&qui.to_packet())?;
        self.base.shutdown();
        Ok(())
    }
}
