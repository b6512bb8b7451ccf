//! IRC bridge: RFC 1459 clients join the global room as `#hub`.
//!
//! Handshake: `NICK`/`USER`, nick policy and reservation (numeric 433 +
//! retry on collision), welcome numerics 001-005, then a wait for
//! `JOIN #hub`. On join the hub echoes the JOIN and sends a synthetic
//! JOIN for every online peer so the client's user list is complete.
//!
//! IRC is unauthenticated: registered nicks cannot log in here, and a
//! private hub refuses IRC guests. IRC peers are not searchable and
//! drop transfer events.

use std::sync::Arc;
use std::time::Duration;

use dchub_proto::irc::{Message, Prefix};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::conn::{run_writer, LineReader, Outbound, WriteMode};
use crate::error::HubError;
use crate::hub::Hub;
use crate::peer::{
    BasePeer, ConnInfo, Peer, PeerRef, Protocol, SearchRequest, UserInfo,
};
use crate::room::{ChatMessage, Room};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const KEEPALIVE_EVERY: Duration = Duration::from_secs(120);

/// The one channel the bridge exposes.
pub const HUB_CHANNEL: &str = "#hub";

/// Serve one IRC connection to completion.
pub(crate) async fn serve(
    hub: &Arc<Hub>,
    stream: TcpStream,
    cinfo: ConnInfo,
) -> Result<(), HubError> {
    let (rd, wr) = stream.into_split();
    let (tx, rx) = mpsc::channel(hub.options().outbound_queue);
    let (close_tx, close_rx) = watch::channel(false);
    let writer = tokio::spawn(run_writer(wr, rx, WriteMode::Plain, close_rx));
    let mut reader = LineReader::new(rd, b'\n', dchub_proto::irc::MAX_LINE + 2);

    let res = match handshake(hub, &mut reader, &tx, close_tx, cinfo).await {
        Ok(peer) => {
            let peer_ref: PeerRef = peer.clone();
            let res = session(hub, &peer, &mut reader).await;
            hub.leave(&peer_ref, res.as_ref().err().map(|_| "error").or(Some("quit")));
            peer.base.shutdown();
            res
        },
        Err(e) => Err(e),
    };
    let _ = writer.await;
    res
}

async fn read_msg(
    reader: &mut LineReader,
    timeout: Duration,
) -> Result<Option<Message>, HubError> {
    loop {
        let Some(line) = reader.read_line(Some(timeout)).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&line);
        let text = text.trim_end_matches('\r');
        if text.is_empty() {
            continue;
        }
        return Ok(Some(Message::decode(text)?));
    }
}

fn send_msg(tx: &mpsc::Sender<Outbound>, m: &Message) -> Result<(), HubError> {
    let mut line = String::new();
    m.encode(&mut line)?;
    tx.try_send(Outbound::Line(line)).map_err(|_| HubError::PeerClosed)
}

async fn handshake(
    hub: &Arc<Hub>,
    reader: &mut LineReader,
    tx: &mpsc::Sender<Outbound>,
    close_tx: watch::Sender<bool>,
    cinfo: ConnInfo,
) -> Result<Arc<IrcPeer>, HubError> {
    let host_pref = Prefix::server(&cinfo.local.ip().to_string());

    // NICK (+ USER on the first round); 433 and retry on collision.
    let mut nick = String::new();
    let mut user = String::new();
    let res = loop {
        let Some(m) = read_msg(reader, HANDSHAKE_TIMEOUT).await? else {
            return Err(HubError::Handshake("connection closed during login".to_string()));
        };
        match m.command.as_str() {
            "CAP" | "PASS" => continue, // no capabilities, no passwords
            "NICK" if m.params.len() == 1 => {
                nick = m.params[0].clone();
            },
            "USER" if m.params.len() == 4 => {
                user = m.params[0].clone();
            },
            _ => {
                return Err(HubError::Handshake(format!("expected NICK/USER, got {}", m.command)));
            },
        }
        if nick.is_empty() || user.is_empty() {
            continue;
        }
        if let Err(e) = hub.validate_nick(&nick) {
            send_msg(tx, &Message::with_prefix(
                host_pref.clone(),
                "432",
                vec!["*".to_string(), nick.clone(), e.to_string()],
            ))?;
            return Err(e);
        }
        match hub.reserve_name(&nick) {
            Ok(res) => break res,
            Err(HubError::NickTaken) => {
                send_msg(tx, &Message::with_prefix(
                    host_pref.clone(),
                    "433",
                    vec!["*".to_string(), nick.clone(), "Nickname is already in use".to_string()],
                ))?;
                nick.clear();
            },
            Err(e) => return Err(e),
        }
    };

    // Registered nicks need a password; the bridge has none. Private
    // hubs take no IRC guests at all.
    if hub.get_user(&nick)?.is_some() {
        return Err(HubError::Handshake(
            "password login is not supported over IRC".to_string(),
        ));
    }
    if hub.config().is_private() {
        return Err(HubError::RegisteredOnly);
    }

    let soft = hub.soft().clone();
    let vers = format!("{}-{}", soft.name, soft.version);
    let welcome: &[(&str, String)] = &[
        ("001", format!("Welcome to the {} hub {}", hub.config().name(), nick)),
        ("002", format!("Your host is {}, running version {}", cinfo.local.ip(), vers)),
        ("003", "This server was created today".to_string()),
        ("004", format!("{} {} o o", cinfo.local.ip(), vers)),
        (
            "005",
            format!("CHANTYPES=# CASEMAPPING=rfc1459 NETWORK={} :are supported by this server",
                hub.config().name()),
        ),
    ];
    for (num, text) in welcome {
        send_msg(tx, &Message::with_prefix(
            host_pref.clone(),
            *num,
            vec![nick.clone(), text.clone()],
        ))?;
    }

    // Wait for JOIN #hub; answer PING meanwhile, reject other channels.
    loop {
        let Some(m) = read_msg(reader, Duration::from_secs(60)).await? else {
            return Err(HubError::Handshake("connection closed before JOIN".to_string()));
        };
        match m.command.as_str() {
            "PING" => {
                let mut pong = m.clone();
                pong.command = "PONG".to_string();
                send_msg(tx, &pong)?;
            },
            "JOIN" if m.params.first().map(String::as_str) == Some(HUB_CHANNEL) => break,
            "JOIN" => {
                send_msg(tx, &Message::with_prefix(
                    host_pref.clone(),
                    "403",
                    vec![
                        nick.clone(),
                        m.params.first().cloned().unwrap_or_default(),
                        "No such channel".to_string(),
                    ],
                ))?;
            },
            "QUIT" => return Err(HubError::Handshake("client quit".to_string())),
            _ => tracing::debug!(cmd = %m.command, "unexpected irc command before JOIN"),
        }
    }

    let sid = hub.roster().alloc_sid();
    let own_pref = Prefix::user(&nick, &user, &cinfo.remote.ip().to_string());
    let peer = Arc::new(IrcPeer {
        base: BasePeer::new(hub, sid, None, cinfo, Protocol::Irc, tx.clone(), close_tx),
        host_pref: host_pref.clone(),
        own_pref: own_pref.clone(),
    });
    peer.base.set_name(&nick);
    peer.base.set_user(UserInfo {
        name: nick.clone(),
        app: dchub_proto::Software {
            name: "DC-IRC bridge".to_string(),
            version: soft.version,
        },
        ..UserInfo::default()
    });

    // Echo the JOIN, then a synthetic JOIN per online peer.
    send_msg(tx, &Message::with_prefix(own_pref, "JOIN", vec![HUB_CHANNEL.to_string()]))?;
    let peer_ref: PeerRef = peer.clone();
    let others = hub.roster().peers();
    peer.peers_join(&others)?;

    hub.accept_peer(&peer_ref, res)?;
    Ok(peer)
}

async fn session(
    hub: &Arc<Hub>,
    peer: &Arc<IrcPeer>,
    reader: &mut LineReader,
) -> Result<(), HubError> {
    let peer_ref: PeerRef = peer.clone();
    let mut keepalive = tokio::time::interval(KEEPALIVE_EVERY);
    keepalive.tick().await;
    loop {
        let m = tokio::select! {
            () = peer.base.closed() => return Ok(()),
            _ = keepalive.tick() => {
                let _ = peer.send(&Message::with_prefix(
                    peer.host_pref.clone(),
                    "PING",
                    vec![hub.config().name()],
                ));
                continue;
            },
            m = read_msg(reader, IDLE_TIMEOUT) => match m? {
                Some(m) => m,
                None => return Ok(()),
            },
        };
        match m.command.as_str() {
            "PING" => {
                let mut pong = m.clone();
                pong.command = "PONG".to_string();
                peer.send(&pong)?;
            },
            "PONG" => {},
            "PRIVMSG" | "NOTICE" if m.params.len() == 2 => {
                let (dst, text) = (m.params[0].as_str(), m.params[1].clone());
                let (text, me) = match text
                    .strip_prefix("\u{1}ACTION ")
                    .and_then(|t| t.strip_suffix('\u{1}'))
                {
                    Some(t) => (t.to_string(), true),
                    None => (text, false),
                };
                if dst == HUB_CHANNEL {
                    hub.handle_chat(&peer_ref, text, me);
                } else {
                    hub.handle_private(&peer_ref, dst, text, me);
                }
            },
            "PART" if m.params.first().map(String::as_str) == Some(HUB_CHANNEL) => {
                return Ok(());
            },
            "QUIT" => return Ok(()),
            "JOIN" => {
                // Named rooms are not tunneled over IRC.
                peer.send(&Message::with_prefix(
                    peer.host_pref.clone(),
                    "403",
                    vec![
                        peer.base.name(),
                        m.params.first().cloned().unwrap_or_default(),
                        "No such channel".to_string(),
                    ],
                ))?;
            },
            _ => tracing::debug!(cmd = %m.command, "unhandled irc command"),
        }
    }
}

/// An IRC bridge peer.
pub(crate) struct IrcPeer {
    base: BasePeer,
    host_pref: Prefix,
    own_pref: Prefix,
}

impl IrcPeer {
    fn send(&self, m: &Message) -> Result<(), HubError> {
        let mut line = String::new();
        m.encode(&mut line)?;
        self.base.send_line(line)
    }

    /// Prefix for another peer as seen by this client.
    fn prefix_for(&self, name: &str) -> Prefix {
        Prefix::user(name, name, &self.host_pref.name)
    }
}

impl Peer for IrcPeer {
    fn base(&self) -> &BasePeer {
        &self.base
    }

    fn user_info(&self) -> UserInfo {
        self.base.user()
    }

    fn searchable(&self) -> bool {
        false
    }

    fn peers_join(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send(&Message::with_prefix(
                self.prefix_for(&p.name()),
                "JOIN",
                vec![HUB_CHANNEL.to_string()],
            ))?;
        }
        Ok(())
    }

    fn peers_update(&self, _peers: &[PeerRef]) -> Result<(), HubError> {
        Ok(()) // no user-info surface on IRC
    }

    fn peers_leave(&self, peers: &[PeerRef]) -> Result<(), HubError> {
        for p in peers {
            self.send(&Message::with_prefix(
                self.prefix_for(&p.name()),
                "PART",
                vec![HUB_CHANNEL.to_string(), "disconnect".to_string()],
            ))?;
        }
        Ok(())
    }

    fn chat_msg(&self, room: &Room, _from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        if !room.is_global() {
            return Ok(()); // named rooms are not tunneled
        }
        let text = if msg.me {
            format!("\u{1}ACTION {}\u{1}", msg.text)
        } else {
            msg.text.clone()
        };
        self.send(&Message::with_prefix(
            self.prefix_for(&msg.name),
            "PRIVMSG",
            vec![HUB_CHANNEL.to_string(), text],
        ))
    }

    fn private_msg(&self, _from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError> {
        let text = if msg.me {
            format!("\u{1}ACTION {}\u{1}", msg.text)
        } else {
            msg.text.clone()
        };
        self.send(&Message::with_prefix(
            self.prefix_for(&msg.name),
            "PRIVMSG",
            vec![self.base.name(), text],
        ))
    }

    fn hub_chat_msg(&self, msg: &ChatMessage) -> Result<(), HubError> {
        // Multi-line hub output becomes one NOTICE per line.
        for line in msg.text.lines() {
            self.send(&Message::with_prefix(
                self.prefix_for(&msg.name),
                "NOTICE",
                vec![HUB_CHANNEL.to_string(), line.to_string()],
            ))?;
        }
        Ok(())
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
        _addr: &str,
        _token: &str,
        _secure: bool,
    ) -> Result<(), HubError> {
        Ok(()) // no transfers over the bridge
    }

    fn rev_connect_to(&self, _from: &PeerRef, _token: &str, _secure: bool) -> Result<(), HubError> {
        Ok(())
    }

    fn search(&self, _req: &SearchRequest) -> Result<(), HubError> {
        Ok(())
    }

    fn redirect(&self, addr: &str) -> Result<(), HubError> {
        self.send(&Message::with_prefix(
            self.host_pref.clone(),
            "ERROR",
            vec![format!("redirecting to {addr}")],
        ))?;
        self.base.shutdown();
        Ok(())
    }
}
