//! The hub runtime: shared roster, rooms, broadcast engine and the
//! connection accept loop.
//!
//! Lock order is `config < roster < peer queue`; no code path acquires
//! them in any other order, and neither the roster lock nor a room lock
//! is ever held across a peer enqueue (snapshot first, send after).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use dchub_proto::Software;
use encoding_rs::Encoding;
use tokio::net::{TcpListener, TcpStream};

use crate::cmd::{register_builtins, CommandRegistry};
use crate::config::Config;
use crate::db::{DbError, UserDatabase, UserRecord};
use crate::error::HubError;
use crate::peer::{ConnInfo, Peer, PeerRef, Protocol, SearchRequest};
use crate::room::{ChatMessage, Room};
use crate::roster::{NameReservation, Roster};
use crate::sniff;

/// Static hub options fixed at construction (the live [`Config`] covers
/// everything mutable at runtime).
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Advertised plain address (`host:port`).
    pub addr: String,
    /// Advertised TLS address, when a TLS terminator runs in front.
    pub tls_addr: Option<String>,
    /// Keyprint of the TLS certificate, for redirect URLs.
    pub keyprint: Option<String>,
    /// NMDC fallback text encoding label (e.g. `cp1251`).
    pub fallback_encoding: Option<String>,
    /// Chat log ring-buffer capacity per room.
    pub chat_log_max: usize,
    /// Messages replayed to a room joiner.
    pub chat_log_join: usize,
    /// Maximum nick length in bytes.
    pub max_nick_len: usize,
    /// Per-peer outbound queue capacity.
    pub outbound_queue: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        HubOptions {
            addr: "127.0.0.1:1411".to_string(),
            tls_addr: None,
            keyprint: None,
            fallback_encoding: None,
            chat_log_max: 50,
            chat_log_join: 10,
            max_nick_len: 32,
            outbound_queue: 64,
        }
    }
}

/// Plugin call-in surface.
///
/// Callbacks run synchronously on the relevant connection task and must
/// return promptly; they receive no internal state by reference. A
/// `false` from the boolean callbacks rejects the connection/join or
/// swallows the chat line.
pub trait HubHooks: Send + Sync + 'static {
    /// A connection was accepted, before any protocol traffic.
    fn on_connected(&self, cinfo: &ConnInfo) -> bool {
        let _ = cinfo;
        true
    }

    /// A peer completed its handshake and joined.
    fn on_joined(&self, peer: &PeerRef) -> bool {
        let _ = peer;
        true
    }

    /// A chat message is about to be fanned out.
    fn on_chat(&self, room: &Room, peer: &PeerRef, msg: &ChatMessage) -> bool {
        let _ = (room, peer, msg);
        true
    }

    /// Periodic tick, about once a minute.
    fn on_timer(&self) {}
}

/// The hub. One per process; owns the roster and rooms, and hands out
/// shared references to connection tasks.
pub struct Hub {
    conf: Config,
    opts: HubOptions,
    soft: Software,
    db: Arc<dyn UserDatabase>,
    roster: Arc<Roster>,
    global: Arc<Room>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    commands: CommandRegistry,
    hooks: RwLock<Vec<Arc<dyn HubHooks>>>,
    fallback_enc: Option<&'static Encoding>,
    created: SystemTime,
    started: Instant,
}

impl Hub {
    /// Create a hub with the given configuration and user database.
    pub fn new(conf: Config, opts: HubOptions, db: Arc<dyn UserDatabase>) -> Arc<Hub> {
        let fallback_enc = opts
            .fallback_encoding
            .as_deref()
            .and_then(|label| Encoding::for_label(label.as_bytes()));
        let commands = CommandRegistry::new();
        register_builtins(&commands);
        Arc::new(Hub {
            conf,
            global: Room::global(opts.chat_log_max, opts.chat_log_join),
            opts,
            soft: Software {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            db,
            roster: Roster::new(),
            rooms: RwLock::new(HashMap::new()),
            commands,
            hooks: RwLock::new(Vec::new()),
            fallback_enc,
            created: SystemTime::now(),
            started: Instant::now(),
        })
    }

    /// Live configuration.
    pub fn config(&self) -> &Config {
        &self.conf
    }

    /// Static options.
    pub fn options(&self) -> &HubOptions {
        &self.opts
    }

    /// Hub software identity.
    pub fn soft(&self) -> &Software {
        &self.soft
    }

    /// The roster.
    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    /// The user database.
    pub fn db(&self) -> &dyn UserDatabase {
        self.db.as_ref()
    }

    /// The command table.
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// The global room.
    pub fn global_room(&self) -> &Arc<Room> {
        &self.global
    }

    /// NMDC fallback encoding, resolved.
    pub(crate) fn fallback_encoding(&self) -> Option<&'static Encoding> {
        self.fallback_enc
    }

    /// Register a plugin hook.
    pub fn add_hook(&self, hook: Arc<dyn HubHooks>) {
        self.hooks.write().expect("hooks lock poisoned").push(hook);
    }

    fn hooks(&self) -> Vec<Arc<dyn HubHooks>> {
        self.hooks.read().expect("hooks lock poisoned").clone()
    }

    /// Time since the hub started.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Hub creation wall-clock time.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Sum of all online peers' share sizes.
    pub fn total_share(&self) -> u64 {
        self.roster.peers().iter().map(|p| p.user_info().share).sum()
    }

    /// Advertised `nmdcs://` URL, when a TLS endpoint exists.
    pub fn nmdcs_url(&self) -> Option<String> {
        let addr = self.opts.tls_addr.as_ref()?;
        Some(match &self.opts.keyprint {
            Some(kp) => format!("nmdcs://{addr}/?kp={kp}"),
            None => format!("nmdcs://{addr}"),
        })
    }

    /// Advertised `adc://` URL.
    pub fn adc_url(&self) -> String {
        format!("adc://{}", self.opts.addr)
    }

    /// Advertised `adcs://` URL, when a TLS endpoint exists.
    pub fn adcs_url(&self) -> Option<String> {
        let addr = self.opts.tls_addr.as_ref()?;
        Some(match &self.opts.keyprint {
            Some(kp) => format!("adcs://{addr}/?kp={kp}"),
            None => format!("adcs://{addr}"),
        })
    }

    /// Validate a nick against the syntax policy.
    pub fn validate_nick(&self, nick: &str) -> Result<(), HubError> {
        if nick.is_empty() {
            return Err(HubError::InvalidNick("empty nick"));
        }
        if nick.len() > self.opts.max_nick_len {
            return Err(HubError::InvalidNick("nick is too long"));
        }
        if nick
            .chars()
            .any(|c| c.is_control() || matches!(c, ' ' | '$' | '|' | '<' | '>' | '&'))
        {
            return Err(HubError::InvalidNick("nick contains a forbidden character"));
        }
        if nick.starts_with(['#', '!', '+', '@']) {
            return Err(HubError::InvalidNick("nick starts with a reserved prefix"));
        }
        if crate::roster::fold_nick(nick) == crate::roster::fold_nick(&self.conf.bot_name()) {
            return Err(HubError::InvalidNick("nick is reserved"));
        }
        Ok(())
    }

    /// Reserve a nick for a handshake.
    pub fn reserve_name(&self, nick: &str) -> Result<NameReservation, HubError> {
        self.roster.reserve_name(nick)
    }

    /// Load a user record, mapping database failures.
    pub fn get_user(&self, nick: &str) -> Result<Option<UserRecord>, HubError> {
        self.db
            .get_user(nick)
            .map_err(|e: DbError| HubError::Database(e.to_string()))
    }

    /// Whether a peer's profile grants operator rights.
    pub fn is_op(&self, peer: &PeerRef) -> bool {
        let Some(profile) = peer.base().profile() else { return false };
        match crate::db::resolve_profile(self.db(), &profile) {
            Ok(Some(p)) => p.can(crate::db::perms::OP) || p.can(crate::db::perms::OWNER),
            _ => false,
        }
    }

    /// The common acceptance step all three handshakes converge on.
    ///
    /// Atomically (under the roster write lock) replaces the nick
    /// reservation with a full entry and snapshots the prior peer list;
    /// then joins the global room, replays its recent chat to the
    /// joiner, and broadcasts the join to the snapshot.
    pub fn accept_peer(
        self: &Arc<Self>,
        peer: &PeerRef,
        res: NameReservation,
    ) -> Result<(), HubError> {
        let snapshot = self.roster.accept_peer(Arc::clone(peer), res)?;
        tracing::info!(
            sid = %peer.sid(),
            name = %peer.name(),
            proto = peer.base().protocol.as_str(),
            addr = %peer.remote_addr(),
            "peer joined"
        );
        self.global.join(peer)?;
        for p in &snapshot {
            if let Err(e) = p.peers_join(std::slice::from_ref(peer)) {
                tracing::debug!(to = %p.name(), "join broadcast failed: {e}");
            }
        }
        for hook in self.hooks() {
            if !hook.on_joined(peer) {
                self.disconnect_peer(peer);
                break;
            }
        }
        Ok(())
    }

    /// Remove a peer from the roster and rooms and broadcast the leave.
    ///
    /// Safe to call unconditionally on the connection task's way out;
    /// only the call that actually removes the entry broadcasts.
    pub fn leave(&self, peer: &PeerRef, reason: Option<&str>) {
        if !self.roster.leave(peer) {
            return;
        }
        for room in peer.base().joined_rooms() {
            room.leave(peer);
            self.drop_room_if_empty(room.name());
        }
        tracing::info!(
            sid = %peer.sid(),
            name = %peer.name(),
            reason = reason.unwrap_or("connection closed"),
            "peer left"
        );
        for p in self.roster.peers() {
            if let Err(e) = p.peers_leave(std::slice::from_ref(peer)) {
                tracing::debug!(to = %p.name(), "leave broadcast failed: {e}");
            }
        }
    }

    /// Ask a peer's connection to shut down. The owning task performs
    /// the roster leave.
    pub fn disconnect_peer(&self, peer: &PeerRef) {
        peer.base().shutdown();
    }

    /// Broadcast a peer's updated info to everyone (including itself;
    /// clients expect the echo).
    pub fn broadcast_update(&self, peer: &PeerRef) {
        for p in self.roster.peers() {
            if let Err(e) = p.peers_update(std::slice::from_ref(peer)) {
                tracing::debug!(to = %p.name(), "update broadcast failed: {e}");
            }
        }
    }

    /// Handle a public chat line from a peer: command dispatch first,
    /// then global-room fan-out.
    pub fn handle_chat(&self, peer: &PeerRef, text: String, me: bool) {
        if !me && self.commands.dispatch(self, peer, &text) {
            return;
        }
        let msg = ChatMessage::from_peer(peer, text, me);
        for hook in self.hooks() {
            if !hook.on_chat(&self.global, peer, &msg) {
                return;
            }
        }
        if !self.conf.global_chat_enabled() {
            return;
        }
        self.global.send_chat(self, peer, &msg);
    }

    /// Handle a private message. Recipients whose name matches a named
    /// room the sender is in get room fan-out instead.
    pub fn handle_private(&self, from: &PeerRef, to: &str, text: String, me: bool) {
        if to.starts_with('#') {
            if let Some(room) = self.room(to) {
                if room.is_member(self, from) {
                    let msg = ChatMessage::from_peer(from, text, me);
                    room.send_chat(self, from, &msg);
                    return;
                }
            }
            self.send_hub_msg_to(from, &format!("no such room: {to}"));
            return;
        }
        let Some(target) = self.roster.by_name(to) else {
            self.send_hub_msg_to(from, &format!("{to} is not online"));
            return;
        };
        let msg = ChatMessage::from_peer(from, text, me);
        if let Err(e) = target.private_msg(from, &msg) {
            tracing::debug!(to = %target.name(), "private message failed: {e}");
        }
    }

    /// Relay a search to every searchable peer except the origin.
    pub fn relay_search(&self, origin: &PeerRef, req: &SearchRequest) {
        for p in self.roster.peers() {
            if p.sid() == origin.sid() || !p.searchable() {
                continue;
            }
            if let Err(e) = p.search(req) {
                tracing::debug!(to = %p.name(), "search relay failed: {e}");
            }
        }
    }

    /// Hub-originated message to a single peer.
    pub fn send_hub_msg_to(&self, peer: &PeerRef, text: &str) {
        let msg = ChatMessage::from_hub(self.conf.bot_name(), text.to_string());
        if let Err(e) = peer.hub_chat_msg(&msg) {
            tracing::debug!(to = %peer.name(), "hub message failed: {e}");
        }
    }

    /// Hub-originated message to the global room.
    pub fn broadcast_hub_msg(&self, text: &str) {
        let msg = ChatMessage::from_hub(self.conf.bot_name(), text.to_string());
        self.global.send_hub_msg(self, &msg);
    }

    /// Rendered MOTD for a joining peer, unless none is configured.
    pub fn motd_for(&self, peer: &PeerRef) -> Option<String> {
        let template = self.conf.motd();
        if template.trim().is_empty() {
            return None;
        }
        Some(crate::motd::render(&template, self, peer))
    }

    /// Look up a named room.
    pub fn room(&self, name: &str) -> Option<Arc<Room>> {
        if name.is_empty() {
            return Some(Arc::clone(&self.global));
        }
        self.rooms
            .read()
            .expect("rooms lock poisoned")
            .get(&normalize_room(name))
            .cloned()
    }

    /// Look up or lazily create a named room.
    pub fn room_or_create(&self, name: &str) -> Arc<Room> {
        if name.is_empty() {
            return Arc::clone(&self.global);
        }
        let name = normalize_room(name);
        let mut rooms = self.rooms.write().expect("rooms lock poisoned");
        Arc::clone(
            rooms
                .entry(name.clone())
                .or_insert_with(|| Room::named(&name, self.opts.chat_log_max, self.opts.chat_log_join)),
        )
    }

    /// Destroy a named room once its last member left.
    pub fn drop_room_if_empty(&self, name: &str) {
        if name.is_empty() {
            return;
        }
        let name = normalize_room(name);
        let mut rooms = self.rooms.write().expect("rooms lock poisoned");
        let empty = rooms
            .get(&name)
            .is_some_and(|r| r.member_count(self) == 0);
        if empty {
            rooms.remove(&name);
        }
    }

    /// Names of currently existing named rooms.
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.read().expect("rooms lock poisoned").keys().cloned().collect()
    }

    /// Handle one accepted connection: plugin gate, protocol sniff,
    /// protocol serve. Runs on its own task; all errors end here.
    pub async fn serve_conn(self: Arc<Self>, stream: TcpStream, cinfo: ConnInfo) {
        for hook in self.hooks() {
            if !hook.on_connected(&cinfo) {
                return;
            }
        }
        // Short: NMDC clients wait silently for our $Lock, so a quiet
        // socket falls through to NMDC quickly.
        let proto = match sniff::sniff(&stream, Duration::from_millis(650)).await {
            Ok(p) => p,
            Err(e) => {
                tracing::info!(addr = %cinfo.remote, "protocol detection failed: {e}");
                return;
            },
        };
        tracing::debug!(addr = %cinfo.remote, proto = proto.as_str(), "connection");
        let res = match proto {
            Protocol::Nmdc => crate::nmdc::serve(&self, stream, cinfo.clone()).await,
            Protocol::Adc => crate::adc::serve(&self, stream, cinfo.clone()).await,
            Protocol::Irc => crate::irc::serve(&self, stream, cinfo.clone()).await,
        };
        match res {
            Ok(()) => tracing::debug!(addr = %cinfo.remote, "connection closed"),
            Err(HubError::Io(e)) => {
                tracing::debug!(addr = %cinfo.remote, "connection i/o error: {e}");
            },
            Err(e) => tracing::info!(addr = %cinfo.remote, "connection error: {e}"),
        }
    }

    /// Spawn the periodic plugin timer.
    fn spawn_timer(self: &Arc<Self>) {
        let hub = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                let Some(hub) = hub.upgrade() else { break };
                for hook in hub.hooks() {
                    hook.on_timer();
                }
            }
        });
    }
}

/// Room names carry a `#` prefix; accept them with or without.
fn normalize_room(name: &str) -> String {
    if name.starts_with('#') {
        name.to_string()
    } else {
        format!("#{name}")
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("name", &self.conf.name())
            .field("online", &self.roster.len())
            .finish()
    }
}

/// Bound listener plus its hub; the production entry point.
pub struct Server {
    hub: Arc<Hub>,
    listener: TcpListener,
}

impl Server {
    /// Bind a listener for the hub.
    pub async fn bind(hub: Arc<Hub>, addr: &str) -> Result<Server, HubError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server { hub, listener })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr, HubError> {
        Ok(self.listener.local_addr()?)
    }

    /// The hub behind this listener.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Accept connections until the process stops.
    pub async fn run(self) -> Result<(), HubError> {
        tracing::info!(
            addr = %self.local_addr()?,
            hub = %self.hub.config().name(),
            "hub listening"
        );
        self.hub.spawn_timer();
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    let local = stream.local_addr().unwrap_or(remote);
                    let cinfo = ConnInfo::plain(local, remote);
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(hub.serve_conn(stream, cinfo));
                },
                Err(e) => {
                    tracing::error!("accept error: {e}");
                },
            }
        }
    }
}
