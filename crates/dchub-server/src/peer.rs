//! Peer objects: per-connection identity, capabilities and the outgoing
//! event surface.
//!
//! Every live connection owns exactly one peer. The roster and rooms
//! hold [`PeerRef`]s (shared handles); the connection task is the owner
//! and tears the peer down when its handler returns.
//!
//! All outgoing traffic goes through a bounded per-peer queue drained by
//! a writer task (see [`crate::conn`]). Event sinks are synchronous:
//! they encode to the peer's wire protocol and `try_send`. A full queue
//! marks the peer for eviction instead of blocking the sender, so a slow
//! recipient can never stall the origin.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use dchub_proto::{adc, nmdc, Cid, Sid, Software};
use tokio::sync::{mpsc, watch};

use crate::conn::Outbound;
use crate::error::HubError;
use crate::hub::Hub;
use crate::room::{ChatMessage, Room};

/// Shared handle to a peer.
pub type PeerRef = Arc<dyn Peer>;

/// Wire protocol a peer speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// NMDC (`dchub://`, `nmdcs://`).
    Nmdc,
    /// ADC (`adc://`, `adcs://`).
    Adc,
    /// IRC bridge.
    Irc,
}

impl Protocol {
    /// Protocol label for logs and user-facing text.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Nmdc => "NMDC",
            Protocol::Adc => "ADC",
            Protocol::Irc => "IRC",
        }
    }
}

/// Facts about a connection established before the handshake.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    /// Local (hub-side) address.
    pub local: SocketAddr,
    /// Remote (client-side) address.
    pub remote: SocketAddr,
    /// Whether the transport was TLS before reaching the hub.
    pub secure: bool,
    /// Negotiated TLS version label, when `secure`.
    pub tls_version: Option<String>,
    /// Certificate keyprint, when known.
    pub keyprint: Option<String>,
}

impl ConnInfo {
    /// Plain-TCP connection info.
    #[must_use]
    pub fn plain(local: SocketAddr, remote: SocketAddr) -> ConnInfo {
        ConnInfo { local, remote, secure: false, tls_version: None, keyprint: None }
    }
}

/// Capability flags advertised by a peer's client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    /// Accepts direct (active) connections.
    pub active: bool,
    /// Reachable over IPv4.
    pub ipv4: bool,
    /// Reachable over IPv6.
    pub ipv6: bool,
    /// Supports TLS transfers.
    pub tls: bool,
    /// Can serve file lists.
    pub file_list: bool,
    /// Supports segmented transfers.
    pub segmented: bool,
}

/// Protocol-neutral user information, as shown to other peers.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Display name.
    pub name: String,
    /// Free-form description.
    pub desc: String,
    /// Client software.
    pub app: Software,
    /// E-mail address.
    pub email: String,
    /// Share size in bytes.
    pub share: u64,
    /// Open upload slots.
    pub slots: u32,
    /// Capability flags.
    pub caps: Caps,
    /// NMDC connection-speed string; empty for other protocols.
    pub conn: String,
    /// NMDC status flag byte.
    pub flag: u8,
}

impl Default for UserInfo {
    fn default() -> Self {
        UserInfo {
            name: String::new(),
            desc: String::new(),
            app: Software::default(),
            email: String::new(),
            share: 0,
            slots: 0,
            caps: Caps::default(),
            conn: String::new(),
            flag: 1,
        }
    }
}

/// A search request being relayed.
///
/// The payload keeps the origin protocol's own representation; peers of
/// the other protocol drop the request (an unsupported combination, per
/// the event contract).
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Searching session.
    pub origin_sid: Sid,
    /// Searching peer's display name.
    pub origin_name: String,
    /// Protocol-specific payload.
    pub payload: SearchPayload,
}

/// Protocol-specific search payload.
#[derive(Debug, Clone)]
pub enum SearchPayload {
    /// NMDC `$Search`.
    Nmdc {
        /// Return address.
        addr: nmdc::SearchAddr,
        /// Raw search specification.
        spec: String,
    },
    /// ADC `SCH` packet (broadcast or feature kind), as received.
    Adc {
        /// The original packet.
        packet: adc::Packet,
    },
}

/// A search result relayed through the hub to a passive searcher.
#[derive(Debug, Clone)]
pub enum SearchResult {
    /// NMDC `$SR`, target nick already stripped.
    Nmdc {
        /// Peer holding the result.
        from: String,
        /// Raw result payload.
        data: String,
    },
    /// ADC `RES` packet, already re-addressed to the recipient.
    Adc {
        /// The packet to deliver.
        packet: adc::Packet,
    },
}

/// The capability set every protocol peer implements.
///
/// Event sinks translate a generic hub event into the peer's wire
/// protocol and enqueue it. Combinations a protocol cannot express are
/// silently dropped (IRC peers are not searchable, for example); the
/// broadcast engine tolerates that. Errors mean the peer is going away
/// and are never propagated back to the event's origin.
pub trait Peer: Send + Sync + 'static {
    /// Shared per-peer state.
    fn base(&self) -> &BasePeer;

    /// Snapshot of the peer's user information.
    fn user_info(&self) -> UserInfo;

    /// Whether search requests should be relayed to this peer.
    fn searchable(&self) -> bool {
        true
    }

    /// One or more peers joined.
    fn peers_join(&self, peers: &[PeerRef]) -> Result<(), HubError>;

    /// One or more peers changed their info.
    fn peers_update(&self, peers: &[PeerRef]) -> Result<(), HubError>;

    /// One or more peers left.
    fn peers_leave(&self, peers: &[PeerRef]) -> Result<(), HubError>;

    /// Chat message in a room this peer is a member of.
    fn chat_msg(&self, room: &Room, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError>;

    /// Private message addressed to this peer.
    fn private_msg(&self, from: &PeerRef, msg: &ChatMessage) -> Result<(), HubError>;

    /// Hub-originated message (no sender peer).
    fn hub_chat_msg(&self, msg: &ChatMessage) -> Result<(), HubError>;

    /// This peer entered a room.
    fn join_room(&self, room: &Room) -> Result<(), HubError>;

    /// This peer left a room.
    fn leave_room(&self, room: &Room) -> Result<(), HubError>;

    /// Ask this peer to connect to `from` at `addr`.
    fn connect_to(
        &self,
        from: &PeerRef,
        addr: &str,
        token: &str,
        secure: bool,
    ) -> Result<(), HubError>;

    /// Ask this peer to initiate a connection back to passive `from`.
    fn rev_connect_to(&self, from: &PeerRef, token: &str, secure: bool) -> Result<(), HubError>;

    /// Relay a search request to this peer.
    fn search(&self, req: &SearchRequest) -> Result<(), HubError>;

    /// Relay a search result to this (passive) peer. Protocols that
    /// cannot express the result drop it.
    fn search_result(&self, res: &SearchResult) -> Result<(), HubError> {
        let _ = res;
        Ok(())
    }

    /// Redirect this peer to another hub address.
    fn redirect(&self, addr: &str) -> Result<(), HubError>;
}

/// Accessors shared by every protocol peer, provided on the trait object
/// for convenience.
impl dyn Peer {
    /// Session identifier.
    #[must_use]
    pub fn sid(&self) -> Sid {
        self.base().sid
    }

    /// Current display name.
    #[must_use]
    pub fn name(&self) -> String {
        self.base().name()
    }

    /// Content identifier, for ADC peers.
    #[must_use]
    pub fn cid(&self) -> Option<Cid> {
        self.base().cid
    }

    /// Remote network address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.base().cinfo.remote
    }

    /// Whether the link is TLS.
    #[must_use]
    pub fn secure(&self) -> bool {
        self.base().cinfo.secure
    }
}

/// State common to all protocol peers.
///
/// The peer holds only a weak back-reference to the hub; once the hub is
/// gone (or the peer was removed), hub-facing calls refuse gracefully.
pub struct BasePeer {
    hub: Weak<Hub>,
    /// Session identifier, stable for the peer's lifetime.
    pub sid: Sid,
    /// Content identifier (ADC only).
    pub cid: Option<Cid>,
    /// Connection facts.
    pub cinfo: ConnInfo,
    /// Wire protocol.
    pub protocol: Protocol,
    /// Creation timestamp.
    pub created: SystemTime,
    name: RwLock<String>,
    profile: RwLock<Option<String>>,
    user: RwLock<UserInfo>,
    rooms: Mutex<Vec<Arc<Room>>>,
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl BasePeer {
    /// Create the shared state for a new peer.
    pub(crate) fn new(
        hub: &Arc<Hub>,
        sid: Sid,
        cid: Option<Cid>,
        cinfo: ConnInfo,
        protocol: Protocol,
        tx: mpsc::Sender<Outbound>,
        close_tx: watch::Sender<bool>,
    ) -> BasePeer {
        BasePeer {
            hub: Arc::downgrade(hub),
            sid,
            cid,
            cinfo,
            protocol,
            created: SystemTime::now(),
            name: RwLock::new(String::new()),
            profile: RwLock::new(None),
            user: RwLock::new(UserInfo::default()),
            rooms: Mutex::new(Vec::new()),
            tx,
            closed: AtomicBool::new(false),
            close_tx,
        }
    }

    /// The hub, unless it has shut down.
    pub fn hub(&self) -> Option<Arc<Hub>> {
        self.hub.upgrade()
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.name.read().expect("name lock poisoned").clone()
    }

    pub(crate) fn set_name(&self, name: &str) {
        *self.name.write().expect("name lock poisoned") = name.to_string();
    }

    /// User profile name, when registered.
    pub fn profile(&self) -> Option<String> {
        self.profile.read().expect("profile lock poisoned").clone()
    }

    pub(crate) fn set_profile(&self, profile: Option<String>) {
        *self.profile.write().expect("profile lock poisoned") = profile;
    }

    /// Protocol-neutral user info snapshot.
    pub fn user(&self) -> UserInfo {
        self.user.read().expect("user lock poisoned").clone()
    }

    pub(crate) fn set_user(&self, info: UserInfo) {
        *self.user.write().expect("user lock poisoned") = info;
    }

    /// Named rooms this peer has joined.
    pub(crate) fn joined_rooms(&self) -> Vec<Arc<Room>> {
        self.rooms.lock().expect("rooms lock poisoned").clone()
    }

    pub(crate) fn track_room(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.lock().expect("rooms lock poisoned");
        if !rooms.iter().any(|r| Arc::ptr_eq(r, room)) {
            rooms.push(Arc::clone(room));
        }
    }

    pub(crate) fn untrack_room(&self, room: &Arc<Room>) {
        self.rooms.lock().expect("rooms lock poisoned").retain(|r| !Arc::ptr_eq(r, room));
    }

    /// Enqueue an already-framed line for the writer task.
    ///
    /// A full queue evicts this peer (slow-consumer policy) and reports
    /// [`HubError::QueueOverflow`]; callers fanning out to many peers
    /// ignore the error.
    pub fn send_line(&self, line: String) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::PeerClosed);
        }
        match self.tx.try_send(Outbound::Line(line)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::info!(
                    sid = %self.sid,
                    name = %self.name(),
                    "outbound queue overflow, evicting slow consumer"
                );
                self.shutdown();
                Err(HubError::QueueOverflow)
            },
            Err(mpsc::error::TrySendError::Closed(_)) => Err(HubError::PeerClosed),
        }
    }

    /// Enqueue the zlib switch (NMDC write side).
    pub(crate) fn send_zon(&self, level: u32) -> Result<(), HubError> {
        match self.tx.try_send(Outbound::ZOn(level)) {
            Ok(()) => Ok(()),
            Err(_) => Err(HubError::PeerClosed),
        }
    }

    /// Mark the peer closed and wake its reader and writer tasks.
    ///
    /// Idempotent: the first call wins, later calls (and concurrent
    /// callers) observe the same result. Roster removal is *not* done
    /// here; the owning connection task performs the leave exactly once
    /// on its way out.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // send_replace: the value must stick even when the writer
            // (holding the only receiver) is already gone.
            let _ = self.close_tx.send_replace(true);
        }
    }

    /// Whether [`BasePeer::shutdown`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until the peer is shut down.
    pub async fn closed(&self) {
        let mut rx = self.close_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::MemoryDatabase;
    use crate::hub::{Hub, HubOptions};

    #[test]
    fn conn_info_plain_defaults() {
        let local: SocketAddr = "127.0.0.1:411".parse().unwrap();
        let remote: SocketAddr = "10.0.0.1:50000".parse().unwrap();
        let ci = ConnInfo::plain(local, remote);
        assert!(!ci.secure);
        assert!(ci.keyprint.is_none());
        assert_eq!(ci.remote, remote);
    }

    #[test]
    fn protocol_labels() {
        assert_eq!(Protocol::Nmdc.as_str(), "NMDC");
        assert_eq!(Protocol::Adc.as_str(), "ADC");
        assert_eq!(Protocol::Irc.as_str(), "IRC");
    }

    fn test_base(queue: usize) -> (BasePeer, mpsc::Receiver<Outbound>) {
        let hub = Hub::new(Config::new(), HubOptions::default(), Arc::new(MemoryDatabase::new()));
        let (tx, rx) = mpsc::channel(queue);
        let (close_tx, _) = watch::channel(false);
        let cinfo = ConnInfo::plain(
            "127.0.0.1:411".parse().unwrap(),
            "10.0.0.1:50000".parse().unwrap(),
        );
        let base = BasePeer::new(
            &hub,
            Sid::new(1),
            None,
            cinfo,
            Protocol::Nmdc,
            tx,
            close_tx,
        );
        (base, rx)
    }

    #[test]
    fn queue_overflow_evicts() {
        let (base, _rx) = test_base(1);
        assert!(base.send_line("first|".to_string()).is_ok());
        // Nobody drains the queue: the second send overflows and marks
        // the peer for eviction instead of blocking.
        let err = base.send_line("second|".to_string()).unwrap_err();
        assert!(matches!(err, HubError::QueueOverflow));
        assert!(base.is_closed());
        // Further sends observe the closed state.
        assert!(matches!(
            base.send_line("third|".to_string()),
            Err(HubError::PeerClosed)
        ));
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (base, _rx) = test_base(4);
        assert!(!base.is_closed());
        base.shutdown();
        base.shutdown();
        base.shutdown();
        assert!(base.is_closed());
    }

    #[tokio::test]
    async fn closed_wakes_waiters() {
        let (base, _rx) = test_base(4);
        let base = Arc::new(base);
        let waiter = {
            let base = Arc::clone(&base);
            tokio::spawn(async move { base.closed().await })
        };
        base.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("closed() must resolve after shutdown")
            .unwrap();
    }

    #[test]
    fn queued_lines_preserve_order() {
        let (base, mut rx) = test_base(8);
        for i in 0..5 {
            base.send_line(format!("msg{i}|")).unwrap();
        }
        for i in 0..5 {
            match rx.try_recv().unwrap() {
                Outbound::Line(l) => assert_eq!(l, format!("msg{i}|")),
                other => panic!("unexpected item: {other:?}"),
            }
        }
    }
}
