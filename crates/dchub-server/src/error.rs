//! Hub error types.

use dchub_proto::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the hub runtime.
///
/// Per-connection tasks catch all of these at the task boundary and
/// translate them into a connection close; none propagate across peers.
/// Roster inconsistencies are deliberately *not* represented here: those
/// are bugs and panic instead.
#[derive(Debug, Error)]
pub enum HubError {
    /// Malformed or out-of-state wire traffic.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A handshake step failed structurally (wrong command for the
    /// current state, missing required fields).
    #[error("handshake error: {0}")]
    Handshake(String),

    /// A read deadline expired.
    #[error("read timed out")]
    Timeout,

    /// The requested nick is taken or reserved.
    #[error("nick is already taken")]
    NickTaken,

    /// The client's CID is already online.
    #[error("client id is already in use")]
    CidTaken,

    /// The nick failed the syntax policy.
    #[error("invalid nick: {0}")]
    InvalidNick(&'static str),

    /// The hub is private and the user is not registered.
    #[error("this hub is for registered users only")]
    RegisteredOnly,

    /// Bad password or password proof.
    #[error("wrong password")]
    WrongPassword,

    /// The user is banned.
    #[error("user is banned")]
    Banned,

    /// The peer's outbound queue overflowed; it is being evicted.
    #[error("peer queue overflow")]
    QueueOverflow,

    /// The peer is already closed.
    #[error("peer is closed")]
    PeerClosed,

    /// Initial bytes matched no supported protocol.
    #[error("unknown protocol")]
    UnknownProtocol,

    /// Configuration problem at startup.
    #[error("config error: {0}")]
    Config(String),

    /// User/profile database failure.
    #[error("database error: {0}")]
    Database(String),
}
