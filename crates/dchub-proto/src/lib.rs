//! Wire codecs for the dchub multi-protocol hub.
//!
//! Three codecs live here, one per protocol the hub speaks:
//!
//! - [`nmdc`]: line-framed `$Command args|` messages with HTML-style
//!   escaping and chat lines of the form `<nick> text|`.
//! - [`adc`]: token-separated, binary-safe text packets
//!   (`<Type><Cmd> fields\n`) with `\s`/`\n`/`\\` escapes. Parsing is
//!   late: [`adc::Packet`] is structural, the body decodes to a typed
//!   message on demand.
//! - [`irc`]: RFC 1459-style messages with optional `:prefix` and a
//!   trailing parameter.
//!
//! This crate is pure: no I/O, no async, no global state. Everything
//! operates on strings and byte slices, which keeps the codecs trivially
//! property-testable. Transport concerns (zlib toggling, legacy text
//! encodings, deadlines) belong to the server crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod adc;
mod errors;
pub mod irc;
pub mod nmdc;
mod types;

pub use errors::ProtocolError;
pub use types::{tiger_digest, Cid, Features, Sid, Software};

/// Result alias used throughout the codec crate.
pub type Result<T> = std::result::Result<T, ProtocolError>;
