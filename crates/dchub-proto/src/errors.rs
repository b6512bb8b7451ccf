//! Codec error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages.
///
/// All variants describe a malformed or forbidden input; none of them are
/// retryable. A connection that produces one of these should be closed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A command was structurally invalid for its type.
    #[error("malformed command: {0}")]
    Malformed(&'static str),

    /// A byte that the framing forbids appeared inside a payload.
    #[error("forbidden byte {0:#04x} in payload")]
    ForbiddenByte(u8),

    /// An escape sequence was started but not completed, or names an
    /// unknown escape.
    #[error("invalid escape sequence")]
    InvalidEscape,

    /// A line exceeded the protocol's maximum length.
    #[error("line too long: {len} bytes (max {max})")]
    LineTooLong {
        /// Observed length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// An ADC packet used a type prefix outside `B/C/D/E/F/H/I/U`.
    #[error("unknown packet kind {0:?}")]
    UnknownKind(char),

    /// A session identifier failed to parse.
    #[error("invalid session identifier")]
    InvalidSid,

    /// A content identifier failed to parse.
    #[error("invalid content identifier")]
    InvalidCid,

    /// A numeric field failed to parse.
    #[error("invalid number in field {0:?}")]
    InvalidNumber(&'static str),

    /// Payload was not valid UTF-8 where the protocol requires it.
    #[error("invalid utf-8 in message")]
    InvalidUtf8,
}
