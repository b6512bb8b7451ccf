//! Protocol detection.
//!
//! Peeks at the first bytes of a connection without consuming them and
//! decides which protocol handler gets the stream. Rules, in order:
//!
//! 1. `HSUP ` (or `H` + three uppercase letters + space) → ADC
//! 2. `$` or `<` → NMDC
//! 3. `NICK `, `USER `, `PASS `, `CAP ` → IRC
//! 4. anything else → error, close
//!
//! Because `peek` is used, the bytes remain available to the chosen
//! handler.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::HubError;
use crate::peer::Protocol;

/// Bytes examined before giving up.
pub const SNIFF_LEN: usize = 16;

/// Classification result for a byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// Decided.
    Found(Protocol),
    /// The prefix cannot belong to any supported protocol.
    Unknown,
    /// Not enough bytes yet.
    NeedMore,
}

const IRC_PREFIXES: &[&[u8]] = &[b"NICK ", b"USER ", b"PASS ", b"CAP "];

/// Classify a peeked byte prefix.
#[must_use]
pub fn detect(buf: &[u8]) -> Detection {
    if buf.is_empty() {
        return Detection::NeedMore;
    }
    match buf[0] {
        b'$' | b'<' => return Detection::Found(Protocol::Nmdc),
        b'H' => {
            // HSUP, or any H<CMD> ADC hub-bound command.
            for (i, &b) in buf.iter().enumerate().skip(1) {
                match i {
                    1..=3 if b.is_ascii_uppercase() => continue,
                    4 if b == b' ' || b == b'\n' => return Detection::Found(Protocol::Adc),
                    _ => return Detection::Unknown,
                }
            }
            return Detection::NeedMore;
        },
        _ => {},
    }
    for pfx in IRC_PREFIXES {
        if buf.len() >= pfx.len() {
            if buf.starts_with(pfx) {
                return Detection::Found(Protocol::Irc);
            }
        } else if pfx.starts_with(buf) {
            return Detection::NeedMore;
        }
    }
    Detection::Unknown
}

/// Peek at the stream until the protocol is decided.
///
/// NMDC is hub-speaks-first: a plain NMDC client sends nothing until it
/// sees `$Lock`. A quiet socket at the deadline is therefore dispatched
/// to the NMDC handler rather than rejected; only bytes that match no
/// protocol are an error.
pub async fn sniff(stream: &TcpStream, timeout: Duration) -> Result<Protocol, HubError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; SNIFF_LEN];
    loop {
        let n = match tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => return Ok(Protocol::Nmdc),
        };
        if n == 0 {
            return Err(HubError::UnknownProtocol);
        }
        match detect(&buf[..n]) {
            Detection::Found(p) => return Ok(p),
            Detection::Unknown => return Err(HubError::UnknownProtocol),
            Detection::NeedMore if n == SNIFF_LEN => return Err(HubError::UnknownProtocol),
            Detection::NeedMore => {
                // The peek returned everything buffered; give the
                // client a moment to send more.
                tokio::time::sleep(Duration::from_millis(20)).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adc_prefixes() {
        assert_eq!(detect(b"HSUP ADBASE"), Detection::Found(Protocol::Adc));
        assert_eq!(detect(b"HSUP"), Detection::NeedMore);
        assert_eq!(detect(b"H"), Detection::NeedMore);
        assert_eq!(detect(b"HPAS AAAA"), Detection::Found(Protocol::Adc));
        assert_eq!(detect(b"Hello"), Detection::Unknown);
    }

    #[test]
    fn nmdc_prefixes() {
        assert_eq!(detect(b"$Key abc"), Detection::Found(Protocol::Nmdc));
        assert_eq!(detect(b"$"), Detection::Found(Protocol::Nmdc));
        assert_eq!(detect(b"<alice> hi"), Detection::Found(Protocol::Nmdc));
    }

    #[test]
    fn irc_prefixes() {
        assert_eq!(detect(b"NICK carol"), Detection::Found(Protocol::Irc));
        assert_eq!(detect(b"NI"), Detection::NeedMore);
        assert_eq!(detect(b"USER c 0 * :c"), Detection::Found(Protocol::Irc));
        assert_eq!(detect(b"PASS x"), Detection::Found(Protocol::Irc));
        assert_eq!(detect(b"CAP LS"), Detection::Found(Protocol::Irc));
        assert_eq!(detect(b"NICKEL"), Detection::Unknown);
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(detect(b"GET / HTTP/1.1"), Detection::Unknown);
        assert_eq!(detect(b"\x16\x03\x01"), Detection::Unknown);
    }
}
