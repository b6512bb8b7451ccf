//! Identifiers and small value types shared by the codecs.

use std::fmt;
use std::str::FromStr;

use data_encoding::BASE32_NOPAD;
use digest::Digest;

use crate::{ProtocolError, Result};

/// Base32 alphabet used by ADC for SIDs (RFC 4648, no padding).
const SID_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Session identifier.
///
/// Unique per hub per live session. On the ADC wire a SID is four base32
/// characters (20 bits); internally it is a plain `u32` with the top bits
/// unused so NMDC and IRC sessions can share the same identifier space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sid(pub u32);

impl Sid {
    /// Number of significant bits in a SID.
    pub const BITS: u32 = 20;

    /// Mask covering the significant bits.
    pub const MASK: u32 = (1 << Self::BITS) - 1;

    /// Create a SID from a raw value, truncating to [`Sid::BITS`] bits.
    #[must_use]
    pub fn new(v: u32) -> Self {
        Sid(v & Self::MASK)
    }

    /// Encode into the 4-character ADC wire form.
    #[must_use]
    pub fn to_adc(self) -> String {
        let v = self.0 & Self::MASK;
        let mut out = String::with_capacity(4);
        for i in (0..4).rev() {
            let idx = ((v >> (i * 5)) & 0x1f) as usize;
            out.push(SID_ALPHABET[idx] as char);
        }
        out
    }
}

impl FromStr for Sid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return Err(ProtocolError::InvalidSid);
        }
        let mut v: u32 = 0;
        for &c in b {
            let idx = SID_ALPHABET
                .iter()
                .position(|&a| a == c)
                .ok_or(ProtocolError::InvalidSid)?;
            v = (v << 5) | idx as u32;
        }
        Ok(Sid(v))
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_adc())
    }
}

/// Content identifier: a 192-bit Tiger hash of the client's private
/// identifier (PID). ADC only; NMDC and IRC peers have no CID.
///
/// PIDs share the representation (`type PID = CID` in spirit): both are
/// 24 opaque bytes rendered as unpadded base32 on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid(pub [u8; 24]);

impl Cid {
    /// Derive the CID for a given PID: `CID = Tiger(PID)`.
    #[must_use]
    pub fn from_pid(pid: &Cid) -> Cid {
        Cid(tiger_digest(&pid.0))
    }

    /// Whether all bytes are zero (an unset identifier).
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Base32 wire form (39 characters, no padding).
    #[must_use]
    pub fn to_base32(&self) -> String {
        BASE32_NOPAD.encode(&self.0)
    }
}

impl FromStr for Cid {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        let raw = BASE32_NOPAD
            .decode(s.as_bytes())
            .map_err(|_| ProtocolError::InvalidCid)?;
        let bytes: [u8; 24] = raw.try_into().map_err(|_| ProtocolError::InvalidCid)?;
        Ok(Cid(bytes))
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

/// Compute a 192-bit Tiger digest.
///
/// Used for CID derivation and for the ADC password proof
/// (`Tiger(password || nonce)`).
#[must_use]
pub fn tiger_digest(data: &[u8]) -> [u8; 24] {
    let mut h = tiger::Tiger::new();
    h.update(data);
    let out = h.finalize();
    let mut digest = [0u8; 24];
    digest.copy_from_slice(&out);
    digest
}

/// Client or hub software identity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Software {
    /// Product name.
    pub name: String,
    /// Version string.
    pub version: String,
}

/// An ordered set of ADC feature tags (`BASE`, `TIGR`, ...).
///
/// Tags are four ASCII characters by convention, but the set does not
/// enforce that; unknown tags pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Features(Vec<String>);

impl Features {
    /// Empty feature set.
    #[must_use]
    pub fn new() -> Self {
        Features(Vec::new())
    }

    /// Build from an iterator of tags, dropping duplicates.
    pub fn from_iter<I: IntoIterator<Item = S>, S: Into<String>>(iter: I) -> Self {
        let mut f = Features::new();
        for tag in iter {
            f.insert(tag.into());
        }
        f
    }

    /// Whether the set contains `tag`.
    #[must_use]
    pub fn has(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// Insert a tag, keeping first-seen order. No-op on duplicates.
    pub fn insert(&mut self, tag: String) {
        if !self.has(&tag) {
            self.0.push(tag);
        }
    }

    /// Remove a tag if present.
    pub fn remove(&mut self, tag: &str) {
        self.0.retain(|t| t != tag);
    }

    /// Tags present in both sets, in `self`'s order.
    #[must_use]
    pub fn intersect(&self, other: &Features) -> Features {
        Features(self.0.iter().filter(|t| other.has(t)).cloned().collect())
    }

    /// Iterate over the tags.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_round_trip() {
        for v in [0u32, 1, 0xABCDE, Sid::MASK] {
            let sid = Sid::new(v);
            let s = sid.to_adc();
            assert_eq!(s.len(), 4);
            assert_eq!(s.parse::<Sid>().unwrap(), sid);
        }
    }

    #[test]
    fn sid_known_value() {
        // AAAB == 1
        assert_eq!("AAAB".parse::<Sid>().unwrap(), Sid(1));
        assert_eq!(Sid(1).to_adc(), "AAAB");
    }

    #[test]
    fn sid_rejects_bad_input() {
        assert!("AB".parse::<Sid>().is_err());
        assert!("ab0!".parse::<Sid>().is_err());
    }

    #[test]
    fn cid_round_trip() {
        let cid = Cid([0x5a; 24]);
        let s = cid.to_base32();
        assert_eq!(s.len(), 39);
        assert_eq!(s.parse::<Cid>().unwrap(), cid);
    }

    #[test]
    fn cid_derivation_is_deterministic() {
        let pid = Cid([7; 24]);
        let a = Cid::from_pid(&pid);
        let b = Cid::from_pid(&pid);
        assert_eq!(a, b);
        assert_ne!(a, pid);
    }

    #[test]
    fn features_intersect_keeps_order() {
        let a = Features::from_iter(["BASE", "TIGR", "PING"]);
        let b = Features::from_iter(["TIGR", "BASE"]);
        let m = a.intersect(&b);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec!["BASE", "TIGR"]);
        assert!(!m.has("PING"));
    }
}
