//! Connection plumbing: buffered line reads, per-direction zlib, legacy
//! text encodings and the per-peer writer task.
//!
//! The reader side lives on the connection task; the writer side is its
//! own task draining the peer's bounded queue. The two directions hold
//! independent state, so reading never blocks on a write in progress.

use bytes::{Bytes, BytesMut};
use encoding_rs::Encoding;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress};
use std::sync::RwLock;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::error::HubError;

/// Items carried by a peer's outbound queue.
#[derive(Debug)]
pub enum Outbound {
    /// A fully framed protocol line (or several), UTF-8.
    Line(String),
    /// Switch the write side to zlib after announcing `$ZOn|`.
    ZOn(u32),
}

const READ_CHUNK: usize = 8 * 1024;

/// Buffered line reader with an optional streaming zlib stage.
///
/// `read_line` scans for the protocol delimiter in the decoded buffer.
/// After [`LineReader::enable_zlib`], bytes already buffered are treated
/// as the start of the compressed stream; the switch is one-shot per
/// direction, a second enable is a protocol error.
pub struct LineReader {
    r: OwnedReadHalf,
    /// Compressed bytes from the socket (zlib mode only).
    raw: BytesMut,
    /// Bytes scanned for delimiters (inflated when zlib is on).
    buf: BytesMut,
    zlib: Option<Decompress>,
    zlib_used: bool,
    delim: u8,
    max_line: usize,
}

impl LineReader {
    /// Wrap a read half.
    pub fn new(r: OwnedReadHalf, delim: u8, max_line: usize) -> LineReader {
        LineReader {
            r,
            raw: BytesMut::new(),
            buf: BytesMut::with_capacity(READ_CHUNK),
            zlib: None,
            zlib_used: false,
            delim,
            max_line,
        }
    }

    /// Switch the read side through a zlib inflater.
    ///
    /// Bytes already buffered past the last delimiter become the start
    /// of the compressed stream.
    pub fn enable_zlib(&mut self) -> Result<(), HubError> {
        if self.zlib_used {
            return Err(HubError::Handshake("repeated ZOn on the same stream".to_string()));
        }
        self.zlib_used = true;
        self.raw = std::mem::take(&mut self.buf);
        self.buf = BytesMut::with_capacity(READ_CHUNK);
        self.zlib = Some(Decompress::new(true));
        Ok(())
    }

    /// Read one line, stripped of its delimiter.
    ///
    /// Returns `Ok(None)` on a clean EOF. `timeout` bounds each
    /// underlying socket read; `None` means wait indefinitely.
    pub async fn read_line(&mut self, timeout: Option<Duration>) -> Result<Option<Bytes>, HubError> {
        loop {
            if let Some(i) = self.buf.iter().position(|&b| b == self.delim) {
                let mut line = self.buf.split_to(i + 1);
                line.truncate(i);
                return Ok(Some(line.freeze()));
            }
            if self.buf.len() > self.max_line {
                return Err(HubError::Protocol(dchub_proto::ProtocolError::LineTooLong {
                    len: self.buf.len(),
                    max: self.max_line,
                }));
            }

            if let Some(z) = &mut self.zlib {
                if !self.raw.is_empty() {
                    let consumed = inflate_into(z, &self.raw, &mut self.buf)?;
                    let _ = self.raw.split_to(consumed);
                    continue;
                }
                let mut chunk = [0u8; READ_CHUNK];
                let n = read_with_timeout(&mut self.r, &mut chunk, timeout).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.raw.extend_from_slice(&chunk[..n]);
            } else {
                let mut chunk = [0u8; READ_CHUNK];
                let n = read_with_timeout(&mut self.r, &mut chunk, timeout).await?;
                if n == 0 {
                    return Ok(None);
                }
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

async fn read_with_timeout(
    r: &mut OwnedReadHalf,
    buf: &mut [u8],
    timeout: Option<Duration>,
) -> Result<usize, HubError> {
    match timeout {
        Some(dt) => match tokio::time::timeout(dt, r.read(buf)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(HubError::Timeout),
        },
        None => Ok(r.read(buf).await?),
    }
}

/// Inflate as much of `input` as fits, appending to `out`.
///
/// Returns the number of input bytes consumed.
fn inflate_into(z: &mut Decompress, input: &[u8], out: &mut BytesMut) -> Result<usize, HubError> {
    let mut scratch = vec![0u8; READ_CHUNK];
    let mut consumed = 0usize;
    loop {
        let before = z.total_in();
        let before_out = z.total_out();
        let status = z
            .decompress(&input[consumed..], &mut scratch, FlushDecompress::None)
            .map_err(|e| HubError::Handshake(format!("zlib inflate failed: {e}")))?;
        let took = (z.total_in() - before) as usize;
        let wrote = (z.total_out() - before_out) as usize;
        consumed += took;
        out.extend_from_slice(&scratch[..wrote]);
        match status {
            flate2::Status::StreamEnd => break,
            _ if consumed >= input.len() => break,
            _ if took == 0 && wrote == 0 => break,
            _ => {},
        }
    }
    Ok(consumed)
}

/// Deflate `input` with a sync flush so the peer sees it immediately.
fn deflate_chunk(c: &mut Compress, input: &[u8], out: &mut Vec<u8>) -> Result<(), HubError> {
    let mut pos = 0usize;
    loop {
        out.reserve(READ_CHUNK);
        let before = c.total_in();
        c.compress_vec(&input[pos..], out, FlushCompress::Sync)
            .map_err(|e| HubError::Handshake(format!("zlib deflate failed: {e}")))?;
        pos += (c.total_in() - before) as usize;
        if pos >= input.len() && out.len() < out.capacity() {
            return Ok(());
        }
    }
}

/// Active/fallback text-encoding pair for an NMDC connection.
///
/// Reads decode with the active encoding; when that produces
/// replacement characters and the configured fallback decodes cleanly,
/// the active pair switches atomically, so later *encodes* use the new
/// encoding while messages already queued are unaffected.
pub struct TextCodec {
    active: RwLock<&'static Encoding>,
    fallback: Option<&'static Encoding>,
}

impl TextCodec {
    /// Create with the given active encoding and optional fallback.
    pub fn new(active: &'static Encoding, fallback: Option<&'static Encoding>) -> TextCodec {
        TextCodec { active: RwLock::new(active), fallback }
    }

    /// Currently active encoding.
    pub fn active(&self) -> &'static Encoding {
        *self.active.read().expect("encoding lock poisoned")
    }

    /// Decode raw line bytes into text, switching to the fallback
    /// encoding when the active one cannot represent the input.
    pub fn decode(&self, bytes: &[u8]) -> String {
        let active = self.active();
        let (text, _, had_errors) = active.decode(bytes);
        if !had_errors {
            return text.into_owned();
        }
        if let Some(fb) = self.fallback {
            if fb != active {
                let (fb_text, _, fb_errors) = fb.decode(bytes);
                if !fb_errors {
                    *self.active.write().expect("encoding lock poisoned") = fb;
                    tracing::debug!(encoding = fb.name(), "switched to fallback encoding");
                    return fb_text.into_owned();
                }
            }
        }
        text.into_owned()
    }

    /// Encode text with the active encoding. Unmappable characters
    /// become HTML numeric references, which is what NMDC clients
    /// expect.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        let (bytes, _, _) = self.active().encode(text);
        bytes.into_owned()
    }
}

/// How the writer task turns queued lines into socket bytes.
pub enum WriteMode {
    /// UTF-8 straight through (ADC, IRC).
    Plain,
    /// Transcode through the connection's [`TextCodec`] (NMDC).
    Nmdc(std::sync::Arc<TextCodec>),
}

/// Drain a peer's outbound queue into the socket.
///
/// Runs until the queue closes or the peer is shut down, then flushes
/// what is left in the queue and closes the write side. Every peer gets
/// exactly one of these tasks.
pub async fn run_writer(
    mut w: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    mode: WriteMode,
    mut close_rx: watch::Receiver<bool>,
) {
    let mut zlib: Option<Compress> = None;
    let mut zlib_used = false;

    loop {
        let item = tokio::select! {
            item = rx.recv() => match item {
                Some(item) => item,
                None => break,
            },
            res = close_rx.changed() => {
                if res.is_err() || *close_rx.borrow() {
                    break;
                }
                continue;
            },
        };
        if write_item(&mut w, &mode, &mut zlib, &mut zlib_used, item).await.is_err() {
            break;
        }
    }

    // Drain anything enqueued before the close won the race, so a final
    // error or redirect still reaches the client.
    while let Ok(item) = rx.try_recv() {
        if write_item(&mut w, &mode, &mut zlib, &mut zlib_used, item).await.is_err() {
            break;
        }
    }
    let _ = w.shutdown().await;
}

async fn write_item(
    w: &mut OwnedWriteHalf,
    mode: &WriteMode,
    zlib: &mut Option<Compress>,
    zlib_used: &mut bool,
    item: Outbound,
) -> Result<(), HubError> {
    match item {
        Outbound::Line(text) => {
            let bytes = match mode {
                WriteMode::Plain => text.into_bytes(),
                WriteMode::Nmdc(codec) => codec.encode(&text),
            };
            match zlib {
                Some(c) => {
                    let mut out = Vec::with_capacity(bytes.len() / 2 + 64);
                    deflate_chunk(c, &bytes, &mut out)?;
                    w.write_all(&out).await?;
                },
                None => w.write_all(&bytes).await?,
            }
            Ok(())
        },
        Outbound::ZOn(level) => {
            if *zlib_used {
                // One-shot per direction; drop the repeat on the floor.
                return Ok(());
            }
            *zlib_used = true;
            // The sentinel itself is always sent uncompressed.
            let announce = match mode {
                WriteMode::Plain => b"$ZOn|".to_vec(),
                WriteMode::Nmdc(codec) => codec.encode("$ZOn|"),
            };
            w.write_all(&announce).await?;
            *zlib = Some(Compress::new(Compression::new(level.min(9)), true));
            Ok(())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_codec_switches_to_fallback() {
        // 0x81 is unmapped in windows-1252 but maps to Ѓ in windows-1251.
        let codec = TextCodec::new(encoding_rs::WINDOWS_1252, Some(encoding_rs::WINDOWS_1251));
        let decoded = codec.decode(&[0xcf, 0xf0, 0xe8, 0xe2, 0xe5, 0xf2, 0x81]);
        assert!(!decoded.contains('\u{FFFD}'), "fallback should decode cleanly: {decoded:?}");
        assert_eq!(codec.active(), encoding_rs::WINDOWS_1251);

        // Subsequent encodes use the new encoding.
        let bytes = codec.encode("Привет");
        assert_eq!(bytes, vec![0xcf, 0xf0, 0xe8, 0xe2, 0xe5, 0xf2]);
    }

    #[test]
    fn text_codec_keeps_active_without_fallback() {
        let codec = TextCodec::new(encoding_rs::WINDOWS_1252, None);
        let _ = codec.decode(&[0x81]);
        assert_eq!(codec.active(), encoding_rs::WINDOWS_1252);
    }

    #[test]
    fn text_codec_encodes_unmappable_as_references() {
        let codec = TextCodec::new(encoding_rs::WINDOWS_1252, None);
        let bytes = codec.encode("snowman \u{2603}");
        let s = String::from_utf8(bytes).unwrap();
        assert_eq!(s, "snowman &#9731;");
    }

    #[test]
    fn deflate_then_inflate_round_trips() {
        let mut c = Compress::new(Compression::new(6), true);
        let mut z = Decompress::new(true);
        let payload = b"$Hello alice|<alice> hi there|".repeat(50);

        let mut compressed = Vec::new();
        deflate_chunk(&mut c, &payload, &mut compressed).unwrap();
        assert!(!compressed.is_empty());

        let mut out = BytesMut::new();
        let consumed = inflate_into(&mut z, &compressed, &mut out).unwrap();
        assert_eq!(consumed, compressed.len());
        assert_eq!(&out[..], &payload[..]);
    }

    #[test]
    fn deflate_streams_incrementally() {
        let mut c = Compress::new(Compression::new(6), true);
        let mut z = Decompress::new(true);
        let mut all = Vec::new();
        for chunk in [b"first|".as_slice(), b"second|", b"third|"] {
            let mut compressed = Vec::new();
            deflate_chunk(&mut c, chunk, &mut compressed).unwrap();
            // Sync flush makes every chunk immediately decodable.
            let mut out = BytesMut::new();
            inflate_into(&mut z, &compressed, &mut out).unwrap();
            all.extend_from_slice(&out);
        }
        assert_eq!(&all[..], b"first|second|third|");
    }
}
