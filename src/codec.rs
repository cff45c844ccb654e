//! Binary codec for RPC messages and on-disk records.
//!
//! Every structured message goes through a single bincode configuration:
//! big-endian, fixed-width integers, `u64` length prefixes for byte strings
//! and sequences, and no trailing bytes. Fixed-layout records (segment
//! frames, index records, snapshot headers) are written directly with
//! `to_be_bytes`/`from_be_bytes` so the on-disk layout never depends on
//! serializer details.

use crate::error::{RaftError, Result};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};

/// Size of the length prefix in front of every framed record.
pub const FRAME_HEADER_LEN: usize = 4;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Serialize a value with the crate-wide encoding.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Deserialize a value encoded with [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// A message with a stable encode/decode interface.
///
/// Implemented for each RPC request/response pair and for log entries.
pub trait WireMessage: Serialize + DeserializeOwned + Sized {
    fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Write `payload` as a `u32 length | bytes` frame. Returns bytes written.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        RaftError::Serialization(format!("record of {} bytes exceeds frame limit", payload.len()))
    })?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok((FRAME_HEADER_LEN + payload.len()) as u64)
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream and on a torn final frame
/// (length prefix or body cut short), so callers can stop replay there.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    // The prefix may be garbage from a torn write; grow only as bytes arrive.
    let len = u32::from_be_bytes(len_buf) as u64;
    let mut payload = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut payload)?;
    if (payload.len() as u64) < len {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Fill `buf` completely. Returns false if the stream ended first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
