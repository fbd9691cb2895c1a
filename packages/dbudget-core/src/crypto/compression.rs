//! # Payload Container
//!
//! Payloads are packed into a single-entry archive before encryption:
//!
//! ```text
//! ┌──────────┬─────────┬──────────────┬──────────────┬───────────────────┐
//! │ magic(4) │ ver (1) │ name_len (2) │ name (n)     │ raw_len (8)       │
//! │ "DBZ1"   │ 0x01    │ u16 BE       │ "data.json"  │ u64 BE            │
//! ├──────────┴─────────┴──────────────┴──────────────┴───────────────────┤
//! │ deflate(payload)                                                     │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Anything that does not unpack cleanly after a successful decrypt is a
//! format mismatch and surfaces as [`Error::Corrupted`].

use miniz_oxide::deflate::compress_to_vec;
use miniz_oxide::inflate::decompress_to_vec_with_limit;

use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"DBZ1";
const VERSION: u8 = 1;
const DEFLATE_LEVEL: u8 = 6;

/// Name of the single archive entry
pub const ENTRY_NAME: &str = "data.json";

/// Hard ceiling on an unpacked entry (256 MiB)
pub const MAX_UNPACKED_SIZE: usize = 256 * 1024 * 1024;

/// Pack `payload` into the container
pub fn compress(payload: &[u8]) -> Vec<u8> {
    let deflated = compress_to_vec(payload, DEFLATE_LEVEL);
    let name = ENTRY_NAME.as_bytes();

    let mut out = Vec::with_capacity(4 + 1 + 2 + name.len() + 8 + deflated.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(name);
    out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    out.extend_from_slice(&deflated);
    out
}

/// Unpack a container produced by [`compress`]
pub fn decompress(container: &[u8]) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(container);

    if cursor.take(4)? != MAGIC {
        return Err(Error::Corrupted("bad archive magic".into()));
    }
    let version = cursor.take(1)?[0];
    if version != VERSION {
        return Err(Error::Corrupted(format!(
            "unsupported archive version {}",
            version
        )));
    }

    let name_len = u16::from_be_bytes(
        cursor
            .take(2)?
            .try_into()
            .map_err(|_| Error::Corrupted("truncated header".into()))?,
    ) as usize;
    if cursor.take(name_len)? != ENTRY_NAME.as_bytes() {
        return Err(Error::Corrupted(format!(
            "archive does not contain {}",
            ENTRY_NAME
        )));
    }

    let raw_len = u64::from_be_bytes(
        cursor
            .take(8)?
            .try_into()
            .map_err(|_| Error::Corrupted("truncated header".into()))?,
    );
    if raw_len > MAX_UNPACKED_SIZE as u64 {
        return Err(Error::Corrupted(format!(
            "entry too large: {} bytes",
            raw_len
        )));
    }

    let data = decompress_to_vec_with_limit(cursor.rest(), (raw_len as usize).max(1))
        .map_err(|e| Error::Corrupted(format!("inflate failed: {:?}", e.status)))?;
    if data.len() as u64 != raw_len {
        return Err(Error::Corrupted(format!(
            "length mismatch: header says {}, got {}",
            raw_len,
            data.len()
        )));
    }

    Ok(data)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corrupted("truncated header".into()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}
