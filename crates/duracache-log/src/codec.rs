//! Change record codec
//!
//! One log record per mutation, framed so that records are length-delimited
//! and corruption is detected before the payload is decoded:
//!
//! ```text
//! +--------+--------+---------+--------+
//! | Magic  | Length | Payload | CRC32C |
//! | 4B     | 4B     | var     | 4B     |
//! +--------+--------+---------+--------+
//! ```
//!
//! The payload is the bincode encoding of [`ChangeRecord`]. The checksum
//! covers magic, length, and payload.

use duracache_common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::time::SystemTime;

/// Record magic number
const RECORD_MAGIC: u32 = 0x44435245; // "DCRE"

/// Frame header size (magic + length)
const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single payload; anything larger is treated as corruption
const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024;

/// One set-or-remove event in the mutation log.
///
/// A record with `is_set = false` encodes a pure removal: replay ignores
/// its `value`, `group_ids`, and `expiry_time` fields entirely.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeRecord<V> {
    pub is_set: bool,
    pub item_id: String,
    pub value: Option<V>,
    pub group_ids: Vec<String>,
    pub expiry_time: Option<SystemTime>,
}

impl<V> ChangeRecord<V> {
    /// Create a set record capturing the item's current state
    pub fn set(
        item_id: impl Into<String>,
        value: V,
        group_ids: Vec<String>,
        expiry_time: Option<SystemTime>,
    ) -> Self {
        Self {
            is_set: true,
            item_id: item_id.into(),
            value: Some(value),
            group_ids,
            expiry_time,
        }
    }

    /// Create a removal record carrying only the item id
    pub fn remove(item_id: impl Into<String>) -> Self {
        Self {
            is_set: false,
            item_id: item_id.into(),
            value: None,
            group_ids: Vec::new(),
            expiry_time: None,
        }
    }
}

/// Encode one record into `w`. `path` names the destination file in errors.
pub fn write_record<W: Write, V: Serialize>(
    w: &mut W,
    record: &ChangeRecord<V>,
    path: &Path,
) -> Result<()> {
    let payload = bincode::serialize(record)
        .map_err(|e| Error::encode(path, e.to_string()))?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());

    w.write_all(&buf)?;
    Ok(())
}

/// Decode the next record from `r`.
///
/// Returns `Ok(None)` on a clean end of stream. A partial frame, bad magic,
/// CRC mismatch, or payload decode failure is a [`Error::Decode`] naming
/// `path`.
pub fn read_record<R: Read, V: DeserializeOwned>(
    r: &mut R,
    path: &Path,
) -> Result<Option<ChangeRecord<V>>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match read_fully(r, &mut header)? {
        0 => return Ok(None),
        n if n < RECORD_HEADER_SIZE => {
            return Err(Error::decode(path, "truncated record header"));
        }
        _ => {}
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Err(Error::decode(path, format!("invalid record magic {magic:#010x}")));
    }
    let payload_len = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(Error::decode(path, format!("record length {payload_len} out of range")));
    }

    let mut payload = vec![0u8; payload_len];
    if read_fully(r, &mut payload)? < payload_len {
        return Err(Error::decode(path, "truncated record payload"));
    }

    let mut crc_buf = [0u8; 4];
    if read_fully(r, &mut crc_buf)? < 4 {
        return Err(Error::decode(path, "truncated record checksum"));
    }
    let stored_crc = u32::from_le_bytes(crc_buf);

    let computed = crc32c::crc32c_append(crc32c::crc32c(&header), &payload);
    if computed != stored_crc {
        return Err(Error::decode(
            path,
            format!("record CRC mismatch: stored {stored_crc:#010x}, computed {computed:#010x}"),
        ));
    }

    let record = bincode::deserialize(&payload)
        .map_err(|e| Error::decode(path, e.to_string()))?;
    Ok(Some(record))
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
