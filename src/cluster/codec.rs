//! Record codec for gossip payloads and snapshot files.
//!
//! Record format:
//! ```text
//! ┌──────────┬────────────────────────┐
//! │ len (4B) │     JSON payload       │
//! │ u32 BE   │                        │
//! └──────────┴────────────────────────┘
//! ```
//! A stream is a plain concatenation of records. Clean EOF at a record
//! boundary ends the stream; EOF inside a record is corruption.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::{Error, Result};

/// Cap on a single record's payload. Anything larger is treated as a
/// corrupt length prefix rather than an allocation request.
pub const MAX_RECORD_BYTES: u32 = 16 * 1024 * 1024;

/// Read one length-delimited record. Returns `None` on clean EOF.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_RECORD_BYTES {
        return Err(Error::corrupt(format!("record too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::corrupt("record truncated mid-payload"),
            _ => e.into(),
        })?;
    Ok(Some(payload))
}

/// Write one length-delimited record. Returns bytes written.
pub fn write_record<W: Write + ?Sized>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    Ok(4 + u64::from(len))
}

/// Serialize and frame one value.
pub fn write_entry<W: Write + ?Sized, T: Serialize>(writer: &mut W, entry: &T) -> Result<u64> {
    let payload = serde_json::to_vec(entry)?;
    write_record(writer, &payload)
}

/// Decode all records in a stream. Stops at clean EOF; any record that
/// fails to decode poisons the whole load.
pub fn read_entries<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Vec<T>> {
    let mut entries = Vec::new();
    while let Some(payload) = read_record(reader)? {
        let entry = serde_json::from_slice(&payload)
            .map_err(|e| Error::corrupt(format!("undecodable record: {}", e)))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Frame a batch of values into one gossip payload.
pub fn encode_entries<T: Serialize>(entries: &[T]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        write_entry(&mut buf, entry)?;
    }
    Ok(buf)
}
