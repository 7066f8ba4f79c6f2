//! Payload index
//!
//! The `\0INDEX` segment maps payload names to byte ranges in the package.
//! Each record is densely packed: a 1-byte name length, the ASCII name, a
//! 4-byte big-endian size and a 4-byte big-endian offset relative to
//! `payload_start`. Names are hash hex strings for content-addressed
//! blobs, `{from}_{to}` for patch blobs, and `\0INSTALLER` for the
//! installer slice.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use crate::error::{Error, Result};

/// Tagged index name of the installer payload
pub const INSTALLER_ENTRY: &str = "\0INSTALLER";

/// One payload record in the `\0INDEX` segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Payload name: hash hex, `{from}_{to}`, or [`INSTALLER_ENTRY`]
    pub name: String,
    /// Payload size in bytes
    pub size: u32,
    /// Offset relative to `payload_start`
    pub offset: u32,
}

impl IndexEntry {
    /// Encoded size of this record
    pub fn encoded_len(&self) -> u64 {
        1 + self.name.len() as u64 + 4 + 4
    }
}

/// Encoded size of a whole index payload
pub fn encoded_len(entries: &[IndexEntry]) -> u64 {
    entries.iter().map(IndexEntry::encoded_len).sum()
}

/// Serialize index entries into a `\0INDEX` segment payload
pub fn write_index(entries: &[IndexEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(encoded_len(entries) as usize);
    for entry in entries {
        if entry.name.is_empty() || entry.name.len() > u8::MAX as usize {
            return Err(Error::invalid_index(format!(
                "entry name length {} out of range",
                entry.name.len()
            )));
        }
        if !entry.name.is_ascii() {
            return Err(Error::invalid_index(format!(
                "entry name is not ASCII: {:?}",
                entry.name
            )));
        }
        buf.write_u8(entry.name.len() as u8)?;
        buf.extend_from_slice(entry.name.as_bytes());
        buf.write_u32::<BigEndian>(entry.size)?;
        buf.write_u32::<BigEndian>(entry.offset)?;
    }
    Ok(buf)
}

/// Parse a `\0INDEX` segment payload
pub fn parse_index(payload: &[u8]) -> Result<Vec<IndexEntry>> {
    let mut entries = Vec::new();
    let mut cursor = std::io::Cursor::new(payload);

    while (cursor.position() as usize) < payload.len() {
        let name_len = cursor
            .read_u8()
            .map_err(|_| Error::invalid_index("truncated name length"))?
            as usize;
        if name_len == 0 {
            return Err(Error::invalid_index("zero-length entry name"));
        }
        let mut name_bytes = vec![0u8; name_len];
        cursor
            .read_exact(&mut name_bytes)
            .map_err(|_| Error::invalid_index("truncated entry name"))?;
        if !name_bytes.iter().all(u8::is_ascii) {
            return Err(Error::invalid_index("entry name is not ASCII"));
        }
        let name = String::from_utf8(name_bytes)
            .map_err(|_| Error::invalid_index("entry name is not UTF-8"))?;

        let size = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::invalid_index("truncated entry size"))?;
        let offset = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::invalid_index("truncated entry offset"))?;

        entries.push(IndexEntry { name, size, offset });
    }

    Ok(entries)
}
