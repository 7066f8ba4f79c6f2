//! Index stripping for self-patch stability
//!
//! A distributed updater executable is a slice of the package it was cut
//! from; its embedded index and footer reference payload offsets of the
//! source package, which differ between otherwise identical builds. Both
//! the builder (hashing the updater for the manifest) and the runtime
//! (verifying a freshly downloaded updater) zero those regions first, so
//! identical source inputs always map to the same installer hash.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::Read;
use tracing::debug;

use crate::error::{Error, Result};
use crate::footer::{FOOTER_LEN, Footer};
use crate::segment::{SEG_INDEX, SEGMENT_MAGIC};

/// Zero the `\0INDEX` segment payload and the footer in place
///
/// Returns `true` when a footer was found and stripped, `false` for a
/// stub-only executable with nothing embedded. Malformed packages (magic
/// present but segments unreadable) are an error, not a silent pass.
pub fn strip_embedded_index(bytes: &mut [u8]) -> Result<bool> {
    let footer = match Footer::locate(bytes) {
        Ok(footer) => footer,
        Err(Error::NoMagic) => return Ok(false),
        Err(e) => return Err(e),
    };
    footer.check_against_file(bytes.len() as u64)?;

    let (region_start, region_end) = footer.segment_region();
    let region_start = region_start as usize;
    let region_end = region_end as usize;

    // Walk segment frames inside the region to find \0INDEX; the walk
    // only needs frame headers, not payload contents.
    let mut pos = region_start;
    while pos < region_end {
        let mut cursor = std::io::Cursor::new(&bytes[pos..region_end]);

        let mut magic = [0u8; SEGMENT_MAGIC.len()];
        cursor
            .read_exact(&mut magic)
            .map_err(|_| Error::invalid_segment(pos as u64, "truncated frame magic"))?;
        if magic != SEGMENT_MAGIC {
            return Err(Error::invalid_segment(pos as u64, "bad frame magic"));
        }
        let name_len = cursor.read_u16::<BigEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        cursor.read_exact(&mut name)?;
        let payload_len = cursor.read_u32::<BigEndian>()? as usize;

        let payload_at = pos + SEGMENT_MAGIC.len() + 2 + name_len + 4;
        let payload_end = payload_at
            .checked_add(payload_len)
            .filter(|end| *end <= region_end)
            .ok_or_else(|| Error::invalid_segment(pos as u64, "payload truncated"))?;

        if name == SEG_INDEX.as_bytes() {
            bytes[payload_at..payload_end].fill(0);
            debug!("zeroed {payload_len} index payload bytes");
        }
        pos = payload_end;
    }

    let footer_at = bytes.len() - FOOTER_LEN;
    bytes[footer_at..].fill(0);
    Ok(true)
}
