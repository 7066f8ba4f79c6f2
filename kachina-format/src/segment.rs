//! Segment framing
//!
//! Segments sit back-to-back in the package header region. Each is framed
//! as: magic `!IN\0`, a 2-byte big-endian name length, the 7-bit-ASCII
//! name, a 4-byte big-endian payload length, then the payload bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

use crate::error::{Error, Result};

/// Magic prefixing every segment frame
pub const SEGMENT_MAGIC: [u8; 4] = *b"!IN\0";

/// Config segment name
pub const SEG_CONFIG: &str = "\0CONFIG";
/// Theme segment name
pub const SEG_THEME: &str = "\0THEME";
/// Payload index segment name
pub const SEG_INDEX: &str = "\0INDEX";
/// Metadata (manifest) segment name
pub const SEG_META: &str = "\0META";

/// Names a reader accepts; anything else is a hard parse error
const KNOWN_SEGMENTS: [&str; 4] = [SEG_CONFIG, SEG_THEME, SEG_INDEX, SEG_META];

/// Longest name a frame may carry; generous versus the known set
const MAX_NAME_LEN: usize = 64;

/// A named chunk of the package header region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment tag, NUL prefix included
    pub name: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

/// Framed size of a segment with the given name and payload length
pub fn segment_len(name: &str, payload_len: usize) -> u64 {
    (SEGMENT_MAGIC.len() + 2 + name.len() + 4 + payload_len) as u64
}

/// Write one framed segment
pub fn write_segment<W: Write>(writer: &mut W, name: &str, payload: &[u8]) -> Result<()> {
    debug_assert!(name.is_ascii());
    writer.write_all(&SEGMENT_MAGIC)?;
    writer.write_u16::<BigEndian>(name.len() as u16)?;
    writer.write_all(name.as_bytes())?;
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Parse every segment in a header region buffer
///
/// The buffer must contain whole frames and nothing else; trailing bytes
/// that do not start a valid frame are an error.
pub fn parse_segments(region: &[u8]) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut cursor = std::io::Cursor::new(region);

    while (cursor.position() as usize) < region.len() {
        let offset = cursor.position();

        let mut magic = [0u8; SEGMENT_MAGIC.len()];
        std::io::Read::read_exact(&mut cursor, &mut magic)
            .map_err(|_| Error::invalid_segment(offset, "truncated frame magic"))?;
        if magic != SEGMENT_MAGIC {
            return Err(Error::invalid_segment(offset, "bad frame magic"));
        }

        let name_len = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| Error::invalid_segment(offset, "truncated name length"))? as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(Error::invalid_segment(
                offset,
                format!("name length {name_len} out of range"),
            ));
        }

        let mut name_bytes = vec![0u8; name_len];
        std::io::Read::read_exact(&mut cursor, &mut name_bytes)
            .map_err(|_| Error::invalid_segment(offset, "truncated name"))?;
        if !name_bytes.iter().all(u8::is_ascii) {
            return Err(Error::unknown_segment(&name_bytes));
        }
        let name = String::from_utf8(name_bytes.clone())
            .map_err(|_| Error::unknown_segment(&name_bytes))?;
        if !KNOWN_SEGMENTS.contains(&name.as_str()) {
            return Err(Error::unknown_segment(name.as_bytes()));
        }

        let payload_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::invalid_segment(offset, "truncated payload length"))?
            as usize;
        let start = cursor.position() as usize;
        let end = start
            .checked_add(payload_len)
            .filter(|end| *end <= region.len())
            .ok_or_else(|| {
                Error::invalid_segment(offset, format!("payload of {payload_len} bytes truncated"))
            })?;

        segments.push(Segment {
            name,
            payload: region[start..end].to_vec(),
        });
        cursor.set_position(end as u64);
    }

    Ok(segments)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_roundtrip_two_segments() {
        let mut buf = Vec::new();
        write_segment(&mut buf, SEG_CONFIG, b"{\"name\":\"demo\"}").unwrap();
        write_segment(&mut buf, SEG_THEME, b"").unwrap();

        let segments = parse_segments(&buf).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].name, SEG_CONFIG);
        assert_eq!(segments[0].payload, b"{\"name\":\"demo\"}");
        assert_eq!(segments[1].name, SEG_THEME);
        assert!(segments[1].payload.is_empty());
    }

    #[test]
    fn test_framed_len_matches_writer() {
        let mut buf = Vec::new();
        write_segment(&mut buf, SEG_META, b"abcd").unwrap();
        assert_eq!(buf.len() as u64, segment_len(SEG_META, 4));
    }

    #[test]
    fn test_unknown_name_rejected() {
        let mut buf = Vec::new();
        write_segment(&mut buf, SEG_CONFIG, b"x").unwrap();
        // Patch the name bytes to an unknown tag
        let name_start = SEGMENT_MAGIC.len() + 2;
        buf[name_start..name_start + 7].copy_from_slice(b"\0BOGUS!");
        assert!(matches!(
            parse_segments(&buf),
            Err(Error::UnknownSegment { .. })
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = Vec::new();
        write_segment(&mut buf, SEG_CONFIG, b"x").unwrap();
        buf[0] = b'?';
        assert!(matches!(
            parse_segments(&buf),
            Err(Error::InvalidSegment { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let mut buf = Vec::new();
        write_segment(&mut buf, SEG_CONFIG, b"full payload").unwrap();
        buf.truncate(buf.len() - 3);
        assert!(matches!(
            parse_segments(&buf),
            Err(Error::InvalidSegment { .. })
        ));
    }
}
