//! Package footer
//!
//! The footer is a fixed-layout trailer at the exact tail of the file:
//! ASCII `!KachinaInstaller!` followed by five 4-byte big-endian unsigned
//! integers. It is the entry point for both the local self-reader and the
//! remote range reader; everything else in the package is located from it.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

use crate::error::{Error, Result};

/// Magic string opening the footer
pub const FOOTER_MAGIC: &[u8; 18] = b"!KachinaInstaller!";

/// Total footer size: magic plus five u32 fields
pub const FOOTER_LEN: usize = FOOTER_MAGIC.len() + 5 * 4;

/// Fixed-layout package trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    /// Offset where the stub ends and the segment region begins
    pub payload_start: u32,
    /// Framed size of the `\0CONFIG` segment
    pub config_size: u32,
    /// Framed size of the `\0THEME` segment, 0 when omitted
    pub theme_size: u32,
    /// Framed size of the `\0INDEX` segment, 0 when omitted
    pub index_size: u32,
    /// Framed size of the `\0META` segment, 0 when omitted
    pub metadata_size: u32,
}

impl Footer {
    /// Locate and decode the footer inside a tail window of the file
    ///
    /// `tail` holds the last bytes of the file (at least [`FOOTER_LEN`] of
    /// them for any valid package). The magic is searched from the tail
    /// backwards, but a well-formed package has it exactly [`FOOTER_LEN`]
    /// bytes before EOF; anything after the five sizes is rejected.
    pub fn locate(tail: &[u8]) -> Result<Self> {
        if tail.len() < FOOTER_LEN {
            return if tail.windows(FOOTER_MAGIC.len()).any(|w| w == FOOTER_MAGIC) {
                Err(Error::TruncatedFooter {
                    len: tail.len(),
                    expected: FOOTER_LEN,
                })
            } else {
                Err(Error::NoMagic)
            };
        }

        let magic_at = tail.len() - FOOTER_LEN;
        if &tail[magic_at..magic_at + FOOTER_MAGIC.len()] != FOOTER_MAGIC {
            // Scan backwards for diagnostics: a magic elsewhere in the
            // window means trailing garbage, not a missing footer.
            let found = tail
                .windows(FOOTER_MAGIC.len())
                .rposition(|w| w == FOOTER_MAGIC);
            return match found {
                Some(pos) => Err(Error::TruncatedFooter {
                    len: tail.len() - pos,
                    expected: FOOTER_LEN,
                }),
                None => Err(Error::NoMagic),
            };
        }

        let mut cursor = std::io::Cursor::new(&tail[magic_at + FOOTER_MAGIC.len()..]);
        Ok(Self {
            payload_start: cursor.read_u32::<BigEndian>()?,
            config_size: cursor.read_u32::<BigEndian>()?,
            theme_size: cursor.read_u32::<BigEndian>()?,
            index_size: cursor.read_u32::<BigEndian>()?,
            metadata_size: cursor.read_u32::<BigEndian>()?,
        })
    }

    /// Write the footer at the current position (which must be the tail)
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(FOOTER_MAGIC)?;
        writer.write_u32::<BigEndian>(self.payload_start)?;
        writer.write_u32::<BigEndian>(self.config_size)?;
        writer.write_u32::<BigEndian>(self.theme_size)?;
        writer.write_u32::<BigEndian>(self.index_size)?;
        writer.write_u32::<BigEndian>(self.metadata_size)?;
        Ok(())
    }

    /// Total framed size of the segment region
    pub fn segment_region_len(&self) -> u64 {
        u64::from(self.config_size)
            + u64::from(self.theme_size)
            + u64::from(self.index_size)
            + u64::from(self.metadata_size)
    }

    /// Absolute byte range `[start, end)` of the segment region
    pub fn segment_region(&self) -> (u64, u64) {
        let start = u64::from(self.payload_start);
        (start, start + self.segment_region_len())
    }

    /// Reject footers whose segment region cannot fit in the file
    pub fn check_against_file(&self, file_size: u64) -> Result<()> {
        let (_, end) = self.segment_region();
        if end + FOOTER_LEN as u64 > file_size {
            return Err(Error::SegmentRegionOutOfRange { end, file_size });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Footer {
        Footer {
            payload_start: 4096,
            config_size: 64,
            theme_size: 0,
            index_size: 220,
            metadata_size: 512,
        }
    }

    #[test]
    fn test_roundtrip() {
        let mut buf = vec![0u8; 100]; // arbitrary prefix
        sample().write(&mut buf).unwrap();
        assert_eq!(buf.len(), 100 + FOOTER_LEN);
        assert_eq!(Footer::locate(&buf).unwrap(), sample());
    }

    #[test]
    fn test_magic_must_sit_at_exact_tail() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf.push(0); // a single trailing byte invalidates the package
        assert!(Footer::locate(&buf).is_err());
    }

    #[test]
    fn test_no_magic() {
        let buf = vec![0u8; 256];
        assert!(matches!(Footer::locate(&buf), Err(Error::NoMagic)));
    }

    #[test]
    fn test_short_tail_without_magic_is_no_magic() {
        let buf = vec![0u8; FOOTER_LEN - 1];
        assert!(matches!(Footer::locate(&buf), Err(Error::NoMagic)));
    }

    #[test]
    fn test_truncated_footer() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf.truncate(buf.len() - 4); // lost the last size field
        assert!(matches!(
            Footer::locate(&buf),
            Err(Error::TruncatedFooter { .. })
        ));
    }

    #[test]
    fn test_segment_region() {
        let footer = sample();
        assert_eq!(footer.segment_region(), (4096, 4096 + 64 + 220 + 512));
        assert!(footer.check_against_file(1 << 20).is_ok());
        assert!(footer.check_against_file(4100).is_err());
    }
}
