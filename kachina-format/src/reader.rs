//! Self-reader
//!
//! Parses a package (this same executable, or any package file) into a
//! `{segments, index, payload_start}` view without touching the payload
//! region. The remote reader in the CDN crate reuses [`ParsedPackage`]
//! over ranges it fetched by HTTP; the local path memory-maps the file.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;

use crate::error::{Error, Result};
use crate::footer::{FOOTER_LEN, Footer};
use crate::index::{IndexEntry, parse_index};
use crate::manifest::Manifest;
use crate::segment::{SEG_CONFIG, SEG_INDEX, SEG_META, SEG_THEME, parse_segments, segment_len};

/// Tail window handed to the footer scanner
const TAIL_WINDOW: u64 = 4096;

/// A parsed package header: footer, segments and resolved index
#[derive(Debug, Clone)]
pub struct ParsedPackage {
    footer: Footer,
    file_size: u64,
    config: Vec<u8>,
    theme: Option<Vec<u8>>,
    metadata_raw: Option<Vec<u8>>,
    index: Vec<IndexEntry>,
}

impl ParsedPackage {
    /// Assemble from a decoded footer and the raw segment region bytes
    ///
    /// Validates the §6 rejection rules: the segment region must fit the
    /// file, segment names must be known, framed sizes must match the
    /// footer fields, and every index entry must address bytes inside the
    /// payload region.
    pub fn from_parts(footer: Footer, region: &[u8], file_size: u64) -> Result<Self> {
        footer.check_against_file(file_size)?;
        if region.len() as u64 != footer.segment_region_len() {
            return Err(Error::invalid_segment(
                0,
                format!(
                    "segment region is {} bytes, footer claims {}",
                    region.len(),
                    footer.segment_region_len()
                ),
            ));
        }

        let segments = parse_segments(region)?;

        let mut config = None;
        let mut theme = None;
        let mut metadata_raw = None;
        let mut index_payload = None;
        for segment in segments {
            let framed = segment_len(&segment.name, segment.payload.len());
            let (slot, declared): (&mut Option<Vec<u8>>, u32) = match segment.name.as_str() {
                SEG_CONFIG => (&mut config, footer.config_size),
                SEG_THEME => (&mut theme, footer.theme_size),
                SEG_INDEX => (&mut index_payload, footer.index_size),
                SEG_META => (&mut metadata_raw, footer.metadata_size),
                other => return Err(Error::unknown_segment(other.as_bytes())),
            };
            if framed != u64::from(declared) {
                return Err(Error::invalid_segment(
                    0,
                    format!(
                        "segment {:?} is {framed} framed bytes, footer claims {declared}",
                        segment.name
                    ),
                ));
            }
            if slot.replace(segment.payload).is_some() {
                return Err(Error::invalid_segment(
                    0,
                    format!("duplicate segment {:?}", segment.name),
                ));
            }
        }

        let config = config.ok_or_else(|| Error::invalid_segment(0, "missing \\0CONFIG"))?;
        let index = match index_payload {
            Some(payload) => parse_index(&payload)?,
            None => Vec::new(),
        };

        let payload_start = u64::from(footer.payload_start);
        let addressable_end = file_size - FOOTER_LEN as u64;
        for entry in &index {
            let start = payload_start + u64::from(entry.offset);
            if start + u64::from(entry.size) > addressable_end {
                return Err(Error::IndexOffsetOutOfRange {
                    name: entry.name.clone(),
                    offset: start,
                    size: u64::from(entry.size),
                    file_size,
                });
            }
        }

        debug!(
            "parsed package: payload_start={payload_start}, {} index entries",
            index.len()
        );

        Ok(Self {
            footer,
            file_size,
            config,
            theme,
            metadata_raw,
            index,
        })
    }

    /// The decoded footer
    pub fn footer(&self) -> Footer {
        self.footer
    }

    /// Size of the whole package file
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Raw `\0CONFIG` payload
    pub fn config_bytes(&self) -> &[u8] {
        &self.config
    }

    /// Raw `\0THEME` payload, if the package carries one
    pub fn theme_bytes(&self) -> Option<&[u8]> {
        self.theme.as_deref().filter(|t| !t.is_empty())
    }

    /// Raw `\0META` payload, if the package carries one
    pub fn metadata_bytes(&self) -> Option<&[u8]> {
        self.metadata_raw.as_deref()
    }

    /// Parse the embedded manifest, if the package carries one
    pub fn manifest(&self) -> Result<Option<Manifest>> {
        self.metadata_raw
            .as_deref()
            .map(Manifest::from_json)
            .transpose()
    }

    /// All payload index entries
    pub fn entries(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Look up an index entry by payload name
    pub fn entry(&self, name: &str) -> Option<&IndexEntry> {
        self.index.iter().find(|e| e.name == name)
    }

    /// Absolute `(offset, size)` of a payload, resolved against the footer
    pub fn payload_range(&self, name: &str) -> Option<(u64, u64)> {
        self.entry(name).map(|e| {
            (
                u64::from(self.footer.payload_start) + u64::from(e.offset),
                u64::from(e.size),
            )
        })
    }
}

/// Reader over a seekable package source
pub struct PackageReader<R> {
    source: R,
    parsed: ParsedPackage,
}

impl<R: Read + Seek> PackageReader<R> {
    /// Parse the package header out of a seekable source
    pub fn new(mut source: R) -> Result<Self> {
        let file_size = source.seek(SeekFrom::End(0))?;

        let tail_len = TAIL_WINDOW.min(file_size);
        source.seek(SeekFrom::End(-(tail_len as i64)))?;
        let mut tail = vec![0u8; tail_len as usize];
        source.read_exact(&mut tail)?;
        let footer = Footer::locate(&tail)?;
        footer.check_against_file(file_size)?;

        let (region_start, region_end) = footer.segment_region();
        source.seek(SeekFrom::Start(region_start))?;
        let mut region = vec![0u8; (region_end - region_start) as usize];
        source.read_exact(&mut region)?;

        let parsed = ParsedPackage::from_parts(footer, &region, file_size)?;
        Ok(Self { source, parsed })
    }

    /// Read a whole payload into memory by index name
    pub fn read_payload(&mut self, name: &str) -> Result<Vec<u8>> {
        let (offset, size) = self
            .parsed
            .payload_range(name)
            .ok_or_else(|| Error::payload_not_found(name))?;
        self.read_at(offset, size)
    }

    /// Read an arbitrary absolute byte range of the package
    pub fn read_at(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.source.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size as usize];
        self.source.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R> PackageReader<R> {
    /// The parsed header view
    pub fn parsed(&self) -> &ParsedPackage {
        &self.parsed
    }

    /// Consume the reader, returning the underlying source
    pub fn into_source(self) -> R {
        self.source
    }
}

/// Memory-map a package file and parse its header
#[allow(unsafe_code)] // read-only map; the package file is not mutated while open
pub fn open_file(path: &Path) -> Result<PackageReader<Cursor<Mmap>>> {
    let file = std::fs::File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    PackageReader::new(Cursor::new(mmap))
}

/// Parse the currently running executable as a package
///
/// A stub-only executable (no embedded package) surfaces as
/// [`Error::NoMagic`]; callers treat that as "nothing embedded".
pub fn open_self() -> Result<PackageReader<Cursor<Mmap>>> {
    let exe = std::env::current_exe()?;
    open_file(&exe)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::index::{INSTALLER_ENTRY, write_index};
    use crate::segment::write_segment;

    /// Build a minimal in-memory package: stub, segments, payloads, footer
    fn build_package(stub: &[u8], payloads: &[(&str, &[u8])]) -> Vec<u8> {
        let config = br#"{"name":"demo"}"#.to_vec();
        let meta = br#"{"tag_name":"1.0.0","hashed":[]}"#.to_vec();

        let mut entries = Vec::new();
        let mut index_len = 0u64;
        for (name, data) in payloads {
            index_len += 1 + name.len() as u64 + 8;
            entries.push(IndexEntry {
                name: (*name).to_string(),
                size: data.len() as u32,
                offset: 0, // fixed up below
            });
        }

        let config_size = segment_len(SEG_CONFIG, config.len());
        let index_size = segment_len(SEG_INDEX, index_len as usize);
        let meta_size = segment_len(SEG_META, meta.len());
        let region_len = config_size + index_size + meta_size;

        let mut offset = region_len;
        for (entry, (_, data)) in entries.iter_mut().zip(payloads) {
            entry.offset = offset as u32;
            offset += data.len() as u64;
        }

        let mut out = stub.to_vec();
        write_segment(&mut out, SEG_CONFIG, &config).unwrap();
        write_segment(&mut out, SEG_INDEX, &write_index(&entries).unwrap()).unwrap();
        write_segment(&mut out, SEG_META, &meta).unwrap();
        for (_, data) in payloads {
            out.extend_from_slice(data);
        }
        Footer {
            payload_start: stub.len() as u32,
            config_size: config_size as u32,
            theme_size: 0,
            index_size: index_size as u32,
            metadata_size: meta_size as u32,
        }
        .write(&mut out)
        .unwrap();
        out
    }

    #[test]
    fn test_parse_and_read_payload() {
        let package = build_package(b"MZ-stub-bytes", &[("aabb", b"payload-one")]);
        let mut reader = PackageReader::new(Cursor::new(package)).unwrap();

        assert_eq!(reader.parsed().config_bytes(), br#"{"name":"demo"}"#);
        assert!(reader.parsed().theme_bytes().is_none());
        assert_eq!(
            reader.parsed().manifest().unwrap().unwrap().tag_name,
            "1.0.0"
        );
        assert_eq!(reader.read_payload("aabb").unwrap(), b"payload-one");
        assert!(matches!(
            reader.read_payload("missing"),
            Err(Error::PayloadNotFound { .. })
        ));
    }

    #[test]
    fn test_installer_entry_resolves() {
        let package = build_package(b"MZ", &[(INSTALLER_ENTRY, b"stub-slice")]);
        let mut reader = PackageReader::new(Cursor::new(package)).unwrap();
        assert_eq!(reader.read_payload(INSTALLER_ENTRY).unwrap(), b"stub-slice");
    }

    #[test]
    fn test_stub_only_reports_no_magic() {
        let stub = vec![0x4D, 0x5A, 0, 0, 1, 2, 3];
        assert!(matches!(
            PackageReader::new(Cursor::new(stub)),
            Err(Error::NoMagic)
        ));
    }

    #[test]
    fn test_index_entry_out_of_range_rejected() {
        let mut package = build_package(b"MZ-stub", &[("aabb", b"data")]);
        // Corrupt the entry's size field inside the index segment so that
        // offset + size runs past the file end.
        let needle = b"\x04aabb";
        let pos = package
            .windows(needle.len())
            .position(|w| w == needle)
            .unwrap();
        package[pos + 5..pos + 9].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            PackageReader::new(Cursor::new(package)),
            Err(Error::IndexOffsetOutOfRange { .. })
        ));
    }
}
