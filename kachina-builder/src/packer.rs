//! Package assembly
//!
//! Lays out the final executable: stub, framed segments, payload region,
//! footer. Offsets are computed before any payload is written, so the
//! writer is single-pass and the footer always lands at the exact tail.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};

use kachina_format::{
    Footer, INSTALLER_ENTRY, IndexEntry, Manifest, SEG_CONFIG, SEG_INDEX, SEG_META, SEG_THEME,
    encoded_len, segment_len, write_index, write_segment,
};

use crate::error::{BuildError, Result};

/// Inputs for one pack run
#[derive(Debug)]
pub struct PackRequest<'a> {
    /// Stub executable copied verbatim as the file prefix
    pub stub: &'a Path,
    /// Raw `\0CONFIG` payload
    pub config: &'a [u8],
    /// Raw `\0THEME` payload; omitted entirely when `None`
    pub theme: Option<&'a [u8]>,
    /// Release manifest; required when a staging directory is given
    pub metadata: Option<&'a Manifest>,
    /// Content-addressed staging directory of payload blobs
    pub hashed_dir: Option<&'a Path>,
    /// Output path of the finished package
    pub out: &'a Path,
}

/// Produce a self-addressable package executable
pub fn pack(request: &PackRequest<'_>) -> Result<()> {
    let stub_bytes = std::fs::read(request.stub)?;
    validate_stub(&stub_bytes)?;
    let payload_start = stub_bytes.len() as u64;

    let metadata_json = request
        .metadata
        .map(|m| {
            m.validate()?;
            m.to_json().map_err(BuildError::from)
        })
        .transpose()?;

    // Enumerate staged blobs in sorted order so identical inputs produce
    // identical layouts.
    let staged = match request.hashed_dir {
        Some(dir) => collect_staged(dir)?,
        None => Vec::new(),
    };

    // Sizes first: index offsets depend only on entry count and name
    // lengths, never on the offsets themselves.
    let config_size = segment_len(SEG_CONFIG, request.config.len());
    let theme_size = request
        .theme
        .map_or(0, |theme| segment_len(SEG_THEME, theme.len()));
    let installer_hex = request
        .metadata
        .and_then(Manifest::installer_entry)
        .map(|f| f.hash.to_hex());
    let mut entries = plan_entries(&staged, installer_hex.as_deref())?;
    let index_size = if staged.is_empty() {
        0
    } else {
        segment_len(SEG_INDEX, encoded_len(&entries) as usize)
    };
    let metadata_size = metadata_json
        .as_ref()
        .map_or(0, |json| segment_len(SEG_META, json.len()));

    let region_len = config_size + theme_size + index_size + metadata_size;
    assign_offsets(&mut entries, &staged, region_len, installer_hex.as_deref())?;

    // Single forward pass over the output file.
    let mut writer = BufWriter::new(File::create(request.out)?);
    writer.write_all(&stub_bytes)?;
    write_segment(&mut writer, SEG_CONFIG, request.config)?;
    if let Some(theme) = request.theme {
        write_segment(&mut writer, SEG_THEME, theme)?;
    }
    if !staged.is_empty() {
        write_segment(&mut writer, SEG_INDEX, &write_index(&entries)?)?;
    }
    if let Some(json) = &metadata_json {
        write_segment(&mut writer, SEG_META, json)?;
    }

    for (name, path, size) in &staged {
        let mut reader = BufReader::new(File::open(path)?);
        let copied = std::io::copy(&mut reader, &mut writer)?;
        if copied != *size {
            return Err(BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("staged blob {name} changed size during pack"),
            )));
        }
        debug!("payload {name}: {size} bytes");
    }

    Footer {
        payload_start: u32::try_from(payload_start).map_err(|_| BuildError::PayloadTooLarge {
            name: "<stub>".to_string(),
            offset: payload_start,
        })?,
        config_size: config_size as u32,
        theme_size: theme_size as u32,
        index_size: index_size as u32,
        metadata_size: metadata_size as u32,
    }
    .write(&mut writer)?;
    writer.flush()?;

    info!(
        "packed {:?}: {} payloads, payload_start {payload_start}",
        request.out,
        staged.len()
    );
    Ok(())
}

/// Reject stubs that are not program images
fn validate_stub(stub: &[u8]) -> Result<()> {
    // MZ for PE images, \x7FELF for unix test stubs.
    let valid = stub.starts_with(b"MZ") || stub.starts_with(b"\x7FELF");
    if !valid {
        return Err(BuildError::invalid_stub(
            "stub does not start with a known executable magic",
        ));
    }
    Ok(())
}

fn collect_staged(dir: &Path) -> Result<Vec<(String, std::path::PathBuf, u64)>> {
    let mut staged = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '_')
        {
            return Err(BuildError::InvalidStagedName { name });
        }
        let size = entry.metadata()?.len();
        staged.push((name, entry.path(), size));
    }
    staged.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(staged)
}

/// Index entries for every staged blob, plus the installer alias
///
/// The installer blob gets a tagged alias entry so the runtime can find
/// it without parsing metadata.
fn plan_entries(
    staged: &[(String, std::path::PathBuf, u64)],
    installer_hex: Option<&str>,
) -> Result<Vec<IndexEntry>> {
    let mut entries: Vec<IndexEntry> = staged
        .iter()
        .map(|(name, _, size)| {
            Ok(IndexEntry {
                name: name.clone(),
                size: u32::try_from(*size).map_err(|_| BuildError::PayloadTooLarge {
                    name: name.clone(),
                    offset: *size,
                })?,
                offset: 0,
            })
        })
        .collect::<Result<_>>()?;

    if let Some(hex) = installer_hex {
        if let Some(blob) = entries.iter().find(|e| e.name == hex) {
            entries.push(IndexEntry {
                name: INSTALLER_ENTRY.to_string(),
                size: blob.size,
                offset: 0,
            });
        }
    }
    Ok(entries)
}

/// Fill in offsets relative to `payload_start`
fn assign_offsets(
    entries: &mut [IndexEntry],
    staged: &[(String, std::path::PathBuf, u64)],
    region_len: u64,
    installer_hex: Option<&str>,
) -> Result<()> {
    let mut offset = region_len;
    let mut by_name: std::collections::HashMap<&str, u32> = std::collections::HashMap::new();
    for (name, _, size) in staged {
        let offset32 = u32::try_from(offset).map_err(|_| BuildError::PayloadTooLarge {
            name: name.clone(),
            offset,
        })?;
        by_name.insert(name.as_str(), offset32);
        offset = offset
            .checked_add(*size)
            .filter(|end| u32::try_from(*end).is_ok())
            .ok_or_else(|| BuildError::PayloadTooLarge {
                name: name.clone(),
                offset,
            })?;
    }

    for entry in entries.iter_mut() {
        let key = if entry.name == INSTALLER_ENTRY {
            installer_hex.unwrap_or_default()
        } else {
            entry.name.as_str()
        };
        entry.offset = *by_name.get(key).ok_or_else(|| {
            BuildError::InvalidStagedName {
                name: entry.name.clone(),
            }
        })?;
    }
    Ok(())
}
