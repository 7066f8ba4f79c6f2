//! Patch stream codec
//!
//! Layout: signature `HDIFF13\0`, then three big-endian u64 fields
//! (compressed control size, compressed cover size, output size), then
//! the zstd-compressed control, cover and extra blocks back-to-back.
//! Control records are triples `{cover_len, extra_len, seek}`; cover
//! bytes are added to base bytes, extra bytes are spliced verbatim.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use tracing::{debug, trace};

use crate::error::{PatchError, Result};

/// Patch signature, `HDIFF13\0` as a big-endian u64
const HDIFF_SIGNATURE: u64 = 0x4844_4946_4631_3300;

/// zstd level for patch blocks; patches are written once, applied often
const BLOCK_COMPRESSION_LEVEL: i32 = 19;

/// Fixed-layout patch header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchHeader {
    /// Compressed size of the control block
    pub control_size: u64,
    /// Compressed size of the cover (diff) block
    pub cover_size: u64,
    /// Size of the file the patch produces
    pub output_size: u64,
}

impl PatchHeader {
    /// Read and validate a header from the stream
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let signature = reader.read_u64::<BigEndian>()?;
        if signature != HDIFF_SIGNATURE {
            return Err(PatchError::InvalidSignature {
                expected: HDIFF_SIGNATURE,
                actual: signature,
            });
        }
        Ok(Self {
            control_size: reader.read_u64::<BigEndian>()?,
            cover_size: reader.read_u64::<BigEndian>()?,
            output_size: reader.read_u64::<BigEndian>()?,
        })
    }

    /// Write the header to the stream
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<BigEndian>(HDIFF_SIGNATURE)?;
        writer.write_u64::<BigEndian>(self.control_size)?;
        writer.write_u64::<BigEndian>(self.cover_size)?;
        writer.write_u64::<BigEndian>(self.output_size)?;
        Ok(())
    }
}

/// Apply a patch to base data, producing the target bytes
pub fn apply_patch(base: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
    debug!(
        "applying patch: base={} bytes, patch={} bytes",
        base.len(),
        patch.len()
    );

    let mut cursor = Cursor::new(patch);
    let header = PatchHeader::read(&mut cursor)?;
    trace!("patch header: {header:?}");

    let control = read_block(&mut cursor, header.control_size as usize)?;
    let cover = read_block(&mut cursor, header.cover_size as usize)?;
    let mut extra_compressed = Vec::new();
    cursor.read_to_end(&mut extra_compressed)?;
    let extra = decompress_block(&extra_compressed)?;

    let output_size = header.output_size as usize;
    let mut output = Vec::with_capacity(output_size);
    let mut control_cursor = Cursor::new(control.as_slice());
    let mut cover_pos = 0usize;
    let mut extra_pos = 0usize;
    let mut base_pos = 0usize;

    while output.len() < output_size {
        let cover_len = read_len(&mut control_cursor)?;
        let extra_len = read_len(&mut control_cursor)?;
        let seek = control_cursor.read_i64::<BigEndian>()?;

        if output.len() + cover_len + extra_len > output_size {
            return Err(PatchError::CorruptPatch(
                "control record exceeds declared output size".to_string(),
            ));
        }
        if cover_pos + cover_len > cover.len() || extra_pos + extra_len > extra.len() {
            return Err(PatchError::CorruptPatch(
                "control record exceeds block contents".to_string(),
            ));
        }

        for delta in &cover[cover_pos..cover_pos + cover_len] {
            let base_byte = base.get(base_pos).copied().unwrap_or(0);
            output.push(base_byte.wrapping_add(*delta));
            base_pos += 1;
        }
        cover_pos += cover_len;

        output.extend_from_slice(&extra[extra_pos..extra_pos + extra_len]);
        extra_pos += extra_len;

        if seek < 0 {
            base_pos = base_pos.saturating_sub(seek.unsigned_abs() as usize);
        } else {
            base_pos = base_pos.saturating_add(seek as usize);
        }
    }

    if output.len() != output_size {
        return Err(PatchError::SizeMismatch {
            expected: output_size,
            actual: output.len(),
        });
    }

    debug!("patch applied: output={} bytes", output.len());
    Ok(output)
}

/// Create a patch turning `base` into `target`
///
/// Cover generation is greedy common-prefix/common-suffix: matching head
/// and tail bytes become zero-delta cover runs (which compress to almost
/// nothing) and the middle travels as extra data. Correct for any input,
/// not size-optimal for reordered content.
pub fn create_patch(base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    debug!(
        "creating patch: base={} bytes, target={} bytes",
        base.len(),
        target.len()
    );

    let prefix = base
        .iter()
        .zip(target.iter())
        .take_while(|(b, t)| b == t)
        .count();
    let max_suffix = base.len().min(target.len()) - prefix;
    let suffix = base
        .iter()
        .rev()
        .zip(target.iter().rev())
        .take_while(|(b, t)| b == t)
        .count()
        .min(max_suffix);

    let middle_target = target.len() - prefix - suffix;
    let middle_base_skip = base.len() as i64 - suffix as i64 - prefix as i64;

    let mut control = Vec::new();
    let mut cover = Vec::new();
    let mut extra = Vec::new();

    // Head run: prefix bytes carried as zero deltas over the base.
    control.write_u64::<BigEndian>(prefix as u64)?;
    control.write_u64::<BigEndian>(middle_target as u64)?;
    control.write_i64::<BigEndian>(middle_base_skip)?;
    cover.resize(prefix, 0);
    extra.extend_from_slice(&target[prefix..prefix + middle_target]);

    if suffix > 0 {
        control.write_u64::<BigEndian>(suffix as u64)?;
        control.write_u64::<BigEndian>(0)?;
        control.write_i64::<BigEndian>(0)?;
        cover.resize(prefix + suffix, 0);
    }

    let control_compressed = compress_block(&control)?;
    let cover_compressed = compress_block(&cover)?;
    let extra_compressed = compress_block(&extra)?;

    let mut patch = Vec::with_capacity(
        8 + 24 + control_compressed.len() + cover_compressed.len() + extra_compressed.len(),
    );
    PatchHeader {
        control_size: control_compressed.len() as u64,
        cover_size: cover_compressed.len() as u64,
        output_size: target.len() as u64,
    }
    .write(&mut patch)?;
    patch.extend_from_slice(&control_compressed);
    patch.extend_from_slice(&cover_compressed);
    patch.extend_from_slice(&extra_compressed);

    debug!("patch created: {} bytes", patch.len());
    Ok(patch)
}

fn read_len(cursor: &mut Cursor<&[u8]>) -> Result<usize> {
    let value = cursor.read_u64::<BigEndian>()?;
    usize::try_from(value)
        .map_err(|_| PatchError::CorruptPatch(format!("length {value} exceeds address space")))
}

fn read_block<R: Read>(reader: &mut R, size: usize) -> Result<Vec<u8>> {
    let mut compressed = vec![0u8; size];
    reader.read_exact(&mut compressed)?;
    decompress_block(&compressed)
}

fn compress_block(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::encode_all(Cursor::new(data), BLOCK_COMPRESSION_LEVEL)
        .map_err(|e| PatchError::Decompression(e.to_string()))
}

fn decompress_block(data: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(Cursor::new(data)).map_err(|e| PatchError::Decompression(e.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_identical_inputs() {
        let data = b"unchanged content".to_vec();
        let patch = create_patch(&data, &data).unwrap();
        assert_eq!(apply_patch(&data, &patch).unwrap(), data);
    }

    #[test]
    fn test_append_only_change() {
        let base = b"shared header |".to_vec();
        let target = b"shared header | plus a new tail".to_vec();
        let patch = create_patch(&base, &target).unwrap();
        assert_eq!(apply_patch(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_middle_edit_keeps_prefix_and_suffix() {
        let base = b"PREFIX ... old middle ... SUFFIX".to_vec();
        let target = b"PREFIX ... replacement ... SUFFIX".to_vec();
        let patch = create_patch(&base, &target).unwrap();
        assert_eq!(apply_patch(&base, &patch).unwrap(), target);
    }

    #[test]
    fn test_empty_to_data() {
        let patch = create_patch(b"", b"fresh content").unwrap();
        assert_eq!(apply_patch(b"", &patch).unwrap(), b"fresh content");
    }

    #[test]
    fn test_data_to_empty() {
        let patch = create_patch(b"old content", b"").unwrap();
        assert_eq!(apply_patch(b"old content", &patch).unwrap(), b"");
    }

    #[test]
    fn test_large_shared_regions_compress_well() {
        let mut base = vec![0x42u8; 512 * 1024];
        let mut target = base.clone();
        target[256 * 1024..256 * 1024 + 64].copy_from_slice(&[0x99; 64]);
        base[100] = 7; // ensure prefix/suffix are nontrivial but bounded

        let patch = create_patch(&base, &target).unwrap();
        assert_eq!(apply_patch(&base, &patch).unwrap(), target);
        // Shared-heavy inputs must not degenerate to full-size patches
        assert!(patch.len() < target.len() / 2);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut patch = create_patch(b"a", b"b").unwrap();
        patch[0] ^= 0xFF;
        assert!(matches!(
            apply_patch(b"a", &patch),
            Err(PatchError::InvalidSignature { .. })
        ));
    }

    #[test]
    fn test_truncated_patch_rejected() {
        let patch = create_patch(b"base data here", b"target data here").unwrap();
        assert!(apply_patch(b"base data here", &patch[..patch.len() - 4]).is_err());
    }

    #[test]
    fn test_wrong_base_still_sized_correctly() {
        // Applying against a wrong base yields wrong bytes, never a wrong
        // size; the installer's hash verification catches the content.
        let base = b"correct base".to_vec();
        let target = b"correct base v2".to_vec();
        let patch = create_patch(&base, &target).unwrap();
        let out = apply_patch(b"wrong base!!", &patch).unwrap();
        assert_eq!(out.len(), target.len());
        assert_ne!(out, target);
    }
}
