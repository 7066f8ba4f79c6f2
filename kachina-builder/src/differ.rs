//! Diff generation between versions
//!
//! Pairs files carrying the same relative path across a previous version
//! and the new version, and produces a binary patch blob for each pair
//! whose content changed. Patch blobs are staged next to the content
//! blobs under `{from_hex}_{to_hex}`.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, trace};

use kachina_format::{HashAlgorithm, HashedFile, PatchRecord};

use crate::error::Result;
use crate::hasher::hash_tree_only;

/// Pairs below this combined size are not worth a patch
const MIN_DIFF_SIZE: u64 = 64 * 1024;

/// Generate patches from one or more previous trees to the new tree
///
/// `new_hashed` is the already-hashed new version; `prev_dirs` hold the
/// trees of prior releases. When several prior versions provide a `from`
/// candidate for one file, the smallest resulting patch wins. A patch at
/// least as large as the zstd-compressed target blob is dropped, since
/// fetching it could never beat a direct download.
pub async fn diff_tree(
    prev_dirs: &[&Path],
    new_dir: &Path,
    new_hashed: &[HashedFile],
    algorithm: HashAlgorithm,
    staging: &Path,
    jobs: usize,
) -> Result<Vec<PatchRecord>> {
    let new_by_name: HashMap<&str, &HashedFile> = new_hashed
        .iter()
        .map(|f| (f.file_name.as_str(), f))
        .collect();

    // Collect from-candidates per target file across every prior tree.
    let mut candidates: HashMap<String, Vec<(kachina_format::Hash, std::path::PathBuf)>> =
        HashMap::new();
    for prev_dir in prev_dirs {
        let prev_hashed = hash_tree_only(prev_dir, algorithm, jobs).await?;
        for prev in prev_hashed {
            let Some(new) = new_by_name.get(prev.file_name.as_str()) else {
                continue;
            };
            if prev.hash == new.hash {
                continue;
            }
            if prev.size + new.size < MIN_DIFF_SIZE {
                trace!("skipping diff for {}: too small", prev.file_name);
                continue;
            }
            candidates
                .entry(prev.file_name.clone())
                .or_default()
                .push((prev.hash, kachina_format::paths::to_os_path(prev_dir, &prev.file_name)));
        }
    }

    let mut records = Vec::new();
    for (file_name, froms) in candidates {
        let new = new_by_name[file_name.as_str()];
        let target_bytes = std::fs::read(kachina_format::paths::to_os_path(new_dir, &file_name))?;
        let staged_target = staging.join(new.hash.to_hex());
        let compressed_target_size = std::fs::metadata(&staged_target)
            .map(|m| m.len())
            .unwrap_or(u64::MAX);

        // Smallest patch among the from-candidates wins.
        let mut best: Option<(PatchRecord, Vec<u8>)> = None;
        for (from_hash, from_path) in froms {
            let base_bytes = std::fs::read(&from_path)?;
            let patch = kachina_hdiff::create_patch(&base_bytes, &target_bytes)?;
            let record = PatchRecord {
                size: patch.len() as u64,
                from: from_hash,
                to: new.hash,
            };
            if best.as_ref().is_none_or(|(b, _)| record.size < b.size) {
                best = Some((record, patch));
            }
        }

        if let Some((record, patch)) = best {
            if record.size >= compressed_target_size {
                debug!(
                    "dropping patch for {file_name}: {} >= compressed target {}",
                    record.size, compressed_target_size
                );
                continue;
            }
            std::fs::write(staging.join(record.blob_name()), &patch)?;
            debug!(
                "patch for {file_name}: {} -> {} ({} bytes)",
                record.from, record.to, record.size
            );
            records.push(record);
        }
    }

    records.sort_by_key(|r| r.blob_name());
    Ok(records)
}

/// Relative paths present previously but absent from the new version
pub fn compute_deletes(prev_hashed: &[HashedFile], new_hashed: &[HashedFile]) -> Vec<String> {
    let kept: std::collections::HashSet<&str> =
        new_hashed.iter().map(|f| f.file_name.as_str()).collect();
    prev_hashed
        .iter()
        .filter(|f| !kept.contains(f.file_name.as_str()))
        .map(|f| f.file_name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hasher::{HashTreeOptions, hash_tree};

    fn write(dir: &Path, rel: &str, data: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    /// Big incompressible file with a small edit; a patch must win
    fn versioned_payload(marker: u8) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        let mut data = vec![0u8; 256 * 1024];
        for byte in &mut data {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *byte = (state >> 56) as u8;
        }
        data[128 * 1024] = marker;
        data
    }

    #[tokio::test]
    async fn test_patch_generated_and_applies() {
        let prev = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();

        write(prev.path(), "app.bin", &versioned_payload(1));
        write(new.path(), "app.bin", &versioned_payload(2));

        let hashed = hash_tree(new.path(), staging.path(), &HashTreeOptions::default())
            .await
            .unwrap();
        let records = diff_tree(
            &[prev.path()],
            new.path(),
            &hashed,
            HashAlgorithm::Md5,
            staging.path(),
            2,
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        let record = records[0];
        assert_eq!(record.to, hashed[0].hash);

        let patch = std::fs::read(staging.path().join(record.blob_name())).unwrap();
        let rebuilt = kachina_hdiff::apply_patch(&versioned_payload(1), &patch).unwrap();
        assert_eq!(rebuilt, versioned_payload(2));
    }

    #[tokio::test]
    async fn test_unchanged_and_tiny_files_skipped() {
        let prev = tempfile::tempdir().unwrap();
        let new = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();

        write(prev.path(), "same.bin", &versioned_payload(1));
        write(new.path(), "same.bin", &versioned_payload(1));
        write(prev.path(), "tiny.txt", b"v1");
        write(new.path(), "tiny.txt", b"v2");

        let hashed = hash_tree(new.path(), staging.path(), &HashTreeOptions::default())
            .await
            .unwrap();
        let records = diff_tree(
            &[prev.path()],
            new.path(),
            &hashed,
            HashAlgorithm::Md5,
            staging.path(),
            2,
        )
        .await
        .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_compute_deletes() {
        let file = |name: &str| HashedFile {
            file_name: name.to_string(),
            size: 1,
            hash: kachina_format::Hash::digest(HashAlgorithm::Md5, name.as_bytes()),
            installer: false,
        };
        let prev = vec![file("keep.txt"), file("drop.txt")];
        let new = vec![file("keep.txt"), file("added.txt")];
        assert_eq!(compute_deletes(&prev, &new), vec!["drop.txt".to_string()]);
    }
}
