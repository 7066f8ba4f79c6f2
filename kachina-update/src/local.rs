//! Local installation scanning
//!
//! Hashes the on-disk files a target manifest cares about, producing the
//! local half of the diff. Hashing yields to the runtime between chunks
//! so a large tree never starves the executor.

use std::collections::HashMap;
use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use kachina_format::{Hash, HashAlgorithm, Hasher, Manifest, paths};

use crate::error::{Result, UpdateError};

/// Read chunk size while hashing
const CHUNK_SIZE: usize = 1 << 20;

/// Cooperative yield cadence in bytes
const YIELD_EVERY: u64 = 8 << 20;

/// Hashes of the local files matching manifest entries
#[derive(Debug, Default)]
pub struct LocalState {
    /// Normalized relative path to on-disk content hash
    pub hashes: HashMap<String, Hash>,
    /// Entries skipped because they sit under a preserved prefix
    pub preserved: Vec<String>,
}

/// Hash every on-disk file the manifest references
///
/// Paths under a preserved prefix that already exist locally are never
/// hashed or replaced; they are user data. Missing files simply produce
/// no entry.
pub async fn scan_local(
    dir: &Path,
    manifest: &Manifest,
    preserved_prefixes: &[String],
) -> Result<LocalState> {
    let algorithm = manifest.algorithm().unwrap_or(HashAlgorithm::Md5);
    let mut state = LocalState::default();

    for entry in &manifest.hashed {
        let os_path = paths::to_os_path(dir, &entry.file_name);
        let exists = os_path.is_file();

        if exists && is_preserved(&entry.file_name, preserved_prefixes) {
            trace!("preserving user data: {}", entry.file_name);
            state.preserved.push(entry.file_name.clone());
            continue;
        }
        if !exists {
            continue;
        }

        let hash = if entry.installer {
            // The updater compares over index-stripped bytes, the same
            // normalization its manifest hash was computed under.
            hash_installer_image(&os_path, algorithm).await?
        } else {
            hash_file_yielding(&os_path, algorithm).await?
        };
        state.hashes.insert(entry.file_name.clone(), hash);
    }

    debug!(
        "scanned {dir:?}: {} hashed, {} preserved",
        state.hashes.len(),
        state.preserved.len()
    );
    Ok(state)
}

/// Whether a normalized path sits under any preserved prefix
pub fn is_preserved(file_name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|prefix| {
        file_name == prefix
            || file_name
                .strip_prefix(prefix.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Hash a file in chunks, yielding to the runtime every few MiB
pub async fn hash_file_yielding(path: &Path, algorithm: HashAlgorithm) -> Result<Hash> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| UpdateError::filesystem(path, e))?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut since_yield = 0u64;

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| UpdateError::filesystem(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        since_yield += n as u64;
        if since_yield >= YIELD_EVERY {
            since_yield = 0;
            tokio::task::yield_now().await;
        }
    }
    Ok(hasher.finalize())
}

/// Hash an updater image over index-stripped bytes
async fn hash_installer_image(path: &Path, algorithm: HashAlgorithm) -> Result<Hash> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Hash> {
        let mut bytes =
            std::fs::read(&path).map_err(|e| UpdateError::filesystem(&path, e))?;
        kachina_format::strip_embedded_index(&mut bytes)?;
        let mut hasher = Hasher::new(algorithm);
        hasher.update(&bytes);
        Ok(hasher.finalize())
    })
    .await
    .map_err(|_| UpdateError::Cancelled)?
}

/// Probe whether a target path can be opened for exclusive writing
///
/// A file another process holds open for execution or with a write lock
/// fails the probe; the planner surfaces those instead of destroying a
/// half-writable installation later.
pub fn probe_writable(path: &Path) -> bool {
    if !path.exists() {
        // Missing files are writable if their parent is.
        return path
            .parent()
            .is_some_and(|parent| parent.as_os_str().is_empty() || parent.exists());
    }
    std::fs::OpenOptions::new()
        .write(true)
        .append(true)
        .open(path)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use kachina_format::HashedFile;

    fn manifest_with(names: &[(&str, &[u8])]) -> Manifest {
        Manifest {
            tag_name: "1.0.0".to_string(),
            hashed: names
                .iter()
                .map(|(name, data)| HashedFile {
                    file_name: (*name).to_string(),
                    size: data.len() as u64,
                    hash: Hash::digest(HashAlgorithm::Md5, data),
                    installer: false,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_scan_hashes_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let manifest = manifest_with(&[("a.txt", b"alpha"), ("missing.txt", b"nope")]);
        let state = scan_local(dir.path(), &manifest, &[]).await.unwrap();

        assert_eq!(state.hashes.len(), 1);
        assert_eq!(
            state.hashes["a.txt"],
            Hash::digest(HashAlgorithm::Md5, b"alpha")
        );
    }

    #[tokio::test]
    async fn test_preserved_prefix_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("saves")).unwrap();
        std::fs::write(dir.path().join("saves/slot1.dat"), b"user data").unwrap();

        let manifest = manifest_with(&[("saves/slot1.dat", b"shipped default")]);
        let state = scan_local(dir.path(), &manifest, &["saves".to_string()])
            .await
            .unwrap();

        assert!(state.hashes.is_empty());
        assert_eq!(state.preserved, vec!["saves/slot1.dat".to_string()]);
    }

    #[test]
    fn test_is_preserved_matches_whole_components() {
        let prefixes = vec!["saves".to_string()];
        assert!(is_preserved("saves/slot1.dat", &prefixes));
        assert!(is_preserved("saves", &prefixes));
        assert!(!is_preserved("saves2/slot1.dat", &prefixes));
    }

    #[test]
    fn test_probe_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, b"data").unwrap();
        assert!(probe_writable(&path));
        assert!(probe_writable(&dir.path().join("new-file.bin")));
    }
}
