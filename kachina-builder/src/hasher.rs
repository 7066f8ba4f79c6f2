//! Tree hashing and content-addressed staging
//!
//! Walks a source tree (gitignore semantics for exclusions), hashes every
//! file, and streams it through a zstd encoder into a staging directory
//! keyed by hash. Duplicate content lands once; a hash collision across
//! different sizes is an error rather than silent corruption.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use futures_util::stream::{self, StreamExt};
use tracing::{debug, trace};

use kachina_format::{Hash, HashAlgorithm, HashedFile, Hasher, paths, strip_embedded_index};

use crate::error::{BuildError, Result};

/// Chunk size for streaming hash/compress
const CHUNK_SIZE: usize = 1 << 20;

/// zstd level for staged payloads; tuned for size over speed
const STAGING_COMPRESSION_LEVEL: i32 = 15;

/// Options for a tree hashing run
#[derive(Debug, Clone)]
pub struct HashTreeOptions {
    /// Hash algorithm for the whole manifest
    pub algorithm: HashAlgorithm,
    /// Bounded parallelism for per-file work
    pub jobs: usize,
    /// Extra ignore globs, applied with gitignore semantics
    pub ignore_rules: Vec<String>,
    /// Relative path of the updater executable, hashed over stripped bytes
    pub installer_name: Option<String>,
}

impl Default for HashTreeOptions {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::Md5,
            jobs: 4,
            ignore_rules: Vec::new(),
            installer_name: None,
        }
    }
}

/// Hash a source tree into a staging directory
///
/// Returns one [`HashedFile`] per kept file, ordered by relative path.
/// Staged blobs are written to `out_dir/{hex_hash}`; an existing blob is
/// trusted and not rewritten.
pub async fn hash_tree(
    dir: &Path,
    out_dir: &Path,
    options: &HashTreeOptions,
) -> Result<Vec<HashedFile>> {
    std::fs::create_dir_all(out_dir)?;
    let files = collect_files(dir, &options.ignore_rules)?;
    debug!("hashing {} files from {dir:?}", files.len());

    let results = stream::iter(files.into_iter().map(|(rel, path)| {
        let algorithm = options.algorithm;
        let out_dir = out_dir.to_path_buf();
        let installer = options.installer_name.as_deref() == Some(rel.as_str());
        async move {
            tokio::task::spawn_blocking(move || stage_file(&path, &rel, &out_dir, algorithm, installer))
                .await
                .map_err(|_| BuildError::TaskJoin)?
        }
    }))
    .buffer_unordered(options.jobs.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut hashed = Vec::with_capacity(results.len());
    let mut seen: HashMap<Hash, u64> = HashMap::new();
    for result in results {
        let file = result?;
        if let Some(prior) = seen.get(&file.hash) {
            if *prior != file.size {
                return Err(BuildError::DuplicateHash {
                    hash: file.hash.to_hex(),
                    size_a: *prior,
                    size_b: file.size,
                });
            }
        } else {
            seen.insert(file.hash, file.size);
        }
        hashed.push(file);
    }

    hashed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(hashed)
}

/// Hash a tree without staging anything (used for previous versions)
pub async fn hash_tree_only(
    dir: &Path,
    algorithm: HashAlgorithm,
    jobs: usize,
) -> Result<Vec<HashedFile>> {
    let files = collect_files(dir, &[])?;
    let results = stream::iter(files.into_iter().map(|(rel, path)| async move {
        tokio::task::spawn_blocking(move || -> Result<HashedFile> {
            let (hash, size) = hash_file(&path, algorithm)?;
            Ok(HashedFile {
                file_name: rel,
                size,
                hash,
                installer: false,
            })
        })
        .await
        .map_err(|_| BuildError::TaskJoin)?
    }))
    .buffer_unordered(jobs.max(1))
    .collect::<Vec<_>>()
    .await;

    let mut hashed = results.into_iter().collect::<Result<Vec<_>>>()?;
    hashed.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(hashed)
}

/// Hash one file streamingly
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<(Hash, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Hasher::new(algorithm);
    let mut size = 0u64;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

fn collect_files(dir: &Path, ignore_rules: &[String]) -> Result<Vec<(String, PathBuf)>> {
    let mut overrides = ignore::overrides::OverrideBuilder::new(dir);
    for rule in ignore_rules {
        // Override globs select files; exclusion rules arrive inverted.
        overrides.add(&format!("!{rule}"))?;
    }

    let walk = ignore::WalkBuilder::new(dir)
        .standard_filters(false)
        .git_ignore(true)
        .hidden(false)
        .overrides(overrides.build()?)
        .sort_by_file_path(std::path::Path::cmp)
        .build();

    let mut files = Vec::new();
    for entry in walk {
        let entry = entry?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        files.push((paths::normalize(&rel), entry.into_path()));
    }
    Ok(files)
}

/// Hash one file and stage its zstd-compressed bytes under the hash name
fn stage_file(
    path: &Path,
    rel: &str,
    out_dir: &Path,
    algorithm: HashAlgorithm,
    installer: bool,
) -> Result<HashedFile> {
    let (hash, size, content) = if installer {
        // The updater is hashed and staged over index-stripped bytes so
        // identical source inputs map to identical installer hashes.
        let mut bytes = std::fs::read(path)?;
        strip_embedded_index(&mut bytes)?;
        let mut hasher = Hasher::new(algorithm);
        hasher.update(&bytes);
        let size = bytes.len() as u64;
        (hasher.finalize(), size, Some(bytes))
    } else {
        let (hash, size) = hash_file(path, algorithm)?;
        (hash, size, None)
    };

    let staged = out_dir.join(hash.to_hex());
    if staged.exists() {
        trace!("dedup: {rel} already staged as {hash}");
    } else {
        let tmp = out_dir.join(format!("{}.tmp", hash.to_hex()));
        let mut encoder =
            zstd::stream::write::Encoder::new(File::create(&tmp)?, STAGING_COMPRESSION_LEVEL)?;
        match &content {
            Some(bytes) => encoder.write_all(bytes)?,
            None => {
                let mut reader = BufReader::new(File::open(path)?);
                std::io::copy(&mut reader, &mut encoder)?;
            }
        }
        encoder.finish()?.sync_all()?;
        std::fs::rename(&tmp, &staged)?;
        trace!("staged {rel} as {hash}");
    }

    Ok(HashedFile {
        file_name: rel.to_string(),
        size,
        hash,
        installer,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write(dir: &Path, rel: &str, data: &[u8]) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_hash_tree_stages_by_hash() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write(src.path(), "app.exe", b"application bytes");
        write(src.path(), "data/assets.dat", b"asset bytes");
        write(src.path(), "data/copy.dat", b"asset bytes"); // duplicate content

        let hashed = hash_tree(src.path(), out.path(), &HashTreeOptions::default())
            .await
            .unwrap();

        assert_eq!(hashed.len(), 3);
        assert_eq!(hashed[0].file_name, "app.exe");
        assert_eq!(hashed[1].file_name, "data/assets.dat");
        // Duplicate content stages exactly one blob
        let staged: Vec<_> = std::fs::read_dir(out.path()).unwrap().collect();
        assert_eq!(staged.len(), 2);

        // Staged blob decompresses back to the source bytes
        let blob = out.path().join(hashed[0].hash.to_hex());
        let decoded = zstd::stream::decode_all(File::open(blob).unwrap()).unwrap();
        assert_eq!(decoded, b"application bytes");
    }

    #[tokio::test]
    async fn test_ignore_rules_exclude() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write(src.path(), "app.exe", b"app");
        write(src.path(), "build.log", b"log");

        let options = HashTreeOptions {
            ignore_rules: vec!["*.log".to_string()],
            ..Default::default()
        };
        let hashed = hash_tree(src.path(), out.path(), &options).await.unwrap();
        assert_eq!(hashed.len(), 1);
        assert_eq!(hashed[0].file_name, "app.exe");
    }

    #[tokio::test]
    async fn test_installer_entry_flagged() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write(src.path(), "updater.exe", b"MZ plain stub");

        let options = HashTreeOptions {
            installer_name: Some("updater.exe".to_string()),
            ..Default::default()
        };
        let hashed = hash_tree(src.path(), out.path(), &options).await.unwrap();
        assert!(hashed[0].installer);
    }

    #[tokio::test]
    async fn test_xxh64_manifests() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        write(src.path(), "a.bin", b"content");

        let options = HashTreeOptions {
            algorithm: HashAlgorithm::Xxh64,
            ..Default::default()
        };
        let hashed = hash_tree(src.path(), out.path(), &options).await.unwrap();
        assert_eq!(hashed[0].hash.algorithm(), HashAlgorithm::Xxh64);
        assert_eq!(hashed[0].hash.to_hex().len(), 16);
    }
}
