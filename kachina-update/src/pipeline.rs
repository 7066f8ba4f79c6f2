//! Per-task streaming pipeline
//!
//! Every task runs `source → decompressor → [patcher] → hasher → temp
//! file → atomic replace`. The hasher sees the decoded (and patched)
//! byte stream; only a verified temp file ever reaches the target path.
//! CPU-heavy stages run on blocking threads; the async side feeds them
//! through a bounded channel and owns cancellation and progress.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use kachina_format::{Hasher, ParsedPackage, paths, reader, strip_embedded_index};

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::plan::DiffTask;

/// Chunk size for blocking reads
const CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of in-flight temp files next to their targets
const TEMP_SUFFIX: &str = ".kachina-tmp";

/// The running installer's own package, readable without seeking
///
/// The payload region is aliased read-only; worker threads slice it
/// concurrently.
pub struct EmbeddedSource {
    backing: Backing,
    parsed: ParsedPackage,
}

enum Backing {
    Mmap(memmap2::Mmap),
    Memory(Vec<u8>),
}

impl Backing {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Mmap(map) => map,
            Self::Memory(vec) => vec,
        }
    }
}

impl EmbeddedSource {
    /// Memory-map a package file
    #[allow(unsafe_code)] // read-only map; the package file is not mutated while open
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| UpdateError::filesystem(path, e))?;
        let map = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| UpdateError::filesystem(path, e))?;
        let parsed = reader::PackageReader::new(std::io::Cursor::new(&map[..]))?
            .parsed()
            .clone();
        Ok(Self {
            backing: Backing::Mmap(map),
            parsed,
        })
    }

    /// Parse an in-memory package (test harnesses)
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let parsed = reader::PackageReader::new(std::io::Cursor::new(&bytes))?
            .parsed()
            .clone();
        Ok(Self {
            backing: Backing::Memory(bytes),
            parsed,
        })
    }

    /// Header view of the embedded package
    pub fn parsed(&self) -> &ParsedPackage {
        &self.parsed
    }

    /// Raw (compressed) payload bytes by index name
    pub fn payload(&self, name: &str) -> Result<&[u8]> {
        let (offset, size) = self
            .parsed
            .payload_range(name)
            .ok_or_else(|| kachina_format::Error::payload_not_found(name))?;
        Ok(&self.backing.as_slice()[offset as usize..(offset + size) as usize])
    }
}

impl std::fmt::Debug for EmbeddedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedSource")
            .field("entries", &self.parsed.entries().len())
            .finish()
    }
}

/// How a finished task left its output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Verified and moved into place
    Committed,
    /// Verified, waiting at a temp path for the completion barrier
    PendingRename {
        /// Temp file holding the verified bytes
        temp: PathBuf,
        /// Final destination
        target: PathBuf,
    },
}

/// Install a task from the embedded package (mode `Local`)
pub async fn install_from_embedded(
    ctx: &UpdateContext,
    task: Arc<DiffTask>,
    embedded: Arc<EmbeddedSource>,
    dest: &Path,
) -> Result<TaskOutcome> {
    ctx.check_cancelled()?;
    let dest = dest.to_path_buf();
    let cancel = ctx.cancel.clone();
    tokio::task::spawn_blocking(move || {
        let compressed = embedded.payload(&task.target.hash.to_hex())?;
        let decoder = zstd::stream::read::Decoder::new(compressed)?;
        commit_decoded(decoder, &task, &dest, &cancel)
    })
    .await
    .map_err(|_| UpdateError::Cancelled)?
}

/// Install a task from already-fetched compressed bytes
///
/// Used for members of a merged group after demultiplexing.
pub async fn install_from_buffer(
    ctx: &UpdateContext,
    task: Arc<DiffTask>,
    compressed: Vec<u8>,
    dest: &Path,
) -> Result<TaskOutcome> {
    ctx.check_cancelled()?;
    let dest = dest.to_path_buf();
    let cancel = ctx.cancel.clone();
    tokio::task::spawn_blocking(move || {
        let decoder = zstd::stream::read::Decoder::new(compressed.as_slice())?;
        commit_decoded(decoder, &task, &dest, &cancel)
    })
    .await
    .map_err(|_| UpdateError::Cancelled)?
}

/// Install a task by streaming its remote payload (mode `Direct`)
pub async fn install_from_remote(
    ctx: &UpdateContext,
    task: Arc<DiffTask>,
    url: &str,
    offset: u64,
    size: u64,
    dest: &Path,
) -> Result<TaskOutcome> {
    ctx.check_cancelled()?;
    let response = ctx.http.get_range_response(url, offset, size).await?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(8);
    let blocking_task = Arc::clone(&task);
    let blocking_dest = dest.to_path_buf();
    let cancel = ctx.cancel.clone();
    let join = tokio::task::spawn_blocking(move || {
        let reader = ChannelReader::new(rx);
        let decoder = zstd::stream::read::Decoder::new(reader)?;
        commit_decoded(decoder, &blocking_task, &blocking_dest, &cancel)
    });

    let mut stream = response.bytes_stream();
    let mut stall = kachina_cdn::StallGuard::new();
    let stream_result: Result<()> = loop {
        tokio::select! {
            () = ctx.cancel.cancelled() => break Err(UpdateError::Cancelled),
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    if let Err(e) = stall.note(bytes.len() as u64) {
                        break Err(e.into());
                    }
                    let total = task.add_downloaded(bytes.len() as u64);
                    ctx.emit_progress(&task.target.file_name, total);
                    if tx.send(bytes.to_vec()).await.is_err() {
                        // Decoder bailed early; its error surfaces below.
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(kachina_cdn::Error::Http(e).into()),
                None => break Ok(()),
            }
        }
    };
    drop(tx);

    let outcome = join.await.map_err(|_| UpdateError::Cancelled)?;
    stream_result?;
    outcome
}

/// Apply a patch to a base and commit the result (modes `Patch`/`HybridPatch`)
pub async fn install_from_patch(
    ctx: &UpdateContext,
    task: Arc<DiffTask>,
    base: Vec<u8>,
    diff: Vec<u8>,
    dest: &Path,
) -> Result<TaskOutcome> {
    ctx.check_cancelled()?;
    let dest = dest.to_path_buf();
    let cancel = ctx.cancel.clone();
    tokio::task::spawn_blocking(move || {
        let patched = kachina_hdiff::apply_patch(&base, &diff)?;
        commit_decoded(patched.as_slice(), &task, &dest, &cancel)
    })
    .await
    .map_err(|_| UpdateError::Cancelled)?
}

/// Fetch and decode the base bytes for a hybrid patch
pub fn embedded_base(embedded: &EmbeddedSource, from_hex: &str) -> Result<Vec<u8>> {
    let compressed = embedded.payload(from_hex)?;
    Ok(zstd::stream::decode_all(compressed)?)
}

/// Drain the decoded stream into a verified temp file and commit it
///
/// Runs on a blocking thread. Installer tasks are index-stripped before
/// hashing and left at their temp path for the completion barrier.
fn commit_decoded<R: Read>(
    mut decoded: R,
    task: &DiffTask,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<TaskOutcome> {
    let target_path = paths::to_os_path(dest, &task.target.file_name);
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| UpdateError::filesystem(parent, e))?;
    }
    let temp_path = temp_path_for(&target_path);

    let result = write_verified(&mut decoded, task, &temp_path, cancel);
    match result {
        Ok(()) => {}
        Err(e) => {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }

    if task.installer {
        debug!("installer staged at {temp_path:?}, rename deferred");
        return Ok(TaskOutcome::PendingRename {
            temp: temp_path,
            target: target_path,
        });
    }
    atomic_replace(&temp_path, &target_path)?;
    trace!("committed {}", task.target.file_name);
    Ok(TaskOutcome::Committed)
}

fn write_verified<R: Read>(
    decoded: &mut R,
    task: &DiffTask,
    temp_path: &Path,
    cancel: &CancellationToken,
) -> Result<()> {
    let algorithm = task.target.hash.algorithm();

    if task.installer {
        // Self-patch needs the whole image to zero its index region
        // before hashing; installers are small enough to buffer.
        let mut bytes = Vec::with_capacity(task.target.size as usize);
        decoded.read_to_end(&mut bytes)?;
        strip_embedded_index(&mut bytes)?;
        verify_bytes(task, algorithm, &bytes)?;
        std::fs::write(temp_path, &bytes).map_err(|e| UpdateError::filesystem(temp_path, e))?;
        return Ok(());
    }

    let mut file = std::fs::File::create(temp_path)
        .map_err(|e| UpdateError::filesystem(temp_path, e))?;
    let mut hasher = Hasher::new(algorithm);
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let n = decoded.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|e| UpdateError::filesystem(temp_path, e))?;
    }
    file.sync_all()
        .map_err(|e| UpdateError::filesystem(temp_path, e))?;
    drop(file);

    if !task.skip_hash {
        let actual = hasher.finalize();
        if actual != task.target.hash {
            return Err(UpdateError::HashMismatch {
                file: task.target.file_name.clone(),
                expected: task.target.hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
    }
    Ok(())
}

fn verify_bytes(task: &DiffTask, algorithm: kachina_format::HashAlgorithm, bytes: &[u8]) -> Result<()> {
    if task.skip_hash {
        return Ok(());
    }
    let actual = kachina_format::Hash::digest(algorithm, bytes);
    if actual != task.target.hash {
        return Err(UpdateError::HashMismatch {
            file: task.target.file_name.clone(),
            expected: task.target.hash.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Temp path sitting next to the target so the rename stays on-device
fn temp_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(TEMP_SUFFIX);
    target.with_file_name(name)
}

/// Move the verified temp file into place
///
/// Plain rename where the OS allows replacing; otherwise delete the
/// target and retry once.
pub fn atomic_replace(temp: &Path, target: &Path) -> Result<()> {
    match std::fs::rename(temp, target) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("rename to {target:?} failed ({first}), retrying after delete");
            let _ = std::fs::remove_file(target);
            std::fs::rename(temp, target).map_err(|e| {
                let _ = std::fs::remove_file(temp);
                UpdateError::filesystem(target, e)
            })
        }
    }
}

/// Blocking `Read` over an async byte-chunk channel
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            current: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pos >= self.current.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = (self.current.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use kachina_format::{Hash, HashAlgorithm, HashedFile};
    use crate::plan::InstallMode;

    fn task_for(name: &str, data: &[u8]) -> Arc<DiffTask> {
        Arc::new(DiffTask::new(
            HashedFile {
                file_name: name.to_string(),
                size: data.len() as u64,
                hash: Hash::digest(HashAlgorithm::Md5, data),
                installer: false,
            },
            None,
            InstallMode::Direct,
        ))
    }

    #[tokio::test]
    async fn test_buffer_install_verifies_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = UpdateContext::new().unwrap();
        let data = b"decoded target bytes".to_vec();
        let compressed = zstd::stream::encode_all(data.as_slice(), 3).unwrap();

        let task = task_for("sub/dir/file.bin", &data);
        let outcome = install_from_buffer(&ctx, Arc::clone(&task), compressed, dir.path())
            .await
            .unwrap();

        assert_eq!(outcome, TaskOutcome::Committed);
        assert_eq!(
            std::fs::read(dir.path().join("sub/dir/file.bin")).unwrap(),
            data
        );
        // No temp leftovers
        assert!(!dir.path().join("sub/dir/file.bin.kachina-tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_payload_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = UpdateContext::new().unwrap();
        let data = b"expected bytes".to_vec();
        let wrong = zstd::stream::encode_all(b"other bytes".as_slice(), 3).unwrap();

        let task = task_for("file.bin", &data);
        let result = install_from_buffer(&ctx, task, wrong, dir.path()).await;

        assert!(matches!(result, Err(UpdateError::HashMismatch { .. })));
        assert!(!dir.path().join("file.bin").exists());
        assert!(!dir.path().join("file.bin.kachina-tmp").exists());
    }

    #[tokio::test]
    async fn test_patch_install() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = UpdateContext::new().unwrap();
        let base = b"version one content".to_vec();
        let target = b"version two content".to_vec();
        let diff = kachina_hdiff::create_patch(&base, &target).unwrap();

        let task = task_for("patched.bin", &target);
        let outcome = install_from_patch(&ctx, task, base, diff, dir.path())
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Committed);
        assert_eq!(std::fs::read(dir.path().join("patched.bin")).unwrap(), target);
    }

    #[test]
    fn test_atomic_replace_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("incoming.tmp");
        let target = dir.path().join("app.bin");
        std::fs::write(&temp, b"new").unwrap();
        std::fs::write(&target, b"old").unwrap();

        atomic_replace(&temp, &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
        assert!(!temp.exists());
    }
}
