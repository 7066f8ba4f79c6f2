//! Bounded-concurrency executor
//!
//! Three task classes run side by side on the shared runtime: `large`
//! downloads (few slots, so big transfers overlap without flooding the
//! link), `small` downloads and merged groups (more slots to amortize
//! latency), and `local` extractions (no network, disk-bound). Each
//! class is bounded by its own semaphore; nothing starves because every
//! task is spawned up front and waits only on its class permit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use kachina_format::{ParsedPackage, paths};

use crate::context::UpdateContext;
use crate::error::{Result, UpdateError};
use crate::merge::{MERGE_MAX_FILE_SIZE, MergeCandidate, MergedGroup, merge_ranges};
use crate::pipeline::{
    EmbeddedSource, TaskOutcome, embedded_base, install_from_buffer, install_from_embedded,
    install_from_patch, install_from_remote,
};
use crate::plan::{DiffTask, InstallMode, TaskState, UpdatePlan};

/// Concurrency slots for the large-download queue
const LARGE_SLOTS: usize = 4;

/// Concurrency slots for the small-download queue
const SMALL_SLOTS: usize = 6;

/// Concurrency slots for local extraction
const LOCAL_SLOTS: usize = 16;

/// Per-task attempt budget
const MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts
const RETRY_BACKOFF_MS: u64 = 200;

/// Remote side of an install run: chunk URL plus the package index
#[derive(Debug, Clone)]
pub struct RemoteSource {
    /// URL byte-range requests go to
    pub url: String,
    /// Parsed remote package header
    pub package: ParsedPackage,
}

impl RemoteSource {
    /// Absolute `(offset, size)` of a payload in the remote package
    pub fn payload_range(&self, name: &str) -> Result<(u64, u64)> {
        self.package
            .payload_range(name)
            .ok_or_else(|| kachina_format::Error::payload_not_found(name).into())
    }
}

/// What one run produced
#[derive(Debug, Default)]
pub struct ExecutionSummary {
    /// Files verified and written
    pub files_written: usize,
    /// Bytes fetched over the network
    pub bytes_downloaded: u64,
    /// Verified updater image waiting for the completion barrier
    pub pending_installer: Option<(PathBuf, PathBuf)>,
}

/// Executor for one planned install run
pub struct Executor {
    ctx: UpdateContext,
    dest: PathBuf,
    embedded: Option<Arc<EmbeddedSource>>,
    remote: Option<Arc<RemoteSource>>,
    large: Arc<Semaphore>,
    small: Arc<Semaphore>,
    local: Arc<Semaphore>,
}

impl Executor {
    /// Create an executor over the available payload sources
    pub fn new(
        ctx: UpdateContext,
        dest: &Path,
        embedded: Option<Arc<EmbeddedSource>>,
        remote: Option<Arc<RemoteSource>>,
    ) -> Self {
        Self {
            ctx,
            dest: dest.to_path_buf(),
            embedded,
            remote,
            large: Arc::new(Semaphore::new(LARGE_SLOTS)),
            small: Arc::new(Semaphore::new(SMALL_SLOTS)),
            local: Arc::new(Semaphore::new(LOCAL_SLOTS)),
        }
    }

    /// Drive every task of the plan to completion
    ///
    /// Returns after the completion barrier: every task has succeeded, or
    /// the first terminal failure has cancelled the rest and is returned.
    pub async fn run(self: Arc<Self>, plan: &UpdatePlan) -> Result<ExecutionSummary> {
        self.ctx.check_cancelled()?;
        if plan.tasks.is_empty() {
            return Ok(ExecutionSummary::default());
        }

        let (groups, singles) = self.partition(plan)?;
        let threshold = large_threshold(&singles);
        debug!(
            "executing {} singles, {} merged groups, large threshold {threshold}",
            singles.len(),
            groups.len()
        );

        let mut join_set: JoinSet<Result<Vec<TaskOutcome>>> = JoinSet::new();

        for (task, download_size) in singles {
            let executor = Arc::clone(&self);
            let queue = if !task.mode.is_remote() {
                Arc::clone(&self.local)
            } else if download_size >= threshold {
                Arc::clone(&self.large)
            } else {
                Arc::clone(&self.small)
            };
            join_set.spawn(async move {
                let _permit = queue.acquire_owned().await.map_err(|_| UpdateError::Cancelled)?;
                executor.run_task(task, false).await.map(|o| vec![o])
            });
        }

        for group in groups {
            let executor = Arc::clone(&self);
            let tasks: Vec<Arc<DiffTask>> = group
                .files
                .iter()
                .map(|c| Arc::clone(&plan.tasks[c.task_index]))
                .collect();
            let queue = Arc::clone(&self.small);
            join_set.spawn(async move {
                let _permit = queue.acquire_owned().await.map_err(|_| UpdateError::Cancelled)?;
                executor.run_group(group, tasks).await
            });
        }

        // Completion barrier: nothing finalizes until every task is done.
        let mut summary = ExecutionSummary::default();
        let mut first_error = None;
        while let Some(joined) = join_set.join_next().await {
            let result = joined.unwrap_or(Err(UpdateError::Cancelled));
            match result {
                Ok(outcomes) => {
                    for outcome in outcomes {
                        summary.files_written += 1;
                        if let TaskOutcome::PendingRename { temp, target } = outcome {
                            summary.pending_installer = Some((temp, target));
                        }
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        warn!("task failed, cancelling remaining work: {e}");
                        self.ctx.cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            if let Some((temp, _)) = summary.pending_installer.take() {
                let _ = std::fs::remove_file(temp);
            }
            return Err(e);
        }

        summary.bytes_downloaded = plan
            .tasks
            .iter()
            .map(|t| t.downloaded.load(std::sync::atomic::Ordering::Relaxed))
            .sum();
        info!(
            "all tasks complete: {} files, {} bytes downloaded",
            summary.files_written, summary.bytes_downloaded
        );
        Ok(summary)
    }

    /// Split the plan into merged groups and individual tasks
    ///
    /// Only `Direct` and `Patch` fetches are merge candidates; `Local`
    /// never touches the network and a hybrid patch reads its base from
    /// the embedded package.
    fn partition(
        &self,
        plan: &UpdatePlan,
    ) -> Result<(Vec<MergedGroup>, Vec<(Arc<DiffTask>, u64)>)> {
        let mut candidates = Vec::new();
        let mut singles = Vec::new();

        for (index, task) in plan.tasks.iter().enumerate() {
            match (&task.mode, self.remote.as_deref()) {
                (InstallMode::Local, _) => singles.push((Arc::clone(task), 0)),
                (mode, Some(remote)) => {
                    let name = mode
                        .remote_payload_name(&task.target)
                        .unwrap_or_else(|| task.target.hash.to_hex());
                    let (offset, size) = remote.payload_range(&name)?;
                    let mergeable = matches!(
                        mode,
                        InstallMode::Direct | InstallMode::Patch(_)
                    ) && size <= MERGE_MAX_FILE_SIZE;
                    if mergeable {
                        candidates.push(MergeCandidate {
                            task_index: index,
                            offset,
                            size,
                        });
                    } else {
                        singles.push((Arc::clone(task), size));
                    }
                }
                (_, None) => {
                    // No remote source: a retry fallback will extract from
                    // the embedded package instead.
                    singles.push((Arc::clone(task), task.target.size));
                }
            }
        }

        let outcome = merge_ranges(candidates);
        for single in outcome.singles {
            singles.push((Arc::clone(&plan.tasks[single.task_index]), single.size));
        }
        Ok((outcome.groups, singles))
    }

    /// Drive one task through its mode with retry
    ///
    /// Each retry disables `Local` and `Patch`, forcing a direct fetch,
    /// so a corrupt embedded payload or bad patch base cannot wedge the
    /// run.
    async fn run_task(&self, task: Arc<DiffTask>, force_direct: bool) -> Result<TaskOutcome> {
        task.set_state(TaskState::Running);

        let mut mode = if force_direct {
            InstallMode::Direct
        } else {
            task.mode.clone()
        };
        let mut last_error = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_millis(RETRY_BACKOFF_MS << (attempt - 1));
                tokio::time::sleep(backoff).await;
                if self.remote.is_some() {
                    mode = InstallMode::Direct;
                }
            }

            match self.run_mode(&task, &mode).await {
                Ok(outcome) => {
                    task.set_state(TaskState::Succeeded);
                    return Ok(outcome);
                }
                Err(UpdateError::Cancelled) => {
                    task.set_state(TaskState::Failed);
                    return Err(UpdateError::Cancelled);
                }
                Err(e) => {
                    let retriable = e.is_retriable();
                    warn!(
                        "task {} attempt {} failed: {e}",
                        task.target.file_name,
                        attempt + 1
                    );
                    last_error = Some(e);
                    if !retriable {
                        break;
                    }
                }
            }
        }

        task.set_state(TaskState::Failed);
        Err(UpdateError::TaskFailed {
            file: task.target.file_name.clone(),
            attempts: MAX_ATTEMPTS,
            source: Box::new(last_error.unwrap_or(UpdateError::Cancelled)),
        })
    }

    /// Execute one mode once
    async fn run_mode(&self, task: &Arc<DiffTask>, mode: &InstallMode) -> Result<TaskOutcome> {
        match mode {
            InstallMode::Local => {
                let embedded = self.require_embedded()?;
                install_from_embedded(&self.ctx, Arc::clone(task), embedded, &self.dest).await
            }
            InstallMode::Direct => match (&self.remote, &self.embedded) {
                (Some(remote), _) => {
                    let (offset, size) = remote.payload_range(&task.target.hash.to_hex())?;
                    install_from_remote(
                        &self.ctx,
                        Arc::clone(task),
                        &remote.url,
                        offset,
                        size,
                        &self.dest,
                    )
                    .await
                }
                (None, Some(_)) => {
                    let embedded = self.require_embedded()?;
                    install_from_embedded(&self.ctx, Arc::clone(task), embedded, &self.dest).await
                }
                (None, None) => Err(UpdateError::CorruptInstall {
                    reason: format!(
                        "no payload source for {}",
                        task.target.file_name
                    ),
                }),
            },
            InstallMode::Patch(patch) => {
                let diff = self.fetch_remote_blob(task, &patch.blob_name()).await?;
                let base_path = paths::to_os_path(&self.dest, &task.target.file_name);
                let base = tokio::fs::read(&base_path)
                    .await
                    .map_err(|e| UpdateError::filesystem(&base_path, e))?;
                install_from_patch(&self.ctx, Arc::clone(task), base, diff, &self.dest).await
            }
            InstallMode::HybridPatch(patch) => {
                let diff = self.fetch_remote_blob(task, &patch.blob_name()).await?;
                let embedded = self.require_embedded()?;
                let from_hex = patch.from.to_hex();
                let base =
                    tokio::task::spawn_blocking(move || embedded_base(&embedded, &from_hex))
                        .await
                        .map_err(|_| UpdateError::Cancelled)??;
                install_from_patch(&self.ctx, Arc::clone(task), base, diff, &self.dest).await
            }
        }
    }

    /// Fetch one whole remote blob, attributing progress to the task
    async fn fetch_remote_blob(&self, task: &Arc<DiffTask>, name: &str) -> Result<Vec<u8>> {
        let remote = self.require_remote()?;
        let (offset, size) = remote.payload_range(name)?;
        self.ctx.check_cancelled()?;
        let bytes = self.ctx.http.get_range(&remote.url, offset, size).await?;
        let total = task.add_downloaded(bytes.len() as u64);
        self.ctx.emit_progress(&task.target.file_name, total);
        Ok(bytes.to_vec())
    }

    /// Download a merged group and demultiplex its members
    ///
    /// The single response body arrives in offset order; members are
    /// sliced out by relative offset and gap bytes are discarded. A
    /// member failing decode or verification is re-queued individually
    /// as a direct download; sibling successes stand.
    async fn run_group(
        &self,
        group: MergedGroup,
        tasks: Vec<Arc<DiffTask>>,
    ) -> Result<Vec<TaskOutcome>> {
        let remote = self.require_remote()?;
        let (start, end) = group.range;

        let buffer = match self
            .ctx
            .http
            .get_range(&remote.url, start, end - start)
            .await
        {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                // Group fetch failed as a whole; fall back to individual
                // downloads rather than giving up on every member.
                warn!("merged group fetch failed ({e}), degrading to singles");
                None
            }
        };

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (candidate, task) in group.files.iter().zip(tasks) {
            self.ctx.check_cancelled()?;
            let member_result = match &buffer {
                Some(buffer) => {
                    let rel = (candidate.offset - start) as usize;
                    let slice = buffer[rel..rel + candidate.size as usize].to_vec();
                    let total = task.add_downloaded(candidate.size);
                    self.ctx.emit_progress(&task.target.file_name, total);
                    task.set_state(TaskState::Running);
                    self.run_member(&task, slice).await
                }
                None => Err(UpdateError::CorruptInstall {
                    reason: "group fetch failed".to_string(),
                }),
            };

            match member_result {
                Ok(outcome) => {
                    task.set_state(TaskState::Succeeded);
                    outcomes.push(outcome);
                }
                Err(UpdateError::Cancelled) => return Err(UpdateError::Cancelled),
                Err(e) => {
                    debug!(
                        "group member {} failed ({e}), re-queueing as direct",
                        task.target.file_name
                    );
                    outcomes.push(self.run_task(task, true).await?);
                }
            }
        }
        Ok(outcomes)
    }

    /// Decode one group member from its sliced bytes
    async fn run_member(&self, task: &Arc<DiffTask>, payload: Vec<u8>) -> Result<TaskOutcome> {
        match &task.mode {
            InstallMode::Patch(_) => {
                let base_path = paths::to_os_path(&self.dest, &task.target.file_name);
                let base = tokio::fs::read(&base_path)
                    .await
                    .map_err(|e| UpdateError::filesystem(&base_path, e))?;
                install_from_patch(&self.ctx, Arc::clone(task), base, payload, &self.dest).await
            }
            _ => install_from_buffer(&self.ctx, Arc::clone(task), payload, &self.dest).await,
        }
    }

    fn require_embedded(&self) -> Result<Arc<EmbeddedSource>> {
        self.embedded
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| UpdateError::CorruptInstall {
                reason: "embedded package required but absent".to_string(),
            })
    }

    fn require_remote(&self) -> Result<Arc<RemoteSource>> {
        self.remote
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| UpdateError::CorruptInstall {
                reason: "remote source required but absent".to_string(),
            })
    }
}

/// Threshold separating the large queue from the small queue
///
/// 80% of the N-th largest download, N chosen to keep two to four tasks
/// in the large class.
fn large_threshold(singles: &[(Arc<DiffTask>, u64)]) -> u64 {
    let mut sizes: Vec<u64> = singles
        .iter()
        .filter(|(task, _)| task.mode.is_remote())
        .map(|(_, size)| *size)
        .collect();
    if sizes.is_empty() {
        return u64::MAX;
    }
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let n = ((sizes.len() as f64 * 0.3).ceil() as usize).clamp(2, 4);
    let nth = sizes[(n - 1).min(sizes.len() - 1)];
    (nth * 8) / 10
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use kachina_format::{Hash, HashAlgorithm, HashedFile};

    fn sized_task(size: u64) -> (Arc<DiffTask>, u64) {
        let task = DiffTask::new(
            HashedFile {
                file_name: format!("f{size}.bin"),
                size,
                hash: Hash::digest(HashAlgorithm::Md5, &size.to_be_bytes()),
                installer: false,
            },
            None,
            InstallMode::Direct,
        );
        (Arc::new(task), size)
    }

    #[test]
    fn test_large_threshold_tracks_nth_largest() {
        let singles: Vec<_> = [100u64, 90, 50, 40, 30, 20, 10, 5, 4, 3]
            .iter()
            .map(|s| sized_task(*s))
            .collect();
        // 10 files -> N = clamp(ceil(3), 2, 4) = 3 -> third largest is 50.
        assert_eq!(large_threshold(&singles), 40);
    }

    #[test]
    fn test_large_threshold_small_plans() {
        let singles: Vec<_> = [100u64, 10].iter().map(|s| sized_task(*s)).collect();
        // N clamps to 2 -> second largest is 10 -> threshold 8.
        assert_eq!(large_threshold(&singles), 8);
    }

    #[test]
    fn test_threshold_without_remote_tasks() {
        assert_eq!(large_threshold(&[]), u64::MAX);
    }
}
