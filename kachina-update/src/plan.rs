//! Diff planning and install-mode selection
//!
//! Compares the local state against the target manifest and classifies
//! every file needing work into one of four install modes. The mode
//! decides which bytes are fetched and which decode pipeline runs:
//!
//! | Mode          | Data source                          |
//! |---------------|--------------------------------------|
//! | `Local`       | embedded payload of the running pkg  |
//! | `HybridPatch` | embedded base + remote diff          |
//! | `Patch`       | on-disk base + remote diff           |
//! | `Direct`      | remote payload                       |

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use tracing::{debug, info};

use kachina_format::{Hash, HashedFile, Manifest, ParsedPackage, PatchRecord, paths};

use crate::error::{Result, UpdateError};
use crate::local::{LocalState, probe_writable};

/// Install mode of one task, with the data it needs to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMode {
    /// Decompress the payload embedded in the running package
    Local,
    /// Decompress an embedded base blob, apply a remote diff
    HybridPatch(PatchRecord),
    /// Read the on-disk base file, apply a remote diff
    Patch(PatchRecord),
    /// Download and decompress the target payload
    Direct,
}

impl InstallMode {
    /// Whether this mode touches the network
    pub fn is_remote(&self) -> bool {
        !matches!(self, Self::Local)
    }

    /// Payload name this mode fetches from the remote package
    pub fn remote_payload_name(&self, target: &HashedFile) -> Option<String> {
        match self {
            Self::Local => None,
            Self::HybridPatch(patch) | Self::Patch(patch) => Some(patch.blob_name()),
            Self::Direct => Some(target.hash.to_hex()),
        }
    }
}

/// Task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    /// Queued, not yet picked up
    Pending = 0,
    /// A worker is driving it
    Running = 1,
    /// Finished and verified
    Succeeded = 2,
    /// Terminally failed
    Failed = 3,
}

/// One file's unit of work during an install run
///
/// Workers mutate only their own task's counters; the plan retains
/// shared ownership for progress aggregation.
#[derive(Debug)]
pub struct DiffTask {
    /// Target manifest entry
    pub target: HashedFile,
    /// Hash of the current on-disk content, when one exists
    pub local_hash: Option<Hash>,
    /// Selected install mode
    pub mode: InstallMode,
    /// This task replaces the updater executable (delayed rename)
    pub installer: bool,
    /// Verification is skipped for this target
    pub skip_hash: bool,
    /// The target path failed the exclusive-write probe
    pub unwritable: bool,
    /// Bytes downloaded so far, published by the owning worker
    pub downloaded: AtomicU64,
    state: AtomicU8,
}

impl DiffTask {
    /// Create a pending task for one target entry
    pub fn new(target: HashedFile, local_hash: Option<Hash>, mode: InstallMode) -> Self {
        let installer = target.installer;
        Self {
            target,
            local_hash,
            mode,
            installer,
            skip_hash: false,
            unwritable: false,
            downloaded: AtomicU64::new(0),
            state: AtomicU8::new(TaskState::Pending as u8),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            _ => TaskState::Failed,
        }
    }

    /// Publish a state transition
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Record downloaded bytes
    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }
}

/// Inputs the planner works from
pub struct PlanRequest<'a> {
    /// Manifest describing the target state
    pub manifest: &'a Manifest,
    /// Install directory
    pub dest: &'a Path,
    /// Header view of the running installer's own package, if any
    pub embedded: Option<&'a ParsedPackage>,
    /// Whether a remote source is available for fetches
    pub online: bool,
    /// Online-only mode: never read embedded payloads
    pub online_only: bool,
    /// Preserved user-data prefixes (already variable-substituted)
    pub preserved_prefixes: &'a [String],
    /// File name of the running updater, exempt from the lock probe
    pub updater_name: &'a str,
}

/// The planner's output, consumed by the executor
#[derive(Debug)]
pub struct UpdatePlan {
    /// Version this plan installs
    pub tag_name: String,
    /// Work units, sorted by descending target size
    pub tasks: Vec<Arc<DiffTask>>,
    /// Paths the finalizer removes
    pub deletes: Vec<String>,
}

impl UpdatePlan {
    /// An empty diff set: the tree is already at the target version
    pub fn is_current(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Total bytes the plan will write
    pub fn total_target_bytes(&self) -> u64 {
        self.tasks.iter().map(|t| t.target.size).sum()
    }
}

/// Build the work plan from local state and the target manifest
pub fn build_plan(request: &PlanRequest<'_>, local: &LocalState) -> Result<UpdatePlan> {
    let mut tasks = Vec::new();
    let mut locked = Vec::new();

    for target in &request.manifest.hashed {
        if local.preserved.contains(&target.file_name) {
            continue;
        }
        let local_hash = local.hashes.get(&target.file_name).copied();
        if local_hash == Some(target.hash) {
            continue;
        }

        let mode = select_mode(request, target, local_hash);
        let mut task = DiffTask::new(target.clone(), local_hash, mode);

        // The running updater is replaced through self-patch, not an
        // in-place write; it is exempt from the probe.
        if target.file_name != request.updater_name {
            let os_path = paths::to_os_path(request.dest, &target.file_name);
            if !probe_writable(&os_path) {
                task.unwritable = true;
                locked.push(target.file_name.clone());
            }
        }

        debug!(
            "task {}: mode {:?}, local hash {:?}",
            target.file_name, task.mode, task.local_hash
        );
        tasks.push(Arc::new(task));
    }

    if !locked.is_empty() {
        return Err(UpdateError::LockedFiles { paths: locked });
    }

    // Large tasks first so they start early and small ones fill gaps.
    tasks.sort_by(|a, b| b.target.size.cmp(&a.target.size));

    info!(
        "plan for {}: {} tasks, {} deletes",
        request.manifest.tag_name,
        tasks.len(),
        request.manifest.deletes.len()
    );
    Ok(UpdatePlan {
        tag_name: request.manifest.tag_name.clone(),
        tasks,
        deletes: request.manifest.deletes.clone(),
    })
}

/// Pick the first applicable install mode for one target
fn select_mode(
    request: &PlanRequest<'_>,
    target: &HashedFile,
    local_hash: Option<Hash>,
) -> InstallMode {
    let embedded = request.embedded.filter(|_| !request.online_only);

    if let Some(package) = embedded {
        if package.entry(&target.hash.to_hex()).is_some() {
            return InstallMode::Local;
        }
    }

    if request.online {
        // Prefer a hybrid patch (embedded base) over an on-disk base:
        // the embedded base needs no local scan to trust.
        if let Some(package) = embedded {
            if let Some(patch) = request
                .manifest
                .patches
                .iter()
                .find(|p| p.to == target.hash && package.entry(&p.from.to_hex()).is_some())
            {
                return InstallMode::HybridPatch(*patch);
            }
        }
        if let Some(local_hash) = local_hash {
            if let Some(patch) = request.manifest.patch_for(local_hash, target.hash) {
                return InstallMode::Patch(*patch);
            }
        }
    }

    InstallMode::Direct
}

/// Refuse a version downgrade
///
/// Versions compare as dotted numeric components with a lexicographic
/// tail; an unparseable pair falls back to string inequality and only
/// exact equality is treated as "same".
pub fn check_downgrade(installed: &str, target: &str) -> Result<()> {
    if version_less(target, installed) {
        return Err(UpdateError::Downgrade {
            installed: installed.to_string(),
            target: target.to_string(),
        });
    }
    Ok(())
}

fn version_less(a: &str, b: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches(['v', 'V'])
            .split(['.', '-', '+'])
            .map_while(|part| part.parse::<u64>().ok())
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    if va.is_empty() || vb.is_empty() {
        return false;
    }
    va < vb
}
