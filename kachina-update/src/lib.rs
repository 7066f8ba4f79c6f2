//! Update engine for the Kachina installer
//!
//! Computes the minimal set of file operations between a local
//! installation and a target manifest, then executes them through an
//! install-mode selector (local extract, direct download, binary patch,
//! hybrid local-base + remote-diff patch) with byte-range multiplexing,
//! small-range merging, bounded-concurrency scheduling, retry, and
//! per-file atomic replacement.

pub mod context;
pub mod error;
pub mod finalize;
pub mod friendly;
pub mod local;
pub mod merge;
pub mod pipeline;
pub mod plan;
pub mod profile;
pub mod run;
pub mod scheduler;

pub use context::{ProgressEvent, UpdateContext};
pub use error::{Result, UpdateError};
pub use finalize::{Registration, finalize_install, read_persisted_manifest, uninstall};
pub use friendly::friendly_message;
pub use local::{LocalState, scan_local};
pub use merge::{MergeCandidate, MergeOutcome, MergedGroup, merge_ranges};
pub use pipeline::{EmbeddedSource, TaskOutcome};
pub use plan::{DiffTask, InstallMode, PlanRequest, TaskState, UpdatePlan, build_plan};
pub use profile::InstallerProfile;
pub use run::{InstallReport, InstallRequest, run_install};
pub use scheduler::{ExecutionSummary, Executor, RemoteSource};
