//! Error types for the update engine

use std::path::PathBuf;

use thiserror::Error;

/// Error types for update operations
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Package format violation
    #[error(transparent)]
    Format(#[from] kachina_format::Error),

    /// Download layer failure
    #[error(transparent)]
    Download(#[from] kachina_cdn::Error),

    /// Patch application failure
    #[error(transparent)]
    Patch(#[from] kachina_hdiff::PatchError),

    /// Written content does not hash to its manifest entry
    #[error("hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        /// Target file name
        file: String,
        /// Hash the manifest promises
        expected: String,
        /// Hash the written bytes produced
        actual: String,
    },

    /// Targets are held open by another process
    #[error("locked files prevent the update: {}", paths.join(", "))]
    LockedFiles {
        /// Normalized paths of the locked targets
        paths: Vec<String>,
    },

    /// Installed version is newer than the requested target
    #[error("downgrade refused: installed {installed}, target {target}")]
    Downgrade {
        /// Version currently installed
        installed: String,
        /// Version the manifest offers
        target: String,
    },

    /// Local installation state is unusable
    #[error("corrupt local installation: {reason}")]
    CorruptInstall {
        /// What was found broken
        reason: String,
    },

    /// Uninstall requested but no persisted manifest exists
    #[error("uninstall metadata missing; reinstall required")]
    MissingUninstallMetadata,

    /// The task gave up after its retry budget
    #[error("task {file} failed after {attempts} attempts: {source}")]
    TaskFailed {
        /// Target file name
        file: String,
        /// Attempts made
        attempts: u32,
        /// Last error
        #[source]
        source: Box<UpdateError>,
    },

    /// Filesystem operation failed on a specific path
    #[error("filesystem error on {path:?}: {source}")]
    Filesystem {
        /// Affected path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled
    #[error("update cancelled")]
    Cancelled,

    /// Persisted state could not be read or written
    #[error("state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for update operations
pub type Result<T> = std::result::Result<T, UpdateError>;

impl UpdateError {
    /// Attach a path to an IO error
    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// Whether the error category is worth a task-level retry
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Download(e) => e.is_retriable(),
            // A wrong hash can come from a bad patch base; the retry path
            // falls back to a direct download.
            Self::HashMismatch { .. } | Self::Patch(_) => true,
            _ => false,
        }
    }
}
