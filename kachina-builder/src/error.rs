//! Error types for the builder pipeline

use thiserror::Error;

/// Error types for build operations
#[derive(Error, Debug)]
pub enum BuildError {
    /// Stub executable does not look like a valid program image
    #[error("invalid stub executable: {reason}")]
    InvalidStub {
        /// Why the stub was rejected
        reason: String,
    },

    /// Two different files produced the same hash
    #[error("duplicate hash {hash} with conflicting sizes {size_a} and {size_b}")]
    DuplicateHash {
        /// The colliding hash
        hash: String,
        /// Size recorded first
        size_a: u64,
        /// Conflicting size
        size_b: u64,
    },

    /// A payload offset left u32 range; the format caps packages at ~4 GiB
    #[error("payload {name} at offset {offset} exceeds the addressable package size")]
    PayloadTooLarge {
        /// Payload name
        name: String,
        /// Offset that overflowed
        offset: u64,
    },

    /// Staging directory entry is not a valid payload name
    #[error("staged file name is not a payload name: {name}")]
    InvalidStagedName {
        /// The offending file name
        name: String,
    },

    /// Tree walk failed
    #[error("tree walk failed: {0}")]
    Walk(#[from] ignore::Error),

    /// Package format error
    #[error(transparent)]
    Format(#[from] kachina_format::Error),

    /// Patch generation failed
    #[error(transparent)]
    Patch(#[from] kachina_hdiff::PatchError),

    /// Metadata serialization failed
    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A background hashing task failed to complete
    #[error("hashing task panicked or was cancelled")]
    TaskJoin,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for build operations
pub type Result<T> = std::result::Result<T, BuildError>;

impl BuildError {
    /// Create an invalid stub error
    pub fn invalid_stub(reason: impl Into<String>) -> Self {
        Self::InvalidStub {
            reason: reason.into(),
        }
    }
}
