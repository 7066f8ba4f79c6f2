//! Error types for patch operations

use thiserror::Error;

/// Error types for patch creation and application
#[derive(Error, Debug)]
pub enum PatchError {
    /// Patch does not start with the expected signature
    #[error("invalid patch signature: expected {expected:016x}, got {actual:016x}")]
    InvalidSignature {
        /// Expected signature value
        expected: u64,
        /// Signature actually read
        actual: u64,
    },

    /// Patch structure is internally inconsistent
    #[error("corrupt patch: {0}")]
    CorruptPatch(String),

    /// Output did not reach the declared size
    #[error("patch output size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Declared output size
        expected: usize,
        /// Bytes actually produced
        actual: usize,
    },

    /// A compressed block failed to decode
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for patch operations
pub type Result<T> = std::result::Result<T, PatchError>;
