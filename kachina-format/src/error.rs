//! Error types for package format parsing and writing

use thiserror::Error;

/// Error types for format operations
#[derive(Error, Debug)]
pub enum Error {
    /// Footer magic not found in the tail window
    #[error("package footer magic not found")]
    NoMagic,

    /// File ends before a complete footer
    #[error("truncated footer: {len} bytes available, {expected} required")]
    TruncatedFooter {
        /// Bytes available at the tail
        len: usize,
        /// Bytes a full footer occupies
        expected: usize,
    },

    /// Segment region extends past the end of the file
    #[error("segment region ends at {end} but file is only {file_size} bytes")]
    SegmentRegionOutOfRange {
        /// Absolute end offset implied by the footer
        end: u64,
        /// Actual file size
        file_size: u64,
    },

    /// Segment framing is malformed
    #[error("invalid segment at offset {offset}: {reason}")]
    InvalidSegment {
        /// Offset of the segment within the segment region
        offset: u64,
        /// What was wrong
        reason: String,
    },

    /// Segment name is not one of the known tags
    #[error("unknown segment name: {name:?}")]
    UnknownSegment {
        /// The offending name, escaped
        name: String,
    },

    /// An index entry addresses bytes outside the payload region
    #[error("index entry {name:?} addresses {offset}+{size} beyond file end {file_size}")]
    IndexOffsetOutOfRange {
        /// Entry name
        name: String,
        /// Absolute payload offset
        offset: u64,
        /// Payload size
        size: u64,
        /// File size the entry must fit within
        file_size: u64,
    },

    /// Index payload is malformed
    #[error("invalid index payload: {reason}")]
    InvalidIndex {
        /// What was wrong
        reason: String,
    },

    /// A payload name was looked up but is not present
    #[error("payload not found: {name}")]
    PayloadNotFound {
        /// The requested entry name
        name: String,
    },

    /// Hash string is not valid for the algorithm
    #[error("invalid hash literal: {literal}")]
    InvalidHash {
        /// The offending literal
        literal: String,
    },

    /// Manifest violates a structural invariant
    #[error("invalid manifest: {reason}")]
    InvalidManifest {
        /// Violated invariant
        reason: String,
    },

    /// Manifest JSON could not be parsed
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for format operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid segment error
    pub fn invalid_segment(offset: u64, reason: impl Into<String>) -> Self {
        Self::InvalidSegment {
            offset,
            reason: reason.into(),
        }
    }

    /// Create an unknown segment error, escaping the raw name bytes
    pub fn unknown_segment(raw: &[u8]) -> Self {
        Self::UnknownSegment {
            name: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    /// Create an invalid index error
    pub fn invalid_index(reason: impl Into<String>) -> Self {
        Self::InvalidIndex {
            reason: reason.into(),
        }
    }

    /// Create an invalid hash error
    pub fn invalid_hash(literal: impl Into<String>) -> Self {
        Self::InvalidHash {
            literal: literal.into(),
        }
    }

    /// Create an invalid manifest error
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Create a payload not found error
    pub fn payload_not_found(name: impl Into<String>) -> Self {
        Self::PayloadNotFound { name: name.into() }
    }
}
