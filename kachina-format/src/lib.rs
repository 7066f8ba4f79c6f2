//! Self-addressable package format for the Kachina installer
//!
//! A Kachina package is a single executable whose tail region carries a
//! set of framed segments (config, theme, payload index, metadata), a
//! payload region of content-addressed blobs, and a fixed footer that
//! makes the whole file addressable by byte range. This crate implements
//! the format itself: segment framing, footer codec, payload index,
//! manifest data model and the self-reader used by both the offline
//! installer and the remote range reader.

pub mod error;
pub mod footer;
pub mod hash;
pub mod index;
pub mod manifest;
pub mod paths;
pub mod reader;
pub mod segment;
pub mod strip;

pub use error::{Error, Result};
pub use footer::{FOOTER_LEN, FOOTER_MAGIC, Footer};
pub use hash::{Hash, HashAlgorithm, Hasher};
pub use index::{INSTALLER_ENTRY, IndexEntry, encoded_len, parse_index, write_index};
pub use manifest::{HashedFile, InstallerRecord, Manifest, PatchRecord};
pub use reader::{PackageReader, ParsedPackage};
pub use segment::{
    SEG_CONFIG, SEG_INDEX, SEG_META, SEG_THEME, SEGMENT_MAGIC, Segment, parse_segments,
    segment_len, write_segment,
};
pub use strip::strip_embedded_index;
