//! Builder pipeline for Kachina packages
//!
//! Offline, developer-machine side of the system: walk a release tree,
//! hash and zstd-stage every file into a content-addressed directory,
//! generate binary patches against prior releases, assemble the manifest,
//! and pack everything behind a stub executable into one
//! self-addressable package.

pub mod differ;
pub mod error;
pub mod hasher;
pub mod metadata;
pub mod packer;

pub use differ::{compute_deletes, diff_tree};
pub use error::{BuildError, Result};
pub use hasher::{HashTreeOptions, hash_file, hash_tree, hash_tree_only};
pub use metadata::assemble_manifest;
pub use packer::{PackRequest, pack};
