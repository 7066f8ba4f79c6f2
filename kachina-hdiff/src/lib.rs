//! Single-compressed-stream binary patches
//!
//! The patch format carries three zstd-compressed blocks (control, cover,
//! extra) back-to-back after a fixed header, so a patch can be applied
//! from one forward read of the stream. Application turns the file with
//! the `from` hash into the file with the `to` hash; the installer feeds
//! it either an on-disk base or a base extracted from its own package.

pub mod error;
pub mod stream;

pub use error::{PatchError, Result};
pub use stream::{PatchHeader, apply_patch, create_patch};
