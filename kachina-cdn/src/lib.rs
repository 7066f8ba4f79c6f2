//! HTTP range layer for the Kachina installer
//!
//! One shared [`HttpClient`] carries every download of an install run:
//! retry with exponential backoff and jitter, single and multi range
//! requests (including `multipart/byteranges` bodies), remote package
//! header discovery, and the pluggable source-resolver seam that turns a
//! package URL into fetchable chunk URLs.

pub mod client;
pub mod error;
pub mod multipart;
pub mod remote;
pub mod source;

pub use client::{HttpClient, HttpClientBuilder, StallGuard, parse_content_range};
pub use error::{Error, Result};
pub use multipart::{boundary_from_content_type, parse_byteranges};
pub use remote::RemotePackage;
pub use source::{DirectSource, SessionSource, UpdateSource, resolve_source};
