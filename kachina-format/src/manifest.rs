//! Manifest data model
//!
//! The manifest is the JSON metadata emitted by the builder and consumed
//! by the installer: the target set of files with their hashes, the binary
//! patches that can produce them, and the paths to delete. All entries in
//! one manifest use the same hash algorithm; the wire format carries the
//! digest under an algorithm-named key (`"md5"` or `"xxh"`).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{Hash, HashAlgorithm};
use crate::paths;

/// One file in the target tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHashedFile", into = "RawHashedFile")]
pub struct HashedFile {
    /// Relative path, forward-slash-normalized, no leading slash
    pub file_name: String,
    /// Decompressed size in bytes
    pub size: u64,
    /// Content hash of the decompressed file
    pub hash: Hash,
    /// Marks the updater executable itself
    pub installer: bool,
}

/// A binary patch turning one content hash into another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawPatchRecord", into = "RawPatchRecord")]
pub struct PatchRecord {
    /// Size of the patch blob in bytes
    pub size: u64,
    /// Hash of the base file the patch applies to
    pub from: Hash,
    /// Hash of the file the patch produces
    pub to: Hash,
}

impl PatchRecord {
    /// Staging/index name of the patch blob: `{from_hex}_{to_hex}`
    pub fn blob_name(&self) -> String {
        format!("{}_{}", self.from.to_hex(), self.to.to_hex())
    }
}

/// Size and hash of the standalone updater artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawInstallerRecord", into = "RawInstallerRecord")]
pub struct InstallerRecord {
    /// Size in bytes
    pub size: u64,
    /// Hash over index-stripped bytes
    pub hash: Hash,
}

/// The target state of one release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Manifest {
    /// Version string of the release
    pub tag_name: String,
    /// Files in the target tree
    #[serde(default)]
    pub hashed: Vec<HashedFile>,
    /// Binary patches between this release and prior ones
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchRecord>,
    /// Relative paths removed by this release
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletes: Vec<String>,
    /// Standalone updater artifact, when one is published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer: Option<InstallerRecord>,
}

impl Manifest {
    /// Parse and validate a manifest from JSON bytes
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize to the wire JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Hash algorithm shared by every entry, `None` for an empty manifest
    pub fn algorithm(&self) -> Option<HashAlgorithm> {
        self.hashed
            .first()
            .map(|f| f.hash.algorithm())
            .or_else(|| self.installer.map(|i| i.hash.algorithm()))
    }

    /// Look up a target entry by normalized file name
    pub fn entry(&self, file_name: &str) -> Option<&HashedFile> {
        self.hashed.iter().find(|f| f.file_name == file_name)
    }

    /// Find a patch producing `to` from `from`
    pub fn patch_for(&self, from: Hash, to: Hash) -> Option<&PatchRecord> {
        self.patches.iter().find(|p| p.from == from && p.to == to)
    }

    /// The entry flagged as the updater executable, if any
    pub fn installer_entry(&self) -> Option<&HashedFile> {
        self.hashed.iter().find(|f| f.installer)
    }

    /// Check the structural invariants of the manifest
    ///
    /// - exactly one hash algorithm across hashed entries, patches and the
    ///   installer record;
    /// - every `patches[i].to` names a hashed entry;
    /// - `deletes` and `hashed` file names are disjoint;
    /// - file names are normalized relative paths without traversal;
    /// - at most one entry carries the installer flag.
    pub fn validate(&self) -> Result<()> {
        let algorithm = match self.algorithm() {
            Some(a) => a,
            None => return Ok(()),
        };

        let mut names = HashSet::with_capacity(self.hashed.len());
        let mut hashes = HashSet::with_capacity(self.hashed.len());
        let mut installer_count = 0usize;
        for file in &self.hashed {
            if file.hash.algorithm() != algorithm {
                return Err(Error::invalid_manifest(format!(
                    "mixed hash algorithms: {} is {:?}, manifest is {:?}",
                    file.file_name,
                    file.hash.algorithm(),
                    algorithm
                )));
            }
            if !paths::is_normalized(&file.file_name) {
                return Err(Error::invalid_manifest(format!(
                    "file name is not a normalized relative path: {}",
                    file.file_name
                )));
            }
            if !names.insert(file.file_name.as_str()) {
                return Err(Error::invalid_manifest(format!(
                    "duplicate file name: {}",
                    file.file_name
                )));
            }
            hashes.insert(file.hash);
            if file.installer {
                installer_count += 1;
            }
        }
        if installer_count > 1 {
            return Err(Error::invalid_manifest(
                "more than one entry is flagged as the installer",
            ));
        }

        for patch in &self.patches {
            if patch.from.algorithm() != algorithm || patch.to.algorithm() != algorithm {
                return Err(Error::invalid_manifest(format!(
                    "patch {} uses a different hash algorithm",
                    patch.blob_name()
                )));
            }
            if !hashes.contains(&patch.to) {
                return Err(Error::invalid_manifest(format!(
                    "patch target {} does not name a hashed entry",
                    patch.to
                )));
            }
        }

        for delete in &self.deletes {
            if !paths::is_normalized(delete) {
                return Err(Error::invalid_manifest(format!(
                    "delete path is not a normalized relative path: {delete}"
                )));
            }
            if names.contains(delete.as_str()) {
                return Err(Error::invalid_manifest(format!(
                    "path {delete} is both hashed and deleted"
                )));
            }
        }

        if let Some(installer) = &self.installer {
            if installer.hash.algorithm() != algorithm {
                return Err(Error::invalid_manifest(
                    "installer record uses a different hash algorithm",
                ));
            }
        }

        Ok(())
    }
}

// Wire representations. The digest moves between the tagged enum and an
// algorithm-named JSON key here so the rest of the crate never sees
// untagged hex strings.

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawHashedFile {
    file_name: String,
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xxh: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    installer: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawHashRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xxh: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPatchRecord {
    size: u64,
    from: RawHashRef,
    to: RawHashRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawInstallerRecord {
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    md5: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    xxh: Option<String>,
}

fn hash_from_keys(md5: Option<String>, xxh: Option<String>) -> Result<Hash> {
    match (md5, xxh) {
        (Some(literal), None) => Hash::from_hex(HashAlgorithm::Md5, &literal),
        (None, Some(literal)) => Hash::from_hex(HashAlgorithm::Xxh64, &literal),
        (Some(_), Some(_)) => Err(Error::invalid_manifest("entry carries both md5 and xxh")),
        (None, None) => Err(Error::invalid_manifest("entry carries neither md5 nor xxh")),
    }
}

fn hash_to_keys(hash: Hash) -> (Option<String>, Option<String>) {
    match hash.algorithm() {
        HashAlgorithm::Md5 => (Some(hash.to_hex()), None),
        HashAlgorithm::Xxh64 => (None, Some(hash.to_hex())),
    }
}

impl TryFrom<RawHashedFile> for HashedFile {
    type Error = Error;

    fn try_from(raw: RawHashedFile) -> Result<Self> {
        Ok(Self {
            file_name: paths::normalize(&raw.file_name),
            size: raw.size,
            hash: hash_from_keys(raw.md5, raw.xxh)?,
            installer: raw.installer.unwrap_or(false),
        })
    }
}

impl From<HashedFile> for RawHashedFile {
    fn from(file: HashedFile) -> Self {
        let (md5, xxh) = hash_to_keys(file.hash);
        Self {
            file_name: file.file_name,
            size: file.size,
            md5,
            xxh,
            installer: file.installer.then_some(true),
        }
    }
}

impl TryFrom<RawHashRef> for Hash {
    type Error = Error;

    fn try_from(raw: RawHashRef) -> Result<Self> {
        hash_from_keys(raw.md5, raw.xxh)
    }
}

impl From<Hash> for RawHashRef {
    fn from(hash: Hash) -> Self {
        let (md5, xxh) = hash_to_keys(hash);
        Self { md5, xxh }
    }
}

impl TryFrom<RawPatchRecord> for PatchRecord {
    type Error = Error;

    fn try_from(raw: RawPatchRecord) -> Result<Self> {
        Ok(Self {
            size: raw.size,
            from: raw.from.try_into()?,
            to: raw.to.try_into()?,
        })
    }
}

impl From<PatchRecord> for RawPatchRecord {
    fn from(patch: PatchRecord) -> Self {
        Self {
            size: patch.size,
            from: patch.from.into(),
            to: patch.to.into(),
        }
    }
}

impl TryFrom<RawInstallerRecord> for InstallerRecord {
    type Error = Error;

    fn try_from(raw: RawInstallerRecord) -> Result<Self> {
        Ok(Self {
            size: raw.size,
            hash: hash_from_keys(raw.md5, raw.xxh)?,
        })
    }
}

impl From<InstallerRecord> for RawInstallerRecord {
    fn from(record: InstallerRecord) -> Self {
        let (md5, xxh) = hash_to_keys(record.hash);
        Self {
            size: record.size,
            md5,
            xxh,
        }
    }
}
