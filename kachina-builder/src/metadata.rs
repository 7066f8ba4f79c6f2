//! Metadata assembly
//!
//! Collects the hashing and diffing results into the manifest the
//! installer consumes, and the registration info the finalizer writes.

use tracing::debug;

use kachina_format::{HashedFile, InstallerRecord, Manifest, PatchRecord};

use crate::error::Result;

/// Assemble and validate a release manifest
pub fn assemble_manifest(
    tag_name: &str,
    hashed: Vec<HashedFile>,
    patches: Vec<PatchRecord>,
    deletes: Vec<String>,
) -> Result<Manifest> {
    let installer = hashed.iter().find(|f| f.installer).map(|f| InstallerRecord {
        size: f.size,
        hash: f.hash,
    });

    let manifest = Manifest {
        tag_name: tag_name.to_string(),
        hashed,
        patches,
        deletes,
        installer,
    };
    manifest.validate()?;

    debug!(
        "manifest {}: {} files, {} patches, {} deletes",
        manifest.tag_name,
        manifest.hashed.len(),
        manifest.patches.len(),
        manifest.deletes.len()
    );
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kachina_format::{Hash, HashAlgorithm};

    #[test]
    fn test_installer_record_derived_from_flag() {
        let updater = HashedFile {
            file_name: "updater.exe".to_string(),
            size: 42,
            hash: Hash::digest(HashAlgorithm::Md5, b"updater"),
            installer: true,
        };
        let manifest =
            assemble_manifest("1.0.0", vec![updater.clone()], Vec::new(), Vec::new()).unwrap();
        let record = manifest.installer.unwrap();
        assert_eq!(record.size, updater.size);
        assert_eq!(record.hash, updater.hash);
    }
}
