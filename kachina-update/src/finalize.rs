//! Finalization and persisted state
//!
//! Runs strictly after the completion barrier: move the pending updater
//! into place, remove deleted paths, persist the applied manifest for
//! future diffs and uninstall, and write the application-registration
//! record. The platform-native registry writer is an external
//! collaborator; the record here is its JSON-backed equivalent.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use kachina_format::{Manifest, paths};

use crate::error::{Result, UpdateError};
use crate::pipeline::atomic_replace;
use crate::profile::InstallerProfile;
use crate::scheduler::ExecutionSummary;

/// File name of the registration record inside the install dir
const REGISTRATION_NAME: &str = ".registration.json";

/// Application-registration record
///
/// Mirrors the fields of a platform "installed programs" entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    /// Product display name
    pub display_name: String,
    /// Installed version
    pub display_version: String,
    /// Publisher, when the profile names one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Absolute install directory
    pub install_location: PathBuf,
    /// Command line that uninstalls the product
    pub uninstall_string: String,
    /// Estimated on-disk size in bytes
    pub estimated_size: u64,
    /// Name of the persisted manifest file
    pub metadata: String,
}

/// Complete the run: self-patch rename, deletes, persisted state
pub fn finalize_install(
    dest: &Path,
    profile: &InstallerProfile,
    manifest: &Manifest,
    summary: &ExecutionSummary,
) -> Result<()> {
    if let Some((temp, target)) = &summary.pending_installer {
        debug!("self-patch: renaming {temp:?} into place");
        atomic_replace(temp, target)?;
    }

    for delete in &manifest.deletes {
        let path = paths::to_os_path(dest, delete);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("deleted {delete}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("could not delete {delete}: {e}"),
        }
    }

    write_persisted_manifest(dest, profile, manifest)?;
    write_registration(dest, profile, manifest)?;

    info!("finalized install of {} into {dest:?}", manifest.tag_name);
    Ok(())
}

/// Persist the applied manifest for future diffs and uninstall
pub fn write_persisted_manifest(
    dest: &Path,
    profile: &InstallerProfile,
    manifest: &Manifest,
) -> Result<()> {
    let path = dest.join(&profile.metadata_name);
    let json = serde_json::to_vec_pretty(manifest)?;
    std::fs::write(&path, json).map_err(|e| UpdateError::filesystem(&path, e))?;
    Ok(())
}

/// Load the persisted manifest of the current installation, if any
pub fn read_persisted_manifest(dest: &Path, profile: &InstallerProfile) -> Result<Option<Manifest>> {
    let path = dest.join(&profile.metadata_name);
    match std::fs::read(&path) {
        Ok(bytes) => Ok(Some(Manifest::from_json(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(UpdateError::filesystem(&path, e)),
    }
}

/// Write the registration record
pub fn write_registration(dest: &Path, profile: &InstallerProfile, manifest: &Manifest) -> Result<()> {
    let updater = dest.join(&profile.updater_name);
    let record = Registration {
        display_name: profile.name.clone(),
        display_version: manifest.tag_name.clone(),
        publisher: profile.publisher.clone(),
        install_location: dest.to_path_buf(),
        uninstall_string: format!("{} -U", updater.display()),
        estimated_size: manifest.hashed.iter().map(|f| f.size).sum(),
        metadata: profile.metadata_name.clone(),
    };
    let path = dest.join(REGISTRATION_NAME);
    std::fs::write(&path, serde_json::to_vec_pretty(&record)?)
        .map_err(|e| UpdateError::filesystem(&path, e))?;
    Ok(())
}

/// Remove an installation: its files, persisted state and registration
///
/// Only paths the persisted manifest names are touched; user data and
/// anything else in the directory stays.
pub fn uninstall(dest: &Path, profile: &InstallerProfile) -> Result<()> {
    let manifest =
        read_persisted_manifest(dest, profile)?.ok_or(UpdateError::MissingUninstallMetadata)?;

    let mut dirs = std::collections::BTreeSet::new();
    for file in &manifest.hashed {
        let path = paths::to_os_path(dest, &file.file_name);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed {}", file.file_name),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(UpdateError::filesystem(&path, e)),
        }
        let mut parent = path.parent();
        while let Some(dir) = parent {
            if dir == dest {
                break;
            }
            dirs.insert(dir.to_path_buf());
            parent = dir.parent();
        }
    }

    // Deepest first so empty chains collapse.
    for dir in dirs.iter().rev() {
        let _ = std::fs::remove_dir(dir);
    }

    let _ = std::fs::remove_file(dest.join(&profile.metadata_name));
    let _ = std::fs::remove_file(dest.join(REGISTRATION_NAME));

    info!("uninstalled {} from {dest:?}", manifest.tag_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use kachina_format::{Hash, HashAlgorithm, HashedFile};

    fn profile() -> InstallerProfile {
        serde_json::from_str(r#"{"name":"demo","publisher":"Demo Corp"}"#).unwrap()
    }

    fn manifest() -> Manifest {
        Manifest {
            tag_name: "1.2.3".to_string(),
            hashed: vec![HashedFile {
                file_name: "data/app.bin".to_string(),
                size: 9,
                hash: Hash::digest(HashAlgorithm::Md5, b"installed"),
                installer: false,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_persist_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        write_persisted_manifest(dir.path(), &profile(), &manifest).unwrap();

        let loaded = read_persisted_manifest(dir.path(), &profile()).unwrap().unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_registration_record() {
        let dir = tempfile::tempdir().unwrap();
        write_registration(dir.path(), &profile(), &manifest()).unwrap();

        let record: Registration =
            serde_json::from_slice(&std::fs::read(dir.path().join(REGISTRATION_NAME)).unwrap())
                .unwrap();
        assert_eq!(record.display_name, "demo");
        assert_eq!(record.display_version, "1.2.3");
        assert_eq!(record.estimated_size, 9);
        assert!(record.uninstall_string.ends_with("-U"));
    }

    #[test]
    fn test_uninstall_removes_manifest_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = manifest();
        std::fs::create_dir_all(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("data/app.bin"), b"installed").unwrap();
        std::fs::write(dir.path().join("user-notes.txt"), b"keep me").unwrap();
        write_persisted_manifest(dir.path(), &profile(), &manifest).unwrap();

        uninstall(dir.path(), &profile()).unwrap();

        assert!(!dir.path().join("data/app.bin").exists());
        assert!(!dir.path().join("data").exists());
        assert!(dir.path().join("user-notes.txt").exists());
        assert!(!dir.path().join(".metadata.json").exists());
    }

    #[test]
    fn test_uninstall_without_metadata_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            uninstall(dir.path(), &profile()),
            Err(UpdateError::MissingUninstallMetadata)
        ));
    }
}
