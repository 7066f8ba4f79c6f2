//! Installer profile
//!
//! The `\0CONFIG` segment carries the product identity the runtime needs:
//! names for the registration record, the updater sibling file, the
//! persisted-state file, and the user-data prefixes the planner must
//! never touch. Paths in `user_data_paths` may reference `${variables}`
//! resolved against a substitution map at scan time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default name of the persisted per-install manifest
fn default_metadata_name() -> String {
    ".metadata.json".to_string()
}

/// Default file name of the updater sibling
fn default_updater_name() -> String {
    "updater.exe".to_string()
}

/// Product configuration embedded in every package
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallerProfile {
    /// Display name of the product
    pub name: String,
    /// Registration key the finalizer writes under
    #[serde(default)]
    pub reg_name: Option<String>,
    /// Publisher shown in the registration record
    #[serde(default)]
    pub publisher: Option<String>,
    /// File name of the updater executable inside the install dir
    #[serde(default = "default_updater_name")]
    pub updater_name: String,
    /// Name of the persisted manifest inside the install dir
    #[serde(default = "default_metadata_name")]
    pub metadata_name: String,
    /// Prefixes (after `${variable}` substitution) preserved across updates
    #[serde(default)]
    pub user_data_paths: Vec<String>,
}

impl InstallerProfile {
    /// Parse a profile from the `\0CONFIG` segment payload
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialize for embedding
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// User-data prefixes with `${variable}` references substituted
    pub fn resolved_user_data_paths(&self, vars: &HashMap<String, String>) -> Vec<String> {
        self.user_data_paths
            .iter()
            .map(|p| substitute(p, vars))
            .map(|p| kachina_format::paths::normalize(&p))
            .collect()
    }
}

fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}
