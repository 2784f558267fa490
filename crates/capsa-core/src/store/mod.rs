//! Persisted bundle state: per-bundle profile files and the tombstone record.
//!
//! One JSON profile per installed bundle lives in the profile directory.
//! Profiles written during install go through the privileged daemon
//! (`STORE_BUFFER_TO_FILE`); this module produces the encoded bytes for that
//! path and reads/refreshes profiles directly during boot reconciliation.

mod atomic;

pub use atomic::{read_json, write_json};

use crate::config::PathsConfig;
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Persisted record of one installed bundle.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleProfile {
    pub name: String,
    pub app_id: String,
    pub code_path: String,
    pub version: u32,
    #[serde(default)]
    pub installed_date: String,
    /// Script engine the bundle's assets were last prepared for.
    #[serde(default)]
    pub engine_version: Option<String>,
    /// Result of the last asset transform pass; `Some(0)` means up to date.
    #[serde(default)]
    pub transform_result: Option<i32>,
}

impl BundleProfile {
    /// Build a fresh profile stamped with the current time.
    pub fn new(name: &str, app_id: &str, code_path: &Path, version: u32) -> Self {
        Self {
            name: name.to_string(),
            app_id: app_id.to_string(),
            code_path: code_path.to_string_lossy().into_owned(),
            version,
            installed_date: Utc::now().to_rfc3339(),
            engine_version: None,
            transform_result: None,
        }
    }

    /// A profile is usable for reload only if its identity fields survived.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && !self.code_path.is_empty()
    }
}

/// Persisted tombstone record: pre-provisioned bundles the user explicitly
/// uninstalled, which reconciliation must never restore.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TombstoneRecord {
    #[serde(default)]
    uninstalled: Vec<String>,
}

/// Reader/writer for the profile directory.
pub struct ProfileStore {
    profile_dir: PathBuf,
    tombstone_path: PathBuf,
}

impl ProfileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let profile_dir = root.join(PathsConfig::PROFILE_DIR_NAME);
        let tombstone_path = profile_dir.join(PathsConfig::TOMBSTONE_FILE_NAME);
        Self {
            profile_dir,
            tombstone_path,
        }
    }

    /// Create the profile directory if missing.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.profile_dir)
            .map_err(|e| crate::CapsaError::io_with_path(e, &self.profile_dir))?;
        Ok(())
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Path of the profile file for a bundle name.
    pub fn profile_path(&self, name: &str) -> PathBuf {
        self.profile_dir.join(format!("{name}.json"))
    }

    /// Read a bundle's profile. `None` when missing.
    pub fn read_profile(&self, name: &str) -> Result<Option<BundleProfile>> {
        read_json(&self.profile_path(name))
    }

    /// Read a bundle's profile, treating a missing, unreadable, or
    /// incomplete record as absent. Boot reconciliation uses this to decide
    /// reinstall-vs-reload, so a torn record must look like "not installed".
    pub fn valid_profile(&self, name: &str) -> Option<BundleProfile> {
        match self.read_profile(name) {
            Ok(Some(profile)) if profile.is_valid() => Some(profile),
            Ok(_) => None,
            Err(e) => {
                warn!("discarding unreadable profile for {}: {}", name, e);
                None
            }
        }
    }

    /// Write a profile directly (boot-time refresh path).
    pub fn write_profile(&self, profile: &BundleProfile) -> Result<()> {
        write_json(&self.profile_path(&profile.name), profile)
    }

    /// Serialize a profile for handoff to the daemon's buffer-write call.
    pub fn encode_profile(&self, profile: &BundleProfile) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(profile)?)
    }

    /// Load the tombstone set. An unreadable record is deleted and treated
    /// as empty rather than wedging the whole scan.
    pub fn load_tombstones(&self) -> HashSet<String> {
        match read_json::<TombstoneRecord>(&self.tombstone_path) {
            Ok(Some(record)) => record.uninstalled.into_iter().collect(),
            Ok(None) => HashSet::new(),
            Err(e) => {
                warn!(
                    "tombstone record unreadable, dropping it: {} ({})",
                    self.tombstone_path.display(),
                    e
                );
                let _ = std::fs::remove_file(&self.tombstone_path);
                HashSet::new()
            }
        }
    }

    /// Add a name to the tombstone set.
    pub fn add_tombstone(&self, name: &str) -> Result<()> {
        let mut set = self.load_tombstones();
        if set.insert(name.to_string()) {
            let mut uninstalled: Vec<String> = set.into_iter().collect();
            uninstalled.sort();
            write_json(&self.tombstone_path, &TombstoneRecord { uninstalled })?;
        }
        Ok(())
    }
}
