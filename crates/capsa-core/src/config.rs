//! Centralized configuration for capsa.
//!
//! Constants for on-device paths, install limits, and daemon connection
//! behavior.

use std::time::Duration;

/// Shared directory and path configuration.
///
/// All paths are relative to the manager root handed to `BundleManager`;
/// on a real device they map onto fixed mount points.
pub struct PathsConfig;

impl PathsConfig {
    /// Final install location for bundle code directories.
    pub const INSTALL_DIR_NAME: &'static str = "app";
    /// Per-bundle data directories.
    pub const DATA_DIR_NAME: &'static str = "appdata";
    /// Persisted bundle profiles (one JSON file per installed bundle).
    pub const PROFILE_DIR_NAME: &'static str = "profiles";
    /// Staging area for extraction before the final rename.
    pub const TMP_DIR_NAME: &'static str = "tmp";
    /// Pre-provisioned system bundles.
    pub const SYSTEM_BUNDLE_DIR_NAME: &'static str = "system";
    /// Pre-provisioned third-party ("third system") bundles.
    pub const THIRD_SYSTEM_BUNDLE_DIR_NAME: &'static str = "vendor";
    /// Tombstone record of explicitly uninstalled pre-provisioned bundles.
    pub const TOMBSTONE_FILE_NAME: &'static str = "uninstalled-preinstalls.json";
    /// Suffix a bundle archive must carry to be considered installable.
    pub const BUNDLE_SUFFIX: &'static str = ".bdl";
}

/// Install pipeline limits.
pub struct InstallConfig;

impl InstallConfig {
    /// Bundle names at or over this length are rejected before queuing.
    pub const MAX_BUNDLE_NAME_LEN: usize = 127;
    /// Cap on reconciled third-party bundles at boot.
    pub const MAX_THIRD_BUNDLE_COUNT: u32 = 64;
    /// Progress value reported with a terminal notification.
    pub const FINISHED_PROGRESS: u8 = 100;
    /// Default owner for created data directories.
    pub const DEFAULT_UID: u32 = 1000;
    pub const DEFAULT_GID: u32 = 1000;
    /// Script engine generation bundle assets are prepared for. Profiles
    /// recording an older generation get their transform markers refreshed
    /// during boot reconciliation.
    pub const SCRIPT_ENGINE_VERSION: &'static str = "3";
}

/// Daemon link connection behavior.
pub struct DaemonConfig;

impl DaemonConfig {
    /// Fixed interval between endpoint-location attempts. The retry loop is
    /// deliberately unbounded: the daemon is assumed eventually present and
    /// boot blocks until it is.
    pub const LOCATE_RETRY_INTERVAL: Duration = Duration::from_millis(200);
    /// Interval between callback-registration retries after a connection.
    pub const REGISTER_RETRY_INTERVAL: Duration = Duration::from_millis(200);
    /// Hard cap on a single IPC frame.
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
}
