//! Startup reconciliation of pre-provisioned and third-party bundles.
//!
//! Diffs the candidate bundle set against persisted profiles and decides,
//! per bundle: fresh install, update, direct profile reload, or skip. Only
//! install/update actions go through the install pipeline; unchanged
//! bundles reload straight into the registry without re-extraction.

use crate::orchestrator::InstallOrchestrator;
use capsa_core::config::{InstallConfig, PathsConfig};
use capsa_core::model::{BundleKind, BundleRecord, InstallOptions};
use capsa_core::store::BundleProfile;
use capsa_core::{pack, BundleRegistry, ProfileStore};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One queued install action produced by the scan.
struct PendingInstall {
    /// Bundle archive to install.
    path: PathBuf,
    /// Existing code directory when this is an update.
    installed_path: Option<PathBuf>,
    kind: BundleKind,
}

/// Boot-time reconciliation scanner.
pub struct ReconciliationScanner {
    root: PathBuf,
    registry: Arc<BundleRegistry>,
    store: Arc<ProfileStore>,
    orchestrator: Arc<InstallOrchestrator>,
}

impl ReconciliationScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        registry: Arc<BundleRegistry>,
        store: Arc<ProfileStore>,
        orchestrator: Arc<InstallOrchestrator>,
    ) -> Self {
        Self {
            root: root.into(),
            registry,
            store,
            orchestrator,
        }
    }

    /// Run one reconciliation pass. Returns the number of install actions
    /// that were queued (zero on an already-converged system).
    pub async fn scan(&self) -> usize {
        if let Err(e) = self.store.ensure_directories() {
            warn!("cannot prepare profile directory, skipping scan: {}", e);
            return 0;
        }

        let tombstones = self.store.load_tombstones();
        let mut queue: Vec<PendingInstall> = Vec::new();

        self.scan_preprovisioned(&tombstones, &mut queue);
        self.scan_third_party(&mut queue);

        let queued = queue.len();
        info!(
            "reconciliation scan queued {} install action(s), {} bundle(s) loaded",
            queued,
            self.registry.len()
        );

        // Drain in enumeration order; the single session slot already
        // forces the installs to run back to back.
        for item in queue {
            self.orchestrator
                .install(&item.path, InstallOptions::default(), None, item.kind)
                .await;
        }
        queued
    }

    fn scan_preprovisioned(&self, tombstones: &HashSet<String>, queue: &mut Vec<PendingInstall>) {
        let dirs = [
            (
                self.root.join(PathsConfig::SYSTEM_BUNDLE_DIR_NAME),
                BundleKind::System,
            ),
            (
                self.root.join(PathsConfig::THIRD_SYSTEM_BUNDLE_DIR_NAME),
                BundleKind::ThirdSystem,
            ),
        ];

        for (dir, kind) in dirs {
            for path in sorted_entries(&dir) {
                self.consider_preprovisioned(&path, kind, tombstones, queue);
            }
        }
    }

    fn consider_preprovisioned(
        &self,
        path: &Path,
        kind: BundleKind,
        tombstones: &HashSet<String>,
        queue: &mut Vec<PendingInstall>,
    ) {
        if !pack::is_bundle_file(path) {
            warn!("skipping non-bundle entry {}", path.display());
            return;
        }

        let (name, version) = match pack::parse_attributes(path) {
            Ok(attrs) => attrs,
            Err(e) => {
                warn!("skipping unparsable candidate {}: {}", path.display(), e);
                return;
            }
        };
        if name.len() >= InstallConfig::MAX_BUNDLE_NAME_LEN {
            warn!("skipping candidate with oversized name: {}", name);
            return;
        }

        // An explicitly uninstalled vendor bundle stays uninstalled.
        if kind == BundleKind::ThirdSystem && tombstones.contains(&name) {
            info!("{} is tombstoned, not restoring", name);
            return;
        }

        if self.registry.contains(&name) {
            debug!("{} already loaded", name);
            return;
        }

        match self.store.valid_profile(&name) {
            None => {
                debug!("queueing fresh install of {}", name);
                queue.push(PendingInstall {
                    path: path.to_path_buf(),
                    installed_path: None,
                    kind,
                });
            }
            Some(profile) if profile.version < version => {
                debug!(
                    "queueing update of {} ({} -> {})",
                    name, profile.version, version
                );
                queue.push(PendingInstall {
                    path: path.to_path_buf(),
                    installed_path: Some(PathBuf::from(&profile.code_path)),
                    kind,
                });
            }
            Some(profile) => {
                // Installed copy is current or newer; load it as-is.
                self.reload_profile(&profile, kind);
            }
        }
    }

    fn scan_third_party(&self, queue: &mut Vec<PendingInstall>) {
        let covered: HashSet<PathBuf> = queue
            .iter()
            .filter_map(|item| item.installed_path.clone())
            .collect();

        let mut third_count = self
            .registry
            .list()
            .iter()
            .filter(|r| r.kind == BundleKind::ThirdParty)
            .count() as u32;

        let install_dir = self.root.join(PathsConfig::INSTALL_DIR_NAME);
        for path in sorted_entries(&install_dir) {
            if !path.is_dir() {
                warn!("skipping stray file in install dir: {}", path.display());
                continue;
            }
            if covered.contains(&path) {
                debug!("{} belongs to a queued system update", path.display());
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if self.registry.contains(&name) {
                continue;
            }
            if third_count >= InstallConfig::MAX_THIRD_BUNDLE_COUNT {
                info!("third-party bundle cap reached, skipping {}", name);
                continue;
            }

            match self.store.valid_profile(&name) {
                Some(profile) => {
                    if self.reload_profile(&profile, BundleKind::ThirdParty) {
                        third_count += 1;
                    }
                }
                None => {
                    // No usable record: push it through the install pipeline,
                    // which will reject it loudly if it is not installable.
                    debug!("queueing install for unrecorded {}", name);
                    queue.push(PendingInstall {
                        path,
                        installed_path: None,
                        kind: BundleKind::ThirdParty,
                    });
                    third_count += 1;
                }
            }
        }
    }

    /// Load a persisted profile straight into the registry, bypassing the
    /// install pipeline. Returns false (and removes the code directory) if
    /// the installed copy is unreadable.
    fn reload_profile(&self, profile: &BundleProfile, kind: BundleKind) -> bool {
        let code_path = PathBuf::from(&profile.code_path);
        match pack::read_installed_manifest(&code_path) {
            Ok(manifest) => {
                self.refresh_transform_markers(profile);
                let record = BundleRecord {
                    name: profile.name.clone(),
                    version: profile.version,
                    code_path,
                    data_path: self
                        .root
                        .join(PathsConfig::DATA_DIR_NAME)
                        .join(&profile.name),
                    app_id: profile.app_id.clone(),
                    kind,
                    label: manifest.label,
                    ability: manifest.ability,
                };
                debug!("reloaded {} version {}", record.name, record.version);
                self.registry.insert(record);
                true
            }
            Err(e) => {
                warn!(
                    "reload of {} failed, discarding install dir: {}",
                    profile.name, e
                );
                let _ = std::fs::remove_dir_all(&code_path);
                false
            }
        }
    }

    /// Refresh the engine/transform markers of a profile whose assets were
    /// prepared for an older script engine generation.
    fn refresh_transform_markers(&self, profile: &BundleProfile) {
        let current = InstallConfig::SCRIPT_ENGINE_VERSION;
        let up_to_date = profile.engine_version.as_deref() == Some(current)
            && profile.transform_result == Some(0);
        if up_to_date {
            return;
        }

        let mut updated = profile.clone();
        updated.engine_version = Some(current.to_string());
        updated.transform_result = Some(0);
        if let Err(e) = self.store.write_profile(&updated) {
            warn!("marker refresh for {} failed: {}", profile.name, e);
        }
    }
}

/// Directory entries sorted by name, for deterministic enumeration order.
/// A missing directory is an empty candidate set, not an error.
fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::CallbackHub;
    use capsa_core::{DaemonLink, LoopbackDaemon};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs::File;
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, file_name: &str, name: &str, version: u32) -> PathBuf {
        std::fs::create_dir_all(dir).unwrap();
        let path = dir.join(file_name);
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let manifest = format!(
            r#"{{"name":"{name}","label":"{name}","version":{version},"appId":"app-{name}"}}"#
        );
        let bytes = manifest.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "manifest.json", bytes).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    struct World {
        registry: Arc<BundleRegistry>,
        store: Arc<ProfileStore>,
        orchestrator: Arc<InstallOrchestrator>,
        scanner: ReconciliationScanner,
    }

    /// Fresh wiring over an existing root, as a process restart would see it.
    async fn wire(root: &Path) -> World {
        let daemon = LoopbackDaemon::new(root);
        let registry = Arc::new(BundleRegistry::new());
        let store = Arc::new(ProfileStore::new(root));
        store.ensure_directories().unwrap();
        let link = DaemonLink::new(daemon);
        link.initialize().await;
        let hub = Arc::new(CallbackHub::new());
        let orchestrator = Arc::new(InstallOrchestrator::new(
            root,
            Arc::clone(&registry),
            Arc::clone(&store),
            link,
            hub,
        ));
        let scanner = ReconciliationScanner::new(
            root,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&orchestrator),
        );
        World {
            registry,
            store,
            orchestrator,
            scanner,
        }
    }

    fn system_dir(root: &Path) -> PathBuf {
        root.join(PathsConfig::SYSTEM_BUNDLE_DIR_NAME)
    }

    fn vendor_dir(root: &Path) -> PathBuf {
        root.join(PathsConfig::THIRD_SYSTEM_BUNDLE_DIR_NAME)
    }

    #[tokio::test]
    async fn test_fresh_system_bundle_installed() {
        let temp = TempDir::new().unwrap();
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 1);

        let world = wire(temp.path()).await;
        let actions = world.scanner.scan().await;

        assert_eq!(actions, 1);
        let record = world.registry.get("com.sys.clock").unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.kind, BundleKind::System);
        assert!(record.code_path.join("manifest.json").exists());
        assert!(world.store.valid_profile("com.sys.clock").is_some());
    }

    #[tokio::test]
    async fn test_rescan_is_idempotent() {
        let temp = TempDir::new().unwrap();
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 1);

        let first = wire(temp.path()).await;
        assert_eq!(first.scanner.scan().await, 1);

        // Same persisted state, fresh process: reload only, no installs.
        let second = wire(temp.path()).await;
        assert_eq!(second.scanner.scan().await, 0);
        let record = second.registry.get("com.sys.clock").unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.kind, BundleKind::System);

        // And a second scan in the same process is also a no-op.
        assert_eq!(second.scanner.scan().await, 0);
    }

    #[tokio::test]
    async fn test_lower_or_equal_candidate_reloads_only() {
        let temp = TempDir::new().unwrap();
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 2);
        let first = wire(temp.path()).await;
        assert_eq!(first.scanner.scan().await, 1);

        // Image rolled back to an older candidate: never downgrade.
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 1);
        let second = wire(temp.path()).await;
        assert_eq!(second.scanner.scan().await, 0);
        assert_eq!(second.registry.get("com.sys.clock").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_newer_candidate_queued_as_update() {
        let temp = TempDir::new().unwrap();
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 1);
        let first = wire(temp.path()).await;
        assert_eq!(first.scanner.scan().await, 1);

        // Leave a data file behind; the update must not clobber it.
        let data_file = first
            .registry
            .get("com.sys.clock")
            .unwrap()
            .data_path
            .join("alarms.json");
        std::fs::create_dir_all(data_file.parent().unwrap()).unwrap();
        std::fs::write(&data_file, b"[]").unwrap();

        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 3);
        let second = wire(temp.path()).await;
        assert_eq!(second.scanner.scan().await, 1);

        let record = second.registry.get("com.sys.clock").unwrap();
        assert_eq!(record.version, 3);
        assert_eq!(second.store.valid_profile("com.sys.clock").unwrap().version, 3);
        assert!(data_file.exists());
    }

    #[tokio::test]
    async fn test_tombstoned_vendor_bundle_not_restored() {
        let temp = TempDir::new().unwrap();
        write_bundle(&vendor_dir(temp.path()), "widget.bdl", "com.vendor.widget", 1);

        let first = wire(temp.path()).await;
        assert_eq!(first.scanner.scan().await, 1);
        assert_eq!(
            first.registry.get("com.vendor.widget").unwrap().kind,
            BundleKind::ThirdSystem
        );

        // Explicit uninstall tombstones the vendor bundle.
        assert!(
            first
                .orchestrator
                .uninstall("com.vendor.widget", InstallOptions::default(), None)
                .await
        );
        assert!(first.store.load_tombstones().contains("com.vendor.widget"));

        let second = wire(temp.path()).await;
        assert_eq!(second.scanner.scan().await, 0);
        assert!(second.registry.get("com.vendor.widget").is_none());
    }

    #[tokio::test]
    async fn test_invalid_candidates_are_skipped() {
        let temp = TempDir::new().unwrap();
        let system = system_dir(temp.path());
        std::fs::create_dir_all(&system).unwrap();

        // Wrong suffix, garbage archive, and an oversized name.
        std::fs::write(system.join("README.txt"), b"not a bundle").unwrap();
        std::fs::write(system.join("garbage.bdl"), b"not gzip").unwrap();
        let long_name = "x".repeat(InstallConfig::MAX_BUNDLE_NAME_LEN);
        write_bundle(&system, "long.bdl", &long_name, 1);

        let world = wire(temp.path()).await;
        assert_eq!(world.scanner.scan().await, 0);
        assert!(world.registry.is_empty());
    }

    #[tokio::test]
    async fn test_third_party_bundle_reloaded() {
        let temp = TempDir::new().unwrap();
        let first = wire(temp.path()).await;
        let bundle = write_bundle(&temp.path().join("pkgs"), "notes.bdl", "com.user.notes", 1);
        assert!(
            first
                .orchestrator
                .install(&bundle, InstallOptions::default(), None, BundleKind::ThirdParty)
                .await
        );

        let second = wire(temp.path()).await;
        assert_eq!(second.scanner.scan().await, 0);
        let record = second.registry.get("com.user.notes").unwrap();
        assert_eq!(record.kind, BundleKind::ThirdParty);
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn test_unrecorded_install_dir_is_queued_and_rejected() {
        let temp = TempDir::new().unwrap();
        // A leftover directory with no profile: queued, then rejected by the
        // installer because a directory is not an installable archive.
        let stray = temp
            .path()
            .join(PathsConfig::INSTALL_DIR_NAME)
            .join("com.user.leftover");
        std::fs::create_dir_all(&stray).unwrap();

        let world = wire(temp.path()).await;
        assert_eq!(world.scanner.scan().await, 1);
        assert!(world.registry.get("com.user.leftover").is_none());
    }

    #[tokio::test]
    async fn test_reload_refreshes_transform_markers() {
        let temp = TempDir::new().unwrap();
        write_bundle(&system_dir(temp.path()), "clock.bdl", "com.sys.clock", 1);
        let first = wire(temp.path()).await;
        first.scanner.scan().await;

        // Freshly installed profiles carry no markers yet.
        let profile = first.store.valid_profile("com.sys.clock").unwrap();
        assert_eq!(profile.engine_version, None);

        let second = wire(temp.path()).await;
        second.scanner.scan().await;

        let refreshed = second.store.valid_profile("com.sys.clock").unwrap();
        assert_eq!(
            refreshed.engine_version.as_deref(),
            Some(InstallConfig::SCRIPT_ENGINE_VERSION)
        );
        assert_eq!(refreshed.transform_result, Some(0));
    }
}

