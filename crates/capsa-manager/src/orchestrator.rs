//! Install and uninstall orchestration.
//!
//! Drives one operation at a time end to end: parse, privileged daemon
//! steps, registry mutation, and exactly one terminal notification through
//! the hub. The session slot is claimed up front and released by a guard on
//! every exit path.

use crate::hub::{progress_event, terminal_event, CallbackHub};
use crate::session::SessionGuard;
use capsa_core::config::{InstallConfig, PathsConfig};
use capsa_core::error::codes;
use capsa_core::model::{
    BundleKind, BundleRecord, InstallOptions, InstallSession, InstallState, ObserverHandle,
    OpKind, SessionPhase,
};
use capsa_core::{pack, BundleRegistry, CapsaError, DaemonLink, ProfileStore, Result};
use capsa_core::store::BundleProfile;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coordinates installs and uninstalls against the daemon and registry.
pub struct InstallOrchestrator {
    root: PathBuf,
    registry: Arc<BundleRegistry>,
    store: Arc<ProfileStore>,
    link: Arc<DaemonLink>,
    hub: Arc<CallbackHub>,
}

impl InstallOrchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        registry: Arc<BundleRegistry>,
        store: Arc<ProfileStore>,
        link: Arc<DaemonLink>,
        hub: Arc<CallbackHub>,
    ) -> Self {
        Self {
            root: root.into(),
            registry,
            store,
            link,
            hub,
        }
    }

    pub fn code_dir(&self, name: &str) -> PathBuf {
        self.root.join(PathsConfig::INSTALL_DIR_NAME).join(name)
    }

    pub fn data_dir(&self, name: &str) -> PathBuf {
        self.root.join(PathsConfig::DATA_DIR_NAME).join(name)
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        self.root.join(PathsConfig::TMP_DIR_NAME).join(name)
    }

    /// Install a bundle archive. Returns whether the request was accepted;
    /// the outcome is reported through the callback and the hub.
    pub async fn install(
        &self,
        bundle_path: &Path,
        _options: InstallOptions,
        callback: Option<&ObserverHandle>,
        kind: BundleKind,
    ) -> bool {
        if bundle_path.as_os_str().is_empty() {
            warn!("install rejected: empty bundle path");
            return false;
        }
        if !pack::is_bundle_file(bundle_path) {
            warn!(
                "install rejected: {} is not a bundle archive",
                bundle_path.display()
            );
            return false;
        }

        // The real name is unknown until the manifest parses; until then the
        // session carries the file stem so state queries have something to
        // match.
        let provisional = bundle_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let guard = match SessionGuard::claim(
            &self.registry,
            new_session(&provisional, OpKind::Install),
        ) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("install of {} rejected: {}", bundle_path.display(), e);
                return false;
            }
        };

        let (name, outcome) = self.run_install(bundle_path, kind, &guard, callback).await;
        self.finish(guard, &name, OpKind::Install, outcome, callback);
        true
    }

    async fn run_install(
        &self,
        bundle_path: &Path,
        kind: BundleKind,
        guard: &SessionGuard,
        callback: Option<&ObserverHandle>,
    ) -> (String, Result<()>) {
        let fallback = bundle_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let manifest = match pack::read_manifest(bundle_path) {
            Ok(manifest) => manifest,
            Err(e) => return (fallback, Err(e)),
        };
        let name = manifest.name.clone();
        if name.len() >= InstallConfig::MAX_BUNDLE_NAME_LEN {
            return (
                name.clone(),
                Err(CapsaError::InvalidArgument {
                    message: format!("bundle name too long: {name}"),
                }),
            );
        }

        // Boot reconciliation queues updates without loading the old record
        // into the registry first, so the persisted profile is consulted too.
        let previous_version = self
            .registry
            .get(&name)
            .map(|r| r.version)
            .or_else(|| self.store.valid_profile(&name).map(|p| p.version));
        if let Some(previous) = previous_version {
            info!(
                "updating {} from version {} to {}",
                name, previous, manifest.version
            );
        } else {
            info!("installing {} version {}", name, manifest.version);
        }

        guard.update(|s| {
            s.name = name.clone();
            s.label = manifest.label.clone();
            s.small_icon_path = manifest.small_icon_path.clone();
            s.big_icon_path = manifest.big_icon_path.clone();
            s.previous_version = previous_version;
            s.phase = SessionPhase::InProgress;
        });
        self.deliver_progress(&name, OpKind::Install, 0, callback);

        let result = self
            .run_daemon_steps(bundle_path, &manifest, &name, previous_version.is_some(), guard)
            .await;
        if let Err(e) = result {
            return (name, Err(e));
        }

        // Registry mutation happens-before the terminal notification.
        let record = BundleRecord {
            name: name.clone(),
            version: manifest.version,
            code_path: self.code_dir(&name),
            data_path: self.data_dir(&name),
            app_id: manifest.app_id.clone(),
            kind,
            label: manifest.label.clone(),
            ability: manifest.ability.clone(),
        };
        self.registry.insert(record);

        (name, Ok(()))
    }

    async fn run_daemon_steps(
        &self,
        bundle_path: &Path,
        manifest: &pack::BundleManifest,
        name: &str,
        is_update: bool,
        guard: &SessionGuard,
    ) -> Result<()> {
        let staging = self.staging_dir(name);
        let code_dir = self.code_dir(name);
        let data_dir = self.data_dir(name);

        self.link.extract_archive(bundle_path, &staging).await?;
        guard.update(|s| s.progress = 40);

        self.link
            .create_data_dir(
                &data_dir,
                InstallConfig::DEFAULT_UID,
                InstallConfig::DEFAULT_GID,
                true,
            )
            .await?;
        guard.update(|s| s.progress = 60);

        // An update replaces the code directory wholesale; the data
        // directory survives.
        if is_update {
            self.link.remove_install_dir(&code_dir, &data_dir, true).await?;
        }
        self.link.rename_path(&staging, &code_dir).await?;
        guard.update(|s| s.progress = 80);

        let profile = BundleProfile::new(name, &manifest.app_id, &code_dir, manifest.version);
        let encoded = self.store.encode_profile(&profile)?;
        self.link
            .store_buffer_to_file(&self.store.profile_path(name), encoded)
            .await?;
        guard.update(|s| s.progress = 90);

        Ok(())
    }

    /// Uninstall an installed bundle by name. Returns whether the request
    /// was accepted.
    pub async fn uninstall(
        &self,
        name: &str,
        options: InstallOptions,
        callback: Option<&ObserverHandle>,
    ) -> bool {
        if name.is_empty() {
            warn!("uninstall rejected: empty bundle name");
            return false;
        }

        let guard =
            match SessionGuard::claim(&self.registry, new_session(name, OpKind::Uninstall)) {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("uninstall of {} rejected: {}", name, e);
                    return false;
                }
            };

        let outcome = self.run_uninstall(name, options, &guard, callback).await;
        self.finish(guard, name, OpKind::Uninstall, outcome, callback);
        true
    }

    async fn run_uninstall(
        &self,
        name: &str,
        options: InstallOptions,
        guard: &SessionGuard,
        callback: Option<&ObserverHandle>,
    ) -> Result<()> {
        let Some(record) = self.registry.get(name) else {
            return Err(CapsaError::BundleNotFound {
                name: name.to_string(),
            });
        };

        guard.update(|s| {
            s.label = record.label.clone();
            s.phase = SessionPhase::InProgress;
        });
        self.deliver_progress(name, OpKind::Uninstall, 0, callback);
        info!("uninstalling {} (keep_data={})", name, options.keep_data);

        self.link
            .remove_install_dir(&record.code_path, &record.data_path, options.keep_data)
            .await?;
        guard.update(|s| s.progress = 60);

        self.link.remove_file(&self.store.profile_path(name)).await?;
        guard.update(|s| s.progress = 90);

        self.registry.remove(name);

        // An explicitly removed pre-provisioned vendor bundle must never be
        // restored by reconciliation.
        if record.kind == BundleKind::ThirdSystem {
            if let Err(e) = self.store.add_tombstone(name) {
                warn!("failed to tombstone {}: {}", name, e);
            }
        }

        Ok(())
    }

    /// Settle the session and deliver the terminal notification, in that
    /// order: callers observing the terminal event must see final registry
    /// and session state.
    fn finish(
        &self,
        guard: SessionGuard,
        name: &str,
        op: OpKind,
        outcome: Result<()>,
        callback: Option<&ObserverHandle>,
    ) {
        let code = match &outcome {
            Ok(()) => codes::OK,
            Err(e) => {
                warn!("{:?} of {} failed: {}", op, name, e);
                e.wire_code()
            }
        };
        guard.update(|s| {
            s.phase = if code == codes::OK {
                SessionPhase::Succeeded
            } else {
                SessionPhase::Failed
            };
            s.progress = InstallConfig::FINISHED_PROGRESS;
        });
        drop(guard);

        let event = terminal_event(name, op, code);
        if let Some(cb) = callback {
            cb.on_state(&event);
        }
        match self.hub.notify(name, op, code) {
            Ok(()) => {}
            Err(CapsaError::CallbackMissing) => {
                debug!("no state-change subscriber for {}", name)
            }
            Err(e) => warn!("notification for {} failed: {}", name, e),
        }
    }

    fn deliver_progress(
        &self,
        name: &str,
        op: OpKind,
        progress: u8,
        callback: Option<&ObserverHandle>,
    ) {
        if let Some(cb) = callback {
            cb.on_state(&progress_event(name, op, progress));
        }
        self.hub.report_progress(name, op, progress);
    }

    /// Current install state of a bundle: a pure read against registry and
    /// session under one lock acquisition. Never blocks on daemon work.
    pub fn query_install_state(&self, name: &str) -> (InstallState, u8) {
        let (record, session) = self.registry.snapshot(name);

        if let Some(record) = record {
            // An update only counts as complete once the stored version has
            // moved past the version seen at update-start.
            let update_still_pending = session.as_ref().is_some_and(|s| {
                s.name == name
                    && s.op == OpKind::Install
                    && matches!(s.previous_version, Some(pv) if record.version <= pv)
            });
            if !update_still_pending {
                return (InstallState::Ok, InstallConfig::FINISHED_PROGRESS);
            }
        }

        if let Some(session) = session.filter(|s| s.name == name) {
            return (session.phase.as_state(), session.progress);
        }

        (InstallState::Fail, 0)
    }
}

fn new_session(name: &str, op: OpKind) -> InstallSession {
    InstallSession {
        name: name.to_string(),
        label: name.to_string(),
        small_icon_path: None,
        big_icon_path: None,
        op,
        phase: SessionPhase::Pending,
        progress: 0,
        previous_version: None,
    }
}
