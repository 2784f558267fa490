//! capsa-manager — bundle install orchestration and startup reconciliation.
//!
//! [`BundleManager`] is the management facade consumed by application
//! framework callers: install/uninstall with asynchronous result
//! notifications, install-state queries, size accounting, state-change
//! subscriptions, and the boot-time reconciliation scan.
//!
//! # Example
//!
//! ```rust,ignore
//! use capsa_core::LoopbackDaemon;
//! use capsa_manager::BundleManager;
//!
//! #[tokio::main]
//! async fn main() -> capsa_core::Result<()> {
//!     let daemon = LoopbackDaemon::new("/var/capsa");
//!     let manager = BundleManager::new("/var/capsa", daemon).await?;
//!
//!     // Reconcile pre-provisioned bundles against persisted state.
//!     manager.scan_packages().await;
//!
//!     for record in manager.get_bundle_infos() {
//!         println!("{} v{}", record.name, record.version);
//!     }
//!     Ok(())
//! }
//! ```

mod hub;
mod orchestrator;
mod scanner;
mod session;
pub mod size;

pub use hub::CallbackHub;
pub use orchestrator::InstallOrchestrator;
pub use scanner::ReconciliationScanner;
pub use session::SessionGuard;

use capsa_core::model::{
    AbilityEntry, BundleKind, BundleRecord, InstallOptions, InstallState, ObserverHandle,
};
use capsa_core::{pack, BundleRegistry, DaemonLink, DaemonTransport, ProfileStore, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Management facade over the registry, daemon link, orchestrator, and
/// reconciliation scanner.
pub struct BundleManager {
    registry: Arc<BundleRegistry>,
    hub: Arc<CallbackHub>,
    orchestrator: Arc<InstallOrchestrator>,
    scanner: ReconciliationScanner,
}

impl BundleManager {
    /// Wire up the manager against a daemon transport and bring the link
    /// up. Blocks until the daemon handshake completes.
    pub async fn new(
        root: impl Into<PathBuf>,
        transport: Arc<dyn DaemonTransport>,
    ) -> Result<Self> {
        let root = root.into();

        let registry = Arc::new(BundleRegistry::new());
        let store = Arc::new(ProfileStore::new(&root));
        store.ensure_directories()?;

        let link = DaemonLink::new(transport);
        link.initialize().await;
        if let Err(e) = link.create_permission_dir().await {
            warn!("permission directory setup failed: {}", e);
        }

        let hub = Arc::new(CallbackHub::new());
        let orchestrator = Arc::new(InstallOrchestrator::new(
            &root,
            Arc::clone(&registry),
            Arc::clone(&store),
            link,
            Arc::clone(&hub),
        ));
        let scanner = ReconciliationScanner::new(
            &root,
            Arc::clone(&registry),
            store,
            Arc::clone(&orchestrator),
        );

        Ok(Self {
            registry,
            hub,
            orchestrator,
            scanner,
        })
    }

    /// Install a bundle archive as a third-party bundle. The callback
    /// receives the start and terminal notifications; the return value only
    /// signals that the request was accepted.
    pub async fn install(
        &self,
        bundle_path: &Path,
        options: InstallOptions,
        callback: ObserverHandle,
    ) -> bool {
        self.orchestrator
            .install(bundle_path, options, Some(&callback), BundleKind::ThirdParty)
            .await
    }

    /// Uninstall a bundle by name.
    pub async fn uninstall(
        &self,
        name: &str,
        options: InstallOptions,
        callback: ObserverHandle,
    ) -> bool {
        self.orchestrator
            .uninstall(name, options, Some(&callback))
            .await
    }

    /// Current install state and progress for a bundle name.
    pub fn query_install_state(&self, name: &str) -> (InstallState, u8) {
        self.orchestrator.query_install_state(name)
    }

    /// Bytes occupied by an installed bundle (code + data); 0 if unknown.
    pub fn get_bundle_size(&self, name: &str) -> u64 {
        self.registry
            .get(name)
            .map(|record| size::bundle_size(&record))
            .unwrap_or(0)
    }

    /// Subscribe to install/uninstall state changes. An empty name
    /// subscribes to every bundle and clears per-name subscriptions.
    pub fn subscribe_state_change(&self, name: &str, observer: ObserverHandle) {
        self.hub.subscribe(name, observer);
    }

    /// Drop all state-change subscriptions.
    pub fn unsubscribe(&self) {
        self.hub.unsubscribe();
    }

    pub fn get_bundle_info(&self, name: &str) -> Option<BundleRecord> {
        self.registry.get(name)
    }

    pub fn get_bundle_infos(&self) -> Vec<BundleRecord> {
        self.registry.list()
    }

    /// Basic ability lookup by bundle name.
    pub fn query_ability(&self, bundle_name: &str) -> Option<AbilityEntry> {
        self.registry.get(bundle_name).and_then(|r| r.ability)
    }

    /// Declared version of a bundle archive on disk, if readable.
    pub fn get_version_by_bundle_path(&self, path: &Path) -> Option<u32> {
        pack::parse_attributes(path).ok().map(|(_, version)| version)
    }

    /// Run the boot reconciliation scan. Returns the number of install
    /// actions performed.
    pub async fn scan_packages(&self) -> usize {
        self.scanner.scan().await
    }

    /// Shared registry handle (state queries, tests).
    pub fn registry(&self) -> &Arc<BundleRegistry> {
        &self.registry
    }
}
