//! Core bundle types shared across the workspace.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Provenance class of an installed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BundleKind {
    /// Shipped in the system image; always restored at boot.
    System,
    /// Shipped in the vendor image; an explicit uninstall tombstones it so
    /// reconciliation never restores it.
    ThirdSystem,
    /// Installed by the user at runtime.
    ThirdParty,
}

impl BundleKind {
    /// True for bundles that arrive pre-provisioned in a read-only image.
    pub fn is_preprovisioned(&self) -> bool {
        matches!(self, BundleKind::System | BundleKind::ThirdSystem)
    }
}

/// Launchable entry point declared by a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbilityEntry {
    pub display_name: String,
    #[serde(default)]
    pub src_path: Option<String>,
    #[serde(default)]
    pub label_id: u32,
    #[serde(default)]
    pub icon_id: u32,
}

/// One installed bundle as held by the in-memory registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleRecord {
    /// Globally unique bundle name, e.g. `com.example.clock`.
    pub name: String,
    /// Monotonically comparable integer version.
    pub version: u32,
    pub code_path: PathBuf,
    pub data_path: PathBuf,
    /// Owning-app identifier from the bundle profile.
    pub app_id: String,
    pub kind: BundleKind,
    pub label: String,
    pub ability: Option<AbilityEntry>,
}

/// Options accepted by install and uninstall requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Keep the bundle's data directory on uninstall.
    pub keep_data: bool,
}

/// Which operation a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Install,
    Uninstall,
}

/// Externally visible install state, as returned by state queries and
/// carried in notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    Doing,
    Ok,
    Fail,
}

/// Lifecycle phase of the single live install session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl SessionPhase {
    /// Collapse the session phase into the externally visible state.
    pub fn as_state(&self) -> InstallState {
        match self {
            SessionPhase::Pending | SessionPhase::InProgress => InstallState::Doing,
            SessionPhase::Succeeded => InstallState::Ok,
            SessionPhase::Failed => InstallState::Fail,
        }
    }
}

/// The single in-flight install or uninstall operation.
///
/// At most one session is live per process; it occupies the registry's
/// session slot from acceptance until the terminal notification.
#[derive(Debug, Clone)]
pub struct InstallSession {
    pub name: String,
    pub label: String,
    pub small_icon_path: Option<String>,
    pub big_icon_path: Option<String>,
    pub op: OpKind,
    pub phase: SessionPhase,
    /// 0..=100.
    pub progress: u8,
    /// Registry version at update-start. An update only counts as complete
    /// once the stored version exceeds this.
    pub previous_version: Option<u32>,
}

/// One state-change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub name: String,
    pub op: OpKind,
    pub state: InstallState,
    /// 0..=100; always 100 on terminal events.
    pub progress: u8,
    /// Wire result code; `codes::OK` on success.
    pub code: i32,
    pub message: String,
}

/// Subscriber interface for install/uninstall notifications.
///
/// Implementors capture whatever context they need; the hub stores them
/// type-erased behind `Arc`.
pub trait StateObserver: Send + Sync {
    fn on_state(&self, event: &StateEvent);
}

impl<F> StateObserver for F
where
    F: Fn(&StateEvent) + Send + Sync,
{
    fn on_state(&self, event: &StateEvent) {
        self(event)
    }
}

/// Shared observer handle as stored by the hub and passed to operations.
pub type ObserverHandle = Arc<dyn StateObserver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_collapses_to_state() {
        assert_eq!(SessionPhase::Pending.as_state(), InstallState::Doing);
        assert_eq!(SessionPhase::InProgress.as_state(), InstallState::Doing);
        assert_eq!(SessionPhase::Succeeded.as_state(), InstallState::Ok);
        assert_eq!(SessionPhase::Failed.as_state(), InstallState::Fail);
    }

    #[test]
    fn test_preprovisioned_kinds() {
        assert!(BundleKind::System.is_preprovisioned());
        assert!(BundleKind::ThirdSystem.is_preprovisioned());
        assert!(!BundleKind::ThirdParty.is_preprovisioned());
    }
}
