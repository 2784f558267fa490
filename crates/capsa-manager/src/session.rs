//! RAII guard over the single install-session slot.
//!
//! Every install/uninstall path must release the slot no matter how it
//! exits, including parser and daemon failures. Tying release to `Drop`
//! makes that guarantee structural instead of a per-path obligation.

use capsa_core::model::InstallSession;
use capsa_core::{BundleRegistry, Result};
use std::sync::Arc;

/// Holds the registry's session slot for the duration of one operation.
pub struct SessionGuard {
    registry: Arc<BundleRegistry>,
}

impl SessionGuard {
    /// Claim the slot. Fails with `AlreadyInProgress` while another
    /// operation is live.
    pub fn claim(registry: &Arc<BundleRegistry>, session: InstallSession) -> Result<Self> {
        registry.begin_session(session)?;
        Ok(Self {
            registry: Arc::clone(registry),
        })
    }

    /// Mutate the live session (phase, progress, resolved metadata).
    pub fn update(&self, f: impl FnOnce(&mut InstallSession)) {
        self.registry.update_session(f);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.end_session();
    }
}
