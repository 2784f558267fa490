//! In-memory table of installed bundles.
//!
//! The registry is the single source of truth for "what is installed". It
//! also owns the one live install-session slot: both sit behind the same
//! lock so a state query can never observe a session and a record mutation
//! out of order.

use crate::model::{BundleRecord, InstallSession};
use crate::{CapsaError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    records: HashMap<String, BundleRecord>,
    session: Option<InstallSession>,
}

/// Shared registry of installed bundles plus the live session slot.
#[derive(Default)]
pub struct BundleRegistry {
    inner: Mutex<Inner>,
}

impl BundleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a record by bundle name.
    pub fn get(&self, name: &str) -> Option<BundleRecord> {
        self.inner.lock().unwrap().records.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().records.contains_key(name)
    }

    /// Insert or replace a record. Replacement is the update path; names are
    /// otherwise immutable once added.
    pub fn insert(&self, record: BundleRecord) {
        self.inner
            .lock()
            .unwrap()
            .records
            .insert(record.name.clone(), record);
    }

    pub fn remove(&self, name: &str) -> Option<BundleRecord> {
        self.inner.lock().unwrap().records.remove(name)
    }

    /// All records, in no particular order.
    pub fn list(&self) -> Vec<BundleRecord> {
        self.inner.lock().unwrap().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Session slot

    /// Claim the session slot. Fails with `AlreadyInProgress` if another
    /// install or uninstall is live.
    pub fn begin_session(&self, session: InstallSession) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(active) = &inner.session {
            return Err(CapsaError::AlreadyInProgress {
                name: active.name.clone(),
            });
        }
        inner.session = Some(session);
        Ok(())
    }

    /// Mutate the live session in place, if one exists.
    pub fn update_session(&self, f: impl FnOnce(&mut InstallSession)) {
        if let Some(session) = self.inner.lock().unwrap().session.as_mut() {
            f(session);
        }
    }

    /// Release the session slot.
    pub fn end_session(&self) -> Option<InstallSession> {
        self.inner.lock().unwrap().session.take()
    }

    /// Copy of the live session, if any.
    pub fn session(&self) -> Option<InstallSession> {
        self.inner.lock().unwrap().session.clone()
    }

    /// Atomic snapshot of a bundle's record together with the live session.
    /// State queries need both under one lock acquisition.
    pub fn snapshot(&self, name: &str) -> (Option<BundleRecord>, Option<InstallSession>) {
        let inner = self.inner.lock().unwrap();
        (inner.records.get(name).cloned(), inner.session.clone())
    }
}
