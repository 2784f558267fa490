//! Routing of install/uninstall notifications to subscribers.
//!
//! Two subscription modes, mutually exclusive: per-name entries, or one
//! global "monitor everything" observer. Registering the global observer
//! clears every per-name entry, and while it is present per-name
//! subscriptions are accepted but inert — global always wins and is checked
//! first.
//!
//! Observers are invoked synchronously on the notifying thread, after the
//! hub lock is released, so an observer can freely call back into the
//! manager.

use capsa_core::error::codes;
use capsa_core::model::{InstallState, ObserverHandle, OpKind, StateEvent};
use capsa_core::{result_message, CapsaError, Result};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct HubInner {
    global: Option<ObserverHandle>,
    by_name: HashMap<String, ObserverHandle>,
}

/// Subscription table for bundle state notifications.
#[derive(Default)]
pub struct CallbackHub {
    inner: Mutex<HubInner>,
}

impl CallbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to state changes. An empty name means "monitor all
    /// bundles"; that clears existing per-name entries. Re-subscribing a
    /// name overwrites its previous entry.
    pub fn subscribe(&self, name: &str, observer: ObserverHandle) {
        let mut inner = self.inner.lock().unwrap();
        if name.is_empty() {
            inner.global = Some(observer);
            inner.by_name.clear();
            return;
        }
        if inner.global.is_some() {
            // Already monitoring everything; the per-name entry would never
            // be consulted.
            return;
        }
        inner.by_name.insert(name.to_string(), observer);
    }

    /// Drop the global observer and all per-name entries.
    pub fn unsubscribe(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.global = None;
        inner.by_name.clear();
    }

    /// Deliver the terminal notification for one operation.
    ///
    /// Exactly one subscriber is invoked: the global observer if present,
    /// else the per-name entry.
    pub fn notify(&self, name: &str, op: OpKind, code: i32) -> Result<()> {
        if name.is_empty() {
            return Err(CapsaError::ObjectNull {
                what: "bundle name".into(),
            });
        }
        let observer = self.lookup(name).ok_or(CapsaError::CallbackMissing)?;
        observer.on_state(&terminal_event(name, op, code));
        Ok(())
    }

    /// Deliver a non-terminal progress notification. Missing subscribers
    /// are not an error here.
    pub fn report_progress(&self, name: &str, op: OpKind, progress: u8) {
        if let Some(observer) = self.lookup(name) {
            observer.on_state(&progress_event(name, op, progress));
        }
    }

    fn lookup(&self, name: &str) -> Option<ObserverHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .global
            .clone()
            .or_else(|| inner.by_name.get(name).cloned())
    }
}

/// Build the terminal event for an operation result.
pub fn terminal_event(name: &str, op: OpKind, code: i32) -> StateEvent {
    let ok = code == codes::OK;
    let message = if ok {
        match op {
            OpKind::Install => "install success".to_string(),
            OpKind::Uninstall => "uninstall success".to_string(),
        }
    } else {
        result_message(code).to_string()
    };
    StateEvent {
        name: name.to_string(),
        op,
        state: if ok { InstallState::Ok } else { InstallState::Fail },
        progress: if ok { 100 } else { 0 },
        code,
        message,
    }
}

/// Build a non-terminal progress event.
pub fn progress_event(name: &str, op: OpKind, progress: u8) -> StateEvent {
    StateEvent {
        name: name.to_string(),
        op,
        state: InstallState::Doing,
        progress,
        code: codes::OK,
        message: match op {
            OpKind::Install => "installing".to_string(),
            OpKind::Uninstall => "uninstalling".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_observer() -> (ObserverHandle, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let observer: ObserverHandle = Arc::new(move |_: &StateEvent| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (observer, count)
    }

    #[test]
    fn test_notify_per_name() {
        let hub = CallbackHub::new();
        let (observer, count) = counting_observer();
        hub.subscribe("app1", observer);

        hub.notify("app1", OpKind::Install, codes::OK).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Different name has no subscriber.
        assert!(matches!(
            hub.notify("app2", OpKind::Install, codes::OK),
            Err(CapsaError::CallbackMissing)
        ));
    }

    #[test]
    fn test_empty_name_is_object_null() {
        let hub = CallbackHub::new();
        assert!(matches!(
            hub.notify("", OpKind::Install, codes::OK),
            Err(CapsaError::ObjectNull { .. })
        ));
    }

    #[test]
    fn test_global_clears_and_overrides_per_name() {
        let hub = CallbackHub::new();
        let (per_name, per_name_count) = counting_observer();
        let (global, global_count) = counting_observer();

        hub.subscribe("app1", per_name);
        hub.subscribe("", global);
        // Per-name registration after global is inert.
        let (late, late_count) = counting_observer();
        hub.subscribe("app1", late);

        hub.notify("app1", OpKind::Install, codes::OK).unwrap();
        hub.notify("anything", OpKind::Uninstall, codes::OK).unwrap();

        assert_eq!(global_count.load(Ordering::SeqCst), 2);
        assert_eq!(per_name_count.load(Ordering::SeqCst), 0);
        assert_eq!(late_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_clears_everything() {
        let hub = CallbackHub::new();
        let (observer, count) = counting_observer();
        hub.subscribe("", observer);
        hub.unsubscribe();

        assert!(matches!(
            hub.notify("app1", OpKind::Install, codes::OK),
            Err(CapsaError::CallbackMissing)
        ));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resubscribe_overwrites() {
        let hub = CallbackHub::new();
        let (first, first_count) = counting_observer();
        let (second, second_count) = counting_observer();
        hub.subscribe("app1", first);
        hub.subscribe("app1", second);

        hub.notify("app1", OpKind::Install, codes::OK).unwrap();
        assert_eq!(first_count.load(Ordering::SeqCst), 0);
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_messages() {
        let event = terminal_event("a", OpKind::Install, codes::OK);
        assert_eq!(event.message, "install success");
        assert_eq!(event.progress, 100);

        let event = terminal_event("a", OpKind::Install, codes::PARSE_FAILED);
        assert_eq!(event.state, InstallState::Fail);
        assert_eq!(event.message, "bundle metadata unreadable");
        assert_eq!(event.progress, 0);

        let event = progress_event("a", OpKind::Uninstall, 0);
        assert_eq!(event.state, InstallState::Doing);
        assert_eq!(event.message, "uninstalling");
    }
}
