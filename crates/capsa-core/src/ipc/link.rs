//! Client for the privileged bundle daemon.
//!
//! The transport only supports fire-and-forget requests plus an async
//! inbound event stream, so `DaemonLink` turns that into blocking-style
//! calls: each call parks on a oneshot that the reply pump fulfills.
//!
//! # Thread safety
//!
//! Calls are serialized through `call_lock`, so replies always match the
//! single outstanding request by construction — there is no correlation id.
//! Death handling deliberately does not touch `call_lock`: a daemon crash
//! must be able to cancel an in-flight call without first acquiring the
//! lock that call is holding.

use crate::config::DaemonConfig;
use crate::error::codes;
use crate::ipc::protocol::{self, DaemonRequest};
use crate::ipc::transport::{DaemonEvent, DaemonTransport};
use crate::{CapsaError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

/// Connection state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    /// `initialize` has not completed its first handshake.
    Uninitialized,
    Connected,
    /// Daemon death observed; reconnection in progress. Calls fail fast.
    Recovering,
}

type PendingCall = oneshot::Sender<Result<i32>>;

/// RPC client to the privileged daemon with reconnect-on-death.
pub struct DaemonLink {
    transport: Arc<dyn DaemonTransport>,
    /// Serializes calls from this link.
    call_lock: AsyncMutex<()>,
    /// Result slot of the single outstanding call.
    pending: Mutex<Option<PendingCall>>,
    status: Mutex<LinkStatus>,
    /// Connection generation, bumped on every completed recovery.
    generation: AtomicU64,
    /// Handle to self for spawning the pump and recovery tasks.
    self_handle: Weak<DaemonLink>,
}

impl DaemonLink {
    pub fn new(transport: Arc<dyn DaemonTransport>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            transport,
            call_lock: AsyncMutex::new(()),
            pending: Mutex::new(None),
            status: Mutex::new(LinkStatus::Uninitialized),
            generation: AtomicU64::new(0),
            self_handle: weak.clone(),
        })
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.lock().unwrap()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Connect to the daemon and complete the callback handshake.
    ///
    /// Endpoint location and callback registration retry forever at a fixed
    /// interval: the daemon is assumed eventually present, and boot blocks
    /// until it is.
    pub async fn initialize(&self) {
        if self.status() != LinkStatus::Uninitialized {
            debug!("daemon link already initialized");
            return;
        }

        self.wait_for_daemon().await;

        // The pump must run before registration so the handshake reply can
        // be delivered.
        let Some(link) = self.self_handle.upgrade() else {
            return;
        };
        tokio::spawn(async move { link.pump_events().await });

        self.register_callback().await;
        *self.status.lock().unwrap() = LinkStatus::Connected;
        info!("daemon link connected");
    }

    /// Issue one request and wait for its reply code.
    ///
    /// Fails fast with `NotInitialized` unless the link is `Connected`, and
    /// with `Canceled` if the daemon dies before replying.
    pub async fn call(&self, request: &DaemonRequest) -> Result<i32> {
        if self.status() != LinkStatus::Connected {
            return Err(CapsaError::NotInitialized);
        }
        self.raw_call(request).await
    }

    /// The call path without the status gate; initialization and recovery
    /// use this for the handshake itself.
    async fn raw_call(&self, request: &DaemonRequest) -> Result<i32> {
        let _serial = self.call_lock.lock().await;

        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap() = Some(tx);

        let frame = protocol::encode_request(request)?;
        if let Err(e) = self.transport.send(frame).await {
            self.pending.lock().unwrap().take();
            return Err(CapsaError::Transport {
                message: format!("{} send failed: {}", request.op_name(), e),
            });
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped without a verdict: treat as a death-cancel.
            Err(_) => Err(CapsaError::Canceled),
        }
    }

    async fn wait_for_daemon(&self) {
        loop {
            match self.transport.open().await {
                Ok(()) => return,
                Err(e) => {
                    debug!("daemon endpoint not available yet: {}", e);
                    tokio::time::sleep(DaemonConfig::LOCATE_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Run the `REGISTER_CALLBACK` handshake until it succeeds, re-opening
    /// the transport whenever the daemon drops out mid-handshake.
    async fn register_callback(&self) {
        loop {
            match self.raw_call(&DaemonRequest::RegisterCallback).await {
                Ok(code) if code == codes::OK => return,
                Ok(code) => {
                    warn!("daemon rejected callback registration: code {}", code);
                }
                Err(e) => {
                    warn!("callback registration failed: {}", e);
                    self.wait_for_daemon().await;
                }
            }
            tokio::time::sleep(DaemonConfig::REGISTER_RETRY_INTERVAL).await;
        }
    }

    async fn pump_events(self: Arc<Self>) {
        while let Some(event) = self.transport.next_event().await {
            match event {
                DaemonEvent::Reply(frame) => self.deliver_reply(&frame),
                DaemonEvent::Died => self.handle_death(),
            }
        }
        debug!("daemon transport closed, event pump exiting");
    }

    fn deliver_reply(&self, frame: &[u8]) {
        let reply = match protocol::decode_reply(frame) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("undecodable daemon reply dropped: {}", e);
                return;
            }
        };
        match self.pending.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(Ok(reply.code));
            }
            // Reply raced a death-cancel; the caller is already gone.
            None => debug!("daemon reply with no outstanding call: code {}", reply.code),
        }
    }

    fn handle_death(&self) {
        let generation = self.generation();

        // Cancel the outstanding call first so no caller blocks forever.
        if let Some(tx) = self.pending.lock().unwrap().take() {
            let _ = tx.send(Err(CapsaError::Canceled));
        }

        let mut status = self.status.lock().unwrap();
        match *status {
            LinkStatus::Connected => {
                *status = LinkStatus::Recovering;
                drop(status);
                warn!("daemon died (generation {}), recovering", generation);
                let Some(link) = self.self_handle.upgrade() else {
                    return;
                };
                tokio::spawn(async move { link.recover().await });
            }
            // Initialization or an earlier recovery already owns the
            // reconnect; a repeated death notice has nothing left to do.
            _ => debug!("daemon death in generation {} already being handled", generation),
        }
    }

    async fn recover(self: Arc<Self>) {
        self.wait_for_daemon().await;
        self.register_callback().await;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.status.lock().unwrap() = LinkStatus::Connected;
        info!("daemon link reconnected (generation {})", generation);
    }

    // Typed wrappers over the wire operations.

    pub async fn extract_archive(&self, src_file: &Path, dest_dir: &Path) -> Result<()> {
        let request = DaemonRequest::ExtractArchive {
            src_file: path_arg(src_file, "source archive")?,
            dest_dir: path_arg(dest_dir, "destination")?,
        };
        self.checked(&request).await
    }

    pub async fn rename_path(&self, old: &Path, new: &Path) -> Result<()> {
        let request = DaemonRequest::RenamePath {
            old: path_arg(old, "old")?,
            new: path_arg(new, "new")?,
        };
        self.checked(&request).await
    }

    pub async fn create_permission_dir(&self) -> Result<()> {
        self.checked(&DaemonRequest::CreatePermissionDir).await
    }

    pub async fn create_data_dir(&self, path: &Path, uid: u32, gid: u32, chown: bool) -> Result<()> {
        let request = DaemonRequest::CreateDataDir {
            path: path_arg(path, "data dir")?,
            uid,
            gid,
            chown,
        };
        self.checked(&request).await
    }

    pub async fn store_buffer_to_file(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            return Err(CapsaError::InvalidArgument {
                message: "empty buffer".into(),
            });
        }
        let request = DaemonRequest::StoreBufferToFile {
            path: path_arg(path, "target file")?,
            bytes,
        };
        self.checked(&request).await
    }

    pub async fn move_file(&self, old: &Path, new: &Path) -> Result<()> {
        let request = DaemonRequest::MoveFile {
            old: path_arg(old, "old")?,
            new: path_arg(new, "new")?,
        };
        self.checked(&request).await
    }

    pub async fn remove_file(&self, path: &Path) -> Result<()> {
        let request = DaemonRequest::RemoveFile {
            path: path_arg(path, "target file")?,
        };
        self.checked(&request).await
    }

    pub async fn remove_install_dir(
        &self,
        code_path: &Path,
        data_path: &Path,
        keep_data: bool,
    ) -> Result<()> {
        let request = DaemonRequest::RemoveInstallDir {
            code_path: path_arg(code_path, "code")?,
            data_path: path_arg(data_path, "data")?,
            keep_data,
        };
        self.checked(&request).await
    }

    async fn checked(&self, request: &DaemonRequest) -> Result<()> {
        let code = self.call(request).await?;
        if code == codes::OK {
            Ok(())
        } else {
            Err(CapsaError::Daemon {
                op: request.op_name(),
                code,
            })
        }
    }
}

fn path_arg(path: &Path, what: &str) -> Result<String> {
    if path.as_os_str().is_empty() {
        return Err(CapsaError::InvalidArgument {
            message: format!("{what} path is empty"),
        });
    }
    Ok(path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::DaemonReply;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI32};
    use tokio::sync::mpsc;

    /// Scriptable transport: records sent requests, optionally auto-replies,
    /// and lets tests inject death events.
    struct ScriptedTransport {
        reachable: AtomicBool,
        auto_reply: AtomicBool,
        reply_code: AtomicI32,
        sent: Mutex<Vec<DaemonRequest>>,
        events_tx: mpsc::UnboundedSender<DaemonEvent>,
        events_rx: AsyncMutex<mpsc::UnboundedReceiver<DaemonEvent>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Arc::new(Self {
                reachable: AtomicBool::new(true),
                auto_reply: AtomicBool::new(true),
                reply_code: AtomicI32::new(codes::OK),
                sent: Mutex::new(Vec::new()),
                events_tx,
                events_rx: AsyncMutex::new(events_rx),
            })
        }

        fn sent_ops(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|r| r.op_name()).collect()
        }

        fn kill_daemon(&self) {
            self.reachable.store(false, Ordering::SeqCst);
            self.events_tx.send(DaemonEvent::Died).unwrap();
        }

        fn revive_daemon(&self) {
            self.reachable.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DaemonTransport for ScriptedTransport {
        async fn open(&self) -> Result<()> {
            if self.reachable.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CapsaError::Transport {
                    message: "daemon not running".into(),
                })
            }
        }

        async fn send(&self, frame: Vec<u8>) -> Result<()> {
            if !self.reachable.load(Ordering::SeqCst) {
                return Err(CapsaError::Transport {
                    message: "daemon not running".into(),
                });
            }
            let request = protocol::decode_request(&frame)?;
            self.sent.lock().unwrap().push(request);
            if self.auto_reply.load(Ordering::SeqCst) {
                let reply = DaemonReply {
                    code: self.reply_code.load(Ordering::SeqCst),
                };
                self.events_tx
                    .send(DaemonEvent::Reply(protocol::encode_reply(&reply)?))
                    .ok();
            }
            Ok(())
        }

        async fn next_event(&self) -> Option<DaemonEvent> {
            self.events_rx.lock().await.recv().await
        }
    }

    async fn wait_for_status(link: &DaemonLink, status: LinkStatus) {
        for _ in 0..200 {
            if link.status() == status {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("link never reached {:?}", status);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_registers_callback() {
        let transport = ScriptedTransport::new();
        let link = DaemonLink::new(transport.clone());

        link.initialize().await;

        assert_eq!(link.status(), LinkStatus::Connected);
        assert_eq!(transport.sent_ops(), vec!["register_callback"]);

        // Idempotent.
        link.initialize().await;
        assert_eq!(transport.sent_ops().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_waits_for_daemon() {
        let transport = ScriptedTransport::new();
        transport.reachable.store(false, Ordering::SeqCst);
        let link = DaemonLink::new(transport.clone());

        let init_link = Arc::clone(&link);
        let handle = tokio::spawn(async move { init_link.initialize().await });

        // Give the retry loop a few spins before the daemon comes up.
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(link.status(), LinkStatus::Uninitialized);

        transport.revive_daemon();
        handle.await.unwrap();
        assert_eq!(link.status(), LinkStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_before_initialize_fails_fast() {
        let transport = ScriptedTransport::new();
        let link = DaemonLink::new(transport);

        let result = link.remove_file(Path::new("/tmp/x")).await;
        assert!(matches!(result, Err(CapsaError::NotInitialized)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_returns_daemon_code() {
        let transport = ScriptedTransport::new();
        let link = DaemonLink::new(transport.clone());
        link.initialize().await;

        link.extract_archive(Path::new("/b/a.bdl"), Path::new("/tmp/a"))
            .await
            .unwrap();

        transport.reply_code.store(codes::EXTRACT_FAILED, Ordering::SeqCst);
        match link
            .extract_archive(Path::new("/b/a.bdl"), Path::new("/tmp/a"))
            .await
        {
            Err(CapsaError::Daemon { op, code }) => {
                assert_eq!(op, "extract_archive");
                assert_eq!(code, codes::EXTRACT_FAILED);
            }
            other => panic!("expected Daemon error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_path_rejected_without_send() {
        let transport = ScriptedTransport::new();
        let link = DaemonLink::new(transport.clone());
        link.initialize().await;
        let sent_before = transport.sent_ops().len();

        let result = link.rename_path(Path::new(""), Path::new("/x")).await;
        assert!(matches!(result, Err(CapsaError::InvalidArgument { .. })));
        assert_eq!(transport.sent_ops().len(), sent_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_death_cancels_outstanding_call_and_recovers() {
        let transport = ScriptedTransport::new();
        let link = DaemonLink::new(transport.clone());
        link.initialize().await;

        // Suppress replies so the next call stays outstanding.
        transport.auto_reply.store(false, Ordering::SeqCst);

        let call_link = Arc::clone(&link);
        let in_flight = tokio::spawn(async move {
            call_link.remove_file(Path::new("/app/ghost.json")).await
        });

        // Let the call reach its await point.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.sent_ops().len(), 2); // register + remove_file

        transport.kill_daemon();
        let result = in_flight.await.unwrap();
        assert!(matches!(result, Err(CapsaError::Canceled)));

        // While recovering, calls fail fast instead of queuing.
        wait_for_status(&link, LinkStatus::Recovering).await;
        assert!(matches!(
            link.remove_file(Path::new("/app/ghost.json")).await,
            Err(CapsaError::NotInitialized)
        ));

        // Daemon comes back; recovery re-registers and restores service.
        transport.auto_reply.store(true, Ordering::SeqCst);
        transport.revive_daemon();
        wait_for_status(&link, LinkStatus::Connected).await;
        assert_eq!(link.generation(), 1);

        link.remove_file(Path::new("/app/ghost.json")).await.unwrap();
        assert_eq!(
            transport.sent_ops().last().copied(),
            Some("remove_file")
        );
        // Recovery ran a fresh handshake.
        assert_eq!(
            transport
                .sent_ops()
                .iter()
                .filter(|op| **op == "register_callback")
                .count(),
            2
        );
    }
}
