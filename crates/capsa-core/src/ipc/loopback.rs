//! In-process daemon for tests and unprivileged deployments.
//!
//! Executes the privileged filesystem operations directly against the local
//! filesystem, with no process boundary. Implements [`DaemonTransport`], so
//! a [`DaemonLink`](super::DaemonLink) drives it exactly like the real
//! daemon, and crash/restart can be simulated for recovery testing.

use crate::error::codes;
use crate::ipc::protocol::{self, DaemonReply, DaemonRequest};
use crate::ipc::transport::{DaemonEvent, DaemonTransport};
use crate::{CapsaError, Result};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, warn};

/// Loopback daemon executing requests inline.
pub struct LoopbackDaemon {
    /// Root under which the permission directory is created.
    root: PathBuf,
    alive: AtomicBool,
    registered: AtomicBool,
    /// One-shot failure injection: `(op_name, code)` applied to the next
    /// matching request.
    injected_failure: Mutex<Option<(String, i32)>>,
    events_tx: mpsc::UnboundedSender<DaemonEvent>,
    events_rx: AsyncMutex<mpsc::UnboundedReceiver<DaemonEvent>>,
}

impl LoopbackDaemon {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            root: root.into(),
            alive: AtomicBool::new(true),
            registered: AtomicBool::new(false),
            injected_failure: Mutex::new(None),
            events_tx,
            events_rx: AsyncMutex::new(events_rx),
        })
    }

    /// Simulate a daemon crash: the connection drops and a death notice is
    /// delivered.
    pub fn crash(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.registered.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(DaemonEvent::Died);
    }

    /// Bring the daemon back after a crash. Clients must re-register.
    pub fn restart(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Make the next request with the given op name fail with `code`.
    pub fn inject_failure(&self, op_name: &str, code: i32) {
        *self.injected_failure.lock().unwrap() = Some((op_name.to_string(), code));
    }

    fn execute(&self, request: &DaemonRequest) -> i32 {
        {
            let mut injected = self.injected_failure.lock().unwrap();
            if injected
                .as_ref()
                .is_some_and(|(op, _)| op.as_str() == request.op_name())
            {
                let (op, code) = injected.take().unwrap();
                debug!("injected failure for {}: code {}", op, code);
                return code;
            }
        }

        match request {
            DaemonRequest::RegisterCallback => {
                self.registered.store(true, Ordering::SeqCst);
                codes::OK
            }
            DaemonRequest::ExtractArchive { src_file, dest_dir } => {
                fail_to_code(extract_archive(src_file, dest_dir), codes::EXTRACT_FAILED)
            }
            DaemonRequest::RenamePath { old, new } => {
                fail_to_code(rename(old, new), codes::RENAME_FAILED)
            }
            DaemonRequest::CreatePermissionDir => fail_to_code(
                std::fs::create_dir_all(self.root.join("permissions")).map_err(Into::into),
                codes::DATA_DIR_FAILED,
            ),
            DaemonRequest::CreateDataDir { path, .. } => {
                // uid/gid/chown need real privileges; ownership is skipped
                // in loopback mode.
                fail_to_code(
                    std::fs::create_dir_all(path).map_err(Into::into),
                    codes::DATA_DIR_FAILED,
                )
            }
            DaemonRequest::StoreBufferToFile { path, bytes } => {
                fail_to_code(store_buffer(path, bytes), codes::STORE_FILE_FAILED)
            }
            DaemonRequest::MoveFile { old, new } => {
                fail_to_code(rename(old, new), codes::RENAME_FAILED)
            }
            DaemonRequest::RemoveFile { path } => {
                let path = Path::new(path);
                if !path.exists() {
                    return codes::OK;
                }
                fail_to_code(
                    std::fs::remove_file(path).map_err(Into::into),
                    codes::REMOVE_FAILED,
                )
            }
            DaemonRequest::RemoveInstallDir {
                code_path,
                data_path,
                keep_data,
            } => {
                let mut result = remove_tree(code_path);
                if !keep_data {
                    if let Err(e) = remove_tree(data_path) {
                        result = Err(e);
                    }
                }
                fail_to_code(result, codes::REMOVE_FAILED)
            }
        }
    }
}

#[async_trait]
impl DaemonTransport for LoopbackDaemon {
    async fn open(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CapsaError::Transport {
                message: "loopback daemon not running".into(),
            })
        }
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(CapsaError::Transport {
                message: "loopback daemon not running".into(),
            });
        }
        let request = protocol::decode_request(&frame)?;
        let code = self.execute(&request);
        if code != codes::OK {
            warn!("loopback {} failed with code {}", request.op_name(), code);
        }
        let reply = protocol::encode_reply(&DaemonReply { code })?;
        let _ = self.events_tx.send(DaemonEvent::Reply(reply));
        Ok(())
    }

    async fn next_event(&self) -> Option<DaemonEvent> {
        self.events_rx.lock().await.recv().await
    }
}

fn fail_to_code(result: Result<()>, code: i32) -> i32 {
    match result {
        Ok(()) => codes::OK,
        Err(e) => {
            debug!("loopback operation failed: {}", e);
            code
        }
    }
}

fn extract_archive(src_file: &str, dest_dir: &str) -> Result<()> {
    let src = Path::new(src_file);
    let dest = Path::new(dest_dir);
    std::fs::create_dir_all(dest).map_err(|e| CapsaError::io_with_path(e, dest))?;

    let file = File::open(src).map_err(|e| CapsaError::io_with_path(e, src))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive
        .unpack(dest)
        .map_err(|e| CapsaError::io_with_path(e, dest))?;
    Ok(())
}

fn rename(old: &str, new: &str) -> Result<()> {
    let new_path = Path::new(new);
    if let Some(parent) = new_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CapsaError::io_with_path(e, parent))?;
    }
    std::fs::rename(old, new_path).map_err(|e| CapsaError::io_with_path(e, old))?;
    Ok(())
}

fn store_buffer(path: &str, bytes: &[u8]) -> Result<()> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CapsaError::io_with_path(e, parent))?;
    }
    std::fs::write(path, bytes).map_err(|e| CapsaError::io_with_path(e, path))?;
    Ok(())
}

fn remove_tree(path: &str) -> Result<()> {
    let path = Path::new(path);
    if !path.exists() {
        return Ok(());
    }
    std::fs::remove_dir_all(path).map_err(|e| CapsaError::io_with_path(e, path))?;
    Ok(())
}
