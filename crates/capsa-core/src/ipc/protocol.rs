//! Daemon wire protocol: request/reply types and framing.
//!
//! Frames are a 4-byte big-endian length prefix followed by a UTF-8 JSON
//! payload:
//!
//! ```text
//! [u32 BE: len][JSON bytes of len]
//! ```
//!
//! Requests are fire-and-forget; every request eventually produces exactly
//! one reply carrying a single integer result code, `0` = success.

use crate::config::DaemonConfig;
use crate::{CapsaError, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One privileged filesystem request to the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum DaemonRequest {
    /// Handshake: register the caller's reply endpoint.
    RegisterCallback,
    ExtractArchive {
        src_file: String,
        dest_dir: String,
    },
    RenamePath {
        old: String,
        new: String,
    },
    CreatePermissionDir,
    CreateDataDir {
        path: String,
        uid: u32,
        gid: u32,
        chown: bool,
    },
    StoreBufferToFile {
        path: String,
        bytes: Vec<u8>,
    },
    MoveFile {
        old: String,
        new: String,
    },
    RemoveFile {
        path: String,
    },
    RemoveInstallDir {
        code_path: String,
        data_path: String,
        keep_data: bool,
    },
}

impl DaemonRequest {
    /// Stable operation name for logs and error context.
    pub fn op_name(&self) -> &'static str {
        match self {
            DaemonRequest::RegisterCallback => "register_callback",
            DaemonRequest::ExtractArchive { .. } => "extract_archive",
            DaemonRequest::RenamePath { .. } => "rename_path",
            DaemonRequest::CreatePermissionDir => "create_permission_dir",
            DaemonRequest::CreateDataDir { .. } => "create_data_dir",
            DaemonRequest::StoreBufferToFile { .. } => "store_buffer_to_file",
            DaemonRequest::MoveFile { .. } => "move_file",
            DaemonRequest::RemoveFile { .. } => "remove_file",
            DaemonRequest::RemoveInstallDir { .. } => "remove_install_dir",
        }
    }
}

/// Reply to a daemon request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DaemonReply {
    pub code: i32,
}

/// Serialize a request into a frame payload.
pub fn encode_request(request: &DaemonRequest) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(request)?)
}

/// Parse a frame payload into a request.
pub fn decode_request(payload: &[u8]) -> Result<DaemonRequest> {
    Ok(serde_json::from_slice(payload)?)
}

/// Serialize a reply into a frame payload.
pub fn encode_reply(reply: &DaemonReply) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(reply)?)
}

/// Parse a frame payload into a reply.
pub fn decode_reply(payload: &[u8]) -> Result<DaemonReply> {
    Ok(serde_json::from_slice(payload)?)
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed the stream).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > DaemonConfig::MAX_FRAME_SIZE {
        return Err(CapsaError::Transport {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                DaemonConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
