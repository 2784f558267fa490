//! Error types for capsa.
//!
//! One taxonomy covers both the in-process API and the daemon wire protocol:
//! every error maps to an integer result code so installer callbacks and the
//! privileged daemon can carry it across the process boundary.

use std::path::PathBuf;
use thiserror::Error;

/// Integer result codes carried over the daemon wire and delivered to
/// installer callbacks. `0` is success; everything else is a failure class.
pub mod codes {
    pub const OK: i32 = 0;
    pub const INVALID_ARGUMENT: i32 = 1;
    pub const OBJECT_NULL: i32 = 2;
    pub const CALLBACK_MISSING: i32 = 3;
    pub const NOT_INITIALIZED: i32 = 4;
    pub const CANCELED: i32 = 5;
    pub const TRANSPORT_FAILED: i32 = 6;
    pub const PARSE_FAILED: i32 = 7;
    pub const ALREADY_IN_PROGRESS: i32 = 8;
    pub const BUNDLE_NOT_FOUND: i32 = 9;
    pub const IO_FAILED: i32 = 10;
    pub const EXTRACT_FAILED: i32 = 20;
    pub const RENAME_FAILED: i32 = 21;
    pub const DATA_DIR_FAILED: i32 = 22;
    pub const STORE_FILE_FAILED: i32 = 23;
    pub const REMOVE_FAILED: i32 = 24;
}

/// Main error type for capsa.
#[derive(Debug, Error)]
pub enum CapsaError {
    // Argument and state validation
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Required object missing: {what}")]
    ObjectNull { what: String },

    #[error("No subscriber registered for notification")]
    CallbackMissing,

    #[error("Daemon link not initialized")]
    NotInitialized,

    #[error("Call canceled by daemon death")]
    Canceled,

    #[error("Another install or uninstall is in progress: {name}")]
    AlreadyInProgress { name: String },

    #[error("Bundle not found: {name}")]
    BundleNotFound { name: String },

    // Daemon and transport
    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Daemon {op} failed with code {code}")]
    Daemon { op: &'static str, code: i32 },

    // Bundle container
    #[error("Bundle parse failed: {message}")]
    Parse { message: String },

    // File system and serialization
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

/// Result type alias for capsa operations.
pub type Result<T> = std::result::Result<T, CapsaError>;

impl From<std::io::Error> for CapsaError {
    fn from(err: std::io::Error) -> Self {
        CapsaError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CapsaError {
    fn from(err: serde_json::Error) -> Self {
        CapsaError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CapsaError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        CapsaError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Map this error to its wire result code.
    ///
    /// Daemon failures pass their original code through unchanged so the
    /// subscriber sees exactly what the daemon reported.
    pub fn wire_code(&self) -> i32 {
        match self {
            CapsaError::InvalidArgument { .. } => codes::INVALID_ARGUMENT,
            CapsaError::ObjectNull { .. } => codes::OBJECT_NULL,
            CapsaError::CallbackMissing => codes::CALLBACK_MISSING,
            CapsaError::NotInitialized => codes::NOT_INITIALIZED,
            CapsaError::Canceled => codes::CANCELED,
            CapsaError::AlreadyInProgress { .. } => codes::ALREADY_IN_PROGRESS,
            CapsaError::BundleNotFound { .. } => codes::BUNDLE_NOT_FOUND,
            CapsaError::Transport { .. } => codes::TRANSPORT_FAILED,
            CapsaError::Daemon { code, .. } => *code,
            CapsaError::Parse { .. } => codes::PARSE_FAILED,
            CapsaError::Io { .. } => codes::IO_FAILED,
            CapsaError::Json { .. } => codes::PARSE_FAILED,
        }
    }
}

/// Render a wire result code as a human-readable message for callbacks.
pub fn result_message(code: i32) -> &'static str {
    match code {
        codes::OK => "success",
        codes::INVALID_ARGUMENT => "invalid argument",
        codes::OBJECT_NULL => "required object missing",
        codes::CALLBACK_MISSING => "no subscriber registered",
        codes::NOT_INITIALIZED => "daemon link not initialized",
        codes::CANCELED => "canceled by daemon death",
        codes::TRANSPORT_FAILED => "transport failure",
        codes::PARSE_FAILED => "bundle metadata unreadable",
        codes::ALREADY_IN_PROGRESS => "another operation in progress",
        codes::BUNDLE_NOT_FOUND => "bundle not found",
        codes::IO_FAILED => "filesystem operation failed",
        codes::EXTRACT_FAILED => "archive extraction failed",
        codes::RENAME_FAILED => "path rename failed",
        codes::DATA_DIR_FAILED => "data directory creation failed",
        codes::STORE_FILE_FAILED => "profile write failed",
        codes::REMOVE_FAILED => "removal failed",
        _ => "operation failed",
    }
}
