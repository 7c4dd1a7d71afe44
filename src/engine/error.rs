//! Status and Error Types
//!
//! Every component reports its own typed error; all of them collapse onto
//! the device-wide `ErrorCode` taxonomy that the wire protocol understands.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device-wide result taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Terminal success
    Ok,
    /// Continuation sentinel, not an error
    InProgress,
    /// Generic operation failure (storage I/O, digest mismatch, size overrun)
    Fail,
    /// Length or range violation on a setup call
    InvalidParam,
    /// Operation is not valid for the collaborator (e.g. write to a closed stream)
    InvalidOp,
    /// State violation (duplicate provisioning, concurrent update, write without begin)
    NotAllowed,
}

impl ErrorCode {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ErrorCode::Ok | ErrorCode::Fail)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::InProgress => "in_progress",
            ErrorCode::Fail => "fail",
            ErrorCode::InvalidParam => "invalid_param",
            ErrorCode::InvalidOp => "invalid_op",
            ErrorCode::NotAllowed => "not_allowed",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Shared secret already set")]
    AlreadySet,
    #[error("Shared secret length {0} outside 1..={max}", max = crate::engine::auth::MAX_SECRET_LEN)]
    InvalidLength(usize),
}

impl AuthError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AuthError::AlreadySet => ErrorCode::NotAllowed,
            AuthError::InvalidLength(_) => ErrorCode::InvalidParam,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image of {requested} bytes does not fit a {capacity}-byte slot")]
    InsufficientSpace { requested: u64, capacity: u64 },
    #[error("Write of {attempted} bytes exceeds the {capacity}-byte region")]
    RegionOverflow { attempted: u64, capacity: u64 },
    #[error("No update region is open")]
    NoRegion,
    #[error("No finalized image to boot from")]
    NotFinalized,
    #[error("Running image is not confirmed yet, its rollback slot is locked")]
    Unconfirmed,
    #[error("Boot record is corrupt: {0}")]
    Record(#[from] serde_json::Error),
    #[error("Injected storage fault: {0}")]
    Injected(&'static str),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("Operation not allowed in the current update state")]
    NotAllowed,
    #[error("Invalid update parameter: {0}")]
    InvalidParam(&'static str),
    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),
    #[error("Image overrun: expected {expected} bytes, received {received}")]
    SizeOverrun { expected: u64, received: u64 },
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
    #[error("Update rejected as unhealthy")]
    Unhealthy,
}

impl UpdateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            UpdateError::NotAllowed => ErrorCode::NotAllowed,
            UpdateError::InvalidParam(_) => ErrorCode::InvalidParam,
            UpdateError::Storage(_)
            | UpdateError::SizeOverrun { .. }
            | UpdateError::DigestMismatch { .. }
            | UpdateError::Unhealthy => ErrorCode::Fail,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame needs {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
    #[error("Unknown acknowledgement marker {0:02x?}")]
    Marker([u8; 4]),
    #[error("Unknown OTA status code {0}")]
    StatusCode(u16),
}

impl FrameError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidParam
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Peer did not respond within {0:?}")]
    Timeout(std::time::Duration),
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Peer closed the connection")]
    Closed,
    #[error("Malformed frame from peer: {0}")]
    Frame(#[from] FrameError),
    #[error("Session worker failed: {0}")]
    Worker(String),
    #[error("Image of {0} bytes does not fit the 32-bit size field")]
    ImageTooLarge(usize),
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl TransportError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::AuthFailed => ErrorCode::NotAllowed,
            TransportError::Frame(e) => e.code(),
            TransportError::ImageTooLarge(_) | TransportError::InvalidRequest(_) => {
                ErrorCode::InvalidParam
            }
            _ => ErrorCode::InvalidOp,
        }
    }
}
