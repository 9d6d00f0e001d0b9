// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shardfs

use thiserror::Error;

use crate::protocol::Reason;

/// Result type alias
pub type ShardResult<T> = Result<T, ShardError>;

/// Main error type
#[derive(Error, Debug)]
pub enum ShardError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("Missing file extension: {0}")]
    MissingExtension(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Payload exceeds limit of {limit} bytes")]
    Capacity { limit: u64 },

    #[error("Backend {node} unavailable: {message}")]
    BackendUnavailable { node: String, message: String },

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Timeout")]
    Timeout,

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ShardError {
    /// Acknowledgment reason reported to the peer for this error.
    pub fn reason(&self) -> Reason {
        match self {
            // Raised at startup only; no request path produces it.
            ShardError::Configuration(_) => Reason::IoError,
            ShardError::Network(_) => Reason::BackendUnavailable,
            ShardError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => Reason::FileNotFound,
            ShardError::Io(_) => Reason::IoError,
            ShardError::NotFound(_) => Reason::FileNotFound,
            ShardError::InvalidPath(_) => Reason::InvalidPath,
            ShardError::UnsupportedType(_) => Reason::InvalidFileType,
            ShardError::MissingExtension(_) => Reason::NoExtension,
            ShardError::Protocol(_) => Reason::InvalidFormat,
            ShardError::Capacity { .. } => Reason::PayloadTooLarge,
            ShardError::BackendUnavailable { .. } => Reason::BackendUnavailable,
            ShardError::Archive(_) => Reason::ArchiveFailed,
            ShardError::Timeout => Reason::Timeout,
            ShardError::Rejected(_) => Reason::Unspecified,
        }
    }

    /// Whether the connection that produced this error can no longer be trusted
    /// to be in sync and must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ShardError::Network(_) | ShardError::Protocol(_) | ShardError::Timeout
        )
    }

    pub fn backend(node: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ShardError::BackendUnavailable {
            node: node.into(),
            message: err.to_string(),
        }
    }
}
