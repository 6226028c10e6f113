//! Error types for LIP.
//!
//! Every failure a caller can observe, local or remote, is a variant of
//! [`LipError`]. Remote failures arrive as an error descriptor on the wire and
//! are rehydrated into the matching variant by the client.

use crate::ipc::protocol::ErrorDescriptor;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the LIP library.
#[derive(Debug, Error)]
pub enum LipError {
    // Server lifecycle errors
    #[error("Endpoint {path:?} is already bound: {message}")]
    Bind { path: PathBuf, message: String },

    #[error("Server terminated before the request completed")]
    Terminated,

    // Wire errors
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    // Lookup errors
    #[error("Function '{name}' not found in available sockets")]
    NotFound { name: String },

    // Remote failures raised by the served function
    #[error("Remote {kind}: {message}")]
    RemoteExecution { kind: String, message: String },

    // Transport errors
    #[error("Connection to {path:?} failed: {message}")]
    Connection {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },
}

/// Result type alias for LIP operations.
pub type Result<T> = std::result::Result<T, LipError>;

impl From<std::io::Error> for LipError {
    fn from(err: std::io::Error) -> Self {
        LipError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for LipError {
    fn from(err: serde_json::Error) -> Self {
        LipError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<ErrorDescriptor> for LipError {
    /// Rehydrate an error descriptor received from a server.
    fn from(descriptor: ErrorDescriptor) -> Self {
        match descriptor.kind.as_str() {
            ErrorDescriptor::NOT_FOUND => LipError::NotFound {
                name: descriptor.message,
            },
            ErrorDescriptor::TERMINATED => LipError::Terminated,
            ErrorDescriptor::PROTOCOL => LipError::Protocol {
                message: descriptor.message,
            },
            _ => LipError::RemoteExecution {
                kind: descriptor.kind,
                message: descriptor.message,
            },
        }
    }
}

impl LipError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LipError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a connection error for the endpoint at `path`.
    pub fn connection(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        LipError::Connection {
            path: path.into(),
            message: err.to_string(),
            source: Some(err),
        }
    }

    /// The kind string this error carries when sent over the wire.
    pub fn error_kind(&self) -> &str {
        match self {
            LipError::NotFound { .. } => ErrorDescriptor::NOT_FOUND,
            LipError::Terminated => ErrorDescriptor::TERMINATED,
            LipError::Protocol { .. } | LipError::Json { .. } => ErrorDescriptor::PROTOCOL,
            LipError::RemoteExecution { kind, .. } => kind,
            LipError::Validation { .. } => ErrorDescriptor::INVALID_ARGUMENTS,
            _ => ErrorDescriptor::INTERNAL,
        }
    }

    /// Whether this failure was reported by a server rather than raised
    /// locally by the client or its transport.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            LipError::RemoteExecution { .. } | LipError::Terminated
        )
    }
}
