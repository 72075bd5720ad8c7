//! Error types for kiln.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kiln operations.
pub type Result<T> = std::result::Result<T, KilnError>;

/// Main error type for kiln.
#[derive(Error, Debug)]
pub enum KilnError {
    // Build specification errors
    #[error("No inputs for run: {cmd}")]
    NoInputsForRun { cmd: String },

    #[error("Invalid path mapping {local:?} -> {container:?}: {reason}")]
    InvalidPathMapping { local: PathBuf, container: String, reason: String },

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid image reference {reference:?}: {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("digest too short: {digest}")]
    DigestTooShort { digest: String },

    // Protocol errors
    #[error("decoding daemon output: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("decoding graph trace: {reason}")]
    TraceDecode { reason: String },

    #[error("Invalid aux payload: {reason}")]
    InvalidAux { reason: String },

    // Errors reported by the daemon while building
    #[error("{0}")]
    DaemonBuild(String),

    #[error(
        "Build daemon is not responding. Maybe it is out of disk space? Try running `docker system prune`"
    )]
    NoDigest,

    // Transport errors
    #[error("{operation}: {source}")]
    Transport {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation}: {reason}")]
    Daemon { operation: String, reason: String },

    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Lifecycle errors
    #[error("build cancelled")]
    Cancelled,

    #[error("build timed out after {0:?}")]
    Timeout(Duration),

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("{op}: {source}")]
    Wrapped {
        op: String,
        #[source]
        source: Box<KilnError>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KilnError {
    /// Prefix the error with the name of the operation that failed.
    pub fn wrap(self, op: impl Into<String>) -> Self {
        Self::Wrapped { op: op.into(), source: Box::new(self) }
    }

    /// Returns the innermost error, skipping operation wrappers.
    pub fn root(&self) -> &KilnError {
        match self {
            Self::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true if the build was stopped by cancellation or deadline.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::Timeout(_))
    }

    /// Build a transport error for a failed stream operation.
    pub fn transport(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport { operation: operation.into(), source }
    }
}
