//! # Error Definitions
//!
//! The crate-wide failure taxonomy. Module-level errors (transport, naming) convert into
//! `ClusterError` at the boundary where they become user-visible.

use elwire::ErrorKind;
use elwire::WireError;

use crate::transport::TransportError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// A frame did not match its declared layout.
    #[error("Protocol error: {0}")]
    Protocol(#[from] WireError),
    /// Unknown NodeId, ApplicationId, InstanceId, route, or method.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Double start, stop when idle, or use before start.
    #[error("Illegal state: {0}")]
    IllegalState(String),
    /// Every independent failure of a multi-step start or stop.
    #[error("{} failures: {}", .0.len(), join(.0))]
    Aggregate(Vec<ClusterError>),
    /// The local transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    /// The remote side reported a failure.
    #[error("Remote failure ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
}

fn join(errors: &[ClusterError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl ClusterError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn illegal_state(what: impl Into<String>) -> Self {
        Self::IllegalState(what.into())
    }

    /// Folds the failures of independent steps into one result.
    ///
    /// No failures is `Ok`, exactly one is returned as-is, more become `Aggregate`.
    pub fn collect(mut errors: Vec<ClusterError>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate(errors)),
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
