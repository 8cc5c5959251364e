//! Error types for the load-generation client

use thiserror::Error;

/// Errors surfaced by client setup and the transport drivers.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to resolve '{target}': {reason}")]
    Resolution { target: String, reason: String },
    #[error("failed to start worker thread: {0}")]
    ThreadStart(String),
    #[error("transport open failed: {0}")]
    TransportOpen(String),
    #[error("transport parameter rejected: {0}")]
    ParameterSet(String),
    #[error("connection start failed: {0}")]
    Start(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PerfError>;
