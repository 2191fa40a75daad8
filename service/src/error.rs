//! Error types for the service layer.

use std::io;
use thiserror::Error;

/// Errors surfaced by service lifecycle operations.
///
/// Per-session failures (read/write errors, TLS record failures, timeouts)
/// are not reported through this type; they close the channel and fire the
/// disconnect callback instead.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("workers already started")]
    WorkersAlreadyStarted,

    #[error("workers not started")]
    WorkersNotStarted,

    #[error("listener already running")]
    ListenerAlreadyRunning,

    #[error("worker count must be between 1 and 65536, got {0}")]
    InvalidWorkerCount(usize),

    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors building TLS contexts or sessions.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("certificate: {0}")]
    Certificate(String),

    #[error("private key: {0}")]
    PrivateKey(String),

    #[error("session setup: {0}")]
    Session(String),
}

/// Errors delivered through the connector's result callback.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    TimedOut,

    #[error(transparent)]
    Io(#[from] io::Error),
}
