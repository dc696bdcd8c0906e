//! Error types for the proxy.

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that end a session or stop the proxy from starting.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The listen address could not be resolved or bound. Fatal at startup.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Network I/O error on a session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Response serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The blocking hash task panicked or was cancelled.
    #[error("share check failed: {0}")]
    ShareTask(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ProxyResult<T> = Result<T, ProxyError>;
