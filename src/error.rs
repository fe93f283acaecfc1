//! Server error type.
//!
//! Only infrastructure and configuration failures are errors. Request-level
//! outcomes (forbidden, not found, aborted exchanges) are responses or
//! connection drops, never `ServerError`s.

use thiserror::Error;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Every socket step of one bind attempt. Logged by the supervisor,
    /// which keeps retrying.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("invalid settings: {0}")]
    Settings(#[from] serde_json::Error),
}

/// Convenience result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
