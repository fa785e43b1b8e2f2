//! Server-side error types.
//!
//! Structured with `thiserror`, in the style of the transaction
//! subsystem's own error module: named fields per variant and a
//! crate-local `Result` alias.

use thiserror::Error;

/// Result type alias for server-side operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    /// A malformed or truncated wire record was received.
    #[error("protocol error on connection: {0}")]
    Protocol(#[source] std::io::Error),

    /// The configured listen address could not be bound.
    #[error("cannot bind listener on '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be read or did not name this server.
    #[error("config error: {0}")]
    Config(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        ServerError::Protocol(err)
    }
}

impl From<crate::config::ConfigError> for ServerError {
    fn from(err: crate::config::ConfigError) -> Self {
        ServerError::Config(err.to_string())
    }
}
