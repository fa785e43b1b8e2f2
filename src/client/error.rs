//! Client-side error types.

use thiserror::Error;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    /// A line in the config file named a server the client doesn't
    /// recognize, or an operation named a server not in the config.
    #[error("unknown server '{0}'")]
    UnknownServer(String),

    /// Could not establish or maintain a connection to a server.
    #[error("cannot connect to server '{name}' at '{addr}': {source}")]
    Connect { name: String, addr: String, #[source] source: std::io::Error },

    /// The connection to a server broke mid-transaction; per §7 this
    /// is fatal to the session rather than recoverable.
    #[error("lost connection to server '{0}': {1}")]
    ConnectionLost(String, #[source] std::io::Error),

    /// The config file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),
}

impl From<crate::config::ConfigError> for ClientError {
    fn from(err: crate::config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}
