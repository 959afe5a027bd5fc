//! Crate-level error type.

use crate::broker::BrokerError;
use crate::config::ConfigError;

/// Errors that stop the server from starting or serving.
#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CollabError>;
