//! Error types for the operator CLI.

use threadlog_store::StoreError;

use crate::config::ConfigError;

/// Errors that can end a CLI command.
#[derive(Debug, thiserror::Error)]
pub enum CtlError {
    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// The engine or its backend failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Reading or writing a local file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Command output could not be rendered.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// The logging subscriber could not be installed.
    #[error("logging error: {0}")]
    Logging(String),

    /// Command line arguments that parse but cannot be honoured.
    #[error("invalid arguments: {0}")]
    Usage(String),
}
