//! Error types for configuration and validation.

use thiserror::Error;

/// Core configuration error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown database target: {0}")]
    UnknownDatabase(String),

    #[error("partition '{0}' is not in the configured allow-list")]
    PartitionNotAllowed(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
