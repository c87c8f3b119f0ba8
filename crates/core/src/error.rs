use thiserror::Error;

/// Top-level error type shared by the Parley crates.
#[derive(Error, Debug)]
pub enum ParleyError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Parley core operations.
pub type Result<T> = std::result::Result<T, ParleyError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Invalid subscription filter: {0}")]
    InvalidFilter(String),

    #[error("Feed closed")]
    Closed,

    #[error("Subscriber lagged: {0} events missed")]
    Lagged(u64),
}
