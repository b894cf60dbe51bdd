//! Unified error handling for the node.

use uuid::Uuid;

use crate::config::ConfigError;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] mdib_engine::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Replica of consumer {consumer} diverged from the provider")]
    Diverged { consumer: Uuid },
}

/// Result type alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
