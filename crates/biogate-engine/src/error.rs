//! Error types for the Biogate engine

use thiserror::Error;

use biogate_core::BackendId;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the engine
///
/// None of these reach an authentication listener: attempt outcomes are
/// always expressed as a `FailureReason`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] biogate_core::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Adapter construction failed
    #[error("Adapter {0} could not be constructed: {1}")]
    Construction(BackendId, String),

    /// Plugin discovery or loading failed
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lockout store error
    #[error("Lockout store error: {0}")]
    Store(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
