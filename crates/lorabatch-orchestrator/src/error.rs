// Error types for batch orchestration

use lorabatch_core::CoreError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Operator asked the batch to stop
    #[error("Batch cancelled by operator")]
    Cancelled,

    /// Training process could not be started
    #[error("Failed to launch '{command}': {source}")]
    Spawn {
        /// Command line that was launched
        command: String,
        /// Underlying launch error
        #[source]
        source: std::io::Error,
    },

    /// Error from the core building blocks
    #[error(transparent)]
    Core(#[from] CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Orchestration error: {0}")]
    Other(String),
}

impl OrchestrationError {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
