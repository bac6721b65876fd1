use thiserror::Error;

use crate::subtask::SubtaskStatus;

/// Unified error type for the fan-out coordinator
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Configuration errors (empty decomposition, id collisions, bad settings)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Store/persistence errors
    #[error("Store operation failed: {operation}")]
    Store {
        operation: String,
        #[source]
        source: sled::Error,
    },

    /// Record (de)serialization errors
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subtask not found: {0}")]
    SubtaskNotFound(String),

    #[error("Parent task not found: {0}")]
    ParentNotFound(String),

    #[error("Decomposition policy not found: {0}")]
    PolicyNotFound(String),

    #[error("Work unit not found: {0}")]
    WorkUnitNotFound(String),

    // Lifecycle conflicts
    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: SubtaskStatus,
        to: SubtaskStatus,
    },

    #[error("Subtask {id} already claimed (status: {status})")]
    AlreadyClaimed { id: String, status: SubtaskStatus },

    #[error("Subtask {id} already assigned to {worker}")]
    AlreadyAssigned { id: String, worker: String },

    #[error("Parent task already dispatched: {0}")]
    AlreadyDispatched(String),

    #[error("Invariant violated for {id}: {message}")]
    InvariantViolation { id: String, message: String },

    #[error("Subtask {id} is not terminal (status: {status})")]
    NotTerminal { id: String, status: SubtaskStatus },

    #[error("Worker task join failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Wrap a sled error with the operation that produced it
    pub fn store<S: Into<String>>(operation: S, source: sled::Error) -> Self {
        Self::Store {
            operation: operation.into(),
            source,
        }
    }

    pub fn invariant<I: Into<String>, M: Into<String>>(id: I, message: M) -> Self {
        Self::InvariantViolation {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Structural errors abort the operation in progress; the rest are
    /// lifecycle conflicts local to one subtask or parent.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::Store { .. }
                | Self::Serialization(_)
                | Self::Yaml(_)
                | Self::Io(_)
                | Self::Join(_)
                | Self::Internal(_)
        )
    }
}

/// Result type alias for FanoutError
pub type Result<T> = std::result::Result<T, FanoutError>;
