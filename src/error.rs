//! Error types for the engine.
//!
//! Node-level failures never escape `run()`: they are captured as
//! [`FailureInfo`](crate::model::FailureInfo) and routed through the adviser
//! chain. The variants here are what callers of the public API can observe.

use std::fmt;

/// Errors that can occur while validating plans, correlating results,
/// dispatching tasks or persisting engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The plan is malformed and was rejected before execution started.
    Validation(String),

    /// A wait correlation was registered under a key that already exists.
    DuplicateKey(String),

    /// A worker lost the race to acquire a task.
    AlreadyAcquired {
        /// The contested task
        task_id: String,
        /// The worker that tried and lost
        worker_id: String,
    },

    /// A deadline fired before a result arrived.
    Timeout(String),

    /// User step logic failed.
    StepExecution(String),

    /// The requested record does not exist.
    NotFound(String),

    /// A status transition was requested from a state that does not allow it.
    InvalidTransition(String),

    /// The persistence collaborator failed.
    Persistence(String),

    /// Unexpected failure inside the engine itself.
    Internal(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Invalid plan: {}", msg),
            Self::DuplicateKey(key) => write!(f, "Resume key already registered: {}", key),
            Self::AlreadyAcquired { task_id, worker_id } => write!(
                f,
                "Task {} was already acquired (worker {} lost the race)",
                task_id, worker_id
            ),
            Self::Timeout(msg) => write!(f, "Timed out: {}", msg),
            Self::StepExecution(msg) => write!(f, "Step execution failed: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::InvalidTransition(msg) => write!(f, "Invalid transition: {}", msg),
            Self::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Self::Internal(msg) => write!(f, "Internal engine error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("serialization: {}", err))
    }
}

impl From<surrealdb::Error> for EngineError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl EngineError {
    /// Race losses are expected traffic, not failures worth an error log.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::AlreadyAcquired { .. })
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
