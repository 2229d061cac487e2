/// Engine error taxonomy
///
/// Every engine-facing operation returns `EngineError`. Node implementations and
/// storage backends use `anyhow` internally; their faults are turned into these
/// variants (or into step-level error strings) at the engine boundary.

use crate::workflow::types::RunError;
use thiserror::Error;

/// Errors surfaced by the registry, interpreter, suspension hub and run manager
#[derive(Debug, Error)]
pub enum EngineError {
    /// A node definition is missing a required field or is malformed
    #[error("invalid node definition: {0}")]
    InvalidNodeDefinition(String),

    /// A node with the same id is already registered
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    /// A graph references a node id that is not registered
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A pause token with the same id is already outstanding
    #[error("duplicate pause id: {0}")]
    DuplicatePauseId(String),

    /// Unknown run, pause, node or trigger id. Expected, not exceptional.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A node failed while executing (or produced ambiguous edges) and the
    /// run ended `failed`
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// The run (or the suspension a waiter was parked on) was cancelled
    #[error("cancelled")]
    Cancelled,

    /// A graph could not be parsed into node references
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A trigger type with the same name is already registered
    #[error("duplicate trigger type: {0}")]
    DuplicateTriggerType(String),

    /// A trigger could not build initial state from its event
    #[error("trigger transform failed: {0}")]
    Transform(String),

    /// Queued mode was requested but no job queue is configured
    #[error("no job queue configured")]
    QueueUnavailable,

    /// The job queue backend rejected an operation
    #[error("job queue error: {0}")]
    Queue(String),

    /// The execution record store rejected an operation
    #[error("execution record error: {0}")]
    Records(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Cross-process resume channel failure
    #[error("resume bus error: {0}")]
    Bus(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound { kind, id: id.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }
}

impl From<RunError> for EngineError {
    fn from(error: RunError) -> Self {
        EngineError::NodeExecution {
            node_id: error.node_id,
            message: error.message,
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
