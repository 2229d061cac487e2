/// Workflow Definition Layer
///
/// This module holds everything a run is built from and leaves behind:
/// - Type definitions (NodeDefinition, NodeRef, NodeOutput, run records)
/// - Lock-free node registry using ArcSwap
/// - JSON graph parsing against a registry scope
/// - SQLite persistence of execution records with sqlx

// Core workflow type definitions
pub mod types;

// Node registry with atomic snapshot scopes
pub mod registry;

// JSON wire form of node graphs
pub mod graph;

// SQLite persistence layer for execution records
pub mod storage;

// Re-export commonly used types
pub use registry::{NodeRegistry, Scope};
pub use storage::{ExecutionRecord, ExecutionRecordStore, SqliteExecutionRecordStore};
pub use types::{
    node_fn, FlowOutcome, NodeDefinition, NodeImplementation, NodeOutput, NodeRef, RunError, RunProgress,
    RunStatus, StepRecord,
};
