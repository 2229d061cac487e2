/// Mechaflow: suspendable workflow execution engine
///
/// This library runs JSON node graphs with edge branching, lets nodes suspend
/// a run until an external resume (possibly delivered from another process),
/// dispatches runs through a durable job queue and streams per-run progress.

// Core configuration and setup
pub mod config;

// Engine error taxonomy
pub mod error;

// Node definitions, registry, graph parsing and execution records
pub mod workflow;

// Runtime execution engine - interpreter, suspension, runs and triggers
pub mod runtime;

// Durable job queue and worker
pub mod queue;

// HTTP API layer - run control, progress SSE, triggers and webhooks
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use error::{EngineError, EngineResult};
pub use runtime::{RunManager, SuspensionHub, TriggerManager};
pub use server::start_server;
pub use workflow::{NodeDefinition, NodeOutput, NodeRef, NodeRegistry, RunStatus};
