/// Runtime Execution Engine
///
/// This module runs node graphs and manages their lifecycle. It handles:
/// - Interpreting node lists with edge branching and parallel fan-out
/// - Node-requested suspension via the suspension hub and resume bus
/// - Per-run progress events
/// - The run directory (start/pause/resume/cancel/status)
/// - Trigger types and their cron source

// Per-run State, control flags and node context
pub mod context;

// Flow interpreter
pub mod engine;

// Progress channel and streams
pub mod events;

// Cross-process resume channel
pub mod bus;

// Pause/resume broker
pub mod suspension;

// Run directory
pub mod manager;

// External event types -> runs
pub mod triggers;

// Built-in node implementations
pub mod executor;

// Background cron trigger source
pub mod scheduler;

// Re-export main types
pub use bus::{LocalResumeBus, PgResumeBus, ResumeBus, ResumeMessage};
pub use context::{FlowState, NodeContext, RunControl};
pub use engine::FlowInterpreter;
pub use events::{ProgressChannel, ProgressEvent, ProgressStream};
pub use executor::register_builtin_nodes;
pub use manager::{RunManager, RunSummary};
pub use scheduler::CronTriggerSource;
pub use suspension::{PauseHandle, PauseSignal, PauseToken, ResumeDelivery, SuspensionHub};
pub use triggers::{StateTransform, TriggerHandler, TriggerManager, TriggerMode};
