/// Durable Job Queue Integration
///
/// Queued-mode runs are written as jobs, claimed by a worker (possibly in a
/// different process) and driven through the same `RunManager` path as
/// immediate runs. Retries follow the queue's bounded attempt policy.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// SQLite implementation of the queue
pub mod store;

// Polling worker that drives claimed jobs
pub mod worker;

pub use store::SqliteJobQueue;
pub use worker::QueueWorker;

/// Durable run request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    /// Assigned at enqueue time so callers can track the run before it starts
    pub flow_instance_id: String,
    pub workflow_id: Option<String>,
    /// Graph in its JSON wire form
    pub nodes: Value,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
}

/// A job handed to exactly one worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub job: RunJob,
    /// 1-based attempt number
    pub attempt: u32,
}

/// What happened to a failed job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back in the queue for another attempt
    Retry,
    /// Out of attempts
    Dead,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &RunJob) -> Result<i64>;

    /// Atomically take the oldest queued job and bump its attempt count
    async fn claim(&self) -> Result<Option<ClaimedJob>>;

    async fn complete(&self, id: i64) -> Result<()>;

    async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome>;

    /// Park a job whose run is waiting on a node-requested pause
    async fn suspend(&self, id: i64) -> Result<()>;

    /// Withdraw a run's job while it is still queued so it is never claimed.
    /// Returns `false` when no queued job was left to withdraw.
    async fn cancel(&self, flow_instance_id: &str) -> Result<bool>;
}
