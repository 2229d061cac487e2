/// Queue worker
///
/// Claims durable jobs and drives each one through `RunManager::start_job`,
/// the same path immediate runs take. Once the run is terminal the outcome is
/// written to the execution record store and the job is acknowledged. A run
/// that parks on a node-requested pause marks its job `suspended` and is
/// finished in the background when it resumes.

use crate::error::EngineError;
use crate::queue::{ClaimedJob, FailOutcome, JobQueue};
use crate::runtime::manager::RunManager;
use crate::workflow::storage::{ExecutionRecord, ExecutionRecordStore};
use crate::workflow::types::{FlowOutcome, RunStatus};
use anyhow::Result;
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

#[derive(Clone)]
pub struct QueueWorker {
    runs: Arc<RunManager>,
    queue: Arc<dyn JobQueue>,
    records: Arc<dyn ExecutionRecordStore>,
    poll_interval: Duration,
}

impl QueueWorker {
    pub fn new(
        runs: Arc<RunManager>,
        queue: Arc<dyn JobQueue>,
        records: Arc<dyn ExecutionRecordStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runs,
            queue,
            records,
            poll_interval,
        }
    }

    /// Claim and process one job. Returns `false` when the queue was empty.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(claimed) = self.queue.claim().await? else {
            return Ok(false);
        };
        let flow_instance_id = claimed.job.flow_instance_id.clone();
        tracing::info!(
            "📦 Claimed job {} for run {} (attempt {})",
            claimed.id,
            flow_instance_id,
            claimed.attempt
        );

        if let Err(e) = self.runs.start_job(&claimed.job, claimed.attempt) {
            tracing::warn!("⚠️ Job {} could not start: {}", claimed.id, e);
            self.report_failure(claimed.id, &e.to_string()).await?;
            return Ok(true);
        }

        let status = self
            .runs
            .wait_for(&flow_instance_id, |s| s.is_terminal() || s == RunStatus::Paused)
            .await?;

        if status == RunStatus::Paused {
            self.queue.suspend(claimed.id).await?;
            self.save_suspended(&claimed).await?;
            tracing::info!("⏸️ Job {} suspended while run {} waits", claimed.id, flow_instance_id);

            let worker = self.clone();
            tokio::spawn(async move {
                if let Err(e) = worker.finish_when_done(claimed).await {
                    tracing::error!("❌ Failed to finish suspended job: {}", e);
                }
            });
            return Ok(true);
        }

        let outcome = self.runs.wait(&flow_instance_id).await?;
        self.finish(&claimed, outcome).await?;
        Ok(true)
    }

    async fn finish_when_done(&self, claimed: ClaimedJob) -> Result<()> {
        let outcome = self.runs.wait(&claimed.job.flow_instance_id).await?;
        self.finish(&claimed, outcome).await
    }

    /// Persist the outcome, then acknowledge or fail the job
    async fn finish(&self, claimed: &ClaimedJob, outcome: FlowOutcome) -> Result<()> {
        let record = ExecutionRecord::from_outcome(&outcome, claimed.job.workflow_id.clone());
        self.records.save(&record).await?;

        let flow_instance_id = outcome.flow_instance_id.clone();
        match outcome.into_result() {
            Err(e @ EngineError::NodeExecution { .. }) => {
                self.report_failure(claimed.id, &e.to_string()).await?;
            }
            // Cancelled runs are acknowledged, not retried
            result => {
                let status = result.map(|o| o.status).unwrap_or(RunStatus::Cancelled);
                self.queue.complete(claimed.id).await?;
                tracing::info!("✅ Job {} done (run {} {})", claimed.id, flow_instance_id, status);
            }
        }
        Ok(())
    }

    async fn report_failure(&self, job_id: i64, message: &str) -> Result<()> {
        match self.queue.fail(job_id, message).await? {
            FailOutcome::Retry => tracing::warn!("🔁 Job {} failed, will retry: {}", job_id, message),
            FailOutcome::Dead => tracing::error!("💀 Job {} failed permanently: {}", job_id, message),
        }
        Ok(())
    }

    /// Record where a suspended run stands so it is visible outside this process
    async fn save_suspended(&self, claimed: &ClaimedJob) -> Result<()> {
        let flow_instance_id = &claimed.job.flow_instance_id;
        let progress = self.runs.progress(flow_instance_id)?;
        let record = ExecutionRecord {
            flow_instance_id: flow_instance_id.clone(),
            workflow_id: claimed.job.workflow_id.clone(),
            status: progress.status,
            steps: Vec::new(),
            final_state: self.runs.state_snapshot(flow_instance_id)?,
            error: progress.error,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.records.save(&record).await
    }

    /// Poll until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("👷 Queue worker started (poll every {:?})", self.poll_interval);
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                // More work may be waiting
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => tracing::error!("❌ Queue worker error: {:#}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("👷 Queue worker stopped");
    }
}
