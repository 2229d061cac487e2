/// Run manager: directory of the runs this process knows about
///
/// Lifecycle operations (start, pause, resume, cancel, status, progress) work
/// the same whether a run was started directly or through the job queue.
/// The manager only holds each run's `RunControl`; the interpreter task owns
/// the flow instance itself. Operations on terminal runs are no-ops.
///
/// A queued run may be claimed by a worker in another process. Its entry here
/// then stays `queued` until it is reconciled with the execution record that
/// worker writes, either on `refresh` or by the background watch started at
/// enqueue time.

use crate::config::RunConfig;
use crate::error::{EngineError, EngineResult};
use crate::queue::{JobQueue, RunJob};
use crate::runtime::context::{FlowState, RunControl};
use crate::runtime::engine::FlowInterpreter;
use crate::runtime::events::{ProgressChannel, ProgressStream};
use crate::runtime::suspension::SuspensionHub;
use crate::workflow::graph::{parse_graph, validate};
use crate::workflow::registry::{NodeRegistry, Scope};
use crate::workflow::storage::{ExecutionRecord, ExecutionRecordStore};
use crate::workflow::types::{FlowOutcome, NodeRef, RunProgress, RunStatus};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
struct RunEntry {
    control: Arc<RunControl>,
    created_at: DateTime<Utc>,
    workflow_id: Option<String>,
    /// Queue attempt that created the current control (0 for direct runs)
    attempt: u32,
}

/// Directory listing entry
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub flow_instance_id: String,
    pub workflow_id: Option<String>,
    pub status: RunStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub created_at: DateTime<Utc>,
}

pub struct RunManager {
    registry: Arc<NodeRegistry>,
    hub: Arc<SuspensionHub>,
    events: Arc<ProgressChannel>,
    queue: Option<Arc<dyn JobQueue>>,
    records: Option<Arc<dyn ExecutionRecordStore>>,
    runs: Arc<DashMap<String, RunEntry>>,
    retention: Duration,
}

/// Floor for the queued-entry watch so a zero retention does not spin
const MIN_RECONCILE_INTERVAL: Duration = Duration::from_millis(500);

impl RunManager {
    pub fn new(registry: Arc<NodeRegistry>, hub: Arc<SuspensionHub>, config: &RunConfig) -> Self {
        Self {
            registry,
            hub,
            events: Arc::new(ProgressChannel::new(config.event_buffer)),
            queue: None,
            records: None,
            runs: Arc::new(DashMap::new()),
            retention: config.retention(),
        }
    }

    /// Enable queued mode
    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Where workers (in any process) write execution records; used to
    /// reconcile queued entries that another process ran
    pub fn with_records(mut self, records: Arc<dyn ExecutionRecordStore>) -> Self {
        self.records = Some(records);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<SuspensionHub> {
        &self.hub
    }

    pub fn events(&self) -> &Arc<ProgressChannel> {
        &self.events
    }

    pub fn has_queue(&self) -> bool {
        self.queue.is_some()
    }

    /// Start a run in this process and return its id immediately
    pub fn start(&self, nodes: Vec<NodeRef>, initial_state: Map<String, Value>) -> EngineResult<String> {
        let scope = self.registry.scope();
        validate(&nodes, &scope)?;

        let flow_instance_id = uuid::Uuid::new_v4().to_string();
        let control = self.new_control(&flow_instance_id, initial_state, RunStatus::Running);
        self.runs.insert(
            flow_instance_id.clone(),
            RunEntry {
                control: Arc::clone(&control),
                created_at: Utc::now(),
                workflow_id: None,
                attempt: 0,
            },
        );
        self.drive(control, nodes, scope);
        Ok(flow_instance_id)
    }

    /// Start a run from a JSON graph
    pub fn start_graph(&self, nodes: &Value, initial_state: Map<String, Value>) -> EngineResult<String> {
        let nodes = parse_graph(nodes, &self.registry.scope())?;
        self.start(nodes, initial_state)
    }

    /// Queued mode: write a durable job and track the run as `queued`
    pub async fn enqueue(
        &self,
        nodes: Value,
        initial_state: Map<String, Value>,
        workflow_id: Option<String>,
    ) -> EngineResult<String> {
        let queue = self.queue.as_ref().ok_or(EngineError::QueueUnavailable)?;
        // Reject bad graphs before they reach a worker
        parse_graph(&nodes, &self.registry.scope())?;

        let flow_instance_id = uuid::Uuid::new_v4().to_string();
        let job = RunJob {
            flow_instance_id: flow_instance_id.clone(),
            workflow_id: workflow_id.clone(),
            nodes,
            initial_state: initial_state.clone(),
        };
        let control = self.new_control(&flow_instance_id, initial_state, RunStatus::Queued);
        self.runs.insert(
            flow_instance_id.clone(),
            RunEntry {
                control: Arc::clone(&control),
                created_at: Utc::now(),
                workflow_id,
                attempt: 0,
            },
        );

        if let Err(e) = queue.enqueue(&job).await {
            self.runs.remove(&flow_instance_id);
            self.events.close(&flow_instance_id);
            return Err(EngineError::Queue(e.to_string()));
        }

        if let Some(records) = &self.records {
            tokio::spawn(watch_queued(
                Arc::clone(&self.runs),
                Arc::clone(records),
                control,
                self.retention,
            ));
        }

        tracing::info!("📥 Queued run {}", flow_instance_id);
        Ok(flow_instance_id)
    }

    /// Drive a queued job. Safe to call once per job attempt.
    ///
    /// Only a queued run, or a failed run seen with a newer attempt, is driven.
    /// Returns `false` when the call was a duplicate.
    pub fn start_job(&self, job: &RunJob, attempt: u32) -> EngineResult<bool> {
        let scope = self.registry.scope();
        let nodes = parse_graph(&job.nodes, &scope)?;

        let control = match self.runs.entry(job.flow_instance_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let status = entry.control.status();
                // Exactly one of this and a concurrent cancel leaves Queued
                if entry.control.transition(RunStatus::Queued, RunStatus::Running) {
                    entry.attempt = attempt;
                    Arc::clone(&entry.control)
                } else if status == RunStatus::Failed && attempt > entry.attempt {
                    let control = self.new_control(&job.flow_instance_id, job.initial_state.clone(), RunStatus::Running);
                    entry.control = Arc::clone(&control);
                    entry.attempt = attempt;
                    control
                } else {
                    tracing::debug!(
                        "⏭️ Run {} already {} for attempt {}, not re-driving",
                        job.flow_instance_id,
                        status,
                        entry.attempt
                    );
                    return Ok(false);
                }
            }
            Entry::Vacant(vacant) => {
                let control = self.new_control(&job.flow_instance_id, job.initial_state.clone(), RunStatus::Running);
                vacant.insert(RunEntry {
                    control: Arc::clone(&control),
                    created_at: Utc::now(),
                    workflow_id: job.workflow_id.clone(),
                    attempt,
                });
                control
            }
        };

        tracing::info!("📦 Driving run {} (attempt {})", job.flow_instance_id, attempt);
        self.drive(control, nodes, scope);
        Ok(true)
    }

    fn new_control(&self, flow_instance_id: &str, initial_state: Map<String, Value>, status: RunStatus) -> Arc<RunControl> {
        self.events.open(flow_instance_id);
        Arc::new(RunControl::new(
            flow_instance_id,
            FlowState::from_map(initial_state),
            status,
            Arc::clone(&self.events),
        ))
    }

    fn drive(&self, control: Arc<RunControl>, nodes: Vec<NodeRef>, scope: Scope) {
        let interpreter = FlowInterpreter::new(scope, Arc::clone(&self.hub), Arc::clone(&control));
        let runs = Arc::clone(&self.runs);
        let retention = self.retention;
        tokio::spawn(async move {
            interpreter.run(nodes).await;
            evict_after(runs, control, retention).await;
        });
    }

    fn control(&self, flow_instance_id: &str) -> EngineResult<Arc<RunControl>> {
        self.runs
            .get(flow_instance_id)
            .map(|entry| Arc::clone(&entry.control))
            .ok_or_else(|| EngineError::not_found("run", flow_instance_id))
    }

    pub fn status(&self, flow_instance_id: &str) -> EngineResult<RunStatus> {
        Ok(self.control(flow_instance_id)?.status())
    }

    pub fn progress(&self, flow_instance_id: &str) -> EngineResult<RunProgress> {
        Ok(self.control(flow_instance_id)?.progress())
    }

    /// Like `progress`, but a run still `queued` here is first checked against
    /// the execution record store in case another process's worker ran it
    pub async fn refresh(&self, flow_instance_id: &str) -> EngineResult<RunProgress> {
        let control = self.control(flow_instance_id)?;
        let Some(records) = &self.records else {
            return Ok(control.progress());
        };
        match reconcile(records.as_ref(), &control).await? {
            Reconciled::Unchanged => Ok(control.progress()),
            Reconciled::Finished => {
                tokio::spawn(evict_after(Arc::clone(&self.runs), Arc::clone(&control), self.retention));
                Ok(control.progress())
            }
            Reconciled::Suspended(progress) => Ok(progress),
        }
    }

    /// Request a pause at the next node boundary
    pub fn pause(&self, flow_instance_id: &str) -> EngineResult<bool> {
        let control = self.control(flow_instance_id)?;
        if control.status().is_terminal() {
            return Ok(false);
        }
        control.request_pause();
        tracing::info!("⏸️ Pause requested for run {}", flow_instance_id);
        Ok(true)
    }

    /// Resume a run: deliver `data` to the node it is parked on, and clear any
    /// external pause. `false` when there was nothing to resume.
    ///
    /// When several nodes are parked (parallel branches), the oldest pause is
    /// resumed; the rest stay parked and can be resumed by calling again or by
    /// pause id through the hub.
    pub fn resume(&self, flow_instance_id: &str, data: Value) -> EngineResult<bool> {
        let control = self.control(flow_instance_id)?;
        if control.status().is_terminal() {
            return Ok(false);
        }

        let parked = control.active_pauses();
        let oldest = self
            .hub
            .list_active_pauses()
            .into_iter()
            .find(|token| token.flow_instance_id == flow_instance_id && parked.contains(&token.pause_id));
        let delivered = oldest
            .map(|token| self.hub.resume(&token.pause_id, data))
            .unwrap_or(false);

        let cleared = control.is_pause_requested();
        if cleared {
            control.clear_pause();
        }

        if delivered || cleared {
            tracing::info!("▶️ Resumed run {}", flow_instance_id);
        }
        Ok(delivered || cleared)
    }

    /// Cancel at the next node boundary and reject any outstanding pause
    ///
    /// A queued run is also cancelled in the job queue so no worker, in this
    /// or another process, claims it later. A job another process has already
    /// claimed is not reached.
    pub async fn cancel(&self, flow_instance_id: &str) -> EngineResult<bool> {
        let control = self.control(flow_instance_id)?;
        if control.status().is_terminal() {
            return Ok(false);
        }

        control.request_cancel();
        let rejected = self.hub.cancel_flow(flow_instance_id);
        tracing::info!("🛑 Cancel requested for run {} ({} pauses rejected)", flow_instance_id, rejected);

        if control.status() == RunStatus::Queued {
            if let Some(queue) = &self.queue {
                let withdrawn = queue
                    .cancel(flow_instance_id)
                    .await
                    .map_err(|e| EngineError::Queue(e.to_string()))?;
                if withdrawn {
                    tracing::info!("🗑️ Withdrew queued job for run {}", flow_instance_id);
                }
            }
        }

        // Nobody is driving a queued run here yet, so finish it ourselves.
        // Losing this race to start_job means the interpreter sees the flag.
        if control.transition(RunStatus::Queued, RunStatus::Cancelled) {
            let now = Utc::now();
            control.finish(FlowOutcome {
                flow_instance_id: flow_instance_id.to_string(),
                status: RunStatus::Cancelled,
                state: control.state_snapshot(),
                steps: Vec::new(),
                last_output: Value::Null,
                error: None,
                started_at: now,
                finished_at: now,
            });
            tokio::spawn(evict_after(Arc::clone(&self.runs), control, self.retention));
        }
        Ok(true)
    }

    /// Live events for one run, starting with a progress snapshot
    pub fn subscribe(&self, flow_instance_id: &str) -> EngineResult<ProgressStream> {
        let control = self.control(flow_instance_id)?;
        Ok(ProgressStream::new(control, &self.events))
    }

    /// Wait until the run's status satisfies `predicate`
    pub async fn wait_for<F>(&self, flow_instance_id: &str, predicate: F) -> EngineResult<RunStatus>
    where
        F: Fn(RunStatus) -> bool,
    {
        let control = self.control(flow_instance_id)?;
        let mut status = control.watch_status();
        let reached = status
            .wait_for(|s| predicate(*s))
            .await
            .map(|s| *s)
            .map_err(|_| EngineError::not_found("run", flow_instance_id));
        reached
    }

    /// Wait for a terminal status and return the outcome
    pub async fn wait(&self, flow_instance_id: &str) -> EngineResult<FlowOutcome> {
        self.wait_for(flow_instance_id, |s| s.is_terminal()).await?;
        self.outcome(flow_instance_id)?
            .ok_or_else(|| EngineError::not_found("outcome", flow_instance_id))
    }

    pub fn outcome(&self, flow_instance_id: &str) -> EngineResult<Option<FlowOutcome>> {
        Ok(self.control(flow_instance_id)?.outcome())
    }

    /// Read-only copy of a run's State
    pub fn state_snapshot(&self, flow_instance_id: &str) -> EngineResult<Map<String, Value>> {
        Ok(self.control(flow_instance_id)?.state_snapshot())
    }

    pub fn list(&self) -> Vec<RunSummary> {
        let mut runs: Vec<RunSummary> = self
            .runs
            .iter()
            .map(|entry| {
                let progress = entry.control.progress();
                RunSummary {
                    flow_instance_id: entry.key().clone(),
                    workflow_id: entry.workflow_id.clone(),
                    status: progress.status,
                    completed_steps: progress.completed_steps,
                    total_steps: progress.total_steps,
                    created_at: entry.created_at,
                }
            })
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

enum Reconciled {
    /// Still queued everywhere we can see, or not queued here at all
    Unchanged,
    /// Another process finished the run; the local control now carries its outcome
    Finished,
    /// Another process's worker left the run parked on a pause
    Suspended(RunProgress),
}

/// Bring a locally queued control in line with the durable record, if any
async fn reconcile(records: &dyn ExecutionRecordStore, control: &RunControl) -> EngineResult<Reconciled> {
    if control.status() != RunStatus::Queued {
        return Ok(Reconciled::Unchanged);
    }
    let record = records
        .get(control.flow_instance_id())
        .await
        .map_err(|e| EngineError::Records(e.to_string()))?;
    let Some(record) = record else {
        return Ok(Reconciled::Unchanged);
    };

    match record.status {
        status if status.is_terminal() => {
            if !control.transition(RunStatus::Queued, status) {
                // Driven or cancelled here in the meantime
                return Ok(Reconciled::Unchanged);
            }
            tracing::info!("🔄 Run {} was {} by another worker", record.flow_instance_id, status);
            control.finish(outcome_from_record(record));
            Ok(Reconciled::Finished)
        }
        RunStatus::Paused => Ok(Reconciled::Suspended(RunProgress {
            status: RunStatus::Paused,
            completed_steps: record.steps.len(),
            total_steps: record.steps.len(),
            last_output: record.steps.last().map(|s| s.output.clone()).unwrap_or(Value::Null),
            error: record.error,
        })),
        _ => Ok(Reconciled::Unchanged),
    }
}

fn outcome_from_record(record: ExecutionRecord) -> FlowOutcome {
    FlowOutcome {
        last_output: record.steps.last().map(|s| s.output.clone()).unwrap_or(Value::Null),
        flow_instance_id: record.flow_instance_id,
        status: record.status,
        state: record.final_state,
        steps: record.steps,
        error: record.error,
        started_at: record.started_at,
        finished_at: record.finished_at.unwrap_or_else(Utc::now),
    }
}

/// Reconcile a queued entry until it leaves `queued`, then let it age out
async fn watch_queued(
    runs: Arc<DashMap<String, RunEntry>>,
    records: Arc<dyn ExecutionRecordStore>,
    control: Arc<RunControl>,
    retention: Duration,
) {
    let interval = retention.max(MIN_RECONCILE_INTERVAL);
    loop {
        tokio::time::sleep(interval).await;
        let tracked = runs
            .get(control.flow_instance_id())
            .map(|entry| Arc::ptr_eq(&entry.control, &control))
            .unwrap_or(false);
        // Runs driven or cancelled here are evicted by those paths
        if !tracked || control.status() != RunStatus::Queued {
            return;
        }
        match reconcile(records.as_ref(), &control).await {
            Ok(Reconciled::Finished) => {
                evict_after(runs, control, retention).await;
                return;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Could not reconcile run {}: {}", control.flow_instance_id(), e),
        }
    }
}

/// Drop a finished run from the directory once its retention elapses
async fn evict_after(runs: Arc<DashMap<String, RunEntry>>, control: Arc<RunControl>, retention: Duration) {
    tokio::time::sleep(retention).await;
    let evicted = runs
        .remove_if(control.flow_instance_id(), |_, entry| Arc::ptr_eq(&entry.control, &control))
        .is_some();
    if evicted {
        tracing::debug!("🧹 Evicted finished run {}", control.flow_instance_id());
    }
}
