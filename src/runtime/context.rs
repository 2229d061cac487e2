/// Run state shared between the interpreter, its nodes and the run manager
///
/// `FlowState` is the per-run key/value store. `RunControl` carries the
/// cooperative pause/cancel flags, status and counters that observers read.
/// `NodeContext` is what a node implementation sees while it executes.

use crate::error::{EngineError, EngineResult};
use crate::runtime::events::{ProgressChannel, ProgressEvent};
use crate::runtime::suspension::{PauseSignal, SuspensionHub};
use crate::workflow::types::{FlowOutcome, RunError, RunProgress, RunStatus, StepRecord};
use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};
use tokio::sync::{futures::Notified, watch, Notify};

/// Key/value State of one flow instance
#[derive(Clone, Default)]
pub struct FlowState {
    inner: Arc<DashMap<String, Value>>,
}

impl FlowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        let state = Self::new();
        state.merge(map);
        state
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.get(key).map(|entry| entry.value().clone())
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Shallow merge: top-level keys of `map` overwrite existing ones
    pub fn merge(&self, map: Map<String, Value>) {
        for (key, value) in map {
            self.inner.insert(key, value);
        }
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Independent copy that shares nothing with `self`
    pub fn fork(&self) -> FlowState {
        FlowState::from_map(self.snapshot())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Control block of one run
///
/// Written by the interpreter (status, counters, outcome) and by the run
/// manager (pause/cancel flags). Terminal status is sticky.
pub struct RunControl {
    flow_instance_id: String,
    status: watch::Sender<RunStatus>,
    pause_requested: AtomicBool,
    cancel_requested: AtomicBool,
    wake: Notify,
    /// Node-requested suspensions the run is parked on; several under `$parallel`
    active_pauses: Mutex<BTreeSet<String>>,
    finished: AtomicBool,
    completed_steps: AtomicUsize,
    total_steps: AtomicUsize,
    last_output: ArcSwap<Value>,
    error: ArcSwapOption<RunError>,
    outcome: ArcSwapOption<FlowOutcome>,
    state: FlowState,
    events: Arc<ProgressChannel>,
    started_at: DateTime<Utc>,
}

impl RunControl {
    pub fn new(
        flow_instance_id: impl Into<String>,
        state: FlowState,
        status: RunStatus,
        events: Arc<ProgressChannel>,
    ) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            flow_instance_id: flow_instance_id.into(),
            status,
            pause_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            wake: Notify::new(),
            active_pauses: Mutex::new(BTreeSet::new()),
            finished: AtomicBool::new(false),
            completed_steps: AtomicUsize::new(0),
            total_steps: AtomicUsize::new(0),
            last_output: ArcSwap::from_pointee(Value::Null),
            error: ArcSwapOption::empty(),
            outcome: ArcSwapOption::empty(),
            state,
            events,
            started_at: Utc::now(),
        }
    }

    pub fn flow_instance_id(&self) -> &str {
        &self.flow_instance_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Move to `status` unless the run already reached a terminal one.
    /// Returns whether the status changed.
    pub fn set_status(&self, status: RunStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if current.is_terminal() || *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            self.events
                .publish(ProgressEvent::snapshot(&self.flow_instance_id, &self.progress()));
        }
        changed
    }

    /// Move from `from` to `to` only if the run is still in `from`
    pub fn transition(&self, from: RunStatus, to: RunStatus) -> bool {
        let changed = self.status.send_if_modified(|current| {
            if *current != from || from == to {
                return false;
            }
            *current = to;
            true
        });
        if changed {
            self.events
                .publish(ProgressEvent::snapshot(&self.flow_instance_id, &self.progress()));
        }
        changed
    }

    /// Report Running, unless a node is still parked on a pause
    pub fn mark_running(&self) -> bool {
        let pauses = self.pauses();
        if !pauses.is_empty() {
            return false;
        }
        self.set_status(RunStatus::Running)
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Wake-up future for pause/cancel changes.
    /// Create it before checking the flags so no notification is missed.
    pub fn notified(&self) -> Notified<'_> {
        self.wake.notified()
    }

    fn pauses(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.active_pauses.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that a node parked on `pause_id` and report the run Paused
    pub fn enter_pause(&self, pause_id: &str) {
        let mut pauses = self.pauses();
        pauses.insert(pause_id.to_string());
        self.set_status(RunStatus::Paused);
    }

    /// Forget `pause_id`. The run reads Running again once no pause remains.
    /// Returns how many pauses are still outstanding.
    pub fn leave_pause(&self, pause_id: &str) -> usize {
        let mut pauses = self.pauses();
        pauses.remove(pause_id);
        if pauses.is_empty() && !self.is_cancelled() {
            self.set_status(RunStatus::Running);
        }
        pauses.len()
    }

    /// Pause ids of the node-requested suspensions the run is parked on
    pub fn active_pauses(&self) -> Vec<String> {
        self.pauses().iter().cloned().collect()
    }

    pub fn add_total_steps(&self, count: usize) {
        if count > 0 {
            self.total_steps.fetch_add(count, Ordering::SeqCst);
        }
    }

    /// Count a recorded step and publish it
    pub fn record_step(&self, step: &StepRecord) {
        let completed = self.completed_steps.fetch_add(1, Ordering::SeqCst) + 1;
        self.last_output.store(Arc::new(step.output.clone()));
        self.events.publish(ProgressEvent::Step {
            flow_instance_id: self.flow_instance_id.clone(),
            step: step.clone(),
            completed_steps: completed,
            total_steps: self.total_steps.load(Ordering::SeqCst).max(completed),
            timestamp: Utc::now(),
        });
    }

    pub fn set_last_output(&self, output: Value) {
        self.last_output.store(Arc::new(output));
    }

    pub fn set_error(&self, error: RunError) {
        self.error.store(Some(Arc::new(error)));
    }

    pub fn progress(&self) -> RunProgress {
        let completed_steps = self.completed_steps.load(Ordering::SeqCst);
        RunProgress {
            status: self.status(),
            completed_steps,
            // Never report fewer planned steps than already completed
            total_steps: self.total_steps.load(Ordering::SeqCst).max(completed_steps),
            last_output: (**self.last_output.load()).clone(),
            error: self.error.load_full().map(|e| (*e).clone()),
        }
    }

    pub fn state_snapshot(&self) -> Map<String, Value> {
        self.state.snapshot()
    }

    pub(crate) fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn outcome(&self) -> Option<FlowOutcome> {
        self.outcome.load_full().map(|o| (*o).clone())
    }

    /// Store the outcome, publish the terminal event and close the topic.
    /// Only the first call wins; later ones return `false` and change nothing.
    pub(crate) fn finish(&self, outcome: FlowOutcome) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            tracing::debug!("⏭️ Run {} already finished, keeping first outcome", self.flow_instance_id);
            return false;
        }
        let status = outcome.status;
        // Outcomes adopted from a durable record never went through record_step
        self.completed_steps.fetch_max(outcome.steps.len(), Ordering::SeqCst);
        self.total_steps.fetch_max(outcome.steps.len(), Ordering::SeqCst);
        if let Some(error) = outcome.error.clone() {
            self.set_error(error);
        }
        self.last_output.store(Arc::new(outcome.last_output.clone()));
        let event = ProgressEvent::terminal(&outcome);
        self.outcome.store(Some(Arc::new(outcome)));
        self.pauses().clear();

        self.status.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = status;
            true
        });
        self.events.publish(event);
        self.events.close(&self.flow_instance_id);
        true
    }
}

/// Execution context handed to a node implementation
#[derive(Clone)]
pub struct NodeContext {
    node_id: String,
    input: Value,
    state: FlowState,
    hub: Arc<SuspensionHub>,
    control: Arc<RunControl>,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<String>,
        input: Value,
        state: FlowState,
        hub: Arc<SuspensionHub>,
        control: Arc<RunControl>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            input,
            state,
            hub,
            control,
        }
    }

    pub fn flow_instance_id(&self) -> &str {
        self.control.flow_instance_id()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Value handed over by the branch that led here (null at top level)
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.state.set(key, value);
    }

    pub fn state_snapshot(&self) -> Map<String, Value> {
        self.state.snapshot()
    }

    pub fn hub(&self) -> &Arc<SuspensionHub> {
        &self.hub
    }

    /// Park this run until `pause_id` is resumed
    ///
    /// Returns exactly the resume payload, or `Cancelled` when the token (or the
    /// whole run) is cancelled first.
    pub async fn request_pause(&self, pause_id: impl Into<String>, details: Value) -> EngineResult<Value> {
        let pause_id = pause_id.into();
        if self.control.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let handle = self
            .hub
            .request_pause(&pause_id, self.flow_instance_id(), details)?;
        // A cancel that raced the registration has already swept the hub
        if self.control.is_cancelled() {
            self.hub.cancel(&pause_id);
        }

        self.control.enter_pause(&pause_id);
        tracing::info!("⏸️ Run {} waiting on pause '{}'", self.flow_instance_id(), pause_id);

        let signal = handle.await;
        let remaining = self.control.leave_pause(&pause_id);
        match signal {
            PauseSignal::Resumed(data) => {
                tracing::info!(
                    "▶️ Run {} resumed from pause '{}' ({} still parked)",
                    self.flow_instance_id(),
                    pause_id,
                    remaining
                );
                Ok(data)
            }
            PauseSignal::Cancelled => {
                tracing::info!("🛑 Pause '{}' of run {} was cancelled", pause_id, self.flow_instance_id());
                Err(EngineError::Cancelled)
            }
        }
    }
}
