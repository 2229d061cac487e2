/// Per-run progress channel
///
/// Topics are keyed by `flowInstanceId` and backed by `tokio::sync::broadcast`.
/// A topic is opened when a run is launched and removed when it terminates, so
/// subscribers drain whatever is buffered and then see the stream end.

use crate::runtime::context::RunControl;
use crate::workflow::types::{FlowOutcome, RunError, RunProgress, RunStatus, StepRecord};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc};
use tokio::sync::broadcast::{self, error::RecvError};

/// Event pushed to observers of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ProgressEvent {
    /// Status or counter change
    Progress {
        flow_instance_id: String,
        status: RunStatus,
        completed_steps: usize,
        total_steps: usize,
        timestamp: DateTime<Utc>,
    },
    /// A node invocation was recorded
    Step {
        flow_instance_id: String,
        step: StepRecord,
        completed_steps: usize,
        total_steps: usize,
        timestamp: DateTime<Utc>,
    },
    /// The run finished without a failure (completed or cancelled)
    Complete {
        flow_instance_id: String,
        status: RunStatus,
        last_output: Value,
        timestamp: DateTime<Utc>,
    },
    /// The run failed
    Error {
        flow_instance_id: String,
        error: RunError,
        timestamp: DateTime<Utc>,
    },
}

impl ProgressEvent {
    pub fn snapshot(flow_instance_id: &str, progress: &RunProgress) -> Self {
        ProgressEvent::Progress {
            flow_instance_id: flow_instance_id.to_string(),
            status: progress.status,
            completed_steps: progress.completed_steps,
            total_steps: progress.total_steps,
            timestamp: Utc::now(),
        }
    }

    /// Final event for a finished run
    pub fn terminal(outcome: &FlowOutcome) -> Self {
        match (&outcome.status, &outcome.error) {
            (RunStatus::Failed, Some(error)) => ProgressEvent::Error {
                flow_instance_id: outcome.flow_instance_id.clone(),
                error: error.clone(),
                timestamp: outcome.finished_at,
            },
            _ => ProgressEvent::Complete {
                flow_instance_id: outcome.flow_instance_id.clone(),
                status: outcome.status,
                last_output: outcome.last_output.clone(),
                timestamp: outcome.finished_at,
            },
        }
    }

    pub fn flow_instance_id(&self) -> &str {
        match self {
            ProgressEvent::Progress { flow_instance_id, .. }
            | ProgressEvent::Step { flow_instance_id, .. }
            | ProgressEvent::Complete { flow_instance_id, .. }
            | ProgressEvent::Error { flow_instance_id, .. } => flow_instance_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProgressEvent::Complete { .. } | ProgressEvent::Error { .. })
    }

    /// SSE event name
    pub fn kind(&self) -> &'static str {
        match self {
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Step { .. } => "step",
            ProgressEvent::Complete { .. } => "complete",
            ProgressEvent::Error { .. } => "error",
        }
    }
}

/// Publish/subscribe hub for progress events, one topic per run
pub struct ProgressChannel {
    topics: DashMap<String, broadcast::Sender<ProgressEvent>>,
    capacity: usize,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn open(&self, flow_instance_id: &str) {
        self.topics
            .entry(flow_instance_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Send to current subscribers; events for closed topics are dropped
    pub fn publish(&self, event: ProgressEvent) {
        if let Some(sender) = self.topics.get(event.flow_instance_id()) {
            // No receivers is fine
            let _ = sender.send(event);
        }
    }

    pub fn subscribe(&self, flow_instance_id: &str) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.topics.get(flow_instance_id).map(|sender| sender.subscribe())
    }

    pub fn close(&self, flow_instance_id: &str) {
        self.topics.remove(flow_instance_id);
    }

    pub fn is_open(&self, flow_instance_id: &str) -> bool {
        self.topics.contains_key(flow_instance_id)
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Observer view of one run's events
///
/// Yields a leading progress snapshot, then live events, and always ends with
/// exactly one terminal event. Lagging subscribers skip what they missed.
pub struct ProgressStream {
    backlog: VecDeque<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    control: Arc<RunControl>,
    finished: bool,
}

impl ProgressStream {
    pub(crate) fn new(control: Arc<RunControl>, channel: &ProgressChannel) -> Self {
        // Subscribe before snapshotting so nothing between the two is lost
        let receiver = channel.subscribe(control.flow_instance_id());
        let mut backlog = VecDeque::new();
        backlog.push_back(ProgressEvent::snapshot(control.flow_instance_id(), &control.progress()));
        Self {
            backlog,
            receiver,
            control,
            finished: false,
        }
    }

    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }
        if self.finished {
            return None;
        }

        if let Some(receiver) = self.receiver.as_mut() {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.is_terminal() {
                            self.finished = true;
                            self.receiver = None;
                        }
                        return Some(event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            "⏭️ Progress subscriber for {} lagged by {} events",
                            self.control.flow_instance_id(),
                            skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            self.receiver = None;
        }

        // Topic gone before we saw the terminal event: synthesize it
        self.finished = true;
        self.control.outcome().map(|outcome| ProgressEvent::terminal(&outcome))
    }

    /// Adapt into a `futures::Stream`
    pub fn into_stream(self) -> impl futures::Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            let event = stream.next().await?;
            Some((event, stream))
        })
    }
}
