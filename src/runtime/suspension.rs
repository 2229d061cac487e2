/// Suspension hub: process-wide pause/resume broker
///
/// Node-requested pauses park on a oneshot continuation keyed by `pauseId`.
/// Resolution removes the key from a `DashMap`, so register, resume and cancel
/// interleave safely and each token is resolved at most once. Resumes that
/// find no local token can be broadcast on a `ResumeBus` for other processes.

use crate::error::{EngineError, EngineResult};
use crate::runtime::bus::{LocalResumeBus, ResumeBus, ResumeMessage};
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{sync::oneshot, task::JoinHandle};

/// Summary of an outstanding pause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseToken {
    pub pause_id: String,
    pub flow_instance_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

/// How a pause ended
#[derive(Debug, Clone, PartialEq)]
pub enum PauseSignal {
    Resumed(Value),
    Cancelled,
}

/// Where a resume request ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeDelivery {
    /// A local waiter received the data
    Local,
    /// No local token; the request went out on the bus
    Broadcast,
}

struct PendingPause {
    token: PauseToken,
    sender: oneshot::Sender<PauseSignal>,
}

/// Awaitable continuation of a registered pause
///
/// Resolves to `Cancelled` if the hub drops the token without resuming it.
pub struct PauseHandle {
    pause_id: String,
    receiver: oneshot::Receiver<PauseSignal>,
}

impl PauseHandle {
    pub fn pause_id(&self) -> &str {
        &self.pause_id
    }
}

impl Future for PauseHandle {
    type Output = PauseSignal;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(PauseSignal::Cancelled))
    }
}

pub struct SuspensionHub {
    pauses: DashMap<String, PendingPause>,
    bus: Arc<dyn ResumeBus>,
    origin: String,
}

impl SuspensionHub {
    pub fn new(bus: Arc<dyn ResumeBus>) -> Self {
        Self {
            pauses: DashMap::new(),
            bus,
            origin: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Hub with a private in-process bus
    pub fn local() -> Self {
        Self::new(Arc::new(LocalResumeBus::new()))
    }

    /// Unique id of this hub on the bus
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Register a pause token. Fails with `DuplicatePauseId` if one is outstanding.
    pub fn request_pause(
        &self,
        pause_id: &str,
        flow_instance_id: &str,
        details: Value,
    ) -> EngineResult<PauseHandle> {
        match self.pauses.entry(pause_id.to_string()) {
            Entry::Occupied(_) => Err(EngineError::DuplicatePauseId(pause_id.to_string())),
            Entry::Vacant(slot) => {
                let (sender, receiver) = oneshot::channel();
                slot.insert(PendingPause {
                    token: PauseToken {
                        pause_id: pause_id.to_string(),
                        flow_instance_id: flow_instance_id.to_string(),
                        details,
                        created_at: Utc::now(),
                    },
                    sender,
                });
                tracing::debug!("⏸️ Registered pause '{}' for run {}", pause_id, flow_instance_id);
                Ok(PauseHandle {
                    pause_id: pause_id.to_string(),
                    receiver,
                })
            }
        }
    }

    /// Deliver `data` to a local waiter. `false` means no live local token.
    pub fn resume(&self, pause_id: &str, data: Value) -> bool {
        let Some((_, pending)) = self.pauses.remove(pause_id) else {
            return false;
        };
        let delivered = pending.sender.send(PauseSignal::Resumed(data)).is_ok();
        if delivered {
            tracing::info!("▶️ Resumed pause '{}' of run {}", pause_id, pending.token.flow_instance_id);
        }
        delivered
    }

    /// Resume locally, or hand the request to every other process
    pub async fn resume_or_broadcast(&self, pause_id: &str, data: Value) -> EngineResult<ResumeDelivery> {
        if self.resume(pause_id, data.clone()) {
            return Ok(ResumeDelivery::Local);
        }

        self.bus
            .publish(&ResumeMessage {
                pause_id: pause_id.to_string(),
                resume_data: data,
                origin: self.origin.clone(),
            })
            .await?;
        tracing::debug!("📤 No local token for pause '{}', broadcast resume", pause_id);
        Ok(ResumeDelivery::Broadcast)
    }

    /// Reject one waiter with `Cancelled`
    pub fn cancel(&self, pause_id: &str) -> bool {
        match self.pauses.remove(pause_id) {
            Some((_, pending)) => {
                let _ = pending.sender.send(PauseSignal::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Reject every waiter of one run. Returns how many were cancelled.
    pub fn cancel_flow(&self, flow_instance_id: &str) -> usize {
        let ids: Vec<String> = self
            .pauses
            .iter()
            .filter(|entry| entry.value().token.flow_instance_id == flow_instance_id)
            .map(|entry| entry.key().clone())
            .collect();

        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn list_active_pauses(&self) -> Vec<PauseToken> {
        let mut tokens: Vec<PauseToken> = self.pauses.iter().map(|entry| entry.value().token.clone()).collect();
        tokens.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.pause_id.cmp(&b.pause_id)));
        tokens
    }

    pub fn is_pending(&self, pause_id: &str) -> bool {
        self.pauses.contains_key(pause_id)
    }

    /// Apply resume messages broadcast by other hubs
    pub async fn listen(self: Arc<Self>) -> EngineResult<JoinHandle<()>> {
        let mut messages = self.bus.subscribe().await?;
        let hub = self;
        Ok(tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                // Our own broadcasts were already tried locally
                if message.origin == hub.origin {
                    continue;
                }
                if hub.resume(&message.pause_id, message.resume_data) {
                    tracing::info!("📥 Applied remote resume for pause '{}'", message.pause_id);
                }
            }
            tracing::debug!("👂 Resume listener for hub {} stopped", hub.origin);
        }))
    }
}

impl Default for SuspensionHub {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resume_succeeds_exactly_once() {
        let hub = SuspensionHub::local();
        let handle = hub.request_pause("p1", "run", json!({"ask": "approve?"})).unwrap();

        assert!(hub.resume("p1", json!("X")));
        assert!(!hub.resume("p1", json!("Y")));
        assert_eq!(handle.await, PauseSignal::Resumed(json!("X")));
    }

    #[tokio::test]
    async fn duplicate_pause_id_is_rejected() {
        let hub = SuspensionHub::local();
        let _handle = hub.request_pause("p1", "run", Value::Null).unwrap();
        assert!(matches!(
            hub.request_pause("p1", "other", Value::Null),
            Err(EngineError::DuplicatePauseId(id)) if id == "p1"
        ));
    }

    #[tokio::test]
    async fn cancel_rejects_and_later_resume_fails() {
        let hub = SuspensionHub::local();
        let handle = hub.request_pause("p1", "run", Value::Null).unwrap();

        assert!(hub.cancel("p1"));
        assert!(!hub.resume("p1", json!("late")));
        assert_eq!(handle.await, PauseSignal::Cancelled);
    }

    #[tokio::test]
    async fn cancel_flow_only_touches_that_run() {
        let hub = SuspensionHub::local();
        let a = hub.request_pause("a", "run-1", Value::Null).unwrap();
        let _b = hub.request_pause("b", "run-2", Value::Null).unwrap();

        assert_eq!(hub.cancel_flow("run-1"), 1);
        assert_eq!(a.await, PauseSignal::Cancelled);
        let active: Vec<_> = hub.list_active_pauses().into_iter().map(|t| t.pause_id).collect();
        assert_eq!(active, vec!["b"]);
    }

    #[tokio::test]
    async fn resume_reaches_another_hub_over_the_bus() {
        let bus: Arc<dyn ResumeBus> = Arc::new(LocalResumeBus::new());
        let owner = Arc::new(SuspensionHub::new(Arc::clone(&bus)));
        let caller = SuspensionHub::new(bus);
        let _listener = Arc::clone(&owner).listen().await.unwrap();

        let handle = owner.request_pause("p1", "run", Value::Null).unwrap();
        let delivery = caller.resume_or_broadcast("p1", json!({"ok": true})).await.unwrap();

        assert_eq!(delivery, ResumeDelivery::Broadcast);
        assert_eq!(handle.await, PauseSignal::Resumed(json!({"ok": true})));
        assert!(!owner.is_pending("p1"));
    }
}
