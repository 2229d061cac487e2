/// Cross-process resume channel
///
/// When a resume request finds no local pause token it is broadcast here;
/// every process's suspension hub subscribes and retries locally. Two
/// transports: an in-process broadcast (tests, single node) and PostgreSQL
/// LISTEN/NOTIFY.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_postgres::{AsyncMessage, NoTls};

/// NOTIFY payloads above this size are rejected by PostgreSQL
const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Broadcast resume request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMessage {
    pub pause_id: String,
    #[serde(default)]
    pub resume_data: Value,
    /// Id of the hub that broadcast the message
    #[serde(default)]
    pub origin: String,
}

#[async_trait]
pub trait ResumeBus: Send + Sync {
    async fn publish(&self, message: &ResumeMessage) -> EngineResult<()>;

    /// Start receiving every message published after this call
    async fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<ResumeMessage>>;
}

/// In-process bus. Hubs sharing one instance behave like separate processes.
pub struct LocalResumeBus {
    sender: broadcast::Sender<ResumeMessage>,
}

impl LocalResumeBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl Default for LocalResumeBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResumeBus for LocalResumeBus {
    async fn publish(&self, message: &ResumeMessage) -> EngineResult<()> {
        // No subscribers just means nobody can resolve it
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<ResumeMessage>> {
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("⚠️ Resume subscriber lagged, {} messages dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}

/// PostgreSQL LISTEN/NOTIFY bus
pub struct PgResumeBus {
    url: String,
    channel: String,
    client: tokio_postgres::Client,
}

fn bus_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Bus(e.to_string())
}

impl PgResumeBus {
    /// Open the publishing connection
    pub async fn connect(url: &str, channel: &str) -> EngineResult<Self> {
        if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(EngineError::Bus(format!("invalid NOTIFY channel name '{}'", channel)));
        }

        let (client, connection) = tokio_postgres::connect(url, NoTls).await.map_err(bus_error)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("❌ Resume bus connection closed: {}", e);
            }
        });

        tracing::info!("📡 Resume bus connected (channel '{}')", channel);
        Ok(Self {
            url: url.to_string(),
            channel: channel.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ResumeBus for PgResumeBus {
    async fn publish(&self, message: &ResumeMessage) -> EngineResult<()> {
        let payload = serde_json::to_string(message)?;
        if payload.len() > MAX_NOTIFY_PAYLOAD {
            return Err(EngineError::Bus(format!(
                "resume payload for '{}' is {} bytes, NOTIFY allows {}",
                message.pause_id,
                payload.len(),
                MAX_NOTIFY_PAYLOAD
            )));
        }

        self.client
            .execute("SELECT pg_notify($1, $2)", &[&self.channel, &payload])
            .await
            .map_err(bus_error)?;
        tracing::debug!("📤 Broadcast resume for pause '{}'", message.pause_id);
        Ok(())
    }

    /// Each subscriber gets its own LISTEN connection
    async fn subscribe(&self) -> EngineResult<mpsc::UnboundedReceiver<ResumeMessage>> {
        let (client, mut connection) = tokio_postgres::connect(&self.url, NoTls).await.map_err(bus_error)?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Notifications only arrive while the connection is polled as a message stream
        let forward = tx.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) if notification.channel() == channel => {
                        match serde_json::from_str::<ResumeMessage>(notification.payload()) {
                            Ok(message) => {
                                if forward.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("⚠️ Ignoring malformed resume message: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("❌ Resume listener connection failed: {}", e);
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN {}", self.channel))
            .await
            .map_err(bus_error)?;

        // Keep the listening client alive for as long as someone reads
        tokio::spawn(async move {
            tx.closed().await;
            drop(client);
        });

        tracing::info!("👂 Listening for resume messages on '{}'", self.channel);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_bus_fans_out_to_every_subscriber() {
        let bus = LocalResumeBus::new();
        let mut a = bus.subscribe().await.unwrap();
        let mut b = bus.subscribe().await.unwrap();

        let message = ResumeMessage {
            pause_id: "p1".to_string(),
            resume_data: json!({"approved": true}),
            origin: "hub-a".to_string(),
        };
        bus.publish(&message).await.unwrap();

        assert_eq!(a.recv().await, Some(message.clone()));
        assert_eq!(b.recv().await, Some(message));
    }

    #[test]
    fn message_wire_form_is_camel_case() {
        let message: ResumeMessage = serde_json::from_value(json!({"pauseId": "p", "resumeData": 1})).unwrap();
        assert_eq!(message.pause_id, "p");
        assert_eq!(message.origin, "");
    }
}
