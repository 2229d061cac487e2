/// HTTP API Layer
///
/// Thin transport over the engine. It handles:
/// - Run submission and control (pause/resume/cancel, status, SSE progress)
/// - Pause tokens and node catalog listing
/// - Trigger registration and webhook events

use crate::error::EngineError;
use crate::runtime::{manager::RunManager, scheduler::CronTriggerSource, triggers::TriggerManager};
use crate::workflow::storage::ExecutionRecordStore;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

// Run lifecycle, pauses and node catalog endpoints
pub mod runs;

// Trigger registration and webhook execution endpoints
pub mod webhooks;

// Re-export router builders
pub use runs::create_run_routes;
pub use webhooks::create_webhook_routes;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub runs: Arc<RunManager>,
    pub triggers: Arc<TriggerManager>,
    pub scheduler: Arc<CronTriggerSource>,
    /// Durable records, consulted when a run is no longer in memory
    pub records: Option<Arc<dyn ExecutionRecordStore>>,
}

/// Engine error rendered as a JSON response
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::DuplicateNodeId(_)
            | EngineError::DuplicatePauseId(_)
            | EngineError::DuplicateTriggerType(_) => StatusCode::CONFLICT,
            EngineError::InvalidGraph(_)
            | EngineError::InvalidNodeDefinition(_)
            | EngineError::UnknownNode(_)
            | EngineError::Transform(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::QueueUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, error.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", error))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("❌ Request failed ({}): {}", self.status, self.message);
        } else {
            tracing::debug!("⚠️ Request rejected ({}): {}", self.status, self.message);
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Parse an optional JSON body; an empty body is `null`
pub(crate) fn parse_body(body: &str) -> Result<serde_json::Value, ApiError> {
    if body.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(body).map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))
}
