/// Trigger registration and webhook execution endpoints
///
/// A webhook call fires the named trigger type with the request body as the
/// event payload. Trigger types may also carry a cron schedule, which is
/// handed to the cron trigger source on registration.

use crate::api::{parse_body, ApiError, AppState};
use crate::runtime::triggers::{StateTransform, TriggerHandler, TriggerMode};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Request body for trigger registration
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTriggerRequest {
    pub trigger_type: String,
    pub nodes: Value,
    #[serde(default)]
    pub mode: TriggerMode,
    pub workflow_id: Option<String>,
    /// State key -> JSONPath; absent means the event object becomes the State
    pub mappings: Option<Map<String, Value>>,
    /// Six-field cron expression (seconds first)
    pub schedule: Option<String>,
}

pub fn create_webhook_routes() -> Router<AppState> {
    Router::new()
        .route("/webhook/{trigger_type}", post(execute_webhook))
        .route("/api/triggers", get(list_triggers).post(register_trigger))
        .route("/api/triggers/{trigger_type}", delete(unregister_trigger))
}

/// POST /webhook/{trigger_type}
/// Body: JSON event payload handed to the trigger's transform
async fn execute_webhook(
    State(state): State<AppState>,
    Path(trigger_type): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    tracing::info!("📥 Webhook request received: {}", trigger_type);
    tracing::debug!("📄 Request body: {}", body);

    let event = parse_body(&body)?;
    let flow_instance_id = state.triggers.fire(&trigger_type, event).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "triggerType": trigger_type, "flowInstanceId": flow_instance_id })),
    ))
}

async fn list_triggers(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "triggers": state.triggers.list(),
        "scheduled": state.scheduler.scheduled().await,
    }))
}

/// POST /api/triggers
async fn register_trigger(
    State(state): State<AppState>,
    Json(payload): Json<RegisterTriggerRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut handler = TriggerHandler::new(payload.nodes).mode(payload.mode);
    if let Some(workflow_id) = payload.workflow_id {
        handler = handler.workflow_id(workflow_id);
    }
    if let Some(mappings) = payload.mappings {
        let mut paths = Vec::with_capacity(mappings.len());
        for (key, path) in mappings {
            let Value::String(path) = path else {
                return Err(ApiError::bad_request(format!("mapping '{}' must be a JSONPath string", key)));
            };
            paths.push((key, path));
        }
        handler = handler.transform(StateTransform::json_path(paths));
    }

    state.triggers.register_trigger_type(&payload.trigger_type, handler)?;

    if let Some(schedule) = &payload.schedule {
        if let Err(e) = state
            .scheduler
            .add_or_update_schedule(&payload.trigger_type, schedule)
            .await
        {
            // Keep registration and schedule consistent
            state.triggers.unregister_trigger_type(&payload.trigger_type);
            return Err(ApiError::bad_request(format!("invalid schedule '{}': {:#}", schedule, e)));
        }
    }

    tracing::info!("🔗 Registered trigger type: {}", payload.trigger_type);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "triggerType": payload.trigger_type, "scheduled": payload.schedule.is_some() })),
    ))
}

/// DELETE /api/triggers/{trigger_type}
async fn unregister_trigger(
    State(state): State<AppState>,
    Path(trigger_type): Path<String>,
) -> Result<StatusCode, ApiError> {
    let unscheduled = state.scheduler.remove_schedule(&trigger_type).await;
    if !state.triggers.unregister_trigger_type(&trigger_type) && !unscheduled {
        return Err(crate::error::EngineError::not_found("trigger type", &trigger_type).into());
    }
    tracing::info!("🗑️ Unregistered trigger type: {}", trigger_type);
    Ok(StatusCode::NO_CONTENT)
}
