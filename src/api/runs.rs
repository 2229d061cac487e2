/// Run lifecycle REST API endpoints
///
/// Control-plane calls are keyed by `flowInstanceId`; resuming a
/// node-requested suspension directly is keyed by `pauseId`.

use crate::api::{parse_body, ApiError, AppState};
use crate::runtime::events::ProgressEvent;
use crate::runtime::suspension::ResumeDelivery;
use crate::runtime::triggers::TriggerMode;
use crate::workflow::types::RunProgress;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::convert::Infallible;

/// Request body for run submission
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunRequest {
    pub nodes: Value,
    #[serde(default)]
    pub initial_state: Map<String, Value>,
    #[serde(default)]
    pub mode: TriggerMode,
    pub workflow_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRunResponse {
    pub flow_instance_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusResponse {
    pub flow_instance_id: String,
    #[serde(flatten)]
    pub progress: RunProgress,
}

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runs", post(start_run).get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/outcome", get(get_outcome))
        .route("/api/runs/{id}/pause", post(pause_run))
        .route("/api/runs/{id}/resume", post(resume_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/events", get(stream_events))
        .route("/api/pauses", get(list_pauses))
        .route("/api/pauses/{pause_id}/resume", post(resume_pause))
        .route("/api/nodes", get(list_nodes))
}

/// POST /api/runs
/// Body: { "nodes": [...], "initialState": {...}, "mode": "immediate" | "queued" }
async fn start_run(
    State(state): State<AppState>,
    Json(payload): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<StartRunResponse>), ApiError> {
    let flow_instance_id = match payload.mode {
        TriggerMode::Immediate => state.runs.start_graph(&payload.nodes, payload.initial_state)?,
        TriggerMode::Queued => {
            state
                .runs
                .enqueue(payload.nodes, payload.initial_state, payload.workflow_id)
                .await?
        }
    };
    tracing::info!("📥 Accepted run {} ({:?})", flow_instance_id, payload.mode);
    Ok((StatusCode::ACCEPTED, Json(StartRunResponse { flow_instance_id })))
}

async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "runs": state.runs.list() }))
}

/// GET /api/runs/{id}
/// Falls back to the execution record once the run left memory
async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    match state.runs.refresh(&id).await {
        Ok(progress) => Ok(Json(serde_json::to_value(RunStatusResponse {
            flow_instance_id: id,
            progress,
        })
        .map_err(crate::error::EngineError::from)?)),
        Err(e) if e.is_not_found() => {
            let record = match &state.records {
                Some(records) => records.get(&id).await?,
                None => None,
            };
            let record = record.ok_or(e)?;
            Ok(Json(json!({
                "flowInstanceId": record.flow_instance_id,
                "status": record.status,
                "completedSteps": record.steps.len(),
                "totalSteps": record.steps.len(),
                "lastOutput": record.steps.last().map(|s| s.output.clone()).unwrap_or(Value::Null),
                "error": record.error,
            })))
        }
        Err(e) => Err(e.into()),
    }
}

/// GET /api/runs/{id}/outcome
async fn get_outcome(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    match state.runs.outcome(&id) {
        Ok(Some(outcome)) => Ok(Json(json!({ "outcome": outcome }))),
        Ok(None) => Ok(Json(json!({ "outcome": null, "status": state.runs.status(&id)? }))),
        Err(e) if e.is_not_found() => {
            let record = match &state.records {
                Some(records) => records.get(&id).await?,
                None => None,
            };
            Ok(Json(json!({ "record": record.ok_or(e)? })))
        }
        Err(e) => Err(e.into()),
    }
}

async fn pause_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let accepted = state.runs.pause(&id)?;
    Ok(Json(json!({ "accepted": accepted })))
}

/// POST /api/runs/{id}/resume
/// Body (optional): resume data handed to the parked node
async fn resume_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let data = parse_body(&body)?;
    let resumed = state.runs.resume(&id, data)?;
    Ok(Json(json!({ "resumed": resumed })))
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    let accepted = state.runs.cancel(&id).await?;
    Ok(Json(json!({ "accepted": accepted })))
}

/// GET /api/runs/{id}/events (Server-Sent Events)
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let events = state.runs.subscribe(&id)?;
    tracing::debug!("📡 SSE subscriber attached to run {}", id);

    let stream = events.into_stream().map(|event: ProgressEvent| {
        let sse = Event::default().event(event.kind());
        Ok(sse
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().comment("unserializable event")))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_pauses(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "pauses": state.runs.hub().list_active_pauses() }))
}

/// POST /api/pauses/{pause_id}/resume
/// Resolves locally or broadcasts to the process that owns the pause
async fn resume_pause(
    State(state): State<AppState>,
    Path(pause_id): Path<String>,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let data = parse_body(&body)?;
    let delivery = state.runs.hub().resume_or_broadcast(&pause_id, data).await?;
    let delivery = match delivery {
        ResumeDelivery::Local => "local",
        ResumeDelivery::Broadcast => "broadcast",
    };
    Ok(Json(json!({ "pauseId": pause_id, "delivery": delivery })))
}

async fn list_nodes(State(state): State<AppState>) -> Json<Value> {
    let nodes: Vec<_> = state.runs.registry().list().iter().map(|def| def.metadata()).collect();
    Json(json!({ "nodes": nodes }))
}
