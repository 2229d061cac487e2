/// SQLite persistence layer for execution records
///
/// Execution records are the durable trace of a finished (or suspended) run:
/// the status, the step log, the final State and the last error. Steps and
/// State are stored as JSON columns; status and timestamps stay queryable.

use crate::workflow::types::{FlowOutcome, RunError, RunStatus, StepRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqlitePool, Row};

/// Durable record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub flow_instance_id: String,
    pub workflow_id: Option<String>,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub final_state: Map<String, Value>,
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn from_outcome(outcome: &FlowOutcome, workflow_id: Option<String>) -> Self {
        Self {
            flow_instance_id: outcome.flow_instance_id.clone(),
            workflow_id,
            status: outcome.status,
            steps: outcome.steps.clone(),
            final_state: outcome.state.clone(),
            error: outcome.error.clone(),
            started_at: outcome.started_at,
            finished_at: Some(outcome.finished_at),
        }
    }
}

/// Where finished runs are written
#[async_trait]
pub trait ExecutionRecordStore: Send + Sync {
    /// Insert or replace the record for `record.flow_instance_id`
    async fn save(&self, record: &ExecutionRecord) -> Result<()>;

    async fn get(&self, flow_instance_id: &str) -> Result<Option<ExecutionRecord>>;
}

/// SQLite-backed record store
#[derive(Debug, Clone)]
pub struct SqliteExecutionRecordStore {
    pool: SqlitePool,
}

impl SqliteExecutionRecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the execution_records table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS execution_records (
                flow_instance_id TEXT PRIMARY KEY,
                workflow_id TEXT,
                status TEXT NOT NULL,
                steps JSON NOT NULL,
                final_state JSON NOT NULL,
                error JSON,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_execution_records_workflow
            ON execution_records(workflow_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionRecordStore for SqliteExecutionRecordStore {
    /// Uses UPSERT so a suspended run's record is overwritten once it finishes
    async fn save(&self, record: &ExecutionRecord) -> Result<()> {
        let steps_json = serde_json::to_string(&record.steps)?;
        let state_json = serde_json::to_string(&record.final_state)?;
        let error_json = record.error.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO execution_records
                (flow_instance_id, workflow_id, status, steps, final_state, error, started_at, finished_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(flow_instance_id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                status = excluded.status,
                steps = excluded.steps,
                final_state = excluded.final_state,
                error = excluded.error,
                started_at = excluded.started_at,
                finished_at = excluded.finished_at,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&record.flow_instance_id)
        .bind(&record.workflow_id)
        .bind(record.status.as_str())
        .bind(&steps_json)
        .bind(&state_json)
        .bind(&error_json)
        .bind(record.started_at.to_rfc3339())
        .bind(record.finished_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Saved execution record {} ({})", record.flow_instance_id, record.status);
        Ok(())
    }

    async fn get(&self, flow_instance_id: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            "SELECT flow_instance_id, workflow_id, status, steps, final_state, error, started_at, finished_at
             FROM execution_records WHERE flow_instance_id = ?",
        )
        .bind(flow_instance_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let steps: String = row.get("steps");
        let final_state: String = row.get("final_state");
        let error: Option<String> = row.get("error");
        let started_at: String = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");

        Ok(Some(ExecutionRecord {
            flow_instance_id: row.get("flow_instance_id"),
            workflow_id: row.get("workflow_id"),
            status: RunStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("Unknown run status in record: {}", status))?,
            steps: serde_json::from_str(&steps)?,
            final_state: serde_json::from_str(&final_state)?,
            error: error.map(|e| serde_json::from_str(&e)).transpose()?,
            started_at: parse_time(&started_at)?,
            finished_at: finished_at.map(|t| parse_time(&t)).transpose()?,
        }))
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteExecutionRecordStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteExecutionRecordStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn record(status: RunStatus) -> ExecutionRecord {
        let mut state = Map::new();
        state.insert("total".to_string(), json!(3));
        ExecutionRecord {
            flow_instance_id: "run-1".to_string(),
            workflow_id: Some("wf".to_string()),
            status,
            steps: vec![StepRecord {
                node_id: "add".to_string(),
                input: json!({"n": 3}),
                output: json!({"total": 3}),
                edge: None,
                error: None,
                started_at: Utc::now(),
                duration_ms: 2,
            }],
            final_state: state,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn save_then_get() {
        let store = store().await;
        let saved = record(RunStatus::Completed);
        store.save(&saved).await.unwrap();

        let loaded = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.final_state.get("total"), Some(&json!(3)));
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_overwrites_suspended_record() {
        let store = store().await;
        store.save(&record(RunStatus::Paused)).await.unwrap();

        let mut finished = record(RunStatus::Failed);
        finished.error = Some(RunError { node_id: "add".to_string(), message: "boom".to_string() });
        finished.finished_at = Some(Utc::now());
        store.save(&finished).await.unwrap();

        let loaded = store.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.error.map(|e| e.message), Some("boom".to_string()));
        assert!(loaded.finished_at.is_some());
    }
}
