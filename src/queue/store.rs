/// SQLite-backed durable job queue
///
/// Jobs live in the `run_jobs` table. Claiming is a single
/// `UPDATE ... RETURNING` statement, so two workers never claim the same job.

use crate::queue::{ClaimedJob, FailOutcome, JobQueue, RunJob};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    pool: SqlitePool,
    max_attempts: u32,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool, max_attempts: u32) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create the run_jobs table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                flow_instance_id TEXT NOT NULL,
                payload JSON NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_run_jobs_status
            ON run_jobs(status, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Status column of a job, for diagnostics
    pub async fn job_status(&self, id: i64) -> Result<Option<String>> {
        let row = sqlx::query("SELECT status FROM run_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get("status")))
    }

    async fn set_status(&self, id: i64, status: &str) -> Result<()> {
        sqlx::query("UPDATE run_jobs SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn enqueue(&self, job: &RunJob) -> Result<i64> {
        let payload = serde_json::to_string(job)?;
        let result = sqlx::query("INSERT INTO run_jobs (flow_instance_id, payload) VALUES (?, ?)")
            .bind(&job.flow_instance_id)
            .bind(&payload)
            .execute(&self.pool)
            .await?;

        let id = result.last_insert_rowid();
        tracing::debug!("📥 Enqueued job {} for run {}", id, job.flow_instance_id);
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>> {
        let row = sqlx::query(
            r#"
            UPDATE run_jobs
            SET status = 'running', attempts = attempts + 1, updated_at = CURRENT_TIMESTAMP
            WHERE id = (SELECT id FROM run_jobs WHERE status = 'queued' ORDER BY id LIMIT 1)
            RETURNING id, payload, attempts
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let payload: String = row.get("payload");
        let attempts: i64 = row.get("attempts");
        Ok(Some(ClaimedJob {
            id: row.get("id"),
            job: serde_json::from_str(&payload)?,
            attempt: u32::try_from(attempts)?,
        }))
    }

    async fn complete(&self, id: i64) -> Result<()> {
        self.set_status(id, "done").await
    }

    async fn fail(&self, id: i64, error: &str) -> Result<FailOutcome> {
        let row = sqlx::query(
            r#"
            UPDATE run_jobs
            SET status = CASE WHEN attempts < ? THEN 'queued' ELSE 'dead' END,
                last_error = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ?
            RETURNING status
            "#,
        )
        .bind(i64::from(self.max_attempts))
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let status: Option<String> = row.map(|row| row.get("status"));
        match status.as_deref() {
            Some("queued") => Ok(FailOutcome::Retry),
            Some(_) => Ok(FailOutcome::Dead),
            None => Err(anyhow::anyhow!("Job {} not found", id)),
        }
    }

    async fn suspend(&self, id: i64) -> Result<()> {
        self.set_status(id, "suspended").await
    }

    async fn cancel(&self, flow_instance_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_jobs
            SET status = 'cancelled', updated_at = CURRENT_TIMESTAMP
            WHERE flow_instance_id = ? AND status = 'queued'
            "#,
        )
        .bind(flow_instance_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn queue(max_attempts: u32) -> SqliteJobQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = SqliteJobQueue::new(pool, max_attempts);
        queue.init_schema().await.unwrap();
        queue
    }

    fn job(id: &str) -> RunJob {
        RunJob {
            flow_instance_id: id.to_string(),
            workflow_id: Some("wf".to_string()),
            nodes: json!(["log"]),
            initial_state: Map::new(),
        }
    }

    #[tokio::test]
    async fn claims_in_fifo_order_once() {
        let queue = queue(3).await;
        queue.enqueue(&job("a")).await.unwrap();
        queue.enqueue(&job("b")).await.unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        assert_eq!(first.job.flow_instance_id, "a");
        assert_eq!(first.attempt, 1);

        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.job.flow_instance_id, "b");
        assert!(queue.claim().await.unwrap().is_none());

        queue.complete(first.id).await.unwrap();
        assert_eq!(queue.job_status(first.id).await.unwrap().as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn failures_retry_until_dead() {
        let queue = queue(2).await;
        let id = queue.enqueue(&job("a")).await.unwrap();

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(queue.fail(claimed.id, "boom").await.unwrap(), FailOutcome::Retry);

        let retried = queue.claim().await.unwrap().unwrap();
        assert_eq!(retried.attempt, 2);
        assert_eq!(queue.fail(retried.id, "boom again").await.unwrap(), FailOutcome::Dead);
        assert_eq!(queue.job_status(id).await.unwrap().as_deref(), Some("dead"));
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_jobs_are_never_claimed() {
        let queue = queue(3).await;
        let id = queue.enqueue(&job("a")).await.unwrap();

        assert!(queue.cancel("a").await.unwrap());
        assert!(!queue.cancel("a").await.unwrap());
        assert_eq!(queue.job_status(id).await.unwrap().as_deref(), Some("cancelled"));
        assert!(queue.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claimed_jobs_cannot_be_withdrawn() {
        let queue = queue(3).await;
        queue.enqueue(&job("a")).await.unwrap();
        let claimed = queue.claim().await.unwrap().unwrap();

        assert!(!queue.cancel("a").await.unwrap());
        assert_eq!(queue.job_status(claimed.id).await.unwrap().as_deref(), Some("running"));
    }
}
