//! Queued-mode runs: enqueue, worker claim, retries and suspension

use mechaflow::config::RunConfig;
use mechaflow::queue::{JobQueue, QueueWorker, RunJob, SqliteJobQueue};
use mechaflow::runtime::{RunManager, StateTransform, SuspensionHub, TriggerHandler, TriggerManager, TriggerMode};
use mechaflow::workflow::{
    node_fn, ExecutionRecordStore, NodeDefinition, NodeRegistry, RunStatus, SqliteExecutionRecordStore,
};
use serde_json::{json, Map};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

struct Harness {
    runs: Arc<RunManager>,
    queue: Arc<SqliteJobQueue>,
    records: Arc<SqliteExecutionRecordStore>,
    worker: QueueWorker,
}

async fn pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

async fn harness(max_attempts: u32) -> Harness {
    harness_with(pool().await, max_attempts, 60).await
}

/// Several harnesses built on one pool behave like processes sharing a database
async fn harness_with(pool: SqlitePool, max_attempts: u32, retention_secs: u64) -> Harness {
    let queue = Arc::new(SqliteJobQueue::new(pool.clone(), max_attempts));
    queue.init_schema().await.unwrap();
    let records = Arc::new(SqliteExecutionRecordStore::new(pool));
    records.init_schema().await.unwrap();

    let registry = Arc::new(NodeRegistry::new());
    registry
        .register(NodeDefinition::new("stamp").implementation(node_fn(|_, ctx| async move {
            Ok(json!({ "stamped": ctx.flow_instance_id() }).into())
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("broken").implementation(node_fn(|_, _| async {
            Err(anyhow::anyhow!("always broken"))
        })))
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    registry
        .register(NodeDefinition::new("flaky").implementation(node_fn(move |_, _| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(anyhow::anyhow!("first attempt fails"))
                } else {
                    Ok(json!({ "recovered": true }).into())
                }
            }
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("approval").implementation(node_fn(|_, ctx| async move {
            let data = ctx.request_pause("queued-approval", serde_json::Value::Null).await?;
            Ok(json!({ "approval": data }).into())
        })))
        .unwrap();

    let config = RunConfig {
        retention_secs,
        event_buffer: 64,
    };
    let runs = Arc::new(
        RunManager::new(registry, Arc::new(SuspensionHub::local()), &config)
            .with_queue(Arc::clone(&queue) as Arc<dyn JobQueue>)
            .with_records(Arc::clone(&records) as Arc<dyn ExecutionRecordStore>),
    );
    let worker = QueueWorker::new(
        Arc::clone(&runs),
        Arc::clone(&queue) as Arc<dyn JobQueue>,
        Arc::clone(&records) as Arc<dyn ExecutionRecordStore>,
        Duration::from_millis(10),
    );

    Harness {
        runs,
        queue,
        records,
        worker,
    }
}

async fn wait_for_job_status(queue: &SqliteJobQueue, id: i64, expected: &str) {
    for _ in 0..200 {
        if queue.job_status(id).await.unwrap().as_deref() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached '{}'", id, expected);
}

#[tokio::test]
async fn worker_runs_job_and_persists_record() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["stamp"]), Map::new(), Some("wf-1".to_string())).await.unwrap();
    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Queued);

    assert!(h.worker.process_next().await.unwrap());
    assert!(!h.worker.process_next().await.unwrap());

    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Completed);
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("done"));

    let record = h.records.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.workflow_id.as_deref(), Some("wf-1"));
    assert_eq!(record.steps.len(), 1);
    assert_eq!(record.final_state.get("stamped"), Some(&json!(id)));
}

#[tokio::test]
async fn failed_job_is_retried_with_a_fresh_run() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["flaky"]), Map::new(), None).await.unwrap();

    assert!(h.worker.process_next().await.unwrap());
    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Failed);
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("queued"));

    assert!(h.worker.process_next().await.unwrap());
    let outcome = h.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.get("recovered"), Some(&json!(true)));
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("done"));
    assert_eq!(h.records.get(&id).await.unwrap().unwrap().status, RunStatus::Completed);
}

#[tokio::test]
async fn job_goes_dead_after_max_attempts() {
    let h = harness(2).await;
    let id = h.runs.enqueue(json!(["broken"]), Map::new(), None).await.unwrap();

    assert!(h.worker.process_next().await.unwrap());
    assert!(h.worker.process_next().await.unwrap());
    assert!(!h.worker.process_next().await.unwrap());

    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("dead"));
    let record = h.records.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error.map(|e| e.node_id), Some("broken".to_string()));
}

#[tokio::test]
async fn start_job_is_idempotent_per_attempt() {
    let h = harness(3).await;
    let job = RunJob {
        flow_instance_id: "direct-job".to_string(),
        workflow_id: None,
        nodes: json!(["stamp"]),
        initial_state: Map::new(),
    };

    assert!(h.runs.start_job(&job, 1).unwrap());
    h.runs.wait(&job.flow_instance_id).await.unwrap();

    // Redelivery of the same or a later attempt must not re-run a completed run
    assert!(!h.runs.start_job(&job, 1).unwrap());
    assert!(!h.runs.start_job(&job, 2).unwrap());
    assert_eq!(h.runs.outcome(&job.flow_instance_id).unwrap().unwrap().steps.len(), 1);
}

#[tokio::test]
async fn cancelled_queued_run_is_withdrawn_from_the_queue() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["stamp"]), Map::new(), None).await.unwrap();

    assert!(h.runs.cancel(&id).await.unwrap());
    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Cancelled);
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("cancelled"));

    assert!(!h.worker.process_next().await.unwrap());
    let outcome = h.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.steps.is_empty());
    assert!(h.records.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_run_stays_cancelled_after_eviction() {
    let h = harness_with(pool().await, 3, 0).await;
    let id = h.runs.enqueue(json!(["stamp"]), Map::new(), None).await.unwrap();

    assert!(h.runs.cancel(&id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.runs.status(&id).unwrap_err().is_not_found());

    // Nothing left for a worker to pick up, so the run never executes
    assert!(!h.worker.process_next().await.unwrap());
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("cancelled"));
    assert!(h.records.get(&id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_before_start_job_wins_without_running() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["stamp"]), Map::new(), None).await.unwrap();
    let job = RunJob {
        flow_instance_id: id.clone(),
        workflow_id: None,
        nodes: json!(["stamp"]),
        initial_state: Map::new(),
    };

    assert!(h.runs.cancel(&id).await.unwrap());
    assert!(!h.runs.start_job(&job, 1).unwrap());
    let outcome = h.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.steps.is_empty());
}

#[tokio::test]
async fn cancel_after_start_job_is_finished_by_the_interpreter_once() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["stamp", "stamp"]), Map::new(), None).await.unwrap();
    let job = RunJob {
        flow_instance_id: id.clone(),
        workflow_id: None,
        nodes: json!(["stamp", "stamp"]),
        initial_state: Map::new(),
    };

    assert!(h.runs.start_job(&job, 1).unwrap());
    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Running);
    assert!(h.runs.cancel(&id).await.unwrap());

    let outcome = h.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.steps.is_empty());

    let mut events = h.runs.subscribe(&id).unwrap();
    let mut terminal = 0;
    while let Some(event) = events.next().await {
        if event.is_terminal() {
            terminal += 1;
        }
    }
    assert_eq!(terminal, 1);
}

#[tokio::test]
async fn queued_run_claimed_elsewhere_is_reconciled_from_its_record() {
    let pool = pool().await;
    let submitter = harness_with(pool.clone(), 3, 60).await;
    let worker = harness_with(pool, 3, 60).await;

    let id = submitter.runs.enqueue(json!(["stamp"]), Map::new(), None).await.unwrap();
    assert!(worker.worker.process_next().await.unwrap());
    assert_eq!(worker.runs.status(&id).unwrap(), RunStatus::Completed);
    assert_eq!(submitter.runs.status(&id).unwrap(), RunStatus::Queued);

    let progress = submitter.runs.refresh(&id).await.unwrap();
    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(progress.completed_steps, 1);
    assert_eq!(submitter.runs.status(&id).unwrap(), RunStatus::Completed);

    let outcome = submitter.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.state.get("stamped"), Some(&json!(id)));
    assert!(!submitter.worker.process_next().await.unwrap());
}

#[tokio::test]
async fn queued_entries_reconcile_in_the_background() {
    let pool = pool().await;
    let submitter = harness_with(pool.clone(), 3, 0).await;
    let worker = harness_with(pool, 3, 60).await;

    let id = submitter.runs.enqueue(json!(["stamp"]), Map::new(), None).await.unwrap();
    let mut events = submitter.runs.subscribe(&id).unwrap();
    assert!(worker.worker.process_next().await.unwrap());

    // The submitter's stream ends once the watch picks up the record
    let mut last = None;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap() {
        last = Some(event);
    }
    assert_eq!(last.map(|e| e.kind()), Some("complete"));

    for _ in 0..100 {
        if submitter.runs.status(&id).is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(submitter.runs.status(&id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn suspended_job_finishes_after_resume() {
    let h = harness(3).await;
    let id = h.runs.enqueue(json!(["approval", "stamp"]), Map::new(), None).await.unwrap();

    assert!(h.worker.process_next().await.unwrap());
    assert_eq!(h.queue.job_status(1).await.unwrap().as_deref(), Some("suspended"));
    assert_eq!(h.records.get(&id).await.unwrap().unwrap().status, RunStatus::Paused);

    assert!(h.runs.hub().resume("queued-approval", json!("ok")));
    wait_for_job_status(&h.queue, 1, "done").await;

    let record = h.records.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.final_state.get("approval"), Some(&json!("ok")));
    assert_eq!(record.steps.len(), 2);
}

#[tokio::test]
async fn queued_trigger_maps_event_into_state() {
    let h = harness(3).await;
    let triggers = TriggerManager::new(Arc::clone(&h.runs));
    triggers
        .register_trigger_type(
            "signup",
            TriggerHandler::new(json!(["stamp"]))
                .mode(TriggerMode::Queued)
                .transform(StateTransform::json_path([("email", "$.user.email")])),
        )
        .unwrap();

    let id = triggers
        .fire("signup", json!({ "user": { "email": "ada@example.com" } }))
        .await
        .unwrap();
    assert_eq!(h.runs.status(&id).unwrap(), RunStatus::Queued);

    assert!(h.worker.process_next().await.unwrap());
    let outcome = h.runs.wait(&id).await.unwrap();
    assert_eq!(outcome.state.get("email"), Some(&json!("ada@example.com")));
    assert!(outcome.state.contains_key("stamped"));
}
