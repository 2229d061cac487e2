//! End-to-end run scenarios against an in-process engine

use mechaflow::config::RunConfig;
use mechaflow::error::EngineError;
use mechaflow::runtime::{LocalResumeBus, ResumeBus, ResumeDelivery, RunManager, SuspensionHub};
use mechaflow::workflow::{node_fn, NodeDefinition, NodeOutput, NodeRef, NodeRegistry, RunStatus};
use serde_json::{json, Map, Value};
use std::{sync::Arc, time::Duration};

fn config() -> RunConfig {
    RunConfig {
        retention_secs: 60,
        event_buffer: 64,
    }
}

fn registry() -> Arc<NodeRegistry> {
    let registry = Arc::new(NodeRegistry::new());

    registry
        .register(
            NodeDefinition::new("n1")
                .edges(["positive", "negative"])
                .implementation(node_fn(|_, _| async {
                    Ok(json!({ "positive": "Sentiment was positive!" }).into())
                })),
        )
        .unwrap();
    for id in ["logNode", "logNode2"] {
        registry
            .register(NodeDefinition::new(id).implementation(node_fn(|_, ctx| async move {
                Ok(NodeOutput::Value(ctx.input().clone()))
            })))
            .unwrap();
    }
    registry
        .register(NodeDefinition::new("divideByZero").implementation(node_fn(|_, _| async {
            Err(anyhow::anyhow!("attempt to divide by zero"))
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("assign").implementation(node_fn(|params, _| async move {
            Ok(NodeOutput::Value(params))
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("increment").implementation(node_fn(|_, ctx| async move {
            let n = ctx.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!({ "n": n + 1 }).into())
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("approval").implementation(node_fn(|_, ctx| async move {
            let pause_id = format!("{}:approval", ctx.flow_instance_id());
            let data = ctx.request_pause(pause_id, json!({ "ask": "approve?" })).await?;
            Ok(json!({ "approval": data }).into())
        })))
        .unwrap();
    registry
        .register(NodeDefinition::new("hold").implementation(node_fn(|params, ctx| async move {
            let name = params.as_str().unwrap_or("hold").to_string();
            let pause_id = format!("{}:{}", ctx.flow_instance_id(), name);
            let data = ctx.request_pause(pause_id, Value::Null).await?;
            let mut output = Map::new();
            output.insert(name, data);
            Ok(Value::Object(output).into())
        })))
        .unwrap();

    registry
}

fn manager() -> RunManager {
    RunManager::new(registry(), Arc::new(SuspensionHub::local()), &config())
}

fn state(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn linear_list_folds_outputs_into_state() {
    let runs = manager();
    let nodes = json!([
        { "assign": { "a": 1, "b": 1 } },
        { "assign": { "b": 2 } },
        { "assign": { "c": 3 } }
    ]);
    let id = runs.start_graph(&nodes, state(&[("seed", json!(true))])).unwrap();
    let outcome = runs.wait(&id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        Value::Object(outcome.state),
        json!({ "seed": true, "a": 1, "b": 2, "c": 3 })
    );
    let order: Vec<&str> = outcome.steps.iter().map(|s| s.node_id.as_str()).collect();
    assert_eq!(order, vec!["assign", "assign", "assign"]);
    assert_eq!(outcome.steps[1].input, json!({ "b": 2 }));
}

#[tokio::test]
async fn sentiment_takes_positive_branch_only() {
    let runs = manager();
    let nodes = json!(["n1", { "positive": ["logNode"], "negative": ["logNode2"] }]);
    let id = runs.start_graph(&nodes, Map::new()).unwrap();
    let outcome = runs.wait(&id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.steps[0].node_id, "n1");
    assert_eq!(outcome.steps[0].edge.as_deref(), Some("positive"));
    assert_eq!(outcome.steps[1].node_id, "logNode");
    assert_eq!(outcome.last_output, json!("Sentiment was positive!"));
}

#[tokio::test]
async fn throwing_node_fails_the_run() {
    let runs = manager();
    let id = runs.start_graph(&json!(["divideByZero", "logNode"]), Map::new()).unwrap();
    let outcome = runs.wait(&id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.steps.len(), 1);
    let step = &outcome.steps[0];
    assert_eq!(step.node_id, "divideByZero");
    assert!(step.error.as_deref().unwrap_or_default().contains("divide by zero"));

    let error = outcome.error.clone().unwrap();
    assert_eq!(error.node_id, "divideByZero");
    assert!(matches!(
        outcome.into_result(),
        Err(EngineError::NodeExecution { node_id, .. }) if node_id == "divideByZero"
    ));

    let progress = runs.progress(&id).unwrap();
    assert_eq!(progress.status, RunStatus::Failed);
    assert!(progress.error.is_some());
}

#[tokio::test]
async fn node_pause_resumes_exactly_once() {
    let runs = manager();
    let id = runs.start(vec![NodeRef::node("approval")], Map::new()).unwrap();
    runs.wait_for(&id, |s| s == RunStatus::Paused).await.unwrap();

    let pause_id = format!("{}:approval", id);
    let pauses = runs.hub().list_active_pauses();
    assert_eq!(pauses.len(), 1);
    assert_eq!(pauses[0].pause_id, pause_id);
    assert_eq!(pauses[0].flow_instance_id, id);

    assert!(runs.hub().resume(&pause_id, json!({ "approved": true })));
    assert!(!runs.hub().resume(&pause_id, json!({ "approved": false })));

    let outcome = runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.get("approval"), Some(&json!({ "approved": true })));
    assert!(runs.hub().list_active_pauses().is_empty());
}

#[tokio::test]
async fn cancel_rejects_outstanding_pause() {
    let runs = manager();
    let id = runs.start(vec![NodeRef::node("approval"), NodeRef::node("logNode")], Map::new()).unwrap();
    runs.wait_for(&id, |s| s == RunStatus::Paused).await.unwrap();

    assert!(runs.cancel(&id).await.unwrap());
    let outcome = runs.wait(&id).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.steps.iter().all(|s| s.node_id != "logNode"));
    assert!(!runs.hub().resume(&format!("{}:approval", id), json!("late")));
}

#[tokio::test]
async fn late_remote_resume_after_cancel_is_ignored() {
    let bus: Arc<dyn ResumeBus> = Arc::new(LocalResumeBus::new());
    let owner = Arc::new(SuspensionHub::new(Arc::clone(&bus)));
    let remote = Arc::new(SuspensionHub::new(bus));
    Arc::clone(&owner).listen().await.unwrap();
    Arc::clone(&remote).listen().await.unwrap();

    let runs = RunManager::new(registry(), Arc::clone(&owner), &config());
    let id = runs.start(vec![NodeRef::node("approval"), NodeRef::node("logNode")], Map::new()).unwrap();
    runs.wait_for(&id, |s| s == RunStatus::Paused).await.unwrap();

    assert!(runs.cancel(&id).await.unwrap());
    let outcome = runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);

    let pause_id = format!("{}:approval", id);
    let delivery = remote.resume_or_broadcast(&pause_id, json!("too late")).await.unwrap();
    assert_eq!(delivery, ResumeDelivery::Broadcast);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!owner.is_pending(&pause_id));
    let after = runs.outcome(&id).unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Cancelled);
    assert!(!after.state.contains_key("approval"));
    assert_eq!(after.steps.len(), outcome.steps.len());
    assert_eq!(runs.status(&id).unwrap(), RunStatus::Cancelled);
}

#[tokio::test]
async fn parallel_pauses_are_resumed_one_at_a_time() {
    let runs = manager();
    let id = runs
        .start(
            vec![NodeRef::parallel(vec![
                vec![NodeRef::call("hold", json!("pa"))],
                vec![NodeRef::call("hold", json!("pb"))],
            ])],
            Map::new(),
        )
        .unwrap();

    for _ in 0..200 {
        if runs.hub().list_active_pauses().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(runs.hub().list_active_pauses().len(), 2);
    assert_eq!(runs.status(&id).unwrap(), RunStatus::Paused);

    // The oldest pause goes first; the other branch stays parked
    assert!(runs.resume(&id, json!(1)).unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;
    let pending = runs.hub().list_active_pauses();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].pause_id, format!("{}:pb", id));
    assert_eq!(runs.status(&id).unwrap(), RunStatus::Paused);

    assert!(runs.resume(&id, json!(2)).unwrap());
    let outcome = tokio::time::timeout(Duration::from_secs(5), runs.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.get("pa"), Some(&json!(1)));
    assert_eq!(outcome.state.get("pb"), Some(&json!(2)));
    assert!(!runs.resume(&id, json!(3)).unwrap());
}

#[tokio::test]
async fn external_pause_holds_at_node_boundary() {
    let runs = manager();
    let nodes = vec![NodeRef::node("increment"); 4];
    let id = runs.start(nodes, state(&[("n", json!(0))])).unwrap();

    assert!(runs.pause(&id).unwrap());
    runs.wait_for(&id, |s| s == RunStatus::Paused).await.unwrap();
    let held = runs.progress(&id).unwrap().completed_steps;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(runs.progress(&id).unwrap().completed_steps, held);

    assert!(runs.resume(&id, Value::Null).unwrap());
    let outcome = runs.wait(&id).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.get("n"), Some(&json!(4)));
}

#[tokio::test]
async fn progress_never_goes_backwards() {
    let runs = manager();
    let nodes = vec![NodeRef::node("increment"); 6];
    let id = runs.start(nodes, Map::new()).unwrap();

    let mut last = 0;
    loop {
        let progress = runs.progress(&id).unwrap();
        assert!(progress.completed_steps >= last);
        assert!(progress.total_steps >= progress.completed_steps);
        last = progress.completed_steps;
        if progress.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(last, 6);
}

#[tokio::test]
async fn concurrent_runs_do_not_share_state() {
    let runs = manager();
    let nodes = vec![NodeRef::node("increment"); 3];
    let a = runs.start(nodes.clone(), state(&[("n", json!(0))])).unwrap();
    let b = runs.start(nodes, state(&[("n", json!(100))])).unwrap();

    let (a, b) = tokio::join!(runs.wait(&a), runs.wait(&b));
    assert_eq!(a.unwrap().state.get("n"), Some(&json!(3)));
    assert_eq!(b.unwrap().state.get("n"), Some(&json!(103)));
}

#[tokio::test]
async fn resume_from_another_process_reaches_the_owner() {
    let bus: Arc<dyn ResumeBus> = Arc::new(LocalResumeBus::new());
    let owner = Arc::new(SuspensionHub::new(Arc::clone(&bus)));
    let remote = Arc::new(SuspensionHub::new(bus));
    Arc::clone(&owner).listen().await.unwrap();
    Arc::clone(&remote).listen().await.unwrap();

    let runs = RunManager::new(registry(), Arc::clone(&owner), &config());
    let id = runs.start(vec![NodeRef::node("approval")], Map::new()).unwrap();
    runs.wait_for(&id, |s| s == RunStatus::Paused).await.unwrap();

    let pause_id = format!("{}:approval", id);
    let delivery = remote.resume_or_broadcast(&pause_id, json!("from afar")).await.unwrap();
    assert_eq!(delivery, ResumeDelivery::Broadcast);

    let outcome = tokio::time::timeout(Duration::from_secs(5), runs.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.state.get("approval"), Some(&json!("from afar")));
    assert!(!owner.is_pending(&pause_id));
}

#[tokio::test]
async fn progress_stream_ends_with_terminal_event() {
    let runs = manager();
    let id = runs.start(vec![NodeRef::node("increment"); 3], Map::new()).unwrap();
    let mut events = runs.subscribe(&id).unwrap();

    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap() {
        assert_eq!(event.flow_instance_id(), id);
        seen.push(event);
    }

    assert_eq!(seen.first().map(|e| e.kind()), Some("progress"));
    let last = seen.last().unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.kind(), "complete");
    assert_eq!(seen.iter().filter(|e| e.is_terminal()).count(), 1);
}

#[tokio::test]
async fn subscribing_after_finish_still_reports_terminal() {
    let runs = manager();
    let id = runs.start(vec![NodeRef::node("divideByZero")], Map::new()).unwrap();
    runs.wait(&id).await.unwrap();

    let mut events = runs.subscribe(&id).unwrap();
    let mut last = None;
    while let Some(event) = events.next().await {
        last = Some(event);
    }
    let last = last.unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.kind(), "error");
}
