/// Flow interpreter
///
/// Walks a node list left to right against one run's State. A node that
/// produces edges selects a continuation from the branch element right after
/// it; the branch sub-graph runs with the edge value as its input and shares
/// the same State. Faults are caught here and either routed to a declared
/// `error` edge or turned into a `failed` run. Pause and cancel requests are
/// honoured between nodes only.

use crate::runtime::context::{FlowState, NodeContext, RunControl};
use crate::runtime::suspension::SuspensionHub;
use crate::workflow::registry::Scope;
use crate::workflow::types::{
    FlowOutcome, NodeImplementation, NodeOutput, NodeRef, RunError, RunStatus, StepRecord, ERROR_EDGE,
};
use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Instant};

/// Why a sequence stopped early
#[derive(Debug)]
enum Halt {
    Failed(RunError),
    Cancelled,
}

/// A resolved invocable element
struct Invocation {
    node_id: String,
    params: Value,
    implementation: Arc<dyn NodeImplementation>,
    edges: Vec<String>,
}

/// Executes one run
///
/// Owned by the task that drives the run; the run manager only holds the
/// shared `RunControl`.
pub struct FlowInterpreter {
    scope: Scope,
    hub: Arc<SuspensionHub>,
    control: Arc<RunControl>,
    state: FlowState,
    steps: Vec<StepRecord>,
}

impl FlowInterpreter {
    pub fn new(scope: Scope, hub: Arc<SuspensionHub>, control: Arc<RunControl>) -> Self {
        let state = control.state().clone();
        Self {
            scope,
            hub,
            control,
            state,
            steps: Vec::new(),
        }
    }

    /// Parallel branch: same run, private copy of State
    fn fork(&self) -> Self {
        Self {
            scope: self.scope.clone(),
            hub: Arc::clone(&self.hub),
            control: Arc::clone(&self.control),
            state: self.state.fork(),
            steps: Vec::new(),
        }
    }

    /// Drive `nodes` to a terminal status and publish the outcome
    pub async fn run(mut self, nodes: Vec<NodeRef>) -> FlowOutcome {
        let started_at = Utc::now();
        let timer = Instant::now();
        let flow_instance_id = self.control.flow_instance_id().to_string();

        self.control.set_status(RunStatus::Running);
        tracing::info!("🚀 Starting run {} ({} top-level nodes)", flow_instance_id, nodes.len());

        let result = self.execute_sequence(&nodes, Value::Null).await;
        let (status, error) = match result {
            Ok(_) => (RunStatus::Completed, None),
            Err(Halt::Failed(error)) => (RunStatus::Failed, Some(error)),
            Err(Halt::Cancelled) => (RunStatus::Cancelled, None),
        };

        match (&status, &error) {
            (RunStatus::Failed, Some(error)) => tracing::error!(
                "❌ Run {} failed at node '{}' after {:?}: {}",
                flow_instance_id,
                error.node_id,
                timer.elapsed(),
                error.message
            ),
            (RunStatus::Cancelled, _) => tracing::info!("🛑 Run {} cancelled after {:?}", flow_instance_id, timer.elapsed()),
            _ => tracing::info!(
                "🎉 Run {} completed {} steps in {:?}",
                flow_instance_id,
                self.steps.len(),
                timer.elapsed()
            ),
        }

        let outcome = FlowOutcome {
            flow_instance_id,
            status,
            state: self.state.snapshot(),
            last_output: self.control.progress().last_output,
            steps: self.steps,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        self.control.finish(outcome.clone());
        outcome
    }

    /// Run a node list; the first node receives `input`, each later node the
    /// previous output. Returns the last output.
    fn execute_sequence<'a>(&'a mut self, nodes: &'a [NodeRef], input: Value) -> BoxFuture<'a, Result<Value, Halt>> {
        async move {
            self.control
                .add_total_steps(nodes.iter().filter(|node| node.is_invocable()).count());

            let mut last = input;
            let mut i = 0;
            while i < nodes.len() {
                self.checkpoint().await?;

                match &nodes[i] {
                    NodeRef::Branch(_) => {
                        tracing::debug!("⏭️ Skipping branch element {} with no edge-producing node before it", i);
                        i += 1;
                    }
                    NodeRef::Parallel(branches) => {
                        last = self.execute_parallel(branches, last).await?;
                        i += 1;
                    }
                    node => {
                        let invocation = self.resolve(node)?;
                        let branch = nodes.get(i + 1).filter(|next| matches!(next, NodeRef::Branch(_)));
                        last = self.execute_node(invocation, last, branch).await?;
                        i += if branch.is_some() { 2 } else { 1 };
                    }
                }
            }
            Ok(last)
        }
        .boxed()
    }

    fn resolve(&self, node: &NodeRef) -> Result<Invocation, Halt> {
        match node {
            NodeRef::Call { id, params } => {
                let registered = self.scope.get(id).ok_or_else(|| {
                    Halt::Failed(RunError {
                        node_id: id.clone(),
                        message: format!("unknown node: {}", id),
                    })
                })?;
                Ok(Invocation {
                    node_id: id.clone(),
                    params: params.clone(),
                    implementation: Arc::clone(&registered.implementation),
                    edges: registered.definition.edges.clone(),
                })
            }
            NodeRef::Callable {
                name,
                edges,
                implementation,
            } => Ok(Invocation {
                node_id: name.clone(),
                params: Value::Null,
                implementation: Arc::clone(implementation),
                edges: edges.clone(),
            }),
            // Control constructs are handled by execute_sequence
            NodeRef::Branch(_) | NodeRef::Parallel(_) => Err(Halt::Failed(RunError {
                node_id: String::new(),
                message: "control element is not invocable".to_string(),
            })),
        }
    }

    /// Wait out an external pause; stop on cancellation
    async fn checkpoint(&self) -> Result<(), Halt> {
        loop {
            let notified = self.control.notified();
            if self.control.is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if !self.control.is_pause_requested() {
                // A sibling parallel branch may still be parked on a node pause
                self.control.mark_running();
                return Ok(());
            }
            if self.control.set_status(RunStatus::Paused) {
                tracing::info!("⏸️ Run {} paused at node boundary", self.control.flow_instance_id());
            }
            notified.await;
        }
    }

    async fn execute_node(
        &mut self,
        invocation: Invocation,
        input: Value,
        branch: Option<&NodeRef>,
    ) -> Result<Value, Halt> {
        let Invocation {
            node_id,
            params,
            implementation,
            edges,
        } = invocation;

        tracing::info!("📍 Executing node '{}' in run {}", node_id, self.control.flow_instance_id());
        let started_at = Utc::now();
        let timer = Instant::now();

        let ctx = NodeContext::new(
            node_id.clone(),
            input,
            self.state.clone(),
            Arc::clone(&self.hub),
            Arc::clone(&self.control),
        );
        let result = AssertUnwindSafe(implementation.invoke(params.clone(), ctx))
            .catch_unwind()
            .await;
        let result = match result {
            Ok(Ok(output)) => Ok(output.normalize(&edges)),
            Ok(Err(e)) => Err(format!("{:#}", e)),
            Err(panic) => Err(panic_message(panic)),
        };

        let mut step = StepRecord {
            node_id: node_id.clone(),
            input: params,
            output: Value::Null,
            edge: None,
            error: None,
            started_at,
            duration_ms: timer.elapsed().as_millis() as u64,
        };

        match result {
            Ok(NodeOutput::Value(value)) => {
                if let Value::Object(map) = &value {
                    self.state.merge(map.clone());
                }
                step.output = value.clone();
                self.record(step);
                tracing::info!("✅ Node '{}' completed in {:?}", node_id, timer.elapsed());
                Ok(value)
            }
            Ok(NodeOutput::Edges(produced)) => {
                let Some(branch) = branch else {
                    step.output = NodeOutput::Edges(produced).to_value();
                    let output = step.output.clone();
                    self.record(step);
                    return Ok(output);
                };

                step.output = NodeOutput::Edges(produced.clone()).to_value();
                let mut candidates: Vec<(String, Value)> = produced
                    .into_iter()
                    .filter(|(edge, _)| branch.branch_target(edge).is_some())
                    .collect();

                match candidates.len() {
                    0 => {
                        tracing::debug!("⏭️ Node '{}' produced no edge the next branch handles", node_id);
                        let output = step.output.clone();
                        self.record(step);
                        Ok(output)
                    }
                    1 => {
                        let (edge, value) = candidates.remove(0);
                        step.edge = Some(edge.clone());
                        self.record(step);
                        tracing::info!("🔀 Node '{}' took edge '{}'", node_id, edge);
                        let target = branch.branch_target(&edge).unwrap_or_default();
                        self.execute_sequence(target, value).await
                    }
                    _ => {
                        let names: Vec<&str> = candidates.iter().map(|(edge, _)| edge.as_str()).collect();
                        let message = format!("ambiguous edges: {}", names.join(", "));
                        step.error = Some(message.clone());
                        self.record(step);
                        tracing::warn!("⚠️ Node '{}' produced {}", node_id, message);
                        Err(Halt::Failed(RunError { node_id, message }))
                    }
                }
            }
            Err(message) => {
                step.error = Some(message.clone());

                if self.control.is_cancelled() {
                    self.record(step);
                    return Err(Halt::Cancelled);
                }

                let error_target = branch
                    .filter(|_| edges.iter().any(|edge| edge == ERROR_EDGE))
                    .and_then(|branch| branch.branch_target(ERROR_EDGE));
                if let Some(target) = error_target {
                    step.edge = Some(ERROR_EDGE.to_string());
                    self.record(step);
                    tracing::warn!("⚠️ Node '{}' failed, routing to error edge: {}", node_id, message);
                    return self.execute_sequence(target, json!({ "error": message })).await;
                }

                self.record(step);
                tracing::warn!("⚠️ Node '{}' failed: {}", node_id, message);
                Err(Halt::Failed(RunError { node_id, message }))
            }
        }
    }

    /// Fan out, then merge each branch's changed keys back in declaration order
    async fn execute_parallel(&mut self, branches: &[Vec<NodeRef>], input: Value) -> Result<Value, Halt> {
        tracing::debug!("🔀 Fanning out {} parallel branches", branches.len());
        let base = self.state.snapshot();
        let mut children: Vec<FlowInterpreter> = branches.iter().map(|_| self.fork()).collect();

        let results = join_all(
            children
                .iter_mut()
                .zip(branches)
                .map(|(child, graph)| child.execute_sequence(graph, input.clone())),
        )
        .await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut halt = None;
        for (child, result) in children.into_iter().zip(results) {
            for (key, value) in child.state.snapshot() {
                if base.get(&key) != Some(&value) {
                    self.state.set(key, value);
                }
            }
            self.steps.extend(child.steps);
            match result {
                Ok(output) => outputs.push(output),
                Err(h) => {
                    outputs.push(Value::Null);
                    halt.get_or_insert(h);
                }
            }
        }

        if let Some(halt) = halt {
            return Err(halt);
        }
        let output = Value::Array(outputs);
        self.control.set_last_output(output.clone());
        Ok(output)
    }

    fn record(&mut self, step: StepRecord) {
        self.control.record_step(&step);
        self.steps.push(step);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("node panicked: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::runtime::events::ProgressChannel;
    use crate::workflow::registry::NodeRegistry;
    use crate::workflow::types::{node_fn, NodeDefinition};
    use serde_json::Map;

    fn registry() -> NodeRegistry {
        let registry = NodeRegistry::new();
        registry
            .register(NodeDefinition::new("inc").implementation(node_fn(|_, ctx| async move {
                let n = ctx.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                Ok(json!({ "n": n + 1 }).into())
            })))
            .unwrap();
        registry
            .register(NodeDefinition::new("record").implementation(node_fn(|params, ctx| async move {
                let key = params.as_str().unwrap_or("seen").to_string();
                ctx.set(key, ctx.input().clone());
                Ok(NodeOutput::none())
            })))
            .unwrap();
        registry
            .register(
                NodeDefinition::new("classify")
                    .edges(["positive", "negative"])
                    .implementation(node_fn(|params, _| async move { Ok(params.into()) })),
            )
            .unwrap();
        registry
            .register(
                NodeDefinition::new("risky")
                    .edges([ERROR_EDGE])
                    .implementation(node_fn(|_, _| async move { Err(anyhow::anyhow!("bad input")) })),
            )
            .unwrap();
        registry
            .register(NodeDefinition::new("explode").implementation(node_fn(|_, _| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(NodeOutput::none())
            })))
            .unwrap();
        registry
    }

    async fn run(nodes: Vec<NodeRef>) -> FlowOutcome {
        let control = Arc::new(RunControl::new(
            "test-run",
            FlowState::new(),
            RunStatus::Running,
            Arc::new(ProgressChannel::default()),
        ));
        FlowInterpreter::new(registry().scope(), Arc::new(SuspensionHub::local()), control)
            .run(nodes)
            .await
    }

    fn state(outcome: &FlowOutcome) -> Value {
        Value::Object(outcome.state.clone())
    }

    #[tokio::test]
    async fn branch_receives_edge_value_as_input() {
        let outcome = run(vec![
            NodeRef::call("classify", json!({"negative": "too bad"})),
            NodeRef::branch([
                ("positive", vec![NodeRef::call("record", json!("pos"))]),
                ("negative", vec![NodeRef::call("record", json!("neg"))]),
            ]),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[0].edge.as_deref(), Some("negative"));
        assert_eq!(state(&outcome), json!({"neg": "too bad"}));
    }

    #[tokio::test]
    async fn unmatched_edge_is_a_no_op() {
        let outcome = run(vec![
            NodeRef::call("classify", json!("negative")),
            NodeRef::branch([("positive", vec![NodeRef::node("record")])]),
            NodeRef::node("inc"),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        let ids: Vec<_> = outcome.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(ids, vec!["classify", "inc"]);
        assert_eq!(outcome.steps[0].edge, None);
    }

    #[tokio::test]
    async fn two_matching_edges_fail_the_run() {
        let outcome = run(vec![
            NodeRef::call("classify", json!({"positive": 1, "negative": 2})),
            NodeRef::branch([("positive", vec![]), ("negative", vec![])]),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        match outcome.into_result() {
            Err(EngineError::NodeExecution { node_id, message }) => {
                assert_eq!(node_id, "classify");
                assert_eq!(message, "ambiguous edges: negative, positive");
            }
            other => panic!("expected a node execution error, got {:?}", other.map(|o| o.status)),
        }
    }

    #[tokio::test]
    async fn callable_with_edges_can_branch_and_catch_errors() {
        let pick = NodeRef::callable_with_edges(
            "pick",
            ["left", "right"],
            node_fn(|_, _| async { Ok(json!({"right": "went right"}).into()) }),
        );
        let fragile = NodeRef::callable_with_edges(
            "fragile",
            [ERROR_EDGE],
            node_fn(|_, _| async { Err(anyhow::anyhow!("nope")) }),
        );
        let outcome = run(vec![
            pick,
            NodeRef::branch([
                ("left", vec![NodeRef::call("record", json!("left"))]),
                ("right", vec![NodeRef::call("record", json!("right"))]),
            ]),
            fragile,
            NodeRef::branch([(ERROR_EDGE, vec![NodeRef::call("record", json!("caught"))])]),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps[0].edge.as_deref(), Some("right"));
        assert_eq!(outcome.steps[2].edge.as_deref(), Some(ERROR_EDGE));
        assert_eq!(state(&outcome), json!({"right": "went right", "caught": {"error": "nope"}}));
    }

    #[tokio::test]
    async fn callable_without_edges_keeps_mapping_as_a_value() {
        let plain = NodeRef::callable("plain", node_fn(|_, _| async { Ok(json!({"right": 1}).into()) }));
        let outcome = run(vec![
            plain,
            NodeRef::branch([("right", vec![NodeRef::call("record", json!("right"))])]),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(state(&outcome), json!({"right": 1}));
    }

    #[tokio::test]
    async fn declared_error_edge_catches_failure() {
        let outcome = run(vec![
            NodeRef::node("risky"),
            NodeRef::branch([(ERROR_EDGE, vec![NodeRef::call("record", json!("caught"))])]),
            NodeRef::node("inc"),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.steps[0].edge.as_deref(), Some(ERROR_EDGE));
        assert_eq!(outcome.steps[0].error.as_deref(), Some("bad input"));
        assert_eq!(state(&outcome), json!({"caught": {"error": "bad input"}, "n": 1}));
    }

    #[tokio::test]
    async fn failure_without_error_arm_stops_the_run() {
        let outcome = run(vec![NodeRef::node("risky"), NodeRef::node("inc")]).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.error.map(|e| e.node_id), Some("risky".to_string()));
        assert!(outcome.state.is_empty());
    }

    #[tokio::test]
    async fn panics_are_contained() {
        let outcome = run(vec![NodeRef::node("explode")]).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.steps[0].error.as_deref().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn unknown_node_fails_without_a_step() {
        let outcome = run(vec![NodeRef::node("ghost")]).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.steps.is_empty());
        assert_eq!(outcome.error.unwrap().message, "unknown node: ghost");
    }

    #[tokio::test]
    async fn parallel_branches_merge_in_declaration_order() {
        let outcome = run(vec![
            NodeRef::node("inc"),
            NodeRef::parallel(vec![
                vec![NodeRef::node("inc"), NodeRef::call("record", json!("left"))],
                vec![NodeRef::node("inc"), NodeRef::node("inc")],
            ]),
        ])
        .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        // Both branches start from n = 1; the second branch's n = 3 wins
        let mut expected = Map::new();
        expected.insert("n".to_string(), json!(3));
        expected.insert("left".to_string(), json!({"n": 2}));
        assert_eq!(outcome.state, expected);
        assert_eq!(outcome.steps.len(), 5);
        assert_eq!(outcome.last_output, json!([null, {"n": 3}]));
    }
}
