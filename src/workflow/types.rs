/// Core workflow type definitions
///
/// Defines node definitions, the node reference graph that the interpreter walks,
/// node outputs with named edges, and the run/step records observers see.
/// Wire-facing types serialize camelCase.

use crate::error::{EngineError, EngineResult};
use crate::runtime::context::NodeContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, future::Future, sync::Arc};

/// Name of the edge a failing node routes to when it declares one
pub const ERROR_EDGE: &str = "error";

/// Executable part of a node
///
/// Receives the node's params and a context exposing the run's State, its
/// `flowInstanceId` and the suspension hub.
#[async_trait]
pub trait NodeImplementation: Send + Sync {
    async fn invoke(&self, params: Value, ctx: NodeContext) -> anyhow::Result<NodeOutput>;
}

/// Adapter turning an async closure into a node implementation
pub struct FnNode<F>(F);

#[async_trait]
impl<F, Fut> NodeImplementation for FnNode<F>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<NodeOutput>> + Send,
{
    async fn invoke(&self, params: Value, ctx: NodeContext) -> anyhow::Result<NodeOutput> {
        (self.0)(params, ctx).await
    }
}

/// Wrap an async closure as a shareable node implementation
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeImplementation>
where
    F: Fn(Value, NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<NodeOutput>> + Send + 'static,
{
    Arc::new(FnNode(f))
}

/// What a node invocation produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    /// A direct value. Objects are merged into State.
    Value(Value),
    /// Named outcomes, edge name -> value handed to the selected branch
    Edges(Vec<(String, Value)>),
}

impl NodeOutput {
    pub fn none() -> Self {
        NodeOutput::Value(Value::Null)
    }

    pub fn edge(name: impl Into<String>, value: Value) -> Self {
        NodeOutput::Edges(vec![(name.into(), value)])
    }

    /// Interpret a plain value against the node's declared edges.
    ///
    /// A string naming a declared edge is sugar for `{edge: null}`; an object
    /// whose every key is a declared edge is an edge mapping.
    pub(crate) fn normalize(self, declared: &[String]) -> Self {
        if declared.is_empty() {
            return self;
        }
        match self {
            NodeOutput::Value(Value::String(s)) if declared.contains(&s) => {
                NodeOutput::Edges(vec![(s, Value::Null)])
            }
            NodeOutput::Value(Value::Object(map))
                if !map.is_empty() && map.keys().all(|k| declared.contains(k)) =>
            {
                NodeOutput::Edges(map.into_iter().collect())
            }
            other => other,
        }
    }

    /// The output as recorded in a step log
    pub fn to_value(&self) -> Value {
        match self {
            NodeOutput::Value(v) => v.clone(),
            NodeOutput::Edges(edges) => Value::Object(
                edges.iter().cloned().collect::<Map<String, Value>>(),
            ),
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        NodeOutput::Value(value)
    }
}

/// Declared input or output of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

/// A registered unit of work
///
/// Registered once and immutable afterwards; `id` is unique within a registry.
#[derive(Clone)]
pub struct NodeDefinition {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    /// Named possible outcomes
    pub edges: Vec<String>,
    pub implementation: Option<Arc<dyn NodeImplementation>>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: "1.0.0".to_string(),
            description: String::new(),
            categories: Vec::new(),
            tags: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            edges: Vec::new(),
            implementation: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.categories.push(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, description: impl Into<String>, required: bool) -> Self {
        self.inputs.push(PortSpec { name: name.into(), description: description.into(), required });
        self
    }

    pub fn output(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.outputs.push(PortSpec { name: name.into(), description: description.into(), required: false });
        self
    }

    pub fn edges<I, S>(mut self, edges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges.extend(edges.into_iter().map(Into::into));
        self
    }

    pub fn implementation(mut self, implementation: Arc<dyn NodeImplementation>) -> Self {
        self.implementation = Some(implementation);
        self
    }

    pub fn declares_edge(&self, edge: &str) -> bool {
        self.edges.iter().any(|e| e == edge)
    }

    /// Serializable catalog view (everything except the implementation)
    pub fn metadata(&self) -> NodeMetadata {
        NodeMetadata {
            id: self.id.clone(),
            version: self.version.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            categories: self.categories.clone(),
            tags: self.tags.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            edges: self.edges.clone(),
        }
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("edges", &self.edges)
            .field("implementation", &self.implementation.is_some())
            .finish()
    }
}

/// Catalog entry for external tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub inputs: Vec<PortSpec>,
    pub outputs: Vec<PortSpec>,
    pub edges: Vec<String>,
}

/// One element of a node graph
///
/// Graphs are ordered `Vec<NodeRef>`; branch and parallel elements nest
/// sub-graphs recursively.
#[derive(Clone)]
pub enum NodeRef {
    /// A registered node with its params
    Call { id: String, params: Value },
    /// A bare callable that is not in the registry, with the edges it may take
    Callable {
        name: String,
        edges: Vec<String>,
        implementation: Arc<dyn NodeImplementation>,
    },
    /// Continuations keyed by the edge the preceding node produced
    Branch(Vec<(String, Vec<NodeRef>)>),
    /// Fan-out sub-graphs that all finish before the run continues
    Parallel(Vec<Vec<NodeRef>>),
}

impl NodeRef {
    pub fn node(id: impl Into<String>) -> Self {
        NodeRef::Call { id: id.into(), params: Value::Null }
    }

    pub fn call(id: impl Into<String>, params: Value) -> Self {
        NodeRef::Call { id: id.into(), params }
    }

    /// A callable without declared edges: it cannot map outputs onto edges or
    /// route a failure to an `error` branch. Use `callable_with_edges` for that.
    pub fn callable(name: impl Into<String>, implementation: Arc<dyn NodeImplementation>) -> Self {
        Self::callable_with_edges(name, Vec::<String>::new(), implementation)
    }

    pub fn callable_with_edges<I, S>(name: impl Into<String>, edges: I, implementation: Arc<dyn NodeImplementation>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NodeRef::Callable {
            name: name.into(),
            edges: edges.into_iter().map(Into::into).collect(),
            implementation,
        }
    }

    pub fn branch<I, S>(arms: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<NodeRef>)>,
        S: Into<String>,
    {
        NodeRef::Branch(arms.into_iter().map(|(edge, graph)| (edge.into(), graph)).collect())
    }

    pub fn parallel(branches: Vec<Vec<NodeRef>>) -> Self {
        NodeRef::Parallel(branches)
    }

    /// Whether this element is a node invocation (as opposed to a control construct)
    pub fn is_invocable(&self) -> bool {
        matches!(self, NodeRef::Call { .. } | NodeRef::Callable { .. })
    }

    /// Sub-graph a branch element declares for `edge`
    pub fn branch_target(&self, edge: &str) -> Option<&[NodeRef]> {
        match self {
            NodeRef::Branch(arms) => arms
                .iter()
                .find(|(name, _)| name == edge)
                .map(|(_, graph)| graph.as_slice()),
            _ => None,
        }
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Call { id, params } => f.debug_struct("Call").field("id", id).field("params", params).finish(),
            NodeRef::Callable { name, edges, .. } => {
                f.debug_struct("Callable").field("name", name).field("edges", edges).finish()
            }
            NodeRef::Branch(arms) => f.debug_tuple("Branch").field(arms).finish(),
            NodeRef::Parallel(branches) => f.debug_tuple("Parallel").field(branches).finish(),
        }
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Accepted in queued mode, not yet picked up by a worker
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded node invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub node_id: String,
    /// Params the node was invoked with
    pub input: Value,
    pub output: Value,
    /// Edge selected for the following branch element, if any
    pub edge: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Last captured failure of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub node_id: String,
    pub message: String,
}

/// Observer view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProgress {
    pub status: RunStatus,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub last_output: Value,
    pub error: Option<RunError>,
}

/// Final result of a run once it reached a terminal status
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowOutcome {
    pub flow_instance_id: String,
    pub status: RunStatus,
    pub state: Map<String, Value>,
    pub steps: Vec<StepRecord>,
    pub last_output: Value,
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl FlowOutcome {
    /// Completed outcomes pass through. A failed run becomes
    /// `NodeExecution` for the node that stopped it, a cancelled one `Cancelled`.
    pub fn into_result(self) -> EngineResult<FlowOutcome> {
        match self.status {
            RunStatus::Failed => Err(match self.error {
                Some(error) => error.into(),
                None => EngineError::NodeExecution {
                    node_id: String::new(),
                    message: "run failed".to_string(),
                },
            }),
            RunStatus::Cancelled => Err(EngineError::Cancelled),
            _ => Ok(self),
        }
    }
}
