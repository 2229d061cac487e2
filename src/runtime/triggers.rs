/// Trigger manager: external event types -> runs
///
/// Each trigger type carries a JSON node graph, a transform that turns the
/// event payload into the run's initial State, and whether the run starts
/// immediately or goes through the job queue. Detecting events is left to
/// the sources (webhook route, cron scheduler).

use crate::error::{EngineError, EngineResult};
use crate::runtime::manager::RunManager;
use crate::workflow::graph::parse_graph;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};

/// Custom event -> State function
pub type TransformFn = Arc<dyn Fn(&Value) -> anyhow::Result<Map<String, Value>> + Send + Sync>;

/// How a trigger builds initial State
#[derive(Clone, Default)]
pub enum StateTransform {
    /// Object events become the State; anything else lands under `event`
    #[default]
    Passthrough,
    /// State key -> JSONPath into the event (`$.user.id`)
    JsonPath(Vec<(String, String)>),
    Custom(TransformFn),
}

impl StateTransform {
    pub fn json_path<I, K, P>(mappings: I) -> Self
    where
        I: IntoIterator<Item = (K, P)>,
        K: Into<String>,
        P: Into<String>,
    {
        StateTransform::JsonPath(mappings.into_iter().map(|(k, p)| (k.into(), p.into())).collect())
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Map<String, Value>> + Send + Sync + 'static,
    {
        StateTransform::Custom(Arc::new(f))
    }

    pub fn apply(&self, event: &Value) -> EngineResult<Map<String, Value>> {
        match self {
            StateTransform::Passthrough => Ok(match event {
                Value::Object(map) => map.clone(),
                other => {
                    let mut state = Map::new();
                    state.insert("event".to_string(), other.clone());
                    state
                }
            }),
            StateTransform::JsonPath(mappings) => {
                let mut state = Map::new();
                for (key, path) in mappings {
                    let mut matches = jsonpath_lib::select(event, path)
                        .map_err(|e| EngineError::Transform(format!("path '{}' for '{}': {:?}", path, key, e)))?;
                    // One match is a value, several an array, none is null
                    let value = match matches.len() {
                        0 => Value::Null,
                        1 => matches.remove(0).clone(),
                        _ => Value::Array(matches.into_iter().cloned().collect()),
                    };
                    state.insert(key.clone(), value);
                }
                Ok(state)
            }
            StateTransform::Custom(f) => f(event).map_err(|e| EngineError::Transform(format!("{:#}", e))),
        }
    }
}

impl fmt::Debug for StateTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateTransform::Passthrough => f.write_str("Passthrough"),
            StateTransform::JsonPath(mappings) => f.debug_tuple("JsonPath").field(mappings).finish(),
            StateTransform::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Where a triggered run executes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerMode {
    #[default]
    Immediate,
    Queued,
}

#[derive(Debug, Clone)]
pub struct TriggerHandler {
    /// Graph in its JSON wire form
    pub nodes: Value,
    pub transform: StateTransform,
    pub mode: TriggerMode,
    pub workflow_id: Option<String>,
}

impl TriggerHandler {
    pub fn new(nodes: Value) -> Self {
        Self {
            nodes,
            transform: StateTransform::default(),
            mode: TriggerMode::default(),
            workflow_id: None,
        }
    }

    pub fn transform(mut self, transform: StateTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

/// Registered trigger type, as listed to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSummary {
    pub trigger_type: String,
    pub mode: TriggerMode,
    pub workflow_id: Option<String>,
}

pub struct TriggerManager {
    handlers: DashMap<String, Arc<TriggerHandler>>,
    runs: Arc<RunManager>,
}

impl TriggerManager {
    pub fn new(runs: Arc<RunManager>) -> Self {
        Self {
            handlers: DashMap::new(),
            runs,
        }
    }

    /// Register a trigger type. The graph is checked against the registry now.
    pub fn register_trigger_type(&self, trigger_type: &str, handler: TriggerHandler) -> EngineResult<()> {
        parse_graph(&handler.nodes, &self.runs.registry().scope())?;
        if handler.mode == TriggerMode::Queued && !self.runs.has_queue() {
            return Err(EngineError::QueueUnavailable);
        }

        match self.handlers.entry(trigger_type.to_string()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateTriggerType(trigger_type.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(handler));
                tracing::info!("🔔 Registered trigger type '{}'", trigger_type);
                Ok(())
            }
        }
    }

    pub fn unregister_trigger_type(&self, trigger_type: &str) -> bool {
        self.handlers.remove(trigger_type).is_some()
    }

    /// React to an event: build initial State and start (or enqueue) the run
    pub async fn fire(&self, trigger_type: &str, event: Value) -> EngineResult<String> {
        let handler = self
            .handlers
            .get(trigger_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::not_found("trigger type", trigger_type))?;

        let initial_state = handler.transform.apply(&event)?;
        let flow_instance_id = match handler.mode {
            TriggerMode::Immediate => self.runs.start_graph(&handler.nodes, initial_state)?,
            TriggerMode::Queued => {
                self.runs
                    .enqueue(handler.nodes.clone(), initial_state, handler.workflow_id.clone())
                    .await?
            }
        };

        tracing::info!("🚀 Trigger '{}' started run {}", trigger_type, flow_instance_id);
        Ok(flow_instance_id)
    }

    pub fn list(&self) -> Vec<TriggerSummary> {
        let mut triggers: Vec<TriggerSummary> = self
            .handlers
            .iter()
            .map(|entry| TriggerSummary {
                trigger_type: entry.key().clone(),
                mode: entry.value().mode,
                workflow_id: entry.value().workflow_id.clone(),
            })
            .collect();
        triggers.sort_by(|a, b| a.trigger_type.cmp(&b.trigger_type));
        triggers
    }

    pub fn contains(&self, trigger_type: &str) -> bool {
        self.handlers.contains_key(trigger_type)
    }
}
