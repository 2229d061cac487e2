/// JSON graph parsing
///
/// Turns the wire form of a node graph into `NodeRef`s. The registry scope is
/// needed to tell a `{nodeId: params}` call apart from a single-arm branch.
///
/// ```json
/// ["fetch", {"classify": {"model": "small"}},
///  {"positive": "notify", "negative": ["log", {"set": {"flag": true}}]},
///  {"$parallel": [["a"], ["b"]]}]
/// ```

use crate::error::{EngineError, EngineResult};
use crate::workflow::registry::Scope;
use crate::workflow::types::NodeRef;
use serde_json::{Map, Value};

/// Reserved key introducing a fan-out construct
pub const PARALLEL_KEY: &str = "$parallel";

/// Parse a JSON node list
pub fn parse_graph(value: &Value, scope: &Scope) -> EngineResult<Vec<NodeRef>> {
    match value {
        Value::Array(items) => items.iter().map(|item| parse_element(item, scope)).collect(),
        other => Err(EngineError::InvalidGraph(format!(
            "a graph must be a list of node references, got {}",
            kind(other)
        ))),
    }
}

fn parse_element(value: &Value, scope: &Scope) -> EngineResult<NodeRef> {
    match value {
        Value::String(id) => {
            if !scope.contains(id) {
                return Err(EngineError::UnknownNode(id.clone()));
            }
            Ok(NodeRef::node(id.clone()))
        }
        Value::Object(map) if map.is_empty() => {
            Err(EngineError::InvalidGraph("empty mapping in graph".to_string()))
        }
        Value::Object(map) => {
            if let Some(branches) = map.get(PARALLEL_KEY) {
                if map.len() != 1 {
                    return Err(EngineError::InvalidGraph(format!(
                        "'{}' must be the only key of its element",
                        PARALLEL_KEY
                    )));
                }
                return parse_parallel(branches, scope);
            }
            if map.len() == 1 {
                if let Some((id, params)) = map.iter().next() {
                    if scope.contains(id) {
                        return Ok(NodeRef::call(id.clone(), params.clone()));
                    }
                }
            }
            parse_branch(map, scope)
        }
        other => Err(EngineError::InvalidGraph(format!(
            "unsupported graph element: {}",
            kind(other)
        ))),
    }
}

fn parse_parallel(value: &Value, scope: &Scope) -> EngineResult<NodeRef> {
    let Value::Array(branches) = value else {
        return Err(EngineError::InvalidGraph(format!(
            "'{}' expects a list of node lists",
            PARALLEL_KEY
        )));
    };
    let graphs = branches
        .iter()
        .map(|branch| parse_target(branch, scope))
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(NodeRef::Parallel(graphs))
}

fn parse_branch(map: &Map<String, Value>, scope: &Scope) -> EngineResult<NodeRef> {
    let arms = map
        .iter()
        .map(|(edge, target)| Ok((edge.clone(), parse_target(target, scope)?)))
        .collect::<EngineResult<Vec<_>>>()?;
    Ok(NodeRef::Branch(arms))
}

/// A branch value is a node list, a single reference, or null for "do nothing"
fn parse_target(value: &Value, scope: &Scope) -> EngineResult<Vec<NodeRef>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => parse_graph(value, scope),
        _ => Ok(vec![parse_element(value, scope)?]),
    }
}

/// Check a typed graph against a scope before running it
pub fn validate(nodes: &[NodeRef], scope: &Scope) -> EngineResult<()> {
    for node in nodes {
        match node {
            NodeRef::Call { id, .. } => {
                if !scope.contains(id) {
                    return Err(EngineError::UnknownNode(id.clone()));
                }
            }
            NodeRef::Callable { .. } => {}
            NodeRef::Branch(arms) => {
                for (i, (edge, graph)) in arms.iter().enumerate() {
                    if arms[..i].iter().any(|(other, _)| other == edge) {
                        return Err(EngineError::InvalidGraph(format!("branch repeats edge '{}'", edge)));
                    }
                    validate(graph, scope)?;
                }
            }
            NodeRef::Parallel(branches) => {
                for graph in branches {
                    validate(graph, scope)?;
                }
            }
        }
    }
    Ok(())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}
