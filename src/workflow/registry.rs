/// Lock-free node registry using ArcSwap
///
/// Registration swaps the whole id -> node map atomically, so interpreters that
/// already took a `Scope` keep running against their snapshot while new nodes
/// are added. Definitions are validated once here, never per call.

use crate::error::{EngineError, EngineResult};
use crate::workflow::types::{NodeDefinition, NodeImplementation};
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// A validated definition paired with its implementation
#[derive(Clone)]
pub struct RegisteredNode {
    pub definition: Arc<NodeDefinition>,
    pub implementation: Arc<dyn NodeImplementation>,
}

/// Read-only id -> node mapping used by one run
///
/// Cloning is cheap: the underlying map is shared.
#[derive(Clone, Default)]
pub struct Scope {
    nodes: Arc<HashMap<String, RegisteredNode>>,
}

impl Scope {
    pub fn get(&self, id: &str) -> Option<&RegisteredNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Catalog of node definitions
///
/// One registry per engine instance; ids are unique within it.
pub struct NodeRegistry {
    nodes: ArcSwap<HashMap<String, RegisteredNode>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            nodes: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register a node definition
    ///
    /// Fails with `InvalidNodeDefinition` when `id` or `implementation` is missing
    /// or the declared edges repeat, and with `DuplicateNodeId` when the id is taken.
    pub fn register(&self, definition: NodeDefinition) -> EngineResult<()> {
        let node = Self::validate(definition)?;
        let id = node.definition.id.clone();

        // rcu may retry the closure under contention; the flag reflects the last attempt
        let mut duplicate = false;
        self.nodes.rcu(|current| {
            duplicate = current.contains_key(&id);
            if duplicate {
                return Arc::clone(current);
            }
            let mut next = (**current).clone();
            next.insert(id.clone(), node.clone());
            Arc::new(next)
        });

        if duplicate {
            return Err(EngineError::DuplicateNodeId(id));
        }

        tracing::debug!("📦 Registered node '{}' (v{})", id, node.definition.version);
        Ok(())
    }

    fn validate(definition: NodeDefinition) -> EngineResult<RegisteredNode> {
        if definition.id.trim().is_empty() {
            return Err(EngineError::InvalidNodeDefinition("node id must not be empty".to_string()));
        }
        if definition.id.starts_with('$') {
            return Err(EngineError::InvalidNodeDefinition(format!(
                "node id '{}' uses the reserved '$' prefix",
                definition.id
            )));
        }
        let implementation = definition.implementation.clone().ok_or_else(|| {
            EngineError::InvalidNodeDefinition(format!("node '{}' has no implementation", definition.id))
        })?;
        for (i, edge) in definition.edges.iter().enumerate() {
            if edge.is_empty() || definition.edges[..i].contains(edge) {
                return Err(EngineError::InvalidNodeDefinition(format!(
                    "node '{}' declares an empty or repeated edge '{}'",
                    definition.id, edge
                )));
            }
        }

        Ok(RegisteredNode {
            definition: Arc::new(definition),
            implementation,
        })
    }

    /// Look up a definition by id
    pub fn resolve(&self, id: &str) -> EngineResult<Arc<NodeDefinition>> {
        self.nodes
            .load()
            .get(id)
            .map(|node| Arc::clone(&node.definition))
            .ok_or_else(|| EngineError::not_found("node", id))
    }

    /// Snapshot of the current id -> implementation mapping
    pub fn scope(&self) -> Scope {
        Scope {
            nodes: self.nodes.load_full(),
        }
    }

    /// All definitions, sorted by id
    pub fn list(&self) -> Vec<Arc<NodeDefinition>> {
        let mut defs: Vec<_> = self
            .nodes
            .load()
            .values()
            .map(|node| Arc::clone(&node.definition))
            .collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }
}
