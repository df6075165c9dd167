//! Save/load contract of the editor's graph model.
//!
//! The bridge never looks inside the editor's data model; it hands
//! specifications and dataflows in and gets dataflows out.

use std::{collections::HashSet, fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("no specification is loaded")]
    NoSpecification,

    #[error("dataflow uses nodes missing from the specification: {}", .0.join(", "))]
    UnknownNodes(Vec<String>),

    #[error("malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Replace the node specification. The current dataflow is kept.
    async fn load_specification(&self, specification: Value) -> Result<(), GraphError>;

    async fn specification(&self) -> Option<Value>;

    /// Replace the current dataflow. Every node must name a node type of the
    /// loaded specification.
    async fn load_dataflow(&self, dataflow: Value) -> Result<(), GraphError>;

    /// Serialize the current dataflow; an empty graph when nothing is loaded.
    async fn save_dataflow(&self) -> Result<Value, GraphError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn GraphStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphStore").field("name", &self.name()).finish()
    }
}

#[derive(Default)]
struct GraphState {
    specification: Option<Value>,
    dataflow: Option<Value>,
}

#[derive(Default)]
pub struct InMemoryGraph {
    state: RwLock<GraphState>,
}

impl InMemoryGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

fn node_types(specification: &Value) -> Result<HashSet<String>, GraphError> {
    let nodes = specification
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| GraphError::Malformed {
            what: "specification",
            reason: "`nodes` is not an array".to_string(),
        })?;
    Ok(nodes
        .iter()
        .filter_map(|n| n.get("name").and_then(Value::as_str))
        .map(str::to_owned)
        .collect())
}

fn dataflow_nodes(dataflow: &Value) -> Result<&Vec<Value>, GraphError> {
    dataflow
        .pointer("/graph/nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| GraphError::Malformed {
            what: "dataflow",
            reason: "`graph.nodes` is not an array".to_string(),
        })
}

#[async_trait]
impl GraphStore for InMemoryGraph {
    async fn load_specification(&self, specification: Value) -> Result<(), GraphError> {
        let types = node_types(&specification)?;
        debug!(node_types = types.len(), "specification loaded");
        self.state.write().await.specification = Some(specification);
        Ok(())
    }

    async fn specification(&self) -> Option<Value> {
        self.state.read().await.specification.clone()
    }

    async fn load_dataflow(&self, dataflow: Value) -> Result<(), GraphError> {
        let mut state = self.state.write().await;
        let spec = state.specification.as_ref().ok_or(GraphError::NoSpecification)?;
        let known = node_types(spec)?;

        let mut unknown: Vec<String> = dataflow_nodes(&dataflow)?
            .iter()
            .filter_map(|n| n.get("name").and_then(Value::as_str))
            .filter(|name| !known.contains(*name))
            .map(str::to_owned)
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            unknown.dedup();
            return Err(GraphError::UnknownNodes(unknown));
        }

        state.dataflow = Some(dataflow);
        Ok(())
    }

    async fn save_dataflow(&self) -> Result<Value, GraphError> {
        Ok(self
            .state
            .read()
            .await
            .dataflow
            .clone()
            .unwrap_or_else(|| json!({"graph": {"nodes": [], "connections": []}})))
    }

    fn name(&self) -> &'static str {
        "InMemoryGraph"
    }
}
