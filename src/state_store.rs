//! Optional persistence of per-node run state, one keyed record per node id.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{OperatorError, TaskState};

#[derive(Error, Debug)]
#[error("state store error: {0}")]
pub struct StateStoreError(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub run_id: Uuid,
    pub node_id: String,
    pub state: TaskState,
    pub attempts: u32,
    pub error: Option<OperatorError>,
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Inserts or replaces the record for `record.node_id` within its run.
    async fn upsert(&self, graph_id: &str, record: &NodeRecord) -> Result<(), StateStoreError>;

    async fn load(&self, graph_id: &str, run_id: Uuid) -> Result<Vec<NodeRecord>, StateStoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: RwLock<HashMap<(String, Uuid), HashMap<String, NodeRecord>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The run's records as a JSON object keyed by node id.
    pub async fn export_json(&self, graph_id: &str, run_id: Uuid) -> serde_json::Value {
        let records = self.records.read().await;
        records
            .get(&(graph_id.to_string(), run_id))
            .and_then(|run| serde_json::to_value(run).ok())
            .unwrap_or_else(|| serde_json::json!({}))
    }
}

#[async_trait]
impl RunStateStore for MemoryStateStore {
    async fn upsert(&self, graph_id: &str, record: &NodeRecord) -> Result<(), StateStoreError> {
        self.records
            .write()
            .await
            .entry((graph_id.to_string(), record.run_id))
            .or_default()
            .insert(record.node_id.clone(), record.clone());
        Ok(())
    }

    async fn load(&self, graph_id: &str, run_id: Uuid) -> Result<Vec<NodeRecord>, StateStoreError> {
        let records = self.records.read().await;
        let mut out: Vec<NodeRecord> = records
            .get(&(graph_id.to_string(), run_id))
            .map(|run| run.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        Ok(out)
    }
}
