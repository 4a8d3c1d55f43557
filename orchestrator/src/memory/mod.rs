//! Shared scratchpad memory.
//!
//! [`Scratchpad`] is the only state several running tasks mutate at once.
//! It wraps a pluggable [`MemoryBackend`]; backends must serialize writes to
//! the same key, must not lose writes to distinct keys, and must let a task
//! read back what it just wrote.

mod in_memory;

pub use in_memory::InMemoryBackend;

use crate::error::MemoryError;
use async_trait::async_trait;
use crew_protocol::TaskId;
use crew_protocol::checkpoint::ScratchpadSnapshot;
use crew_protocol::checkpoint::TaskOutputEntry;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage contract behind a [`Scratchpad`].
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), MemoryError>;

    /// Removes a key. Returns whether it was present.
    async fn delete(&self, key: &str) -> Result<bool, MemoryError>;

    async fn keys(&self) -> Result<Vec<String>, MemoryError>;

    /// Appends to the task output ledger. A task records at most one output.
    async fn append_task_output(&self, task_id: &TaskId, output: String)
    -> Result<(), MemoryError>;

    async fn task_output(&self, task_id: &TaskId) -> Result<Option<String>, MemoryError>;

    /// Full ledger in append order.
    async fn task_outputs(&self) -> Result<Vec<TaskOutputEntry>, MemoryError>;

    async fn snapshot(&self) -> Result<ScratchpadSnapshot, MemoryError>;

    /// Replaces all contents with `snapshot`.
    async fn restore(&self, snapshot: ScratchpadSnapshot) -> Result<(), MemoryError>;

    async fn clear(&self) -> Result<(), MemoryError>;
}

/// Handle to the run's shared memory. Clones share the same backend.
#[derive(Clone)]
pub struct Scratchpad {
    backend: Arc<dyn MemoryBackend>,
}

impl Scratchpad {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        self.backend.get(key).await
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), MemoryError> {
        tracing::debug!(key, "scratchpad set");
        self.backend.set(key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, MemoryError> {
        self.backend.delete(key).await
    }

    pub async fn has_key(&self, key: &str) -> Result<bool, MemoryError> {
        Ok(self.backend.get(key).await?.is_some())
    }

    pub async fn keys(&self) -> Result<Vec<String>, MemoryError> {
        self.backend.keys().await
    }

    pub async fn append_task_output(
        &self,
        task_id: &TaskId,
        output: String,
    ) -> Result<(), MemoryError> {
        tracing::debug!(task_id = %task_id, "scratchpad task output recorded");
        self.backend.append_task_output(task_id, output).await
    }

    pub async fn task_output(&self, task_id: &TaskId) -> Result<Option<String>, MemoryError> {
        self.backend.task_output(task_id).await
    }

    pub async fn task_outputs(&self) -> Result<Vec<TaskOutputEntry>, MemoryError> {
        self.backend.task_outputs().await
    }

    /// All key/value pairs, ordered by key.
    pub async fn values(&self) -> Result<BTreeMap<String, Value>, MemoryError> {
        Ok(self.backend.snapshot().await?.values)
    }

    pub async fn snapshot(&self) -> Result<ScratchpadSnapshot, MemoryError> {
        self.backend.snapshot().await
    }

    pub async fn restore(&self, snapshot: ScratchpadSnapshot) -> Result<(), MemoryError> {
        self.backend.restore(snapshot).await
    }

    pub async fn clear(&self) -> Result<(), MemoryError> {
        self.backend.clear().await
    }

    /// Reads `key` from an agent-scoped keyspace (`"{namespace}:{key}"`).
    pub async fn read_namespaced(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Value>, MemoryError> {
        self.get(&format!("{namespace}:{key}")).await
    }

    pub async fn write_namespaced(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
    ) -> Result<(), MemoryError> {
        self.set(&format!("{namespace}:{key}"), value).await
    }

    /// All pairs of one namespace, with the prefix stripped.
    pub async fn read_namespace(
        &self,
        namespace: &str,
    ) -> Result<HashMap<String, Value>, MemoryError> {
        let prefix = format!("{namespace}:");
        Ok(self
            .values()
            .await?
            .into_iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v)))
            .collect())
    }
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::in_memory()
    }
}
