//! Default in-process memory backend.

use super::MemoryBackend;
use crate::error::MemoryError;
use async_trait::async_trait;
use crew_protocol::TaskId;
use crew_protocol::checkpoint::ScratchpadSnapshot;
use crew_protocol::checkpoint::TaskOutputEntry;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

/// One key's value.
type Slot = Arc<Mutex<Value>>;

/// Synchronized in-process store.
///
/// Writers hold the slot map's read lock while they update a key's slot, so
/// writers of different keys never wait on each other. Creating and deleting
/// keys take the write lock; a deleted key's slot leaves the map.
pub struct InMemoryBackend {
    slots: RwLock<HashMap<String, Slot>>,
    ledger: RwLock<IndexMap<TaskId, String>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            ledger: RwLock::new(IndexMap::new()),
        }
    }

    async fn all_slots(&self) -> Vec<(String, Slot)> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect()
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>, MemoryError> {
        let slots = self.slots.read().await;
        match slots.get(key) {
            Some(slot) => Ok(Some(slot.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), MemoryError> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(key) {
                *slot.lock().await = value;
                return Ok(());
            }
        }

        let mut slots = self.slots.write().await;
        match slots.entry(key.to_string()) {
            Entry::Occupied(entry) => *entry.get().lock().await = value,
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(value)));
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, MemoryError> {
        let mut slots = self.slots.write().await;
        Ok(slots.remove(key).is_some())
    }

    async fn keys(&self) -> Result<Vec<String>, MemoryError> {
        let slots = self.slots.read().await;
        let mut keys: Vec<String> = slots.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn append_task_output(
        &self,
        task_id: &TaskId,
        output: String,
    ) -> Result<(), MemoryError> {
        let mut ledger = self.ledger.write().await;
        if ledger.contains_key(task_id) {
            return Err(MemoryError::DuplicateOutput {
                task_id: task_id.clone(),
            });
        }
        ledger.insert(task_id.clone(), output);
        Ok(())
    }

    async fn task_output(&self, task_id: &TaskId) -> Result<Option<String>, MemoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger.get(task_id).cloned())
    }

    async fn task_outputs(&self) -> Result<Vec<TaskOutputEntry>, MemoryError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .iter()
            .map(|(task_id, output)| TaskOutputEntry {
                task_id: task_id.clone(),
                output: output.clone(),
            })
            .collect())
    }

    async fn snapshot(&self) -> Result<ScratchpadSnapshot, MemoryError> {
        let mut values = BTreeMap::new();
        for (key, slot) in self.all_slots().await {
            let value = slot.lock().await.clone();
            values.insert(key, value);
        }
        Ok(ScratchpadSnapshot {
            values,
            task_outputs: self.task_outputs().await?,
        })
    }

    async fn restore(&self, snapshot: ScratchpadSnapshot) -> Result<(), MemoryError> {
        let mut slots = self.slots.write().await;
        let mut ledger = self.ledger.write().await;
        *slots = snapshot
            .values
            .into_iter()
            .map(|(key, value)| (key, Arc::new(Mutex::new(value))))
            .collect();
        *ledger = snapshot
            .task_outputs
            .into_iter()
            .map(|entry| (entry.task_id, entry.output))
            .collect();
        Ok(())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.restore(ScratchpadSnapshot::default()).await
    }
}
