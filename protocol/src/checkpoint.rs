//! Checkpoint document format.
//!
//! A checkpoint is a self-describing JSON document. Readers must check
//! `schemaVersion` before interpreting anything else.

use crate::AgentId;
use crate::CrewId;
use crate::TaskId;
use crate::TaskStatus;
use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;

/// Version written by this crate. Loading any other version fails.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// Field holding the schema version in the serialized document.
pub const SCHEMA_VERSION_FIELD: &str = "schemaVersion";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub schema_version: u32,
    pub crew_id: CrewId,
    /// Strategy identifier, see `Process::kind`.
    pub strategy: String,
    pub timestamp: DateTime<Utc>,
    pub task_statuses: BTreeMap<TaskId, TaskStatus>,
    #[serde(default)]
    pub task_errors: BTreeMap<TaskId, String>,
    pub scratchpad: ScratchpadSnapshot,
    /// Crew-level inputs of the interrupted run.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Worker assignments of a hierarchical run, once planned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<BTreeMap<TaskId, AgentId>>,
    /// Output of the implicit manager synthesis, once it succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
}

/// Serializable contents of a scratchpad.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScratchpadSnapshot {
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    /// Task output ledger in append order.
    #[serde(default)]
    pub task_outputs: Vec<TaskOutputEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutputEntry {
    pub task_id: TaskId,
    pub output: String,
}
