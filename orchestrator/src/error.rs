//! Error types for every orchestrator concern.

use crew_protocol::AgentId;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use thiserror::Error;

/// Structural problems found while building the dependency graph.
///
/// These are always reported before any task runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("crew must have at least one agent and one task")]
    EmptyCrew,
    #[error("duplicate agent id: {agent_id}")]
    DuplicateAgent { agent_id: AgentId },
    #[error("duplicate task id: {task_id}")]
    DuplicateTask { task_id: TaskId },
    #[error("task {task_id} references unknown agent: {agent_id}")]
    UnknownAgent { task_id: TaskId, agent_id: AgentId },
    #[error("task {task_id} depends on unknown task: {dependency}")]
    MissingDependency { task_id: TaskId, dependency: TaskId },
    #[error("circular dependency detected at task {task_id}: {}", format_path(.path))]
    Cycle { task_id: TaskId, path: Vec<TaskId> },
    #[error("invalid hierarchy: {message}")]
    InvalidHierarchy { message: String },
}

fn format_path(path: &[TaskId]) -> String {
    path.iter()
        .map(TaskId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A failed agent-execution call. Local to one task; recorded, never raised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("task {task_id} failed: {message}")]
pub struct TaskExecutionError {
    pub task_id: TaskId,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("unsupported checkpoint schema version {found} (expected {expected})")]
    UnsupportedVersion { found: u64, expected: u32 },
    #[error("checkpoint has no schema version")]
    MissingVersion,
    #[error("malformed checkpoint: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("checkpoint references unknown task: {task_id}")]
    UnknownTask { task_id: TaskId },
    #[error("checkpoint references unknown agent: {agent_id}")]
    UnknownAgent { agent_id: AgentId },
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("checkpoint store error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("output for task {task_id} was already recorded")]
    DuplicateOutput { task_id: TaskId },
    #[error("memory backend error: {message}")]
    Backend { message: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DelegationError {
    #[error("delegation names unknown task: {task_id}")]
    UnknownTask { task_id: TaskId },
    #[error("task {task_id} is not a worker task and cannot be delegated")]
    NotAWorker { task_id: TaskId },
    #[error("delegation of task {task_id} names unknown agent: {agent_id}")]
    UnknownAgent { task_id: TaskId, agent_id: AgentId },
    #[error("delegation planner failed: {message}")]
    Planner { message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Rejected status change; only produced by a scheduler bug or a bad restore.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("task {task_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Errors surfaced by [`Orchestrator`](crate::Orchestrator) entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no checkpoint store configured")]
    NoCheckpointStore,
    #[error("no checkpoint found for crew {crew_id}")]
    CheckpointNotFound { crew_id: String },
}
