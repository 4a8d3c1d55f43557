//! Task definitions and the task status machine.

use crate::AgentId;
use crate::TaskId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::fmt;

/// A unit of work assigned to exactly one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    /// Hint describing the shape of the expected output.
    #[serde(default)]
    pub expected_output: String,
    pub agent: AgentId,
    /// Tasks that must reach a terminal state before this one starts.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Extra variables handed to the executor with this task only.
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Lets a task run alongside its successors in a sequential walk.
    #[serde(default)]
    pub async_execution: bool,
}

impl Task {
    pub fn new(description: impl Into<String>, agent: impl Into<AgentId>) -> Self {
        Self {
            id: TaskId::random(),
            description: description.into(),
            expected_output: String::new(),
            agent: agent.into(),
            dependencies: Vec::new(),
            context: Map::new(),
            async_execution: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_expected_output(mut self, expected_output: impl Into<String>) -> Self {
        self.expected_output = expected_output.into();
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<TaskId>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_async_execution(mut self, async_execution: bool) -> Self {
        self.async_execution = async_execution;
        self
    }
}

/// Execution status of a task.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed}`, with `Skipped`
/// reachable from `Pending`/`Ready` when a required dependency fails and
/// `Cancelled` reachable from any non-terminal state when a run stops early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }

    /// Whether the status machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
