//! Crews: the bounded set of agents and tasks forming one workflow.

use crate::Agent;
use crate::AgentId;
use crate::CrewId;
use crate::Task;
use crate::TaskId;
use serde::Deserialize;
use serde::Serialize;

/// Execution discipline for a crew.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Process {
    /// One task at a time, in dependency order.
    #[default]
    Sequential,
    /// Independent tasks run concurrently.
    Parallel,
    /// A manager plans, delegates worker tasks, then synthesizes.
    Hierarchical {
        manager: AgentId,
        #[serde(default)]
        workers: SubProcess,
    },
}

/// Strategy used for delegated worker tasks in a hierarchical crew.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubProcess {
    #[default]
    Sequential,
    Parallel,
}

impl Process {
    /// Strategy identifier recorded in checkpoints.
    pub fn kind(&self) -> &'static str {
        match self {
            Process::Sequential => "sequential",
            Process::Parallel => "parallel",
            Process::Hierarchical { .. } => "hierarchical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crew {
    pub id: CrewId,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub process: Process,
    /// Whether tasks see the shared scratchpad in their context.
    #[serde(default = "default_true")]
    pub memory: bool,
    #[serde(default)]
    pub checkpoint_enabled: bool,
    /// Run dependents of a failed task instead of skipping them.
    #[serde(default)]
    pub continue_on_failure: bool,
}

fn default_true() -> bool {
    true
}

impl Crew {
    pub fn new(agents: Vec<Agent>, tasks: Vec<Task>) -> Self {
        Self {
            id: CrewId::random(),
            agents,
            tasks,
            process: Process::default(),
            memory: true,
            checkpoint_enabled: false,
            continue_on_failure: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<CrewId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = process;
        self
    }

    pub fn with_memory(mut self, memory: bool) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_checkpoints(mut self, enabled: bool) -> Self {
        self.checkpoint_enabled = enabled;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn agent(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.iter().find(|agent| &agent.id == id)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.id == id)
    }
}
