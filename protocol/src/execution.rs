//! Types of the agent-execution contract.
//!
//! The orchestrator hands an [`AgentRequest`] to an external executor and
//! gets an [`AgentResponse`] back. It never looks inside the output text.

use crate::Agent;
use crate::AgentId;
use crate::ModelConfig;
use crate::Task;
use crate::TaskId;
use crate::TaskStatus;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;

/// Everything an agent is given to work on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub role: String,
    pub goal: String,
    pub backstory: String,
    pub tools: Vec<String>,
    pub model: ModelConfig,
    pub max_iterations: u32,
    pub allow_delegation: bool,
    pub context: TaskContext,
}

impl AgentRequest {
    pub fn new(agent: &Agent, task_id: TaskId, context: TaskContext) -> Self {
        Self {
            task_id,
            agent_id: agent.id.clone(),
            role: agent.role.clone(),
            goal: agent.goal.clone(),
            backstory: agent.backstory.clone(),
            tools: agent.tools.clone(),
            model: agent.model.clone(),
            max_iterations: agent.max_iterations,
            allow_delegation: agent.allow_delegation,
            context,
        }
    }
}

/// Context assembled for a single task invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    pub description: String,
    pub expected_output: String,
    /// Crew-level inputs given to the run.
    pub inputs: Map<String, Value>,
    /// Scratchpad values, empty when memory is disabled for the crew or agent.
    pub memory: BTreeMap<String, Value>,
    /// Outputs of declared dependencies, in declaration order.
    pub dependency_outputs: Vec<DependencyOutput>,
    /// The task's own context mapping.
    pub task_context: Map<String, Value>,
}

impl TaskContext {
    pub fn for_task(task: &Task) -> Self {
        Self {
            description: task.description.clone(),
            expected_output: task.expected_output.clone(),
            task_context: task.context.clone(),
            ..Self::default()
        }
    }
}

/// Result of an upstream task as seen by its dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyOutput {
    pub task_id: TaskId,
    /// Role of the agent that produced the output.
    pub role: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the external executor reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub output: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            output: String::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}
