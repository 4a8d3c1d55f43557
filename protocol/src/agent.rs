//! Agent definitions.

use crate::AgentId;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

/// Default ceiling on reasoning iterations handed to the executor.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// A named worker with a persona and execution configuration.
///
/// Agents are immutable once a run starts. Everything an agent "does" lives
/// behind the external executor; the orchestrator only forwards these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    /// Role or specialty, e.g. "planner" or "researcher".
    pub role: String,
    /// What the agent is trying to accomplish.
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    /// Names of the tools the executor may expose to this agent.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub model: ModelConfig,
    /// Whether the agent sees the shared scratchpad in its task context.
    #[serde(default = "default_true")]
    pub memory_enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub allow_delegation: bool,
}

/// Model parameters passed through untouched to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Provider-specific settings.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

impl Agent {
    pub fn new(role: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: AgentId::random(),
            role: role.into(),
            goal: goal.into(),
            backstory: String::new(),
            tools: Vec::new(),
            model: ModelConfig::default(),
            memory_enabled: true,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            allow_delegation: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<AgentId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_backstory(mut self, backstory: impl Into<String>) -> Self {
        self.backstory = backstory.into();
        self
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_memory(mut self, enabled: bool) -> Self {
        self.memory_enabled = enabled;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_delegation(mut self, allow: bool) -> Self {
        self.allow_delegation = allow;
        self
    }
}
