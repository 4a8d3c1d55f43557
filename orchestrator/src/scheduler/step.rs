//! One task invocation: context assembly, the agent call and recording
//! the output.

use crate::executor::AgentExecutor;
use crate::executor::invoke;
use crate::memory::Scratchpad;
use crew_protocol::Agent;
use crew_protocol::Task;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use crew_protocol::execution::AgentRequest;
use crew_protocol::execution::DependencyOutput;
use crew_protocol::execution::TaskContext;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;

/// Task id and scratchpad key of the implicit synthesis step.
pub const SYNTHESIS_KEY: &str = "synthesis";

const SYNTHESIS_DESCRIPTION: &str =
    "Combine the results of the delegated tasks into one final answer.";

/// Status of an upstream task at dispatch time. The output itself is read
/// from the scratchpad when the task starts.
#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    pub(crate) task_id: TaskId,
    pub(crate) role: String,
    pub(crate) status: TaskStatus,
    pub(crate) error: Option<String>,
}

/// Everything a spawned task needs, resolved by the scheduler loop.
pub(crate) struct Dispatch {
    pub(crate) task: Task,
    pub(crate) agent: Agent,
    pub(crate) upstream: Vec<Upstream>,
}

/// Cheap to clone; one copy moves into every spawned task.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    executor: Arc<dyn AgentExecutor>,
    scratchpad: Scratchpad,
    inputs: Arc<Map<String, Value>>,
    crew_memory: bool,
}

impl TaskRunner {
    pub(crate) fn new(
        executor: Arc<dyn AgentExecutor>,
        scratchpad: Scratchpad,
        inputs: Map<String, Value>,
        crew_memory: bool,
    ) -> Self {
        Self {
            executor,
            scratchpad,
            inputs: Arc::new(inputs),
            crew_memory,
        }
    }

    /// Runs a declared task and appends its output to the ledger.
    pub(crate) async fn execute(self, dispatch: Dispatch) -> Result<String, String> {
        let Dispatch {
            task,
            agent,
            upstream,
        } = dispatch;
        let context = self
            .assemble(TaskContext::for_task(&task), &agent, upstream)
            .await?;

        let output = invoke(
            self.executor.as_ref(),
            AgentRequest::new(&agent, task.id.clone(), context),
        )
        .await?;

        self.scratchpad
            .append_task_output(&task.id, output.clone())
            .await
            .map_err(|err| err.to_string())?;
        Ok(output)
    }

    /// Asks the manager to combine worker outputs when the crew declares no
    /// synthesis task. The result is stored under [`SYNTHESIS_KEY`].
    pub(crate) async fn synthesize(
        self,
        manager: Agent,
        upstream: Vec<Upstream>,
    ) -> Result<String, String> {
        let base = TaskContext {
            description: SYNTHESIS_DESCRIPTION.to_string(),
            ..TaskContext::default()
        };
        let context = self.assemble(base, &manager, upstream).await?;

        let output = invoke(
            self.executor.as_ref(),
            AgentRequest::new(&manager, TaskId::from(SYNTHESIS_KEY), context),
        )
        .await?;

        self.scratchpad
            .set(SYNTHESIS_KEY, Value::String(output.clone()))
            .await
            .map_err(|err| err.to_string())?;
        Ok(output)
    }

    async fn assemble(
        &self,
        mut context: TaskContext,
        agent: &Agent,
        upstream: Vec<Upstream>,
    ) -> Result<TaskContext, String> {
        context.inputs = self.inputs.as_ref().clone();

        if self.crew_memory && agent.memory_enabled {
            context.memory = self
                .scratchpad
                .values()
                .await
                .map_err(|err| err.to_string())?;
        }

        for dep in upstream {
            let output = match dep.status {
                TaskStatus::Succeeded => self
                    .scratchpad
                    .task_output(&dep.task_id)
                    .await
                    .map_err(|err| err.to_string())?,
                _ => None,
            };
            context.dependency_outputs.push(DependencyOutput {
                task_id: dep.task_id,
                role: dep.role,
                status: dep.status,
                output,
                error: dep.error,
            });
        }
        Ok(context)
    }
}
