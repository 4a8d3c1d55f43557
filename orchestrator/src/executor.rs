//! The agent-execution contract the scheduler calls for every task.

use async_trait::async_trait;
use crew_protocol::execution::AgentRequest;
use crew_protocol::execution::AgentResponse;

/// Runs one task against one agent.
///
/// Prompting, model calls, tools and any retry policy live behind this
/// trait. The orchestrator treats a call as opaque, possibly slow and
/// possibly failing. Returning `Err` counts as a failed response.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: AgentRequest) -> anyhow::Result<AgentResponse>;
}

/// Calls the executor and folds its result into output-or-error.
pub(crate) async fn invoke(
    executor: &dyn AgentExecutor,
    request: AgentRequest,
) -> Result<String, String> {
    let task_id = request.task_id.clone();
    let agent_id = request.agent_id.clone();
    tracing::info!(
        task_id = %task_id,
        agent_id = %agent_id,
        role = %request.role,
        "Invoking agent"
    );

    match executor.execute(request).await {
        Ok(AgentResponse {
            output,
            success: true,
            ..
        }) => Ok(output),
        Ok(AgentResponse { error, .. }) => {
            Err(error.unwrap_or_else(|| "agent reported failure".to_string()))
        }
        Err(err) => Err(format!("{err:#}")),
    }
}
