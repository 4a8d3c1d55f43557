//! Manager-led crews: task classification and worker delegation.

use crate::error::DelegationError;
use crate::error::GraphError;
use crate::graph::DependencyGraph;
use async_trait::async_trait;
use crew_protocol::Agent;
use crew_protocol::AgentId;
use crew_protocol::Crew;
use crew_protocol::Process;
use crew_protocol::SubProcess;
use crew_protocol::Task;
use crew_protocol::TaskId;
use crew_protocol::checkpoint::TaskOutputEntry;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashSet;

/// Scratchpad key holding the recorded worker assignments.
pub const DELEGATION_KEY: &str = "delegation";

/// Worker task id to the agent that runs it.
pub type Delegation = BTreeMap<TaskId, AgentId>;

/// Tasks of a hierarchical crew split into the three phases.
///
/// Manager tasks with no worker upstream are planning tasks; the other
/// manager tasks synthesize. Each list is in topological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyPlan {
    pub manager: AgentId,
    pub workers_mode: SubProcess,
    pub planning: Vec<usize>,
    pub workers: Vec<usize>,
    pub synthesis: Vec<usize>,
}

impl HierarchyPlan {
    /// Returns `None` for crews that are not hierarchical.
    pub fn classify(crew: &Crew, graph: &DependencyGraph) -> Result<Option<Self>, GraphError> {
        let Process::Hierarchical { manager, workers } = &crew.process else {
            return Ok(None);
        };
        if crew.agent(manager).is_none() {
            return Err(GraphError::InvalidHierarchy {
                message: format!("manager agent {manager} is not part of the crew"),
            });
        }

        let is_manager_task = |index: usize| &crew.tasks[index].agent == manager;
        let mut plan = HierarchyPlan {
            manager: manager.clone(),
            workers_mode: *workers,
            planning: Vec::new(),
            workers: Vec::new(),
            synthesis: Vec::new(),
        };

        for &index in graph.topological_order() {
            if !is_manager_task(index) {
                plan.workers.push(index);
            } else if graph
                .ancestors(index)
                .into_iter()
                .any(|ancestor| !is_manager_task(ancestor))
            {
                plan.synthesis.push(index);
            } else {
                plan.planning.push(index);
            }
        }

        let synthesis: HashSet<usize> = plan.synthesis.iter().copied().collect();
        for &worker in &plan.workers {
            if let Some(blocker) = graph
                .ancestors(worker)
                .into_iter()
                .find(|ancestor| synthesis.contains(ancestor))
            {
                return Err(GraphError::InvalidHierarchy {
                    message: format!(
                        "worker task {} depends on synthesis task {}",
                        graph.task_id(worker),
                        graph.task_id(blocker)
                    ),
                });
            }
        }

        Ok(Some(plan))
    }

    pub fn is_synthesis(&self, index: usize) -> bool {
        self.synthesis.contains(&index)
    }
}

/// What the manager knows when it assigns worker tasks.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub manager: Agent,
    pub planning_outputs: Vec<TaskOutputEntry>,
    pub worker_tasks: Vec<Task>,
    pub agents: Vec<Agent>,
}

/// Chooses which agent runs each worker task.
///
/// Tasks left out of the returned map keep their declared agent.
#[async_trait]
pub trait Delegator: Send + Sync {
    async fn delegate(&self, request: DelegationRequest) -> Result<Delegation, DelegationError>;
}

/// Assigns every worker task to the agent it was declared with.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredDelegator;

#[async_trait]
impl Delegator for DeclaredDelegator {
    async fn delegate(&self, request: DelegationRequest) -> Result<Delegation, DelegationError> {
        Ok(request
            .worker_tasks
            .into_iter()
            .map(|task| (task.id, task.agent))
            .collect())
    }
}

/// Checks a delegator's answer and fills in declared agents for the worker
/// tasks it did not mention.
pub(crate) fn complete_delegation(
    crew: &Crew,
    plan: &HierarchyPlan,
    graph: &DependencyGraph,
    proposed: Delegation,
) -> Result<Delegation, DelegationError> {
    for (task_id, agent_id) in &proposed {
        let Some(index) = graph.index_of(task_id) else {
            return Err(DelegationError::UnknownTask {
                task_id: task_id.clone(),
            });
        };
        if !plan.workers.contains(&index) {
            return Err(DelegationError::NotAWorker {
                task_id: task_id.clone(),
            });
        }
        if crew.agent(agent_id).is_none() {
            return Err(DelegationError::UnknownAgent {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
            });
        }
    }

    let mut delegation = proposed;
    for &index in &plan.workers {
        let task = &crew.tasks[index];
        delegation
            .entry(task.id.clone())
            .or_insert_with(|| task.agent.clone());
    }
    Ok(delegation)
}

/// Scratchpad form of a delegation: task id to agent id.
pub(crate) fn delegation_value(delegation: &Delegation) -> Value {
    let assignments: Map<String, Value> = delegation
        .iter()
        .map(|(task_id, agent_id)| (task_id.to_string(), Value::String(agent_id.to_string())))
        .collect();
    Value::Object(assignments)
}
