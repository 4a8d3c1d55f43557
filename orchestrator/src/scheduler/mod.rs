//! Strategy engine: turns a validated crew into task invocations.
//!
//! All three strategies share one loop. It keeps a set of spawned tasks,
//! dispatches whatever the strategy allows next, and applies every status
//! transition itself when a task reports back. Spawned tasks never touch the
//! status board.

mod hierarchy;
mod step;

pub use hierarchy::DELEGATION_KEY;
pub use hierarchy::DeclaredDelegator;
pub use hierarchy::Delegation;
pub use hierarchy::DelegationRequest;
pub use hierarchy::Delegator;
pub use hierarchy::HierarchyPlan;
pub use step::SYNTHESIS_KEY;

use crate::checkpoint::CheckpointStore;
use crate::config::CancelPolicy;
use crate::config::OrchestratorConfig;
use crate::error::GraphError;
use crate::error::OrchestratorError;
use crate::events::EventEmitter;
use crate::events::RunEventMsg;
use crate::executor::AgentExecutor;
use crate::graph::DependencyGraph;
use crate::graph::ReadinessPolicy;
use crate::memory::Scratchpad;
use crate::state::RunState;
use crew_protocol::Agent;
use crew_protocol::AgentId;
use crew_protocol::Crew;
use crew_protocol::Process;
use crew_protocol::SubProcess;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use hierarchy::complete_delegation;
use hierarchy::delegation_value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use step::Dispatch;
use step::TaskRunner;
use step::Upstream;
use tokio::task::AbortHandle;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Walk the topological order one task at a time, letting
    /// `async_execution` tasks overlap with what follows them.
    Sequential,
    /// Dispatch every ready task up to the concurrency limit.
    Parallel,
}

impl From<SubProcess> for Mode {
    fn from(sub: SubProcess) -> Self {
        match sub {
            SubProcess::Sequential => Mode::Sequential,
            SubProcess::Parallel => Mode::Parallel,
        }
    }
}

/// In-flight futures are `Sync` so that `&Scheduler` can be held across
/// awaits inside a spawned run.
type TaskFuture = Pin<Box<dyn Future<Output = Finished> + Send + Sync>>;

struct Finished {
    index: usize,
    result: Result<Result<String, String>, JoinError>,
}

struct InFlight {
    abort: AbortHandle,
    /// Runs alone: nothing else may start until it finishes.
    exclusive: bool,
}

/// Collaborators the scheduler borrows from the orchestrator for one run.
pub(crate) struct SchedulerParts {
    pub(crate) crew: Arc<Crew>,
    pub(crate) graph: Arc<DependencyGraph>,
    pub(crate) plan: Option<HierarchyPlan>,
    pub(crate) state: Arc<RunState>,
    pub(crate) scratchpad: Scratchpad,
    pub(crate) executor: Arc<dyn AgentExecutor>,
    pub(crate) delegator: Arc<dyn Delegator>,
    pub(crate) checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    pub(crate) events: EventEmitter,
    pub(crate) config: OrchestratorConfig,
    pub(crate) cancel: CancellationToken,
}

/// What the scheduler hands back once no more work will start.
#[derive(Debug, Default)]
pub(crate) struct SchedulerOutcome {
    pub(crate) cancelled: bool,
    /// Result of the implicit synthesis step, when one ran.
    pub(crate) synthesis: Option<Result<String, String>>,
    pub(crate) checkpoint: Option<Vec<u8>>,
}

pub(crate) struct Scheduler {
    crew: Arc<Crew>,
    graph: Arc<DependencyGraph>,
    plan: Option<HierarchyPlan>,
    state: Arc<RunState>,
    scratchpad: Scratchpad,
    runner: TaskRunner,
    delegator: Arc<dyn Delegator>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    events: EventEmitter,
    policy: ReadinessPolicy,
    limit: usize,
    cancel_policy: CancelPolicy,
    cancel: CancellationToken,
    in_flight: FuturesUnordered<TaskFuture>,
    running: HashMap<usize, InFlight>,
    stopped: bool,
    outcome: SchedulerOutcome,
}

impl Scheduler {
    pub(crate) fn new(parts: SchedulerParts) -> Self {
        let SchedulerParts {
            crew,
            graph,
            plan,
            state,
            scratchpad,
            executor,
            delegator,
            checkpoint_store,
            events,
            config,
            cancel,
        } = parts;

        let runner = TaskRunner::new(
            executor,
            scratchpad.clone(),
            state.inputs.clone(),
            crew.memory,
        );
        let policy = if crew.continue_on_failure {
            ReadinessPolicy::Lenient
        } else {
            ReadinessPolicy::Strict
        };

        Self {
            limit: config.concurrency_limit(),
            cancel_policy: config.cancel_policy,
            crew,
            graph,
            plan,
            state,
            scratchpad,
            runner,
            delegator,
            checkpoint_store,
            events,
            policy,
            cancel,
            in_flight: FuturesUnordered::new(),
            running: HashMap::new(),
            stopped: false,
            outcome: SchedulerOutcome::default(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<SchedulerOutcome, OrchestratorError> {
        let order = self.graph.topological_order().to_vec();
        match self.crew.process.clone() {
            Process::Sequential => self.drive(&order, Mode::Sequential).await?,
            Process::Parallel => self.drive(&order, Mode::Parallel).await?,
            Process::Hierarchical { .. } => self.run_hierarchical().await?,
        }

        if self.stopped {
            self.cancel_remaining().await?;
        } else {
            self.skip_remaining(&order).await?;
        }
        self.outcome.cancelled = self.stopped;
        if self.crew.checkpoint_enabled {
            self.save_checkpoint().await;
        }
        Ok(self.outcome)
    }

    async fn run_hierarchical(&mut self) -> Result<(), OrchestratorError> {
        let Some(plan) = self.plan.clone() else {
            return Err(GraphError::InvalidHierarchy {
                message: "hierarchical crew was not classified".to_string(),
            }
            .into());
        };

        self.drive(&plan.planning, Mode::Sequential).await?;
        if self.stopped {
            return Ok(());
        }
        let planning_ok = {
            let board = self.state.board.read().await;
            plan.planning
                .iter()
                .all(|&index| board.status(index) == TaskStatus::Succeeded)
        };
        if !planning_ok {
            tracing::warn!(crew_id = %self.crew.id, "Planning failed; skipping delegated work");
            return Ok(());
        }

        self.record_delegation(&plan).await?;

        self.drive(&plan.workers, plan.workers_mode.into()).await?;
        if self.stopped {
            return Ok(());
        }

        if plan.synthesis.is_empty() {
            self.synthesize(&plan).await?;
        } else {
            self.drive(&plan.synthesis, Mode::Sequential).await?;
        }
        Ok(())
    }

    async fn record_delegation(&mut self, plan: &HierarchyPlan) -> Result<(), OrchestratorError> {
        let restored = self.state.delegation.read().await.clone();
        let delegation = match restored {
            Some(delegation) => {
                tracing::info!(crew_id = %self.crew.id, "Reusing delegation from checkpoint");
                delegation
            }
            None => {
                let manager = self.agent(&plan.manager, plan.planning.first().copied())?;
                let request = DelegationRequest {
                    manager,
                    planning_outputs: self.scratchpad.task_outputs().await?,
                    worker_tasks: plan
                        .workers
                        .iter()
                        .map(|&index| self.crew.tasks[index].clone())
                        .collect(),
                    agents: self.crew.agents.clone(),
                };
                let proposed = self.delegator.delegate(request).await?;
                complete_delegation(&self.crew, plan, &self.graph, proposed)?
            }
        };

        self.scratchpad
            .set(DELEGATION_KEY, delegation_value(&delegation))
            .await?;
        *self.state.delegation.write().await = Some(delegation.clone());
        self.events.emit(RunEventMsg::DelegationRecorded {
            assignments: delegation,
        });
        Ok(())
    }

    async fn synthesize(&mut self, plan: &HierarchyPlan) -> Result<(), OrchestratorError> {
        let previous = self.state.synthesis.read().await.clone();
        if let Some(previous) = previous {
            tracing::info!(crew_id = %self.crew.id, "Synthesis already recorded; not re-running");
            self.outcome.synthesis = Some(Ok(previous));
            return Ok(());
        }

        if self.cancel.is_cancelled() {
            self.stop();
            return Ok(());
        }

        let manager = self.agent(&plan.manager, None)?;
        let upstream = self.upstream(&plan.workers).await?;
        let call = self.runner.clone().synthesize(manager, upstream);

        let cancel = self.cancel.clone();
        let abandon = self.cancel_policy == CancelPolicy::Abandon;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled(), if abandon => None,
            result = call => Some(result),
        };
        match result {
            Some(Ok(output)) => {
                tracing::info!(crew_id = %self.crew.id, "Synthesis complete");
                *self.state.synthesis.write().await = Some(output.clone());
                self.outcome.synthesis = Some(Ok(output));
            }
            Some(Err(error)) => {
                tracing::warn!(crew_id = %self.crew.id, error = %error, "Synthesis failed");
                self.outcome.synthesis = Some(Err(error));
            }
            None => self.stopped = true,
        }
        Ok(())
    }

    /// Runs the tasks in `scope` (given in topological order) until none is
    /// in flight and none can start.
    async fn drive(&mut self, scope: &[usize], mode: Mode) -> Result<(), OrchestratorError> {
        let mut in_scope = vec![false; self.graph.len()];
        for &index in scope {
            in_scope[index] = true;
        }
        let mut by_declaration = scope.to_vec();
        by_declaration.sort_unstable();
        let mut cursor = 0;

        loop {
            if !self.stopped && self.cancel.is_cancelled() {
                self.stop();
            }
            if !self.stopped {
                self.mark_ready(&in_scope).await?;
                match mode {
                    Mode::Sequential => self.dispatch_sequential(scope, &mut cursor).await?,
                    Mode::Parallel => self.dispatch_parallel(&by_declaration).await?,
                }
            }

            if self.in_flight.is_empty() {
                if !self.stopped {
                    self.skip_remaining(scope).await?;
                }
                return Ok(());
            }

            let cancel = self.cancel.clone();
            let watch_cancel = !self.stopped;
            let next = tokio::select! {
                finished = self.in_flight.next() => finished,
                _ = cancel.cancelled(), if watch_cancel => None,
            };
            if let Some(finished) = next {
                self.complete(finished).await?;
            }
        }
    }

    fn stop(&mut self) {
        tracing::info!(
            crew_id = %self.crew.id,
            policy = ?self.cancel_policy,
            in_flight = self.running.len(),
            "Cancellation requested"
        );
        self.stopped = true;
        if self.cancel_policy == CancelPolicy::Abandon {
            for task in self.running.values() {
                task.abort.abort();
            }
        }
    }

    async fn mark_ready(&mut self, in_scope: &[bool]) -> Result<(), OrchestratorError> {
        let mut board = self.state.board.write().await;
        let ready = self.graph.ready_tasks(board.statuses(), self.policy);
        for index in ready {
            if in_scope[index] && board.status(index) == TaskStatus::Pending {
                board.transition(index, TaskStatus::Ready)?;
                self.events.task_ready(self.graph.task_id(index));
            }
        }
        Ok(())
    }

    async fn dispatch_sequential(
        &mut self,
        order: &[usize],
        cursor: &mut usize,
    ) -> Result<(), OrchestratorError> {
        while let Some(&index) = order.get(*cursor) {
            let status = self.state.board.read().await.status(index);
            if status.is_terminal() || status == TaskStatus::Running {
                *cursor += 1;
                continue;
            }
            if status != TaskStatus::Ready || self.running.values().any(|task| task.exclusive) {
                return Ok(());
            }

            if self.crew.tasks[index].async_execution {
                if self.running.len() >= self.limit {
                    return Ok(());
                }
                self.dispatch(index, false).await?;
                *cursor += 1;
            } else {
                if !self.running.is_empty() {
                    return Ok(());
                }
                self.dispatch(index, true).await?;
                *cursor += 1;
                return Ok(());
            }
        }
        Ok(())
    }

    async fn dispatch_parallel(&mut self, by_declaration: &[usize]) -> Result<(), OrchestratorError> {
        for &index in by_declaration {
            if self.running.len() >= self.limit {
                break;
            }
            let status = self.state.board.read().await.status(index);
            if status == TaskStatus::Ready {
                self.dispatch(index, false).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, index: usize, exclusive: bool) -> Result<(), OrchestratorError> {
        let task = self.crew.tasks[index].clone();
        let agent = self.assigned_agent(index).await?;

        let mut upstream_ids = self.graph.dependencies(index).to_vec();
        if let Some(plan) = &self.plan {
            if plan.is_synthesis(index) {
                for &worker in &plan.workers {
                    if !upstream_ids.contains(&worker) {
                        upstream_ids.push(worker);
                    }
                }
            }
        }
        let upstream = self.upstream(&upstream_ids).await?;

        self.state
            .board
            .write()
            .await
            .transition(index, TaskStatus::Running)?;
        self.events.task_started(&task.id, &agent.id);

        let handle = tokio::spawn(self.runner.clone().execute(Dispatch {
            task,
            agent,
            upstream,
        }));
        self.running.insert(
            index,
            InFlight {
                abort: handle.abort_handle(),
                exclusive,
            },
        );
        self.in_flight.push(Box::pin(async move {
            Finished {
                index,
                result: handle.await,
            }
        }));
        Ok(())
    }

    async fn complete(&mut self, finished: Finished) -> Result<(), OrchestratorError> {
        let Finished { index, result } = finished;
        self.running.remove(&index);
        let task_id = self.graph.task_id(index).clone();

        match result {
            Ok(Ok(_output)) => {
                self.state
                    .board
                    .write()
                    .await
                    .transition(index, TaskStatus::Succeeded)?;
                self.events.task_succeeded(&task_id);
            }
            Ok(Err(error)) => self.fail(index, error).await?,
            Err(err) if err.is_cancelled() => {
                self.state
                    .board
                    .write()
                    .await
                    .transition(index, TaskStatus::Cancelled)?;
                self.events.task_cancelled(&task_id);
            }
            Err(err) => self.fail(index, format!("task panicked: {err}")).await?,
        }

        if self.crew.checkpoint_enabled {
            self.save_checkpoint().await;
        }
        Ok(())
    }

    async fn fail(&mut self, index: usize, error: String) -> Result<(), OrchestratorError> {
        let task_id = self.graph.task_id(index).clone();
        self.events.task_failed(&task_id, &error);

        let mut board = self.state.board.write().await;
        board.fail(index, error)?;
        if self.crew.continue_on_failure {
            return Ok(());
        }
        for dependent in self.graph.dependents_closure(index) {
            if matches!(
                board.status(dependent),
                TaskStatus::Pending | TaskStatus::Ready
            ) {
                board.transition(dependent, TaskStatus::Skipped)?;
                self.events
                    .task_skipped(self.graph.task_id(dependent), Some(&task_id));
            }
        }
        Ok(())
    }

    /// Marks tasks in `scope` that can no longer start as skipped.
    async fn skip_remaining(&mut self, scope: &[usize]) -> Result<(), OrchestratorError> {
        let mut board = self.state.board.write().await;
        for &index in scope {
            if matches!(board.status(index), TaskStatus::Pending | TaskStatus::Ready) {
                tracing::debug!(task_id = %self.graph.task_id(index), "Skipping unreachable task");
                board.transition(index, TaskStatus::Skipped)?;
                self.events.task_skipped(self.graph.task_id(index), None);
            }
        }
        Ok(())
    }

    async fn cancel_remaining(&mut self) -> Result<(), OrchestratorError> {
        let mut board = self.state.board.write().await;
        for index in 0..board.len() {
            if !board.status(index).is_terminal() {
                board.transition(index, TaskStatus::Cancelled)?;
                self.events.task_cancelled(self.graph.task_id(index));
            }
        }
        Ok(())
    }

    async fn save_checkpoint(&mut self) {
        let blob = match self.state.checkpoint(&self.crew, &self.scratchpad).await {
            Ok(blob) => blob,
            Err(err) => {
                tracing::warn!(crew_id = %self.crew.id, error = %err, "Failed to capture checkpoint");
                return;
            }
        };
        if let Some(store) = &self.checkpoint_store {
            if let Err(err) = store.persist(&self.crew.id, &blob).await {
                tracing::warn!(crew_id = %self.crew.id, error = %err, "Failed to persist checkpoint");
            }
        }
        self.events.emit(RunEventMsg::CheckpointSaved { bytes: blob.len() });
        self.outcome.checkpoint = Some(blob);
    }

    async fn upstream(&self, indices: &[usize]) -> Result<Vec<Upstream>, OrchestratorError> {
        let mut upstream = Vec::with_capacity(indices.len());
        for &index in indices {
            let role = self.assigned_agent(index).await?.role;
            let board = self.state.board.read().await;
            upstream.push(Upstream {
                task_id: self.graph.task_id(index).clone(),
                role,
                status: board.status(index),
                error: board.error(index).map(str::to_string),
            });
        }
        Ok(upstream)
    }

    /// The agent that runs (or ran) a task, honoring delegation.
    async fn assigned_agent(&self, index: usize) -> Result<Agent, OrchestratorError> {
        let task = &self.crew.tasks[index];
        let delegated = self
            .state
            .delegation
            .read()
            .await
            .as_ref()
            .and_then(|delegation| delegation.get(&task.id).cloned());
        let agent_id = delegated.unwrap_or_else(|| task.agent.clone());
        self.agent(&agent_id, Some(index))
    }

    fn agent(
        &self,
        agent_id: &AgentId,
        task: Option<usize>,
    ) -> Result<Agent, OrchestratorError> {
        self.crew.agent(agent_id).cloned().ok_or_else(|| {
            let task_id = match task {
                Some(index) => self.graph.task_id(index).clone(),
                None => TaskId::from(SYNTHESIS_KEY),
            };
            GraphError::UnknownAgent {
                task_id,
                agent_id: agent_id.clone(),
            }
            .into()
        })
    }
}
