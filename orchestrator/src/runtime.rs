//! Core orchestrator runtime.

use crate::checkpoint::CheckpointManager;
use crate::checkpoint::CheckpointStore;
use crate::config::OrchestratorConfig;
use crate::error::GraphError;
use crate::error::OrchestratorError;
use crate::events::EventEmitter;
use crate::events::RunEvent;
use crate::events::RunEventMsg;
use crate::executor::AgentExecutor;
use crate::graph::DependencyGraph;
use crate::memory::MemoryBackend;
use crate::memory::Scratchpad;
use crate::report::ResultAggregator;
use crate::report::RunReport;
use crate::report::TaskRecord;
use crate::scheduler::DeclaredDelegator;
use crate::scheduler::Delegator;
use crate::scheduler::HierarchyPlan;
use crate::scheduler::Scheduler;
use crate::scheduler::SchedulerParts;
use crate::state::RunState;
use crate::state::StatusBoard;
use crew_protocol::Crew;
use serde_json::Map;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Runs one crew against an agent executor.
///
/// An orchestrator owns its scratchpad, so it runs one crew execution at a
/// time. Calling [`Orchestrator::run`] again starts over with a cleared
/// scratchpad.
pub struct Orchestrator {
    crew: Arc<Crew>,
    config: OrchestratorConfig,

    /// Agent-execution contract implementation
    executor: Arc<dyn AgentExecutor>,

    scratchpad: Scratchpad,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    delegator: Arc<dyn Delegator>,

    /// Event emitter
    event_emitter: EventEmitter,

    /// State of the latest run, kept for on-demand checkpoints
    current: RwLock<Option<Arc<RunState>>>,
}

impl Orchestrator {
    /// Creates an orchestrator with an in-memory scratchpad, no checkpoint
    /// store and the declared-agent delegator.
    pub fn new(crew: Crew, executor: Arc<dyn AgentExecutor>) -> Self {
        let event_emitter = EventEmitter::new(crew.id.clone(), None);
        Self {
            crew: Arc::new(crew),
            config: OrchestratorConfig::default(),
            executor,
            scratchpad: Scratchpad::in_memory(),
            checkpoint_store: None,
            delegator: Arc::new(DeclaredDelegator),
            event_emitter,
            current: RwLock::new(None),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_memory_backend(mut self, backend: Arc<dyn MemoryBackend>) -> Self {
        self.scratchpad = Scratchpad::new(backend);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    pub fn with_delegator(mut self, delegator: Arc<dyn Delegator>) -> Self {
        self.delegator = delegator;
        self
    }

    pub fn with_event_sender(mut self, sender: UnboundedSender<RunEvent>) -> Self {
        self.event_emitter = EventEmitter::new(self.crew.id.clone(), Some(sender));
        self
    }

    pub fn crew(&self) -> &Crew {
        &self.crew
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn scratchpad(&self) -> &Scratchpad {
        &self.scratchpad
    }

    /// Checks the crew's structure without running anything.
    pub fn validate(&self) -> Result<(), GraphError> {
        self.prepare().map(|_| ())
    }

    fn prepare(&self) -> Result<(Arc<DependencyGraph>, Option<HierarchyPlan>), GraphError> {
        let graph = DependencyGraph::build(&self.crew.agents, &self.crew.tasks)?;
        let plan = HierarchyPlan::classify(&self.crew, &graph)?;
        Ok((Arc::new(graph), plan))
    }

    pub async fn run(&self, inputs: Map<String, Value>) -> Result<RunReport, OrchestratorError> {
        self.run_with_cancel(inputs, CancellationToken::new()).await
    }

    /// Like [`Orchestrator::run`]; cancelling `cancel` stops dispatching new
    /// tasks and winds the run down according to the cancel policy.
    pub async fn run_with_cancel(
        &self,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let (graph, plan) = self.prepare()?;

        self.scratchpad.clear().await?;
        for (key, value) in &inputs {
            self.scratchpad.set(key, value.clone()).await?;
        }

        let state = RunState::new(StatusBoard::new(&graph), inputs, None, None);
        self.execute(graph, plan, Arc::new(state), cancel, false).await
    }

    /// Continues a run from a checkpoint blob. Finished tasks are not run
    /// again.
    pub async fn resume(&self, blob: &[u8]) -> Result<RunReport, OrchestratorError> {
        self.resume_with_cancel(blob, CancellationToken::new()).await
    }

    pub async fn resume_with_cancel(
        &self,
        blob: &[u8],
        cancel: CancellationToken,
    ) -> Result<RunReport, OrchestratorError> {
        let (graph, plan) = self.prepare()?;
        let checkpoint = CheckpointManager::new(&self.crew).load(blob)?;

        let mut board =
            StatusBoard::restore(&graph, &checkpoint.task_statuses, &checkpoint.task_errors);
        board.prepare_resume(&graph, self.config.retry_failed_on_resume);
        let mut scratchpad = checkpoint.scratchpad;
        board.retain_finished_outputs(&mut scratchpad.task_outputs);
        self.scratchpad.restore(scratchpad).await?;

        tracing::info!(
            crew_id = %self.crew.id,
            saved_at = %checkpoint.timestamp,
            "Resuming from checkpoint"
        );
        let state = RunState::new(
            board,
            checkpoint.inputs,
            checkpoint.delegation,
            checkpoint.synthesis,
        );
        self.execute(graph, plan, Arc::new(state), cancel, true).await
    }

    /// Resumes from the latest checkpoint in the configured store.
    pub async fn resume_from_store(&self) -> Result<RunReport, OrchestratorError> {
        let store = self
            .checkpoint_store
            .as_ref()
            .ok_or(OrchestratorError::NoCheckpointStore)?;
        let blob = store.restore(&self.crew.id).await?.ok_or_else(|| {
            OrchestratorError::CheckpointNotFound {
                crew_id: self.crew.id.to_string(),
            }
        })?;
        self.resume(&blob).await
    }

    /// Snapshot of the latest run, or `None` before the first run.
    pub async fn checkpoint(&self) -> Result<Option<Vec<u8>>, OrchestratorError> {
        let current = self.current.read().await.clone();
        match current {
            Some(state) => Ok(Some(state.checkpoint(&self.crew, &self.scratchpad).await?)),
            None => Ok(None),
        }
    }

    async fn execute(
        &self,
        graph: Arc<DependencyGraph>,
        plan: Option<HierarchyPlan>,
        state: Arc<RunState>,
        cancel: CancellationToken,
        resumed: bool,
    ) -> Result<RunReport, OrchestratorError> {
        *self.current.write().await = Some(Arc::clone(&state));

        self.event_emitter.emit(RunEventMsg::RunStarted {
            strategy: self.crew.process.kind().to_string(),
            resumed,
        });

        let timer = self.config.timeout().map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout = ?timeout, "Run timed out");
                cancel.cancel();
            })
        });

        let scheduler = Scheduler::new(SchedulerParts {
            crew: Arc::clone(&self.crew),
            graph: Arc::clone(&graph),
            plan,
            state: Arc::clone(&state),
            scratchpad: self.scratchpad.clone(),
            executor: Arc::clone(&self.executor),
            delegator: Arc::clone(&self.delegator),
            checkpoint_store: self.checkpoint_store.clone(),
            events: self.event_emitter.clone(),
            config: self.config.clone(),
            cancel,
        });
        let outcome = scheduler.run().await;
        if let Some(timer) = timer {
            timer.abort();
        }
        let outcome = outcome?;

        let mut aggregator = ResultAggregator::new();
        let delegation = state.delegation.read().await.clone();
        {
            let board = state.board.read().await;
            for (index, task) in self.crew.tasks.iter().enumerate() {
                let agent_id = delegation
                    .as_ref()
                    .and_then(|delegation| delegation.get(&task.id))
                    .unwrap_or(&task.agent)
                    .clone();
                aggregator.add_result(TaskRecord {
                    task_id: task.id.clone(),
                    agent_id,
                    status: board.status(index),
                    output: self.scratchpad.task_output(&task.id).await?,
                    error: board.error(index).map(str::to_string),
                });
            }
        }

        let report = aggregator.finish(
            self.crew.id.clone(),
            &graph,
            outcome.synthesis,
            outcome.cancelled,
            outcome.checkpoint,
            delegation,
        );
        let summary = report.summary();
        tracing::info!(
            crew_id = %self.crew.id,
            success = report.success,
            cancelled = report.cancelled,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            "Crew run finished"
        );
        self.event_emitter.emit(RunEventMsg::RunCompleted {
            success: report.success,
            cancelled: report.cancelled,
        });
        Ok(report)
    }
}
