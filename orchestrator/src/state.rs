//! Per-run task status bookkeeping.

use crate::checkpoint::CheckpointManager;
use crate::checkpoint::RunSnapshot;
use crate::error::InvalidTransition;
use crate::error::OrchestratorError;
use crate::graph::DependencyGraph;
use crate::memory::Scratchpad;
use crew_protocol::AgentId;
use crew_protocol::Crew;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use serde_json::Map;
use serde_json::Value;
use crew_protocol::checkpoint::TaskOutputEntry;
use std::collections::BTreeMap;
use std::collections::HashSet;
use tokio::sync::RwLock;

/// Status and error of every task, addressed by declaration index.
///
/// Only the scheduler loop writes to the board. Every write goes through the
/// status machine except [`StatusBoard::restore`].
#[derive(Debug, Clone)]
pub struct StatusBoard {
    task_ids: Vec<TaskId>,
    statuses: Vec<TaskStatus>,
    errors: Vec<Option<String>>,
}

impl StatusBoard {
    pub fn new(graph: &DependencyGraph) -> Self {
        let task_ids: Vec<TaskId> = (0..graph.len()).map(|i| graph.task_id(i).clone()).collect();
        Self {
            statuses: vec![TaskStatus::Pending; task_ids.len()],
            errors: vec![None; task_ids.len()],
            task_ids,
        }
    }

    /// Rebuilds a board with the exact statuses of a checkpoint. Tasks the
    /// checkpoint does not mention start out `Pending`.
    pub fn restore(
        graph: &DependencyGraph,
        statuses: &BTreeMap<TaskId, TaskStatus>,
        errors: &BTreeMap<TaskId, String>,
    ) -> Self {
        let mut board = Self::new(graph);
        for (i, task_id) in board.task_ids.iter().enumerate() {
            match statuses.get(task_id) {
                Some(status) => board.statuses[i] = *status,
                None => tracing::warn!(task_id = %task_id, "Task missing from checkpoint; treating as pending"),
            }
            board.errors[i] = errors.get(task_id).cloned();
        }
        board
    }

    /// Normalizes restored statuses so the scheduler can re-enter.
    ///
    /// Tasks that never finished go back to `Pending`. With `retry_failed`,
    /// failed tasks do too, along with the dependents their failure skipped.
    /// `Succeeded` and (otherwise) `Skipped` tasks are left alone.
    pub fn prepare_resume(&mut self, graph: &DependencyGraph, retry_failed: bool) {
        for status in &mut self.statuses {
            if matches!(
                status,
                TaskStatus::Ready | TaskStatus::Running | TaskStatus::Cancelled
            ) {
                *status = TaskStatus::Pending;
            }
        }

        if !retry_failed {
            return;
        }
        let failed: Vec<usize> = (0..self.statuses.len())
            .filter(|&i| self.statuses[i] == TaskStatus::Failed)
            .collect();
        for index in failed {
            tracing::info!(task_id = %self.task_ids[index], "Retrying failed task on resume");
            self.statuses[index] = TaskStatus::Pending;
            self.errors[index] = None;
            for dependent in graph.dependents_closure(index) {
                if self.statuses[dependent] == TaskStatus::Skipped {
                    self.statuses[dependent] = TaskStatus::Pending;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn status(&self, index: usize) -> TaskStatus {
        self.statuses[index]
    }

    pub fn statuses(&self) -> &[TaskStatus] {
        &self.statuses
    }

    pub fn error(&self, index: usize) -> Option<&str> {
        self.errors[index].as_deref()
    }

    pub fn transition(&mut self, index: usize, to: TaskStatus) -> Result<(), InvalidTransition> {
        let from = self.statuses[index];
        if !from.can_transition_to(to) {
            return Err(InvalidTransition {
                task_id: self.task_ids[index].clone(),
                from,
                to,
            });
        }
        self.statuses[index] = to;
        Ok(())
    }

    /// Moves a running task to `Failed` and records why.
    pub fn fail(&mut self, index: usize, error: String) -> Result<(), InvalidTransition> {
        self.transition(index, TaskStatus::Failed)?;
        self.errors[index] = Some(error);
        Ok(())
    }

    /// Drops ledger entries of tasks that are not `Succeeded`, so a task
    /// that runs again can record its output.
    pub fn retain_finished_outputs(&self, outputs: &mut Vec<TaskOutputEntry>) {
        let succeeded: HashSet<&TaskId> = self
            .task_ids
            .iter()
            .zip(&self.statuses)
            .filter(|(_, status)| **status == TaskStatus::Succeeded)
            .map(|(task_id, _)| task_id)
            .collect();
        outputs.retain(|entry| {
            let keep = succeeded.contains(&entry.task_id);
            if !keep {
                tracing::debug!(task_id = %entry.task_id, "Dropping output of unfinished task");
            }
            keep
        });
    }

    pub fn status_map(&self) -> BTreeMap<TaskId, TaskStatus> {
        self.task_ids
            .iter()
            .cloned()
            .zip(self.statuses.iter().copied())
            .collect()
    }

    pub fn error_map(&self) -> BTreeMap<TaskId, String> {
        self.task_ids
            .iter()
            .zip(&self.errors)
            .filter_map(|(task_id, error)| Some((task_id.clone(), error.clone()?)))
            .collect()
    }
}

/// State of the run in progress, shared between the scheduler and
/// on-demand checkpoints.
pub(crate) struct RunState {
    pub(crate) board: RwLock<StatusBoard>,
    pub(crate) delegation: RwLock<Option<BTreeMap<TaskId, AgentId>>>,
    /// Output of the implicit synthesis step once it succeeded.
    pub(crate) synthesis: RwLock<Option<String>>,
    pub(crate) inputs: Map<String, Value>,
}

impl RunState {
    pub(crate) fn new(
        board: StatusBoard,
        inputs: Map<String, Value>,
        delegation: Option<BTreeMap<TaskId, AgentId>>,
        synthesis: Option<String>,
    ) -> Self {
        Self {
            board: RwLock::new(board),
            delegation: RwLock::new(delegation),
            synthesis: RwLock::new(synthesis),
            inputs,
        }
    }

    /// Serializes the current statuses and scratchpad contents.
    pub(crate) async fn checkpoint(
        &self,
        crew: &Crew,
        scratchpad: &Scratchpad,
    ) -> Result<Vec<u8>, OrchestratorError> {
        let (statuses, errors) = {
            let board = self.board.read().await;
            (board.status_map(), board.error_map())
        };
        let delegation = self.delegation.read().await.clone();
        let synthesis = self.synthesis.read().await.clone();
        let snapshot = RunSnapshot {
            statuses,
            errors,
            scratchpad: scratchpad.snapshot().await?,
            inputs: self.inputs.clone(),
            delegation,
            synthesis,
        };
        Ok(CheckpointManager::new(crew).save(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_protocol::Agent;
    use crew_protocol::Task;
    use pretty_assertions::assert_eq;

    fn graph() -> DependencyGraph {
        DependencyGraph::build(
            &[Agent::new("worker", "work").with_id("w")],
            &[
                Task::new("a", "w").with_id("a"),
                Task::new("b", "w").with_id("b").depends_on("a"),
                Task::new("c", "w").with_id("c").depends_on("b"),
                Task::new("d", "w").with_id("d"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn transitions_go_through_the_status_machine() {
        let mut board = StatusBoard::new(&graph());
        board.transition(0, TaskStatus::Ready).unwrap();
        board.transition(0, TaskStatus::Running).unwrap();
        board.fail(0, "boom".to_string()).unwrap();

        assert_eq!(board.error(0), Some("boom"));
        let err = board.transition(0, TaskStatus::Pending).unwrap_err();
        assert_eq!(err.from, TaskStatus::Failed);
        assert_eq!(
            board.error_map(),
            BTreeMap::from([(TaskId::from("a"), "boom".to_string())])
        );
    }

    #[test]
    fn resume_keeps_finished_work() {
        let graph = graph();
        let statuses = BTreeMap::from([
            (TaskId::from("a"), TaskStatus::Succeeded),
            (TaskId::from("b"), TaskStatus::Running),
            (TaskId::from("c"), TaskStatus::Cancelled),
            (TaskId::from("d"), TaskStatus::Skipped),
        ]);
        let mut board = StatusBoard::restore(&graph, &statuses, &BTreeMap::new());
        assert_eq!(board.status_map(), statuses);

        board.prepare_resume(&graph, false);
        assert_eq!(
            board.statuses(),
            &[
                TaskStatus::Succeeded,
                TaskStatus::Pending,
                TaskStatus::Pending,
                TaskStatus::Skipped,
            ]
        );
    }

    #[test]
    fn retrying_failures_reopens_skipped_dependents() {
        let graph = graph();
        let statuses = BTreeMap::from([
            (TaskId::from("a"), TaskStatus::Failed),
            (TaskId::from("b"), TaskStatus::Skipped),
            (TaskId::from("c"), TaskStatus::Skipped),
            (TaskId::from("d"), TaskStatus::Succeeded),
        ]);
        let errors = BTreeMap::from([(TaskId::from("a"), "boom".to_string())]);

        let mut kept = StatusBoard::restore(&graph, &statuses, &errors);
        kept.prepare_resume(&graph, false);
        assert_eq!(kept.status(0), TaskStatus::Failed);
        assert_eq!(kept.status(2), TaskStatus::Skipped);

        let mut retried = StatusBoard::restore(&graph, &statuses, &errors);
        retried.prepare_resume(&graph, true);
        assert_eq!(
            retried.statuses(),
            &[
                TaskStatus::Pending,
                TaskStatus::Pending,
                TaskStatus::Pending,
                TaskStatus::Succeeded,
            ]
        );
        assert_eq!(retried.error(0), None);
    }

    #[test]
    fn outputs_of_reopened_tasks_are_dropped() {
        let graph = graph();
        let statuses = BTreeMap::from([
            (TaskId::from("a"), TaskStatus::Succeeded),
            (TaskId::from("b"), TaskStatus::Running),
            (TaskId::from("c"), TaskStatus::Pending),
            (TaskId::from("d"), TaskStatus::Succeeded),
        ]);
        let mut board = StatusBoard::restore(&graph, &statuses, &BTreeMap::new());
        board.prepare_resume(&graph, false);

        let entry = |task_id: &str| TaskOutputEntry {
            task_id: TaskId::from(task_id),
            output: format!("out:{task_id}"),
        };
        let mut outputs = vec![entry("a"), entry("b"), entry("d")];
        board.retain_finished_outputs(&mut outputs);
        assert_eq!(outputs, vec![entry("a"), entry("d")]);
    }
}
