//! Per-task records and the overall outcome of a run.

use crate::graph::DependencyGraph;
use crate::scheduler::Delegation;
use crew_protocol::AgentId;
use crew_protocol::CrewId;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    /// Agent that ran the task, after delegation.
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub crew_id: CrewId,
    pub success: bool,
    pub final_output: Option<String>,
    /// One record per task, in declaration order.
    pub tasks: Vec<TaskRecord>,
    pub cancelled: bool,
    /// Last checkpoint taken during the run, when checkpointing is on.
    #[serde(skip)]
    pub checkpoint: Option<Vec<u8>>,
    pub delegation: Option<Delegation>,
}

impl RunReport {
    pub fn task(&self, task_id: &TaskId) -> Option<&TaskRecord> {
        self.tasks.iter().find(|record| &record.task_id == task_id)
    }

    pub fn status_of(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.task(task_id).map(|record| record.status)
    }

    pub fn summary(&self) -> RunSummary {
        let count = |status: TaskStatus| {
            self.tasks
                .iter()
                .filter(|record| record.status == status)
                .count()
        };
        RunSummary {
            total: self.tasks.len(),
            succeeded: count(TaskStatus::Succeeded),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            cancelled: count(TaskStatus::Cancelled),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

impl RunSummary {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.succeeded as f64 / self.total as f64
    }
}

/// Collects task records as the run is wound up.
#[derive(Default)]
pub(crate) struct ResultAggregator {
    records: Vec<TaskRecord>,
}

impl ResultAggregator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_result(&mut self, record: TaskRecord) {
        self.records.push(record);
    }

    /// Builds the report. `synthesis` is the implicit manager synthesis
    /// result, when one ran; its output wins over terminal task outputs.
    pub(crate) fn finish(
        self,
        crew_id: CrewId,
        graph: &DependencyGraph,
        synthesis: Option<Result<String, String>>,
        cancelled: bool,
        checkpoint: Option<Vec<u8>>,
        delegation: Option<Delegation>,
    ) -> RunReport {
        let all_succeeded = self
            .records
            .iter()
            .all(|record| record.status == TaskStatus::Succeeded);
        let synthesis_ok = !matches!(synthesis, Some(Err(_)));

        let final_output = match synthesis {
            Some(Ok(output)) => Some(output),
            _ => {
                let outputs: Vec<&str> = graph
                    .terminal_tasks()
                    .into_iter()
                    .filter_map(|index| self.records[index].output.as_deref())
                    .collect();
                if outputs.is_empty() {
                    None
                } else {
                    Some(outputs.join("\n\n"))
                }
            }
        };

        RunReport {
            crew_id,
            success: all_succeeded && synthesis_ok && !cancelled,
            final_output,
            tasks: self.records,
            cancelled,
            checkpoint,
            delegation,
        }
    }
}
