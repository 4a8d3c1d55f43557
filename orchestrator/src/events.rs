//! Run lifecycle events.
//!
//! Every event is tagged with the crew it belongs to and mirrored to
//! `tracing`. Subscribers receive them over an unbounded channel.

use crew_protocol::AgentId;
use crew_protocol::CrewId;
use crew_protocol::TaskId;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunEvent {
    pub crew_id: CrewId,
    pub msg: RunEventMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventMsg {
    RunStarted {
        strategy: String,
        resumed: bool,
    },
    TaskReady {
        task_id: TaskId,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: AgentId,
    },
    TaskSucceeded {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    TaskSkipped {
        task_id: TaskId,
        /// Failed upstream task that caused the skip, if any.
        cause: Option<TaskId>,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    DelegationRecorded {
        assignments: BTreeMap<TaskId, AgentId>,
    },
    CheckpointSaved {
        bytes: usize,
    },
    RunCompleted {
        success: bool,
        cancelled: bool,
    },
}

/// Tags and publishes events for one crew.
#[derive(Clone)]
pub struct EventEmitter {
    crew_id: CrewId,
    sender: Option<UnboundedSender<RunEvent>>,
}

impl EventEmitter {
    pub fn new(crew_id: CrewId, sender: Option<UnboundedSender<RunEvent>>) -> Self {
        Self { crew_id, sender }
    }

    pub fn emit(&self, msg: RunEventMsg) {
        trace_event(&self.crew_id, &msg);
        if let Some(sender) = &self.sender {
            // A dropped receiver only means nobody is listening.
            let _ = sender.send(RunEvent {
                crew_id: self.crew_id.clone(),
                msg,
            });
        }
    }

    pub fn task_ready(&self, task_id: &TaskId) {
        self.emit(RunEventMsg::TaskReady {
            task_id: task_id.clone(),
        });
    }

    pub fn task_started(&self, task_id: &TaskId, agent_id: &AgentId) {
        self.emit(RunEventMsg::TaskStarted {
            task_id: task_id.clone(),
            agent_id: agent_id.clone(),
        });
    }

    pub fn task_succeeded(&self, task_id: &TaskId) {
        self.emit(RunEventMsg::TaskSucceeded {
            task_id: task_id.clone(),
        });
    }

    pub fn task_failed(&self, task_id: &TaskId, error: &str) {
        self.emit(RunEventMsg::TaskFailed {
            task_id: task_id.clone(),
            error: error.to_string(),
        });
    }

    pub fn task_skipped(&self, task_id: &TaskId, cause: Option<&TaskId>) {
        self.emit(RunEventMsg::TaskSkipped {
            task_id: task_id.clone(),
            cause: cause.cloned(),
        });
    }

    pub fn task_cancelled(&self, task_id: &TaskId) {
        self.emit(RunEventMsg::TaskCancelled {
            task_id: task_id.clone(),
        });
    }
}

fn trace_event(crew_id: &CrewId, msg: &RunEventMsg) {
    match msg {
        RunEventMsg::RunStarted { strategy, resumed } => {
            tracing::info!(crew_id = %crew_id, strategy = %strategy, resumed, "Run started");
        }
        RunEventMsg::TaskReady { task_id } => {
            tracing::debug!(crew_id = %crew_id, task_id = %task_id, "Task ready");
        }
        RunEventMsg::TaskStarted { task_id, agent_id } => {
            tracing::info!(crew_id = %crew_id, task_id = %task_id, agent_id = %agent_id, "Task started");
        }
        RunEventMsg::TaskSucceeded { task_id } => {
            tracing::info!(crew_id = %crew_id, task_id = %task_id, "Task succeeded");
        }
        RunEventMsg::TaskFailed { task_id, error } => {
            tracing::warn!(crew_id = %crew_id, task_id = %task_id, error = %error, "Task failed");
        }
        RunEventMsg::TaskSkipped { task_id, cause } => {
            tracing::info!(crew_id = %crew_id, task_id = %task_id, cause = ?cause, "Task skipped");
        }
        RunEventMsg::TaskCancelled { task_id } => {
            tracing::info!(crew_id = %crew_id, task_id = %task_id, "Task cancelled");
        }
        RunEventMsg::DelegationRecorded { assignments } => {
            tracing::info!(crew_id = %crew_id, assignments = assignments.len(), "Delegation recorded");
        }
        RunEventMsg::CheckpointSaved { bytes } => {
            tracing::debug!(crew_id = %crew_id, bytes, "Checkpoint saved");
        }
        RunEventMsg::RunCompleted { success, cancelled } => {
            tracing::info!(crew_id = %crew_id, success, cancelled, "Run completed");
        }
    }
}
