//! Saving and restoring run state.
//!
//! [`CheckpointManager`] turns run state into a versioned JSON blob and back.
//! Where blobs live is up to a [`CheckpointStore`].

use crate::error::CheckpointError;
use async_trait::async_trait;
use chrono::Utc;
use crew_protocol::AgentId;
use crew_protocol::Crew;
use crew_protocol::CrewId;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use crew_protocol::checkpoint::CHECKPOINT_SCHEMA_VERSION;
use crew_protocol::checkpoint::Checkpoint;
use crew_protocol::checkpoint::SCHEMA_VERSION_FIELD;
use crew_protocol::checkpoint::ScratchpadSnapshot;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Run state captured by a checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSnapshot {
    pub statuses: BTreeMap<TaskId, TaskStatus>,
    pub errors: BTreeMap<TaskId, String>,
    pub scratchpad: ScratchpadSnapshot,
    pub inputs: Map<String, Value>,
    pub delegation: Option<BTreeMap<TaskId, AgentId>>,
    pub synthesis: Option<String>,
}

/// Encodes and validates checkpoints for one crew.
pub struct CheckpointManager<'a> {
    crew: &'a Crew,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(crew: &'a Crew) -> Self {
        Self { crew }
    }

    pub fn capture(&self, run: RunSnapshot) -> Checkpoint {
        Checkpoint {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            crew_id: self.crew.id.clone(),
            strategy: self.crew.process.kind().to_string(),
            timestamp: Utc::now(),
            task_statuses: run.statuses,
            task_errors: run.errors,
            scratchpad: run.scratchpad,
            inputs: run.inputs,
            delegation: run.delegation,
            synthesis: run.synthesis,
        }
    }

    /// Produces a self-describing checkpoint blob.
    pub fn save(&self, run: RunSnapshot) -> Result<Vec<u8>, CheckpointError> {
        serde_json::to_vec_pretty(&self.capture(run)).map_err(CheckpointError::Encode)
    }

    /// Decodes `blob` and checks it against this crew.
    ///
    /// The blob is only read; a failed load leaves it usable for another
    /// attempt.
    pub fn load(&self, blob: &[u8]) -> Result<Checkpoint, CheckpointError> {
        let document: Value = serde_json::from_slice(blob).map_err(CheckpointError::Malformed)?;
        let Some(version) = document.get(SCHEMA_VERSION_FIELD).and_then(Value::as_u64) else {
            return Err(CheckpointError::MissingVersion);
        };
        if version != u64::from(CHECKPOINT_SCHEMA_VERSION) {
            return Err(CheckpointError::UnsupportedVersion {
                found: version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        let checkpoint: Checkpoint =
            serde_json::from_value(document).map_err(CheckpointError::Malformed)?;

        self.check_references(&checkpoint)?;

        if checkpoint.crew_id != self.crew.id {
            tracing::warn!(
                checkpoint_crew = %checkpoint.crew_id,
                crew_id = %self.crew.id,
                "Resuming checkpoint taken for a different crew id"
            );
        }
        if checkpoint.strategy != self.crew.process.kind() {
            tracing::warn!(
                checkpoint_strategy = %checkpoint.strategy,
                strategy = self.crew.process.kind(),
                "Resuming checkpoint under a different strategy"
            );
        }
        Ok(checkpoint)
    }

    fn check_references(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let tasks: HashSet<&TaskId> = self.crew.tasks.iter().map(|task| &task.id).collect();
        let agents: HashSet<&AgentId> = self.crew.agents.iter().map(|agent| &agent.id).collect();

        let referenced = checkpoint
            .task_statuses
            .keys()
            .chain(checkpoint.task_errors.keys())
            .chain(
                checkpoint
                    .scratchpad
                    .task_outputs
                    .iter()
                    .map(|entry| &entry.task_id),
            );
        for task_id in referenced {
            if !tasks.contains(task_id) {
                return Err(CheckpointError::UnknownTask {
                    task_id: task_id.clone(),
                });
            }
        }

        if let Some(delegation) = &checkpoint.delegation {
            for (task_id, agent_id) in delegation {
                if !tasks.contains(task_id) {
                    return Err(CheckpointError::UnknownTask {
                        task_id: task_id.clone(),
                    });
                }
                if !agents.contains(agent_id) {
                    return Err(CheckpointError::UnknownAgent {
                        agent_id: agent_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Where checkpoint blobs are persisted.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn persist(&self, crew_id: &CrewId, blob: &[u8]) -> Result<(), CheckpointError>;

    /// Latest blob for the crew, if any.
    async fn restore(&self, crew_id: &CrewId) -> Result<Option<Vec<u8>>, CheckpointError>;

    /// Returns whether a checkpoint existed.
    async fn delete(&self, crew_id: &CrewId) -> Result<bool, CheckpointError>;
}

/// One `{crew_id}.json` file per crew inside a directory.
///
/// Writes go to a temp file which is then renamed over the target, so a
/// reader never sees a half-written checkpoint.
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, crew_id: &CrewId) -> PathBuf {
        let name: String = crew_id
            .as_str()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn persist(&self, crew_id: &CrewId, blob: &[u8]) -> Result<(), CheckpointError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(crew_id);
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, blob).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        tracing::debug!(path = %path.display(), "Checkpoint persisted");
        Ok(())
    }

    async fn restore(&self, crew_id: &CrewId) -> Result<Option<Vec<u8>>, CheckpointError> {
        match tokio::fs::read(self.path_for(crew_id)).await {
            Ok(blob) => Ok(Some(blob)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, crew_id: &CrewId) -> Result<bool, CheckpointError> {
        match tokio::fs::remove_file(self.path_for(crew_id)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

/// Keeps every persisted blob in memory; `restore` returns the latest.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    saved: Mutex<HashMap<CrewId, Vec<Vec<u8>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All blobs persisted for the crew, oldest first.
    pub async fn history(&self, crew_id: &CrewId) -> Vec<Vec<u8>> {
        let saved = self.saved.lock().await;
        saved.get(crew_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn persist(&self, crew_id: &CrewId, blob: &[u8]) -> Result<(), CheckpointError> {
        let mut saved = self.saved.lock().await;
        saved.entry(crew_id.clone()).or_default().push(blob.to_vec());
        Ok(())
    }

    async fn restore(&self, crew_id: &CrewId) -> Result<Option<Vec<u8>>, CheckpointError> {
        let saved = self.saved.lock().await;
        Ok(saved.get(crew_id).and_then(|blobs| blobs.last().cloned()))
    }

    async fn delete(&self, crew_id: &CrewId) -> Result<bool, CheckpointError> {
        let mut saved = self.saved.lock().await;
        Ok(saved.remove(crew_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crew_protocol::Agent;
    use crew_protocol::Task;
    use crew_protocol::checkpoint::TaskOutputEntry;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn crew() -> Crew {
        Crew::new(
            vec![Agent::new("writer", "write").with_id("w")],
            vec![
                Task::new("outline", "w").with_id("a"),
                Task::new("draft", "w").with_id("b").depends_on("a"),
            ],
        )
        .with_id("crew-1")
    }

    fn snapshot() -> RunSnapshot {
        RunSnapshot {
            statuses: BTreeMap::from([
                (TaskId::from("a"), TaskStatus::Succeeded),
                (TaskId::from("b"), TaskStatus::Pending),
            ]),
            errors: BTreeMap::new(),
            scratchpad: ScratchpadSnapshot {
                values: BTreeMap::from([("topic".to_string(), json!("rust"))]),
                task_outputs: vec![TaskOutputEntry {
                    task_id: TaskId::from("a"),
                    output: "done:outline".to_string(),
                }],
            },
            inputs: Map::from_iter([("topic".to_string(), json!("rust"))]),
            delegation: None,
            synthesis: None,
        }
    }

    #[test]
    fn save_then_load_restores_state() {
        let crew = crew();
        let manager = CheckpointManager::new(&crew);
        let blob = manager.save(snapshot()).unwrap();

        let checkpoint = manager.load(&blob).unwrap();
        assert_eq!(checkpoint.schema_version, CHECKPOINT_SCHEMA_VERSION);
        assert_eq!(checkpoint.crew_id, CrewId::from("crew-1"));
        assert_eq!(checkpoint.strategy, "sequential");
        assert_eq!(checkpoint.task_statuses, snapshot().statuses);
        assert_eq!(checkpoint.scratchpad, snapshot().scratchpad);
        assert_eq!(checkpoint.inputs, snapshot().inputs);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let crew = crew();
        let manager = CheckpointManager::new(&crew);
        let mut document: Value = serde_json::from_slice(&manager.save(snapshot()).unwrap()).unwrap();
        document[SCHEMA_VERSION_FIELD] = json!(99);
        let blob = serde_json::to_vec(&document).unwrap();

        let err = manager.load(&blob).unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::UnsupportedVersion {
                found: 99,
                expected: CHECKPOINT_SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn missing_version_and_garbage_are_rejected() {
        let crew = crew();
        let manager = CheckpointManager::new(&crew);
        assert!(matches!(
            manager.load(br#"{"crewId": "crew-1"}"#).unwrap_err(),
            CheckpointError::MissingVersion
        ));
        assert!(matches!(
            manager.load(b"not json").unwrap_err(),
            CheckpointError::Malformed(_)
        ));
    }

    #[test]
    fn references_outside_the_crew_are_rejected() {
        let crew = crew();
        let manager = CheckpointManager::new(&crew);

        let mut run = snapshot();
        run.statuses.insert(TaskId::from("ghost"), TaskStatus::Pending);
        let blob = manager.save(run).unwrap();
        assert!(matches!(
            manager.load(&blob).unwrap_err(),
            CheckpointError::UnknownTask { task_id } if task_id == TaskId::from("ghost")
        ));

        let mut run = snapshot();
        run.delegation = Some(BTreeMap::from([(TaskId::from("b"), AgentId::from("nobody"))]));
        let blob = manager.save(run).unwrap();
        assert!(matches!(
            manager.load(&blob).unwrap_err(),
            CheckpointError::UnknownAgent { .. }
        ));
    }

    #[tokio::test]
    async fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let crew_id = CrewId::from("crew/1");

        assert_eq!(store.restore(&crew_id).await.unwrap(), None);
        store.persist(&crew_id, b"first").await.unwrap();
        store.persist(&crew_id, b"second").await.unwrap();
        assert_eq!(
            store.restore(&crew_id).await.unwrap(),
            Some(b"second".to_vec())
        );
        assert!(store.path_for(&crew_id).ends_with("crew_1.json"));

        assert!(store.delete(&crew_id).await.unwrap());
        assert!(!store.delete(&crew_id).await.unwrap());
    }

    #[tokio::test]
    async fn memory_store_keeps_history() {
        let store = InMemoryCheckpointStore::new();
        let crew_id = CrewId::from("crew-1");
        store.persist(&crew_id, b"one").await.unwrap();
        store.persist(&crew_id, b"two").await.unwrap();

        assert_eq!(store.history(&crew_id).await.len(), 2);
        assert_eq!(store.restore(&crew_id).await.unwrap(), Some(b"two".to_vec()));
    }
}
