//! Integration tests for the orchestrator.

use async_trait::async_trait;
use crew_orchestrator::CancelPolicy;
use crew_orchestrator::CancellationToken;
use crew_orchestrator::Delegation;
use crew_orchestrator::DelegationRequest;
use crew_orchestrator::Delegator;
use crew_orchestrator::FileCheckpointStore;
use crew_orchestrator::InMemoryCheckpointStore;
use crew_orchestrator::Orchestrator;
use crew_orchestrator::OrchestratorConfig;
use crew_orchestrator::OrchestratorError;
use crew_orchestrator::RunEventMsg;
use crew_orchestrator::error::CheckpointError;
use crew_orchestrator::error::DelegationError;
use crew_orchestrator::error::GraphError;
use crew_orchestrator::executor::AgentExecutor;
use crew_orchestrator::scheduler::SYNTHESIS_KEY;
use crew_protocol::Agent;
use crew_protocol::AgentId;
use crew_protocol::Crew;
use crew_protocol::Process;
use crew_protocol::SubProcess;
use crew_protocol::Task;
use crew_protocol::TaskId;
use crew_protocol::TaskStatus;
use crew_protocol::checkpoint::Checkpoint;
use crew_protocol::execution::AgentRequest;
use crew_protocol::execution::AgentResponse;
use pretty_assertions::assert_eq;
use serde_json::Map;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::sync::Notify;
use tracing_test::traced_test;

enum Behavior {
    Fail(&'static str),
    Error(&'static str),
    Sleep(Duration),
    Barrier(Arc<Barrier>),
    /// Signals `started`, then waits for `release` (forever if `None`).
    Block {
        started: Arc<Notify>,
        release: Option<Arc<Notify>>,
    },
}

/// Answers `"{agent}:{task}"` unless a behavior is configured for the task.
#[derive(Default)]
struct StubExecutor {
    behaviors: HashMap<TaskId, Behavior>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<AgentRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl StubExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn with(mut self, task_id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(TaskId::from(task_id), behavior);
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn request_for(&self, task_id: &str) -> AgentRequest {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .find(|request| request.task_id.as_str() == task_id)
            .cloned()
            .unwrap()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for StubExecutor {
    async fn execute(&self, request: AgentRequest) -> anyhow::Result<AgentResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(request.task_id.to_string());
        self.requests.lock().unwrap().push(request.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);

        let result = match self.behaviors.get(&request.task_id) {
            Some(Behavior::Fail(message)) => Ok(AgentResponse::failure(*message)),
            Some(Behavior::Error(message)) => Err(anyhow::anyhow!(*message)),
            Some(Behavior::Sleep(duration)) => {
                tokio::time::sleep(*duration).await;
                Ok(self.answer(&request))
            }
            Some(Behavior::Barrier(barrier)) => {
                barrier.wait().await;
                Ok(self.answer(&request))
            }
            Some(Behavior::Block { started, release }) => {
                started.notify_one();
                match release {
                    Some(release) => release.notified().await,
                    None => std::future::pending::<()>().await,
                }
                Ok(self.answer(&request))
            }
            None => Ok(self.answer(&request)),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl StubExecutor {
    fn answer(&self, request: &AgentRequest) -> AgentResponse {
        AgentResponse::success(format!("{}:{}", request.agent_id, request.task_id))
    }
}

fn agents() -> Vec<Agent> {
    vec![
        Agent::new("Researcher", "find facts").with_id("researcher"),
        Agent::new("Writer", "write prose").with_id("writer"),
        Agent::new("Lead", "coordinate").with_id("lead"),
    ]
}

fn task(id: &str, agent: &str, deps: &[&str]) -> Task {
    deps.iter().fold(
        Task::new(format!("do {id}"), agent).with_id(id),
        |task, dep| task.depends_on(*dep),
    )
}

fn linear_crew() -> Crew {
    Crew::new(
        agents(),
        vec![
            task("a", "researcher", &[]),
            task("b", "writer", &["a"]),
            task("c", "writer", &["b"]),
        ],
    )
    .with_id("linear")
}

fn hierarchical(tasks: Vec<Task>, workers: SubProcess) -> Crew {
    Crew::new(agents(), tasks)
        .with_id("hier")
        .with_process(Process::Hierarchical {
            manager: AgentId::from("lead"),
            workers,
        })
}

async fn within<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sequential_runs_in_dependency_order() {
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(linear_crew(), executor.clone());

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert_eq!(executor.calls(), vec!["a", "b", "c"]);
    assert!(report.success);
    assert!(!report.cancelled);
    assert_eq!(report.final_output.as_deref(), Some("writer:c"));
    assert_eq!(report.summary().succeeded, 3);

    let b = executor.request_for("b");
    assert_eq!(b.context.dependency_outputs.len(), 1);
    assert_eq!(b.context.dependency_outputs[0].role, "Researcher");
    assert_eq!(
        b.context.dependency_outputs[0].output.as_deref(),
        Some("researcher:a")
    );
}

#[tokio::test]
async fn test_sequential_follows_declaration_order_for_ties() {
    let crew = Crew::new(
        agents(),
        vec![
            task("late", "writer", &["early"]),
            task("x", "researcher", &[]),
            task("early", "researcher", &[]),
        ],
    );
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());

    orchestrator.run(Map::new()).await.unwrap();

    assert_eq!(executor.calls(), vec!["x", "early", "late"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_runs_independent_tasks_together() {
    let barrier = Arc::new(Barrier::new(2));
    let executor = Arc::new(
        StubExecutor::new()
            .with("a", Behavior::Barrier(barrier.clone()))
            .with("b", Behavior::Barrier(barrier)),
    );
    let crew = Crew::new(
        agents(),
        vec![
            task("a", "researcher", &[]),
            task("b", "writer", &[]),
            task("c", "writer", &["a", "b"]),
        ],
    )
    .with_process(Process::Parallel);
    let orchestrator = Orchestrator::new(crew, executor.clone())
        .with_config(OrchestratorConfig::default().with_max_concurrency(2));

    let report = within(orchestrator.run(Map::new())).await.unwrap();

    assert!(report.success);
    let calls = executor.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2], "c");
    assert_eq!(executor.peak(), 2);

    let c = executor.request_for("c");
    let upstream: Vec<&str> = c
        .context
        .dependency_outputs
        .iter()
        .map(|dep| dep.task_id.as_str())
        .collect();
    assert_eq!(upstream, vec!["a", "b"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_parallel_respects_concurrency_limit() {
    let executor = Arc::new(
        StubExecutor::new()
            .with("a", Behavior::Sleep(Duration::from_millis(20)))
            .with("b", Behavior::Sleep(Duration::from_millis(20)))
            .with("c", Behavior::Sleep(Duration::from_millis(20))),
    );
    let crew = Crew::new(
        agents(),
        vec![
            task("a", "researcher", &[]),
            task("b", "researcher", &[]),
            task("c", "researcher", &[]),
        ],
    )
    .with_process(Process::Parallel);
    let orchestrator = Orchestrator::new(crew, executor.clone())
        .with_config(OrchestratorConfig::default().with_max_concurrency(1));

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(executor.calls(), vec!["a", "b", "c"]);
    assert_eq!(executor.peak(), 1);
}

#[tokio::test]
async fn test_cycle_is_rejected_before_execution() {
    let crew = Crew::new(
        agents(),
        vec![task("a", "writer", &["b"]), task("b", "writer", &["a"])],
    );
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());

    assert!(matches!(
        orchestrator.validate(),
        Err(GraphError::Cycle { .. })
    ));
    let err = orchestrator.run(Map::new()).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Graph(GraphError::Cycle { .. })
    ));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_agent_is_rejected() {
    let crew = Crew::new(agents(), vec![task("a", "ghost", &[])]);
    let orchestrator = Orchestrator::new(crew, Arc::new(StubExecutor::new()));

    assert_eq!(
        orchestrator.validate(),
        Err(GraphError::UnknownAgent {
            task_id: TaskId::from("a"),
            agent_id: AgentId::from("ghost"),
        })
    );
}

#[tokio::test]
async fn test_failure_skips_transitive_dependents() {
    let executor = Arc::new(StubExecutor::new().with("a", Behavior::Fail("no sources")));
    let crew = Crew::new(
        agents(),
        vec![
            task("a", "researcher", &[]),
            task("b", "writer", &["a"]),
            task("c", "writer", &["b"]),
            task("d", "writer", &[]),
        ],
    );
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(!report.success);
    assert_eq!(executor.calls(), vec!["a", "d"]);
    assert_eq!(report.status_of(&TaskId::from("a")), Some(TaskStatus::Failed));
    assert_eq!(report.status_of(&TaskId::from("b")), Some(TaskStatus::Skipped));
    assert_eq!(report.status_of(&TaskId::from("c")), Some(TaskStatus::Skipped));
    assert_eq!(
        report.status_of(&TaskId::from("d")),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(
        report.task(&TaskId::from("a")).unwrap().error.as_deref(),
        Some("no sources")
    );
}

#[tokio::test]
async fn test_executor_error_counts_as_failure() {
    let executor = Arc::new(StubExecutor::new().with("c", Behavior::Error("model offline")));
    let orchestrator = Orchestrator::new(linear_crew(), executor);

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(!report.success);
    assert_eq!(report.final_output, None);
    assert_eq!(
        report.task(&TaskId::from("c")).unwrap().error.as_deref(),
        Some("model offline")
    );
}

#[tokio::test]
async fn test_continue_on_failure_runs_dependents() {
    let executor = Arc::new(StubExecutor::new().with("a", Behavior::Fail("no sources")));
    let crew = linear_crew().with_continue_on_failure(true);
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert_eq!(executor.calls(), vec!["a", "b", "c"]);
    assert!(!report.success);
    assert_eq!(report.summary().failed, 1);

    let dep = &executor.request_for("b").context.dependency_outputs[0];
    assert_eq!(dep.status, TaskStatus::Failed);
    assert_eq!(dep.output, None);
    assert_eq!(dep.error.as_deref(), Some("no sources"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_tasks_overlap_in_sequential_crew() {
    let barrier = Arc::new(Barrier::new(2));
    let executor = Arc::new(
        StubExecutor::new()
            .with("a", Behavior::Barrier(barrier.clone()))
            .with("b", Behavior::Barrier(barrier)),
    );
    let crew = Crew::new(
        agents(),
        vec![
            task("a", "researcher", &[]).with_async_execution(true),
            task("b", "writer", &[]).with_async_execution(true),
            task("c", "writer", &[]),
        ],
    );
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let report = within(orchestrator.run(Map::new())).await.unwrap();

    assert!(report.success);
    assert_eq!(executor.peak(), 2);
    assert_eq!(executor.calls()[2], "c");
}

#[tokio::test]
async fn test_inputs_and_memory_reach_agents() {
    let crew = linear_crew();
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());
    let inputs = Map::from_iter([("topic".to_string(), json!("lighthouses"))]);

    orchestrator.run(inputs).await.unwrap();

    let a = executor.request_for("a");
    assert_eq!(a.context.inputs.get("topic"), Some(&json!("lighthouses")));
    assert_eq!(a.context.memory.get("topic"), Some(&json!("lighthouses")));
    assert_eq!(a.role, "Researcher");
    assert_eq!(a.context.description, "do a");
}

#[tokio::test]
async fn test_crew_memory_switch_hides_scratchpad() {
    let crew = linear_crew().with_memory(false);
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());
    let inputs = Map::from_iter([("topic".to_string(), json!("lighthouses"))]);

    orchestrator.run(inputs).await.unwrap();

    let a = executor.request_for("a");
    assert!(a.context.memory.is_empty());
    assert_eq!(a.context.inputs.get("topic"), Some(&json!("lighthouses")));
}

#[tokio::test]
async fn test_resume_skips_completed_tasks() {
    let store = Arc::new(InMemoryCheckpointStore::new());
    let first = Arc::new(StubExecutor::new());
    let crew = linear_crew().with_checkpoints(true);
    let orchestrator =
        Orchestrator::new(crew.clone(), first.clone()).with_checkpoint_store(store.clone());
    orchestrator.run(Map::new()).await.unwrap();

    let history = store.history(&crew.id).await;
    // One per terminal transition plus the final one.
    assert_eq!(history.len(), 4);
    let after_a = history[0].clone();

    let second = Arc::new(StubExecutor::new());
    let resumed = Orchestrator::new(crew, second.clone());
    let report = resumed.resume(&after_a).await.unwrap();

    assert_eq!(first.calls(), vec!["a", "b", "c"]);
    assert_eq!(second.calls(), vec!["b", "c"]);
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("writer:c"));
    assert_eq!(
        report.task(&TaskId::from("a")).unwrap().output.as_deref(),
        Some("researcher:a")
    );
    assert_eq!(
        second.request_for("b").context.dependency_outputs[0]
            .output
            .as_deref(),
        Some("researcher:a")
    );
}

#[tokio::test]
async fn test_resume_retries_failed_tasks_when_configured() {
    let failing = Arc::new(StubExecutor::new().with("b", Behavior::Fail("flaky")));
    let crew = linear_crew().with_checkpoints(true);
    let report = Orchestrator::new(crew.clone(), failing)
        .run(Map::new())
        .await
        .unwrap();
    let blob = report.checkpoint.unwrap();

    let untouched = Arc::new(StubExecutor::new());
    let kept = Orchestrator::new(crew.clone(), untouched.clone())
        .resume(&blob)
        .await
        .unwrap();
    assert!(untouched.calls().is_empty());
    assert_eq!(kept.status_of(&TaskId::from("b")), Some(TaskStatus::Failed));
    assert_eq!(kept.status_of(&TaskId::from("c")), Some(TaskStatus::Skipped));

    let healthy = Arc::new(StubExecutor::new());
    let retried = Orchestrator::new(crew, healthy.clone())
        .with_config(OrchestratorConfig::default().with_retry_failed_on_resume(true))
        .resume(&blob)
        .await
        .unwrap();
    assert_eq!(healthy.calls(), vec!["b", "c"]);
    assert!(retried.success);
}

#[tokio::test]
async fn test_resume_rejects_bad_checkpoints() {
    let crew = linear_crew().with_checkpoints(true);
    let orchestrator = Orchestrator::new(crew, Arc::new(StubExecutor::new()));
    let blob = orchestrator
        .run(Map::new())
        .await
        .unwrap()
        .checkpoint
        .unwrap();

    let err = orchestrator.resume(b"not json").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::Malformed(_))
    ));

    let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    value["schemaVersion"] = json!(99);
    let err = orchestrator
        .resume(&serde_json::to_vec(&value).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::UnsupportedVersion { found: 99, .. })
    ));

    let other = Orchestrator::new(
        Crew::new(agents(), vec![task("z", "writer", &[])]).with_id("linear"),
        Arc::new(StubExecutor::new()),
    );
    let err = other.resume(&blob).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Checkpoint(CheckpointError::UnknownTask { .. })
    ));
}

#[tokio::test]
async fn test_cancel_drains_in_flight_task() {
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let executor = Arc::new(StubExecutor::new().with(
        "b",
        Behavior::Block {
            started: started.clone(),
            release: Some(release.clone()),
        },
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        linear_crew().with_checkpoints(true),
        executor.clone(),
    ));
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run_with_cancel(Map::new(), cancel).await }
    });
    within(started.notified()).await;
    cancel.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    let report = within(run).await.unwrap().unwrap();

    assert!(report.cancelled);
    assert!(!report.success);
    assert_eq!(executor.calls(), vec!["a", "b"]);
    assert_eq!(
        report.status_of(&TaskId::from("b")),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(
        report.status_of(&TaskId::from("c")),
        Some(TaskStatus::Cancelled)
    );

    let checkpoint: Checkpoint = serde_json::from_slice(&report.checkpoint.unwrap()).unwrap();
    assert_eq!(
        checkpoint.task_statuses.get(&TaskId::from("c")),
        Some(&TaskStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_cancel_abandons_in_flight_task_and_resumes() {
    let started = Arc::new(Notify::new());
    let executor = Arc::new(StubExecutor::new().with(
        "b",
        Behavior::Block {
            started: started.clone(),
            release: None,
        },
    ));
    let crew = linear_crew().with_checkpoints(true);
    let orchestrator = Arc::new(
        Orchestrator::new(crew.clone(), executor)
            .with_config(OrchestratorConfig::default().with_cancel_policy(CancelPolicy::Abandon)),
    );
    let cancel = CancellationToken::new();

    let run = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let cancel = cancel.clone();
        async move { orchestrator.run_with_cancel(Map::new(), cancel).await }
    });
    within(started.notified()).await;
    cancel.cancel();

    let report = within(run).await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(
        report.status_of(&TaskId::from("b")),
        Some(TaskStatus::Cancelled)
    );
    assert_eq!(
        report.status_of(&TaskId::from("c")),
        Some(TaskStatus::Cancelled)
    );

    let fresh = Arc::new(StubExecutor::new());
    let resumed = Orchestrator::new(crew, fresh.clone())
        .resume(&report.checkpoint.unwrap())
        .await
        .unwrap();
    assert_eq!(fresh.calls(), vec!["b", "c"]);
    assert!(resumed.success);
}

#[tokio::test]
async fn test_timeout_cancels_run() {
    let executor = Arc::new(StubExecutor::new().with(
        "a",
        Behavior::Block {
            started: Arc::new(Notify::new()),
            release: None,
        },
    ));
    let config = OrchestratorConfig::default()
        .with_timeout(Duration::from_millis(50))
        .with_cancel_policy(CancelPolicy::Abandon);
    let orchestrator = Orchestrator::new(linear_crew(), executor.clone()).with_config(config);

    let report = within(orchestrator.run(Map::new())).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(executor.calls(), vec!["a"]);
    assert_eq!(report.summary().cancelled, 3);
}

#[tokio::test]
async fn test_resume_reruns_task_with_unfinished_status_and_recorded_output() {
    let crew = linear_crew().with_checkpoints(true);
    let first = Orchestrator::new(crew.clone(), Arc::new(StubExecutor::new()));
    let blob = first.run(Map::new()).await.unwrap().checkpoint.unwrap();

    // Crash between recording c's output and marking it succeeded.
    let mut value: serde_json::Value = serde_json::from_slice(&blob).unwrap();
    value["taskStatuses"]["c"] = json!("running");
    let blob = serde_json::to_vec(&value).unwrap();

    let executor = Arc::new(StubExecutor::new());
    let resumed = Orchestrator::new(crew, executor.clone());
    let report = within(resumed.resume(&blob)).await.unwrap();

    assert_eq!(executor.calls(), vec!["c"]);
    assert!(report.success);
    assert_eq!(
        report.status_of(&TaskId::from("c")),
        Some(TaskStatus::Succeeded)
    );
    assert_eq!(report.final_output.as_deref(), Some("writer:c"));
}

#[tokio::test]
async fn test_hierarchical_implicit_synthesis() {
    let crew = hierarchical(
        vec![
            task("plan", "lead", &[]),
            task("dig", "researcher", &["plan"]),
            task("draft", "writer", &["plan"]),
        ],
        SubProcess::Parallel,
    );
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(executor.calls()[0], "plan");
    assert_eq!(executor.calls().last().map(String::as_str), Some(SYNTHESIS_KEY));
    assert_eq!(report.final_output.as_deref(), Some("lead:synthesis"));
    assert_eq!(
        orchestrator.scratchpad().get(SYNTHESIS_KEY).await.unwrap(),
        Some(json!("lead:synthesis"))
    );

    let synthesis = executor.request_for(SYNTHESIS_KEY);
    let upstream: Vec<&str> = synthesis
        .context
        .dependency_outputs
        .iter()
        .map(|dep| dep.task_id.as_str())
        .collect();
    assert_eq!(upstream, vec!["dig", "draft"]);
    assert_eq!(
        report.delegation,
        Some(Delegation::from([
            (TaskId::from("dig"), AgentId::from("researcher")),
            (TaskId::from("draft"), AgentId::from("writer")),
        ]))
    );
}

#[tokio::test]
async fn test_input_named_like_synthesis_key_does_not_skip_synthesis() {
    let crew = hierarchical(
        vec![task("plan", "lead", &[]), task("dig", "researcher", &["plan"])],
        SubProcess::Sequential,
    );
    let executor = Arc::new(StubExecutor::new());
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let inputs = Map::from_iter([(SYNTHESIS_KEY.to_string(), json!("user supplied"))]);
    let report = orchestrator.run(inputs).await.unwrap();

    assert_eq!(executor.calls(), vec!["plan", "dig", SYNTHESIS_KEY]);
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("lead:synthesis"));
}

#[tokio::test]
async fn test_resume_reuses_recorded_synthesis() {
    let crew = hierarchical(
        vec![task("plan", "lead", &[]), task("dig", "researcher", &["plan"])],
        SubProcess::Sequential,
    )
    .with_checkpoints(true);
    let first = Orchestrator::new(crew.clone(), Arc::new(StubExecutor::new()));
    let blob = first.run(Map::new()).await.unwrap().checkpoint.unwrap();
    let checkpoint: Checkpoint = serde_json::from_slice(&blob).unwrap();
    assert_eq!(checkpoint.synthesis.as_deref(), Some("lead:synthesis"));

    let executor = Arc::new(StubExecutor::new());
    let report = Orchestrator::new(crew, executor.clone())
        .resume(&blob)
        .await
        .unwrap();

    assert!(executor.calls().is_empty());
    assert!(report.success);
    assert_eq!(report.final_output.as_deref(), Some("lead:synthesis"));
}

struct ReassignToWriter;

#[async_trait]
impl Delegator for ReassignToWriter {
    async fn delegate(&self, request: DelegationRequest) -> Result<Delegation, DelegationError> {
        assert_eq!(request.planning_outputs.len(), 1);
        Ok(Delegation::from([(
            TaskId::from("dig"),
            AgentId::from("writer"),
        )]))
    }
}

#[tokio::test]
async fn test_hierarchical_delegation_overrides_declared_agent() {
    let crew = hierarchical(
        vec![
            task("plan", "lead", &[]),
            task("dig", "researcher", &["plan"]),
            task("merge", "lead", &["dig"]),
        ],
        SubProcess::Sequential,
    );
    let executor = Arc::new(StubExecutor::new());
    let orchestrator =
        Orchestrator::new(crew, executor.clone()).with_delegator(Arc::new(ReassignToWriter));

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(report.success);
    assert_eq!(executor.calls(), vec!["plan", "dig", "merge"]);
    assert_eq!(executor.request_for("dig").agent_id, AgentId::from("writer"));
    assert_eq!(
        report.task(&TaskId::from("dig")).unwrap().agent_id,
        AgentId::from("writer")
    );
    assert_eq!(report.final_output.as_deref(), Some("lead:merge"));

    let merge = executor.request_for("merge");
    assert_eq!(merge.context.dependency_outputs[0].role, "Writer");
    assert_eq!(
        merge.context.memory.get("delegation"),
        Some(&json!({"dig": "writer"}))
    );
}

#[tokio::test]
async fn test_hierarchical_planning_failure_skips_workers() {
    let crew = hierarchical(
        vec![
            task("plan", "lead", &[]),
            task("dig", "researcher", &["plan"]),
            task("solo", "writer", &[]),
        ],
        SubProcess::Parallel,
    );
    let executor = Arc::new(StubExecutor::new().with("plan", Behavior::Fail("no plan")));
    let orchestrator = Orchestrator::new(crew, executor.clone());

    let report = orchestrator.run(Map::new()).await.unwrap();

    assert!(!report.success);
    assert_eq!(executor.calls(), vec!["plan"]);
    assert_eq!(report.summary().skipped, 2);
    assert_eq!(report.delegation, None);
}

#[tokio::test]
async fn test_file_store_supports_resume_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileCheckpointStore::new(dir.path()));
    let crew = linear_crew().with_checkpoints(true);

    let failing = Arc::new(StubExecutor::new().with("c", Behavior::Fail("writer's block")));
    Orchestrator::new(crew.clone(), failing)
        .with_checkpoint_store(store.clone())
        .run(Map::new())
        .await
        .unwrap();
    assert!(store.path_for(&crew.id).exists());

    let healthy = Arc::new(StubExecutor::new());
    let report = Orchestrator::new(crew, healthy.clone())
        .with_checkpoint_store(store)
        .with_config(OrchestratorConfig::default().with_retry_failed_on_resume(true))
        .resume_from_store()
        .await
        .unwrap();
    assert_eq!(healthy.calls(), vec!["c"]);
    assert!(report.success);
}

#[tokio::test]
async fn test_resume_from_store_requires_a_store() {
    let orchestrator = Orchestrator::new(linear_crew(), Arc::new(StubExecutor::new()));
    assert!(matches!(
        orchestrator.resume_from_store().await,
        Err(OrchestratorError::NoCheckpointStore)
    ));

    let orchestrator = orchestrator.with_checkpoint_store(Arc::new(InMemoryCheckpointStore::new()));
    assert!(matches!(
        orchestrator.resume_from_store().await,
        Err(OrchestratorError::CheckpointNotFound { .. })
    ));
}

#[tokio::test]
async fn test_on_demand_checkpoint() {
    let orchestrator = Orchestrator::new(linear_crew(), Arc::new(StubExecutor::new()));
    assert_eq!(orchestrator.checkpoint().await.unwrap(), None);

    orchestrator.run(Map::new()).await.unwrap();
    let blob = orchestrator.checkpoint().await.unwrap().unwrap();
    let checkpoint: Checkpoint = serde_json::from_slice(&blob).unwrap();
    assert_eq!(checkpoint.strategy, "sequential");
    assert!(
        checkpoint
            .task_statuses
            .values()
            .all(|status| *status == TaskStatus::Succeeded)
    );
}

#[tokio::test]
async fn test_events_trace_the_run() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let executor = Arc::new(StubExecutor::new().with("b", Behavior::Fail("nope")));
    let orchestrator = Orchestrator::new(linear_crew(), executor).with_event_sender(tx);

    orchestrator.run(Map::new()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.msg);
    }
    assert_eq!(
        events.first(),
        Some(&RunEventMsg::RunStarted {
            strategy: "sequential".to_string(),
            resumed: false,
        })
    );
    assert_eq!(
        events.last(),
        Some(&RunEventMsg::RunCompleted {
            success: false,
            cancelled: false,
        })
    );
    assert!(events.contains(&RunEventMsg::TaskSkipped {
        task_id: TaskId::from("c"),
        cause: Some(TaskId::from("b")),
    }));
}

#[tokio::test]
#[traced_test]
async fn test_failures_are_logged() {
    let executor = Arc::new(StubExecutor::new().with("a", Behavior::Fail("no sources")));
    Orchestrator::new(linear_crew(), executor)
        .run(Map::new())
        .await
        .unwrap();

    assert!(logs_contain("Task failed"));
    assert!(logs_contain("no sources"));
    assert!(logs_contain("Crew run finished"));
}
