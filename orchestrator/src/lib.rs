//! Crew orchestration engine.
//!
//! A crew is a set of agents and a set of tasks with declared dependencies.
//! The orchestrator validates the task graph, runs tasks under a sequential,
//! parallel or hierarchical strategy, shares state through a scratchpad and
//! can checkpoint a run and resume it later. Agent behavior itself lives
//! behind [`AgentExecutor`].

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod graph;
pub mod memory;
pub mod report;
pub mod runtime;
pub mod scheduler;
pub mod state;

pub use checkpoint::CheckpointManager;
pub use checkpoint::CheckpointStore;
pub use checkpoint::FileCheckpointStore;
pub use checkpoint::InMemoryCheckpointStore;
pub use config::CancelPolicy;
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use events::RunEvent;
pub use events::RunEventMsg;
pub use executor::AgentExecutor;
pub use graph::DependencyGraph;
pub use graph::ReadinessPolicy;
pub use memory::InMemoryBackend;
pub use memory::MemoryBackend;
pub use memory::Scratchpad;
pub use report::RunReport;
pub use report::RunSummary;
pub use report::TaskRecord;
pub use runtime::Orchestrator;
pub use scheduler::DeclaredDelegator;
pub use scheduler::Delegation;
pub use scheduler::DelegationRequest;
pub use scheduler::Delegator;
pub use tokio_util::sync::CancellationToken;
