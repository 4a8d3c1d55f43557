//! Data model shared by the crew orchestrator and anything that builds crews.
//!
//! Every type here is plain serde data: a YAML or JSON loader produces the
//! same object graph the orchestrator consumes.

pub mod agent;
pub mod checkpoint;
pub mod crew;
pub mod execution;
mod ids;
pub mod task;

pub use agent::Agent;
pub use agent::ModelConfig;
pub use crew::Crew;
pub use crew::Process;
pub use crew::SubProcess;
pub use ids::AgentId;
pub use ids::CrewId;
pub use ids::TaskId;
pub use task::Task;
pub use task::TaskStatus;
