//! The orchestration trio (Orchestrator, Planner, Executor) and the
//! mini-agent spawner with its lifecycle manager.

pub mod executor;
pub mod lifecycle;
pub mod orchestrator;
pub mod planner;
pub mod segments;
pub mod spawner;

pub use executor::{ExecutedCall, Executor, ExecutorError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, TurnOutcome};
pub use planner::{Plan, PlanTask, Planner, TaskVerb};
pub use segments::{segment_response, Segment, ToolCallRequest};
pub use spawner::{MiniAgentSpawner, SpawnError};
