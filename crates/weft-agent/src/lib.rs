//! Multi-agent orchestration on top of the plugin registry and executor
//! router.

pub mod debate;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod recovery;

pub use debate::{ConsensusDecision, DebateRound, DebateSession, Moderator, NormalizingModerator, Position};
pub use executor::{AgentExecutor, AGENT};
pub use orchestrator::{AgentOrchestrator, OrchestrationResult};
pub use planner::{Complexity, ExecutionTree, PlanStep, Task, TaskAnalysis};
pub use recovery::{FailureClass, RecoveryAction, RecoveryPolicy};
