use serde::{Deserialize, Serialize};

use weft_core::error::{ErrorKind, WeftError};

/// Failure classes a plan step can end in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureClass {
    Timeout,
    ExecutionError,
    InsufficientCapability,
    ResourceUnavailable,
    FatalError,
}

impl FailureClass {
    pub fn classify(err: &WeftError) -> Self {
        match err.kind() {
            ErrorKind::Timeout => Self::Timeout,
            ErrorKind::ExecutorUnavailable => Self::ResourceUnavailable,
            ErrorKind::InsufficientCapability => Self::InsufficientCapability,
            ErrorKind::Execution
            | ErrorKind::BindingResolution
            | ErrorKind::Routing
            | ErrorKind::GuardrailBlocked => Self::ExecutionError,
            _ => Self::FatalError,
        }
    }

    /// Whether substituting another agent may help.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::FatalError)
    }
}

/// What to do after a step failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Retry the step with a different agent.
    Replan,
    Abort,
}

/// Bounded replanning budget for one step.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    max_replans: u32,
}

impl RecoveryPolicy {
    pub fn new(max_replans: u32) -> Self {
        Self { max_replans }
    }

    pub fn decide(&self, class: FailureClass, replans_so_far: u32) -> RecoveryAction {
        if class.is_recoverable() && replans_so_far < self.max_replans {
            RecoveryAction::Replan
        } else {
            RecoveryAction::Abort
        }
    }
}
