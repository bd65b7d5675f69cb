use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use weft_core::error::{ErrorKind, Result, WeftError};
use weft_core::types::{NodeStatus, ValueMap};

/// Failure recorded on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&WeftError> for NodeError {
    fn from(e: &WeftError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Mutable execution record of one node within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionState {
    pub node_id: String,
    pub status: NodeStatus,
    pub attempts: u32,
    #[serde(default)]
    pub inputs: ValueMap,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<NodeError>,
    #[serde(default)]
    pub skip_reason: Option<String>,
    /// The failure was routed to an error-handler edge.
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl NodeExecutionState {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Pending,
            attempts: 0,
            inputs: ValueMap::new(),
            output: None,
            error: None,
            skip_reason: None,
            recovered: false,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting moves the status machine does not allow.
    pub fn transition(&mut self, next: NodeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(WeftError::InvalidTransition {
                node: self.node_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        if next == NodeStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    pub fn complete(&mut self, output: Value) -> Result<()> {
        self.transition(NodeStatus::Completed)?;
        self.output = Some(output);
        Ok(())
    }

    /// Record a failure. A node that never started passes through `Running`
    /// so every failed node has a start time.
    pub fn fail(&mut self, error: &WeftError) -> Result<()> {
        if self.status == NodeStatus::Pending {
            self.transition(NodeStatus::Running)?;
        }
        self.transition(NodeStatus::Failed)?;
        self.error = Some(NodeError::from(error));
        Ok(())
    }

    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(NodeStatus::Skipped)?;
        self.skip_reason = Some(reason.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lifecycle_records_timestamps() {
        let mut state = NodeExecutionState::new("n1");
        state.transition(NodeStatus::Running).unwrap();
        assert!(state.started_at.is_some());
        state.complete(json!(42)).unwrap();
        assert_eq!(state.output, Some(json!(42)));
        assert!(state.finished_at.is_some());
        assert!(state.transition(NodeStatus::Running).is_err());
    }

    #[test]
    fn pending_failure_passes_through_running() {
        let mut state = NodeExecutionState::new("n1");
        state.fail(&WeftError::binding("n1", "missing x")).unwrap();
        assert_eq!(state.status, NodeStatus::Failed);
        assert!(state.started_at.is_some());
        assert_eq!(state.error.as_ref().unwrap().kind, ErrorKind::BindingResolution);
    }

    #[test]
    fn terminal_states_reject_cancel() {
        let mut state = NodeExecutionState::new("n1");
        state.skip("branch not taken").unwrap();
        let err = state.transition(NodeStatus::Cancelled).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }
}
