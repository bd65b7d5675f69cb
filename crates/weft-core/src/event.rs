use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorKind;
use crate::policy::PolicyPhase;
use crate::traits::AuditSink;
use crate::types::RunStatus;

/// Lifecycle events published by the engine and orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: String,
        graph_id: String,
    },
    NodeStarted {
        run_id: String,
        node_id: String,
        attempt: u32,
    },
    NodeCompleted {
        run_id: String,
        node_id: String,
        output: serde_json::Value,
    },
    NodeFailed {
        run_id: String,
        node_id: String,
        kind: ErrorKind,
        error: String,
    },
    NodeSkipped {
        run_id: String,
        node_id: String,
        reason: String,
    },
    NodeSuspended {
        run_id: String,
        node_id: String,
        state_tag: String,
    },
    NodeResumed {
        run_id: String,
        node_id: String,
    },
    NodeCancelled {
        run_id: String,
        node_id: String,
    },
    NodeRetrying {
        run_id: String,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    StreamChunk {
        run_id: String,
        node_id: String,
        chunk: serde_json::Value,
    },
    GuardrailTriggered {
        run_id: String,
        node_id: String,
        phase: PolicyPhase,
        policies: Vec<String>,
        allowed: bool,
    },
    LateResultDropped {
        run_id: String,
        node_id: String,
    },
    RunCompleted {
        run_id: String,
        status: RunStatus,
    },
    DebateRound {
        topic: String,
        round: u32,
        summary: String,
    },
    ConsensusReached {
        topic: String,
        reached: bool,
        decision: serde_json::Value,
    },
}

impl EngineEvent {
    /// Stable event type name handed to audit sinks.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeFailed { .. } => "node_failed",
            Self::NodeSkipped { .. } => "node_skipped",
            Self::NodeSuspended { .. } => "node_suspended",
            Self::NodeResumed { .. } => "node_resumed",
            Self::NodeCancelled { .. } => "node_cancelled",
            Self::NodeRetrying { .. } => "node_retrying",
            Self::StreamChunk { .. } => "stream_chunk",
            Self::GuardrailTriggered { .. } => "guardrail_triggered",
            Self::LateResultDropped { .. } => "late_result_dropped",
            Self::RunCompleted { .. } => "run_completed",
            Self::DebateRound { .. } => "debate_round",
            Self::ConsensusReached { .. } => "consensus_reached",
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forward every bus event to an audit sink until the bus closes.
pub fn spawn_audit_forwarder(
    bus: &EventBus,
    sink: Arc<dyn AuditSink>,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_value(&event).unwrap_or_default();
                    sink.emit(event.event_type(), payload);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Audit forwarder lagged, skipped events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    debug!("EventBus closed, audit forwarder stopping");
                    break;
                }
            }
        }
    })
}
