use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use weft_core::error::{Result, WeftError};
use weft_core::types::ExecutionOutcome;

type Sender = oneshot::Sender<Result<ExecutionOutcome>>;

/// Pending ASYNC continuations keyed by correlation id.
///
/// A dispatch registers a continuation and returns at once; whoever
/// receives the executor's callback completes it by id.
#[derive(Default)]
pub struct CompletionBroker {
    pending: Mutex<HashMap<String, Sender>>,
}

impl CompletionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation and return the handle the caller parks on.
    pub async fn register(self: &Arc<Self>, executor_id: &str) -> (Completion, PendingCompletion) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.clone(), tx);
        debug!(correlation_id = %id, executor = %executor_id, "Registered async continuation");
        (
            Completion {
                id: id.clone(),
                broker: Arc::clone(self),
            },
            PendingCompletion {
                id,
                executor: executor_id.to_string(),
                rx: Some(rx),
                broker: Arc::downgrade(self),
            },
        )
    }

    /// Complete a pending continuation.
    /// Returns true if the id was found and the waiter was still listening.
    pub async fn complete(&self, correlation_id: &str, result: Result<ExecutionOutcome>) -> bool {
        let entry = self.lock().remove(correlation_id);
        match entry {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                warn!(correlation_id = %correlation_id, "Completion for unknown or settled continuation");
                false
            }
        }
    }

    /// Drop a continuation without completing it.
    pub async fn forget(&self, correlation_id: &str) -> bool {
        self.lock().remove(correlation_id).is_some()
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Sender>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer side of one continuation, handed to a transport.
pub struct Completion {
    id: String,
    broker: Arc<CompletionBroker>,
}

impl Completion {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn complete(self, result: Result<ExecutionOutcome>) -> bool {
        self.broker.complete(&self.id, result).await
    }
}

/// Consumer side: parked on by the engine without holding a worker.
///
/// Dropping it unanswered (the waiter was cancelled) removes the
/// continuation from the broker.
pub struct PendingCompletion {
    id: String,
    executor: String,
    rx: Option<oneshot::Receiver<Result<ExecutionOutcome>>>,
    broker: Weak<CompletionBroker>,
}

impl PendingCompletion {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self) -> Result<ExecutionOutcome> {
        let received = match self.rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        };
        match received {
            Some(result) => result,
            None => Err(WeftError::unavailable(
                &self.executor,
                format!("continuation {} dropped before completion", self.id),
            )),
        }
    }
}

impl Drop for PendingCompletion {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            if broker.lock().remove(&self.id).is_some() {
                debug!(correlation_id = %self.id, "Abandoned async continuation removed");
            }
        }
    }
}
