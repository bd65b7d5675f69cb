use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::traits::Executor;
use weft_core::types::{ExecutionOutcome, ExecutorBinding, StreamChunk};

use crate::broker::Completion;
use crate::transport::{ChunkStream, Transport, TransportRequest};

/// Trusted local executors, called directly with no serialization.
pub struct InProcTransport {
    executors: ArcSwap<HashMap<String, Arc<dyn Executor>>>,
    stream_buffer: usize,
}

impl InProcTransport {
    pub fn new(stream_buffer: usize) -> Self {
        Self {
            executors: ArcSwap::new(Arc::new(HashMap::new())),
            stream_buffer: stream_buffer.max(1),
        }
    }

    /// Load and register an executor, replacing any with the same id.
    pub async fn register(&self, executor: Arc<dyn Executor>) -> Result<()> {
        executor.on_load(&executor.descriptor()).await?;
        let id = executor.id().to_string();
        let previous = self.swap_in(id.clone(), Some(executor));
        if let Some(old) = previous {
            old.on_unload().await?;
        }
        info!(executor = %id, "In-process executor registered");
        Ok(())
    }

    /// Unregister and unload an executor. Returns whether it was present.
    pub async fn unregister(&self, id: &str) -> Result<bool> {
        match self.swap_in(id.to_string(), None) {
            Some(old) => {
                old.on_unload().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn swap_in(&self, id: String, executor: Option<Arc<dyn Executor>>) -> Option<Arc<dyn Executor>> {
        let mut previous = None;
        self.executors.rcu(|current| {
            let mut next = HashMap::clone(current);
            previous = match &executor {
                Some(e) => next.insert(id.clone(), e.clone()),
                None => next.remove(&id),
            };
            next
        });
        previous
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Executor>> {
        self.executors.load().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.executors.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn lookup(&self, binding: &ExecutorBinding) -> Result<Arc<dyn Executor>> {
        self.get(&binding.executor_id).ok_or_else(|| {
            WeftError::unavailable(&binding.executor_id, "no in-process executor registered")
        })
    }
}

impl Default for InProcTransport {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Transport for InProcTransport {
    fn name(&self) -> &str {
        "inproc"
    }

    fn is_available(&self, binding: &ExecutorBinding) -> bool {
        self.executors.load().contains_key(&binding.executor_id)
    }

    fn call(&self, request: TransportRequest) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            let executor = self.lookup(&request.binding)?;
            executor.execute(request.context).await
        })
    }

    fn open_stream(&self, request: TransportRequest) -> BoxFuture<'_, Result<ChunkStream>> {
        Box::pin(async move {
            let executor = self.lookup(&request.binding)?;
            let (tx, rx) = mpsc::channel::<Result<StreamChunk>>(self.stream_buffer);
            let cancel = request.context.cancel.clone();
            let node = request.context.node_id.clone();

            // The executor's stream borrows the executor, so it is driven on
            // its own task and forwarded through a bounded channel.
            tokio::spawn(async move {
                let forward = async {
                    match executor.execute_stream(request.context).await {
                        Ok(mut chunks) => {
                            while let Some(chunk) = chunks.next().await {
                                if tx.send(chunk).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                        }
                    }
                };
                tokio::select! {
                    _ = forward => {}
                    _ = cancel.cancelled() => {
                        debug!(node_id = %node, "In-process stream aborted by cancellation");
                    }
                }
            });

            let chunks = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            Ok(chunks.boxed())
        })
    }

    fn submit(
        &self,
        request: TransportRequest,
        completion: Completion,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let executor = self.lookup(&request.binding)?;
            let cancel = request.context.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = executor.execute(request.context) => {
                        completion.complete(result).await;
                    }
                    _ = cancel.cancelled() => {
                        completion.complete(Err(WeftError::Cancelled)).await;
                    }
                }
            });
            Ok(())
        })
    }
}
