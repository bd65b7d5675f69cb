use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::StreamExt;
use tracing::{debug, warn};

use weft_core::config::RouterConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::Executor;
use weft_core::types::{
    ExecutionMode, ExecutionOutcome, ExecutorBinding, NodeContext, Protocol, StreamChunk,
};

use crate::broker::{CompletionBroker, PendingCompletion};
use crate::inproc::InProcTransport;
use crate::rest::RestTransport;
use crate::transport::{ChunkStream, Transport, TransportRequest};

/// A resolved, callable executor.
#[derive(Clone)]
pub struct ExecutorHandle {
    binding: ExecutorBinding,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl ExecutorHandle {
    pub fn binding(&self) -> &ExecutorBinding {
        &self.binding
    }

    pub fn executor_id(&self) -> &str {
        &self.binding.executor_id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.binding.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl std::fmt::Debug for ExecutorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorHandle")
            .field("executor_id", &self.binding.executor_id)
            .field("mode", &self.binding.mode)
            .field("transport", &self.transport.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What a dispatch returned.
///
/// Only `Done` means the executor has finished. `Pending` and `Stream`
/// are consumed after the dispatching worker has been released.
pub enum Dispatched {
    Done(ExecutionOutcome),
    Pending(PendingCompletion),
    Stream(ChunkStream),
}

impl Dispatched {
    /// Drive to a terminal outcome, passing partial chunks to `on_partial`.
    pub async fn finish<F>(self, mut on_partial: F) -> Result<ExecutionOutcome>
    where
        F: FnMut(serde_json::Value),
    {
        match self {
            Self::Done(outcome) => Ok(outcome),
            Self::Pending(pending) => pending.wait().await,
            Self::Stream(mut chunks) => {
                while let Some(chunk) = chunks.next().await {
                    match chunk? {
                        StreamChunk::Partial(v) => on_partial(v),
                        StreamChunk::Final(v) => return Ok(ExecutionOutcome::completed(v)),
                    }
                }
                Err(WeftError::execution(
                    "stream",
                    "stream closed without a final chunk",
                ))
            }
        }
    }
}

/// Resolves executor bindings to transports and dispatches node attempts
/// according to the binding's execution mode.
pub struct ExecutorRouter {
    transports: ArcSwap<HashMap<Protocol, Arc<dyn Transport>>>,
    inproc: Arc<InProcTransport>,
    broker: Arc<CompletionBroker>,
    config: RouterConfig,
}

impl ExecutorRouter {
    /// Router with the built-in INPROC and REST transports.
    pub fn new(config: RouterConfig) -> Self {
        let inproc = Arc::new(InProcTransport::new(config.stream_buffer));
        let mut transports: HashMap<Protocol, Arc<dyn Transport>> = HashMap::new();
        transports.insert(Protocol::Inproc, inproc.clone());
        transports.insert(Protocol::Rest, Arc::new(RestTransport::new()));
        Self {
            transports: ArcSwap::new(Arc::new(transports)),
            inproc,
            broker: Arc::new(CompletionBroker::new()),
            config,
        }
    }

    /// Install or replace the transport for a protocol (e.g. GRPC, KAFKA).
    pub fn register_transport(&self, protocol: Protocol, transport: Arc<dyn Transport>) {
        debug!(%protocol, transport = transport.name(), "Transport registered");
        self.transports.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(protocol, transport.clone());
            next
        });
    }

    /// Register a trusted local executor.
    pub async fn register_executor(&self, executor: Arc<dyn Executor>) -> Result<()> {
        self.inproc.register(executor).await
    }

    pub fn inproc(&self) -> &Arc<InProcTransport> {
        &self.inproc
    }

    pub fn broker(&self) -> &Arc<CompletionBroker> {
        &self.broker
    }

    /// Resolve a binding to a handle. Fails with `ExecutorUnavailable` when
    /// no live transport can reach the executor.
    pub fn resolve(&self, binding: &ExecutorBinding) -> Result<ExecutorHandle> {
        let transport = self
            .transports
            .load()
            .get(&binding.protocol)
            .cloned()
            .ok_or_else(|| {
                WeftError::unavailable(
                    &binding.executor_id,
                    format!("no transport registered for protocol {}", binding.protocol),
                )
            })?;
        if !transport.is_available(binding) {
            return Err(WeftError::unavailable(
                &binding.executor_id,
                format!("{} transport cannot reach executor", transport.name()),
            ));
        }
        let timeout_ms = binding
            .config_u64("timeout_ms")
            .unwrap_or(self.config.sync_timeout_ms);
        Ok(ExecutorHandle {
            binding: binding.clone(),
            transport,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    /// Dispatch one attempt.
    ///
    /// SYNC waits for the result, bounded by the handle's timeout. ASYNC
    /// registers a continuation and returns `Pending`. STREAM returns the
    /// open chunk stream.
    pub async fn dispatch(&self, handle: &ExecutorHandle, ctx: NodeContext) -> Result<Dispatched> {
        let request = TransportRequest::new(handle.binding.clone(), ctx);
        match handle.binding.mode {
            ExecutionMode::Sync => {
                match tokio::time::timeout(handle.timeout, handle.transport.call(request)).await {
                    Ok(result) => result.map(Dispatched::Done),
                    Err(_) => {
                        warn!(
                            executor = %handle.binding.executor_id,
                            timeout_ms = handle.timeout.as_millis() as u64,
                            "Executor call timed out"
                        );
                        Err(WeftError::Timeout {
                            executor: handle.binding.executor_id.clone(),
                            timeout_ms: handle.timeout.as_millis() as u64,
                            retryable: true,
                        })
                    }
                }
            }
            ExecutionMode::Async => {
                let (completion, pending) = self.broker.register(&handle.binding.executor_id).await;
                let id = completion.id().to_string();
                if let Err(e) = handle.transport.submit(request, completion).await {
                    self.broker.forget(&id).await;
                    return Err(e);
                }
                Ok(Dispatched::Pending(pending))
            }
            ExecutionMode::Stream => handle
                .transport
                .open_stream(request)
                .await
                .map(Dispatched::Stream),
        }
    }

    /// Resolve, dispatch and drive to completion, discarding partial chunks.
    pub async fn call(&self, binding: &ExecutorBinding, ctx: NodeContext) -> Result<ExecutionOutcome> {
        let handle = self.resolve(binding)?;
        self.dispatch(&handle, ctx).await?.finish(|_| {}).await
    }
}

impl Default for ExecutorRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use futures::stream::{self, BoxStream};
    use serde_json::json;

    struct Slow;

    impl Executor for Slow {
        fn id(&self) -> &str {
            "slow"
        }

        fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ExecutionOutcome::completed(json!("late")))
            })
        }
    }

    struct Ticker;

    impl Executor for Ticker {
        fn id(&self) -> &str {
            "ticker"
        }

        fn execute(&self, _ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async { Ok(ExecutionOutcome::completed(json!(3))) })
        }

        fn execute_stream(
            &self,
            _ctx: NodeContext,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
            Box::pin(async {
                let chunks = vec![
                    Ok(StreamChunk::Partial(json!(1))),
                    Ok(StreamChunk::Partial(json!(2))),
                    Ok(StreamChunk::Final(json!(3))),
                ];
                Ok(stream::iter(chunks).boxed())
            })
        }
    }

    fn ctx() -> NodeContext {
        NodeContext::new("r1", "n1", "test")
    }

    #[tokio::test(start_paused = true)]
    async fn sync_timeout_is_retryable() {
        let router = ExecutorRouter::default();
        router.register_executor(Arc::new(Slow)).await.unwrap();
        let binding = ExecutorBinding::inproc("slow").with_config("timeout_ms", json!(2000));

        let err = router.call(&binding, ctx()).await.unwrap_err();
        match err {
            WeftError::Timeout {
                timeout_ms,
                retryable,
                ..
            } => {
                assert_eq!(timeout_ms, 2000);
                assert!(retryable);
            }
            other => panic!("expected timeout, got {other}"),
        }
    }

    #[tokio::test]
    async fn stream_surfaces_partials_then_final() {
        let router = ExecutorRouter::default();
        router.register_executor(Arc::new(Ticker)).await.unwrap();
        let binding = ExecutorBinding::inproc("ticker").with_mode(ExecutionMode::Stream);
        let handle = router.resolve(&binding).unwrap();

        let mut partials = Vec::new();
        let outcome = router
            .dispatch(&handle, ctx())
            .await
            .unwrap()
            .finish(|v| partials.push(v))
            .await
            .unwrap();
        assert_eq!(partials, vec![json!(1), json!(2)]);
        assert_eq!(outcome, ExecutionOutcome::completed(json!(3)));
    }

    #[tokio::test]
    async fn async_mode_parks_on_completion() {
        let router = ExecutorRouter::default();
        router.register_executor(Arc::new(Ticker)).await.unwrap();
        let binding = ExecutorBinding::inproc("ticker").with_mode(ExecutionMode::Async);
        let handle = router.resolve(&binding).unwrap();
        let dispatched = router.dispatch(&handle, ctx()).await.unwrap();
        assert!(matches!(dispatched, Dispatched::Pending(_)));
        let outcome = dispatched.finish(|_| {}).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::completed(json!(3)));
    }

    #[test]
    fn missing_transport_or_executor_is_unavailable() {
        let router = ExecutorRouter::default();
        let grpc = ExecutorBinding::inproc("remote").with_protocol(Protocol::Grpc);
        assert!(matches!(
            router.resolve(&grpc),
            Err(WeftError::ExecutorUnavailable { .. })
        ));
        assert!(matches!(
            router.resolve(&ExecutorBinding::inproc("ghost")),
            Err(WeftError::ExecutorUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn registered_transport_is_used() {
        let router = ExecutorRouter::default();
        let grpc = Arc::new(InProcTransport::default());
        grpc.register(Arc::new(Ticker)).await.unwrap();
        router.register_transport(Protocol::Grpc, grpc);

        let binding = ExecutorBinding::inproc("ticker").with_protocol(Protocol::Grpc);
        let outcome = router.call(&binding, ctx()).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::completed(json!(3)));
    }
}
