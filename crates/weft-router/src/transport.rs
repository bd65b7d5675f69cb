use futures::future::BoxFuture;
use futures::stream::BoxStream;

use weft_core::error::Result;
use weft_core::types::{ExecutionOutcome, ExecutorBinding, NodeContext, StreamChunk};

use crate::broker::Completion;

/// Chunks of a STREAM execution, independent of the transport that produced them.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk>>;

/// One node attempt addressed to an executor.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub binding: ExecutorBinding,
    pub context: NodeContext,
}

impl TransportRequest {
    pub fn new(binding: ExecutorBinding, context: NodeContext) -> Self {
        Self { binding, context }
    }

    pub fn executor_id(&self) -> &str {
        &self.binding.executor_id
    }
}

/// One protocol family such as INPROC, REST, GRPC or KAFKA.
pub trait Transport: Send + Sync + 'static {
    /// Transport name for logs.
    fn name(&self) -> &str;

    /// Whether this transport can currently reach the binding's executor.
    fn is_available(&self, binding: &ExecutorBinding) -> bool;

    /// Request/response call. Deadlines are applied by the router.
    fn call(&self, request: TransportRequest) -> BoxFuture<'_, Result<ExecutionOutcome>>;

    /// Open a chunk stream ending in a `StreamChunk::Final`.
    fn open_stream(&self, request: TransportRequest) -> BoxFuture<'_, Result<ChunkStream>>;

    /// Hand off an ASYNC execution. The result arrives later through `completion`.
    fn submit(
        &self,
        request: TransportRequest,
        completion: Completion,
    ) -> BoxFuture<'_, Result<()>>;
}
