use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::descriptor::ExecutorDescriptor;
use crate::error::{Result, WeftError};
use crate::policy::Policy;
use crate::types::*;

/// The pluggable implementation behind a node type.
pub trait Executor: Send + Sync + 'static {
    /// Executor id (matches `ExecutorBinding::executor_id`).
    fn id(&self) -> &str;

    /// Descriptor published to the registry.
    fn descriptor(&self) -> ExecutorDescriptor {
        ExecutorDescriptor::inproc(self.id())
    }

    /// Called once when the executor is registered with a router.
    fn on_load(&self, _descriptor: &ExecutorDescriptor) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Run one attempt of a node.
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>>;

    /// Run one attempt in STREAM mode.
    ///
    /// The default runs `execute` and yields its output as the final chunk.
    fn execute_stream(
        &self,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
        Box::pin(async move {
            let node = ctx.node_id.clone();
            match self.execute(ctx).await? {
                ExecutionOutcome::Completed { output } => {
                    Ok(stream::once(async move { Ok(StreamChunk::Final(output)) }).boxed())
                }
                ExecutionOutcome::Suspend { .. } => Err(WeftError::validation(format!(
                    "node {} cannot suspend from a stream",
                    node
                ))),
            }
        })
    }

    /// Called when the executor is removed from a router.
    fn on_unload(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A persisted suspension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub state_tag: String,
    pub payload: Vec<u8>,
}

/// Persistence for suspended nodes.
pub trait CheckpointStore: Send + Sync + 'static {
    fn save(
        &self,
        run_id: String,
        node_id: String,
        state_tag: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'_, Result<()>>;

    fn load(
        &self,
        run_id: String,
        node_id: String,
    ) -> BoxFuture<'_, Result<Option<CheckpointRecord>>>;

    fn delete(&self, run_id: String, node_id: String) -> BoxFuture<'_, Result<()>>;
}

/// Fire-and-forget event consumer.
pub trait AuditSink: Send + Sync + 'static {
    fn emit(&self, event_type: &str, payload: serde_json::Value);
}

/// Supplies guardrail policies.
pub trait PolicySource: Send + Sync + 'static {
    fn policies(&self) -> Vec<Policy>;
}

impl PolicySource for Vec<Policy> {
    fn policies(&self) -> Vec<Policy> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    struct Upper;

    impl Executor for Upper {
        fn id(&self) -> &str {
            "upper"
        }

        fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
            Box::pin(async move {
                let text = ctx.input_str("text").unwrap_or_default().to_uppercase();
                Ok(ExecutionOutcome::completed(serde_json::json!(text)))
            })
        }
    }

    #[tokio::test]
    async fn default_stream_yields_final_chunk() {
        let exec = Upper;
        let ctx = NodeContext::new("r1", "n1", "upper").with_input("text", serde_json::json!("hi"));
        let chunks: Vec<StreamChunk> = exec
            .execute_stream(ctx)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks, vec![StreamChunk::Final(serde_json::json!("HI"))]);
        assert_eq!(exec.descriptor().id, "upper");
    }
}
