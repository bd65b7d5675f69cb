//! Mocks and fixtures shared by the weft test suites.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use weft_core::descriptor::{ExecutorDescriptor, NodeTypeDescriptor};
use weft_core::error::{Result, WeftError};
use weft_core::traits::{AuditSink, Executor};
use weft_core::types::{ExecutionMode, ExecutionOutcome, NodeContext, StreamChunk};
use weft_registry::{PluginManifest, PluginRegistry};
use weft_router::ExecutorRouter;

/// One scripted reaction of a [`MockExecutor`].
#[derive(Debug, Clone)]
pub enum Step {
    /// Complete with a fixed value.
    Complete(Value),
    /// Complete with the node's inputs as an object.
    Echo,
    /// Suspend with a state tag and an awaiting payload.
    Suspend(String, Value),
    /// Fail with a retryable `ExecutorUnavailable`.
    Unavailable,
    /// Fail with a non-retryable execution error.
    Fail(String),
    /// Sleep, then complete with the value.
    Sleep(Duration, Value),
}

/// Scripted in-process executor.
///
/// Steps are consumed in order; the last one repeats once the script runs
/// out. Every call is recorded for later inspection.
pub struct MockExecutor {
    id: String,
    mode: ExecutionMode,
    script: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    delay: Option<Duration>,
    chunks: Vec<Value>,
    probe: Option<ConcurrencyProbe>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<NodeContext>>,
}

impl MockExecutor {
    /// Executor that echoes its inputs.
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            mode: ExecutionMode::Sync,
            script: Mutex::new(VecDeque::new()),
            last: Mutex::new(Step::Echo),
            delay: None,
            chunks: vec![],
            probe: None,
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(vec![]),
        }
    }

    /// Executor that always completes with `output`.
    pub fn returning(id: &str, output: Value) -> Self {
        Self::new(id).then(Step::Complete(output))
    }

    /// Append a step to the script.
    pub fn then(self, step: Step) -> Self {
        if let Ok(mut last) = self.last.lock() {
            *last = step.clone();
        }
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Partial chunks emitted before the final output in STREAM mode.
    pub fn with_chunks(mut self, chunks: Vec<Value>) -> Self {
        self.mode = ExecutionMode::Stream;
        self.chunks = chunks;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_probe(mut self, probe: ConcurrencyProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Number of `execute` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Contexts of every call, in call order.
    pub fn contexts(&self) -> Vec<NodeContext> {
        self.contexts.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_step(&self) -> Step {
        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(step) => step,
            None => self
                .last
                .lock()
                .map(|s| s.clone())
                .unwrap_or(Step::Echo),
        }
    }
}

impl Executor for MockExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn descriptor(&self) -> ExecutorDescriptor {
        let mut desc = ExecutorDescriptor::inproc(&self.id);
        desc.mode = self.mode;
        desc
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, Result<ExecutionOutcome>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut contexts) = self.contexts.lock() {
                contexts.push(ctx.clone());
            }
            let _guard = self.probe.as_ref().map(ConcurrencyProbe::enter);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match self.next_step() {
                Step::Complete(v) => Ok(ExecutionOutcome::completed(v)),
                Step::Echo => Ok(ExecutionOutcome::completed(ctx.inputs_value())),
                Step::Suspend(tag, awaiting) => Ok(ExecutionOutcome::suspend(tag, awaiting)),
                Step::Unavailable => Err(WeftError::unavailable(&self.id, "mock unavailable")),
                Step::Fail(msg) => Err(WeftError::execution(&self.id, msg)),
                Step::Sleep(d, v) => {
                    tokio::time::sleep(d).await;
                    Ok(ExecutionOutcome::completed(v))
                }
            }
        })
    }

    fn execute_stream(
        &self,
        ctx: NodeContext,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamChunk>>>> {
        Box::pin(async move {
            let partials: Vec<Result<StreamChunk>> = self
                .chunks
                .iter()
                .cloned()
                .map(|c| Ok(StreamChunk::Partial(c)))
                .collect();
            let last = match self.execute(ctx).await? {
                ExecutionOutcome::Completed { output } => Ok(StreamChunk::Final(output)),
                ExecutionOutcome::Suspend { .. } => {
                    Err(WeftError::validation("mock stream cannot suspend"))
                }
            };
            Ok(stream::iter(partials).chain(stream::once(async move { last })).boxed())
        })
    }
}

/// Tracks how many callers are inside a section at once.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyProbe {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> ProbeGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ProbeGuard {
            current: self.current.clone(),
        }
    }

    /// Highest concurrent count observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    current: Arc<AtomicUsize>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Audit sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.events().into_iter().map(|(t, _)| t).collect()
    }

    pub fn count(&self, event_type: &str) -> usize {
        self.events().iter().filter(|(t, _)| t == event_type).count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event_type: &str, payload: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push((event_type.to_string(), payload));
        }
    }
}

/// Node type descriptor whose default executor is `executor_id`.
pub fn node_type(node_type: &str, executor_id: &str, checkpointable: bool) -> NodeTypeDescriptor {
    let mut desc = NodeTypeDescriptor::builtin(node_type, checkpointable);
    desc.default_executor = Some(executor_id.to_string());
    desc
}

/// Register `executor` with the router and bind `node_type` to it in the
/// registry.
pub async fn bind(
    registry: &PluginRegistry,
    router: &ExecutorRouter,
    node_type_name: &str,
    executor: Arc<dyn Executor>,
    checkpointable: bool,
) -> Result<()> {
    registry.register_executor(executor.descriptor())?;
    registry.register_node_type(node_type(node_type_name, executor.id(), checkpointable))?;
    router.register_executor(executor).await
}

/// Write manifests as TOML files into a fresh temporary directory.
pub fn manifest_dir(manifests: &[PluginManifest]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for manifest in manifests {
        write_manifest(dir.path(), manifest);
    }
    dir
}

pub fn write_manifest(dir: &Path, manifest: &PluginManifest) {
    let content = toml::to_string(manifest).unwrap();
    std::fs::write(dir.join(format!("{}.toml", manifest.id())), content).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn script_runs_in_order_then_repeats() {
        let exec = MockExecutor::new("m")
            .then(Step::Unavailable)
            .then(Step::Complete(json!(1)));
        let ctx = NodeContext::new("r", "n", "t");
        assert!(exec.execute(ctx.clone()).await.is_err());
        assert_eq!(
            exec.execute(ctx.clone()).await.unwrap(),
            ExecutionOutcome::completed(json!(1))
        );
        assert_eq!(
            exec.execute(ctx).await.unwrap(),
            ExecutionOutcome::completed(json!(1))
        );
        assert_eq!(exec.calls(), 3);
    }

    #[test]
    fn probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();
        let a = probe.enter();
        let b = probe.enter();
        drop(a);
        let _c = probe.enter();
        drop(b);
        assert_eq!(probe.peak(), 2);
    }

    #[test]
    fn manifests_round_trip_through_dir() {
        let manifest = PluginManifest::new("demo")
            .with_executor(ExecutorDescriptor::inproc("echo"))
            .with_node_type(node_type("echo", "echo", false));
        let dir = manifest_dir(&[manifest]);
        let loaded = weft_registry::load_manifests(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), "demo");
    }
}
