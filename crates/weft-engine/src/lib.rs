//! Workflow execution: graph model, scheduler, node lifecycle, guardrails
//! and checkpoints.

pub mod builtin;
pub mod checkpoint;
mod engine;
pub mod graph;
pub mod guardrail;
mod scheduler;
pub mod state;
pub mod token;
mod worker;

pub use builtin::MergePolicy;
pub use checkpoint::{MemoryCheckpointStore, SqliteCheckpointStore};
pub use engine::{
    EngineBuilder, NodeChunk, NodeExecutionEngine, RunHandle, RunReport, SuspendedNode,
};
pub use graph::{Binding, BindingKind, Edge, EdgeKind, GraphModel, NodeInstance, WorkflowGraph};
pub use guardrail::GuardrailGate;
pub use state::{NodeError, NodeExecutionState};
pub use token::TokenIssuer;
