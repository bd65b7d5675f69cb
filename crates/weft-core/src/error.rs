use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Authoring / schema errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Binding resolution failed for node {node}: {message}")]
    BindingResolution { node: String, message: String },

    #[error("No outgoing edge matched for node {node}")]
    Routing { node: String },

    // Execution errors
    #[error("Executor {executor} timed out after {timeout_ms}ms")]
    Timeout {
        executor: String,
        timeout_ms: u64,
        retryable: bool,
    },

    #[error("Executor unavailable: {executor}: {message}")]
    ExecutorUnavailable { executor: String, message: String },

    #[error("Executor {executor} failed: {message}")]
    Execution { executor: String, message: String },

    #[error("Blocked by guardrail policy {policy}: {reason}")]
    GuardrailBlocked { policy: String, reason: String },

    #[error("Stale or mismatched execution token for node {node}: {reason}")]
    StaleToken { node: String, reason: String },

    #[error("Invalid state transition for node {node}: {from} -> {to}")]
    InvalidTransition {
        node: String,
        from: String,
        to: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    // Orchestration errors
    #[error("No agent provides capability: {0}")]
    InsufficientCapability(String),

    #[error("Orchestration aborted after {} error(s): {}", .errors.len(), .errors.join("; "))]
    FatalOrchestration { errors: Vec<String> },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Stable classification of a [`WeftError`], used in node state records,
/// events and error-handler edge matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    BindingResolution,
    Routing,
    Timeout,
    ExecutorUnavailable,
    Execution,
    GuardrailBlocked,
    StaleToken,
    InvalidTransition,
    Cancelled,
    InsufficientCapability,
    FatalOrchestration,
    Config,
    Checkpoint,
    Io,
    Json,
}

impl WeftError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::BindingResolution { .. } => ErrorKind::BindingResolution,
            Self::Routing { .. } => ErrorKind::Routing,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ExecutorUnavailable { .. } => ErrorKind::ExecutorUnavailable,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::GuardrailBlocked { .. } => ErrorKind::GuardrailBlocked,
            Self::StaleToken { .. } => ErrorKind::StaleToken,
            Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::InsufficientCapability(_) => ErrorKind::InsufficientCapability,
            Self::FatalOrchestration { .. } => ErrorKind::FatalOrchestration,
            Self::Config(_) | Self::ConfigNotFound(_) => ErrorKind::Config,
            Self::Checkpoint(_) => ErrorKind::Checkpoint,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
        }
    }

    /// Transient kinds that the engine retries with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { retryable, .. } => *retryable,
            Self::ExecutorUnavailable { .. } => true,
            _ => false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unavailable(executor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExecutorUnavailable {
            executor: executor.into(),
            message: message.into(),
        }
    }

    pub fn execution(executor: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            executor: executor.into(),
            message: message.into(),
        }
    }

    pub fn binding(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BindingResolution {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn stale(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StaleToken {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
