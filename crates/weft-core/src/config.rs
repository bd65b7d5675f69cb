use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::policy::Policy;

/// Top-level engine configuration (`weft.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    /// Guardrail policies applied to every run.
    #[serde(default)]
    pub policies: Vec<Policy>,
}

/// Per-run scheduling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Nodes dispatched concurrently within one run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// How long a suspended node may wait for a resume. Unbounded when unset.
    #[serde(default)]
    pub hitl_timeout_secs: Option<u64>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            hitl_timeout_secs: None,
            token_ttl_secs: default_token_ttl(),
        }
    }
}

impl SchedulerConfig {
    pub fn hitl_timeout(&self) -> Option<Duration> {
        self.hitl_timeout_secs.map(Duration::from_secs)
    }
}

fn default_max_concurrency() -> usize { 8 }
fn default_token_ttl() -> u64 { 3600 }

/// Retry configuration for transient executor failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 10_000 }
fn default_jitter() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Default SYNC deadline when a binding carries no `timeout_ms`.
    #[serde(default = "default_sync_timeout")]
    pub sync_timeout_ms: u64,
    /// Channel capacity between a STREAM executor and its consumer.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: default_sync_timeout(),
            stream_buffer: default_stream_buffer(),
        }
    }
}

fn default_sync_timeout() -> u64 { 30_000 }
fn default_stream_buffer() -> usize { 64 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_debate_rounds")]
    pub max_debate_rounds: u32,
    /// Fraction of participants that must agree.
    #[serde(default = "default_quorum")]
    pub quorum: f64,
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_debate_rounds: default_max_debate_rounds(),
            quorum: default_quorum(),
            max_replans: default_max_replans(),
            max_parallel_steps: default_max_parallel_steps(),
        }
    }
}

fn default_max_debate_rounds() -> u32 { 3 }
fn default_quorum() -> f64 { 0.66 }
fn default_max_replans() -> u32 { 2 }
fn default_max_parallel_steps() -> usize { 4 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite file. Checkpoints stay in memory when unset.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    #[serde(default)]
    pub manifest_dir: Option<String>,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(WeftError::Config("engine.max_concurrency must be > 0".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(WeftError::Config("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.quorum) || self.orchestrator.quorum == 0.0 {
            return Err(WeftError::Config(
                "orchestrator.quorum must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.checkpoint.path.as_deref().map(expand_home)
    }

    pub fn manifest_dir(&self) -> Option<PathBuf> {
        self.plugins.manifest_dir.as_deref().map(expand_home)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
