use std::io::Write;

use weft_core::config::EngineConfig;
use weft_core::policy::{PolicyAction, PolicyPhase};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_concurrency = 4
hitl_timeout_secs = 900
token_ttl_secs = 120

[retry]
max_attempts = 5
initial_backoff_ms = 50
max_backoff_ms = 1000
jitter = false

[router]
sync_timeout_ms = 2000
stream_buffer = 16

[orchestrator]
max_debate_rounds = 5
quorum = 0.75
max_replans = 1
max_parallel_steps = 2

[checkpoint]
path = "/tmp/weft-test/checkpoints.db"

[plugins]
manifest_dir = "/tmp/weft-test/plugins"

[[policies]]
id = "no-secrets"
name = "No secrets"
expression = "prompt contains 'password'"
deny_message = "prompt mentions a password"
severity = "high"
phase = "pre"

[[policies]]
id = "mask-email"
expression = "true"
phase = "post"
applies_to = ["llm_call"]
action = { type = "redact", pattern = "[a-z]+@[a-z.]+", replacement = "***" }
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 4);
    assert_eq!(config.engine.hitl_timeout().map(|d| d.as_secs()), Some(900));
    assert_eq!(config.engine.token_ttl_secs, 120);
    assert_eq!(config.retry.max_attempts, 5);
    assert!(!config.retry.jitter);
    assert_eq!(config.router.sync_timeout_ms, 2000);
    assert_eq!(config.orchestrator.max_debate_rounds, 5);
    assert_eq!(config.orchestrator.max_parallel_steps, 2);
    assert_eq!(
        config.checkpoint_path().unwrap().to_str(),
        Some("/tmp/weft-test/checkpoints.db")
    );
    assert!(config.manifest_dir().is_some());

    assert_eq!(config.policies.len(), 2);
    assert_eq!(config.policies[0].phase, PolicyPhase::Pre);
    assert_eq!(config.policies[0].action, PolicyAction::Deny);
    assert_eq!(config.policies[1].applies_to, vec!["llm_call"]);
    assert!(matches!(
        config.policies[1].action,
        PolicyAction::Redact { ref replacement, .. } if replacement == "***"
    ));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_CHECKPOINT_PATH", "/var/lib/weft/cp.db");

    let toml_content = r#"
[checkpoint]
path = "${WEFT_TEST_CHECKPOINT_PATH}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.checkpoint.path.as_deref(), Some("/var/lib/weft/cp.db"));

    std::env::remove_var("WEFT_TEST_CHECKPOINT_PATH");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[engine]
max_concurrency = 2
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = EngineConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_concurrency, 2);
    assert_eq!(config.engine.token_ttl_secs, 3600);
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.initial_backoff_ms, 200);
    assert_eq!(config.router.sync_timeout_ms, 30_000);
    assert_eq!(config.orchestrator.max_replans, 2);
    assert!(config.checkpoint_path().is_none());
    assert!(config.manifest_dir().is_none());
    assert!(config.policies.is_empty());
}

#[test]
fn test_invalid_values_are_rejected() {
    let toml_content = r#"
[orchestrator]
quorum = 1.5
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let err = EngineConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().contains("quorum"));
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = EngineConfig::load(std::path::Path::new("/nonexistent/weft.toml")).unwrap_err();
    assert!(matches!(err, weft_core::error::WeftError::ConfigNotFound(_)));
}
