use std::io::Write;

use quill_core::config::{AppConfig, CheckpointBackend};
use quill_core::error::QuillError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
workspace = "/tmp/quill-test"

[model]
provider = "openai"
model_id = "gpt-4o-mini"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.2

[model.retry]
max_retries = 5
initial_backoff_ms = 250

[[fallback_models]]
provider = "ollama"
model_id = "llama3.2"
base_url = "http://localhost:11434/v1/chat/completions"

[web_search]
api_key = "tvly-test"

[research]
max_loop_iterations = 3
max_steps = 20
step_timeout_secs = 30
search_results = 8
curated_sources = 4

[checkpoint]
backend = "memory"

[log]
log_dir = "/tmp/quill-logs"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.model_id, "gpt-4o-mini");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);
    let retry = config.model.retry.as_ref().expect("retry present");
    assert_eq!(retry.max_retries, 5);
    assert_eq!(retry.initial_backoff_ms, 250);
    assert_eq!(retry.max_backoff_ms, 30000);

    assert_eq!(config.fallback_models.len(), 1);
    assert_eq!(config.fallback_models[0].provider, "ollama");

    let search = config.web_search.as_ref().expect("web_search present");
    assert_eq!(search.provider, "tavily");
    assert_eq!(search.api_key, "tvly-test");

    assert_eq!(config.research.max_loop_iterations, 3);
    assert_eq!(config.research.max_steps, 20);
    assert_eq!(config.research.step_timeout_secs, 30);
    assert_eq!(config.research.search_results, 8);
    assert_eq!(config.research.curated_sources, 4);
    assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
    assert_eq!(
        config.log_dir(),
        Some(std::path::PathBuf::from("/tmp/quill-logs"))
    );
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("QUILL_TEST_API_KEY", "expanded-key-value");

    let tmp = write_config(
        r#"
[model]
model_id = "test-model"
api_key = "${QUILL_TEST_API_KEY}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("QUILL_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.workspace, "~/.quill");
    assert!(config.fallback_models.is_empty());
    assert!(config.web_search.is_none());
    assert_eq!(config.research.max_loop_iterations, 10);
    assert_eq!(config.research.max_steps, 64);
    assert_eq!(config.research.step_timeout_secs, 120);
    assert!(config.checkpoint.enabled);
    assert!(config.log.is_none());
}

#[test]
fn test_missing_file_is_config_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/quill.toml")).unwrap_err();
    assert!(matches!(err, QuillError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_research_settings_rejected() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"

[research]
curated_sources = 0
"#,
    );

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, QuillError::Config(_)));
}

#[test]
fn test_unknown_backend_rejected() {
    let tmp = write_config(
        r#"
[model]
model_id = "llama3.2"

[checkpoint]
backend = "postgres"
"#,
    );

    assert!(AppConfig::load(tmp.path()).is_err());
}
