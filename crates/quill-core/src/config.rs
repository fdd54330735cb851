use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuillError, Result};

/// Top-level Quill configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
}

fn default_workspace() -> String { "~/.quill".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

impl ModelConfig {
    /// OpenAI model with defaults for everything but the key.
    pub fn openai(model_id: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            provider: default_provider(),
            model_id: model_id.into(),
            api_key,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            retry: None,
        }
    }
}

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Web search provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchConfig {
    #[serde(default = "default_search_provider")]
    pub provider: String,
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

fn default_search_provider() -> String { "tavily".to_string() }

/// Research workflow tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Maximum critique → revise iterations before the run is aborted.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: usize,
    /// Hard cap on total steps per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-step wait bound for the external providers.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Number of documents requested from the search provider.
    #[serde(default = "default_search_results")]
    pub search_results: usize,
    /// Number of sources the curator is asked to keep.
    #[serde(default = "default_curated_sources")]
    pub curated_sources: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: default_max_loop_iterations(),
            max_steps: default_max_steps(),
            step_timeout_secs: default_step_timeout_secs(),
            search_results: default_search_results(),
            curated_sources: default_curated_sources(),
        }
    }
}

impl ResearchConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

fn default_max_loop_iterations() -> usize { 10 }
fn default_max_steps() -> usize { 64 }
fn default_step_timeout_secs() -> u64 { 120 }
fn default_search_results() -> usize { 10 }
fn default_curated_sources() -> usize { 5 }

/// Where checkpoints are kept.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    Sqlite,
    Memory,
}

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Database path. Default: <workspace>/checkpoints.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: CheckpointBackend::default(),
            path: None,
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }

/// JSONL run logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable run logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <workspace>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
        }
    }
}

fn default_log_enabled() -> bool { true }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| QuillError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references first.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| QuillError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from the environment alone.
    ///
    /// `OPENAI_API_KEY` selects OpenAI; without it a local Ollama endpoint is
    /// assumed. `TAVILY_API_KEY` enables search unless it is unset or `NONE`.
    pub fn from_env() -> Self {
        let model = match std::env::var("OPENAI_API_KEY").ok() {
            Some(key) => ModelConfig::openai("gpt-4o-mini", Some(key)),
            None => ModelConfig {
                provider: "ollama".to_string(),
                base_url: Some("http://localhost:11434/v1/chat/completions".to_string()),
                ..ModelConfig::openai("llama3.2", None)
            },
        };

        let web_search = std::env::var("TAVILY_API_KEY")
            .ok()
            .filter(|k| !k.is_empty() && k != "NONE")
            .map(|api_key| WebSearchConfig {
                provider: default_search_provider(),
                api_key,
                base_url: None,
            });

        Self {
            workspace: default_workspace(),
            model,
            fallback_models: vec![],
            web_search,
            research: ResearchConfig::default(),
            checkpoint: CheckpointConfig::default(),
            log: None,
        }
    }

    /// Reject settings the workflow cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.research.max_steps == 0 {
            return Err(QuillError::Config("research.max_steps must be at least 1".into()));
        }
        if self.research.step_timeout_secs == 0 {
            return Err(QuillError::Config(
                "research.step_timeout_secs must be at least 1".into(),
            ));
        }
        if self.research.search_results == 0 || self.research.curated_sources == 0 {
            return Err(QuillError::Config(
                "research.search_results and research.curated_sources must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Resolve the checkpoint database path.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.checkpoint
            .path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.workspace_dir().join("checkpoints.db"))
    }

    /// Resolve the run log directory, if run logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(
            log.log_dir
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| self.workspace_dir().join("logs")),
        )
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_QUILL_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_QUILL_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_QUILL_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_QUILL_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_QUILL_VAR}\"");
    }

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.research.max_loop_iterations, 10);
        assert_eq!(config.research.search_results, 10);
        assert_eq!(config.research.curated_sources, 5);
        assert_eq!(config.research.step_timeout(), Duration::from_secs(120));
        assert!(config.checkpoint.enabled);
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Sqlite);
        assert!(config.web_search.is_none());
        assert!(config.log_dir().is_none());
    }

    #[test]
    fn test_checkpoint_path_defaults_to_workspace() {
        let config = AppConfig::parse(
            r#"
workspace = "/tmp/quill-ws"

[model]
model_id = "gpt-4o-mini"
"#,
        )
        .unwrap();
        assert_eq!(config.checkpoint_path(), PathBuf::from("/tmp/quill-ws/checkpoints.db"));
    }

    #[test]
    fn test_log_dir_when_enabled() {
        let config = AppConfig::parse(
            r#"
workspace = "/tmp/quill-ws"

[model]
model_id = "gpt-4o-mini"

[log]
"#,
        )
        .unwrap();
        assert_eq!(config.log_dir(), Some(PathBuf::from("/tmp/quill-ws/logs")));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"

[research]
step_timeout_secs = 0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, QuillError::Config(_)));
    }

    #[test]
    fn test_memory_backend() {
        let config = AppConfig::parse(
            r#"
[model]
model_id = "gpt-4o-mini"

[checkpoint]
backend = "memory"
"#,
        )
        .unwrap();
        assert_eq!(config.checkpoint.backend, CheckpointBackend::Memory);
    }
}
