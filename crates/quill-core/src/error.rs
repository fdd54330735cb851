use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuillError {
    // Provider errors
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("Step timed out after {timeout_secs}s: {step}")]
    StepTimeout { step: String, timeout_secs: u64 },

    // Structured output errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Workflow errors
    #[error("Invalid graph definition: {0}")]
    GraphDefinition(String),

    #[error("Convergence loop exceeded its bound ({limit})")]
    LoopLimitExceeded { limit: usize },

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Run {run_id} failed: {source}")]
    RunFailed {
        run_id: String,
        #[source]
        source: Box<QuillError>,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QuillError {
    /// Shorthand for a provider-side failure.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Wrap an error as the cause of a failed run.
    pub fn run_failed(run_id: impl Into<String>, source: QuillError) -> Self {
        Self::RunFailed {
            run_id: run_id.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error (or the cause it wraps) is a provider-side failure.
    /// Timeouts count as provider failures.
    pub fn is_provider(&self) -> bool {
        match self {
            Self::Provider { .. } | Self::StepTimeout { .. } => true,
            Self::RunFailed { source, .. } => source.is_provider(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping any `RunFailed` layers.
    pub fn root_cause(&self) -> &QuillError {
        match self {
            Self::RunFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failed_keeps_cause() {
        let err = QuillError::run_failed("research-1", QuillError::Validation("bad json".into()));
        assert_eq!(err.to_string(), "Run research-1 failed: Validation failed: bad json");
        assert!(matches!(err.root_cause(), QuillError::Validation(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_timeout_is_provider_failure() {
        let err = QuillError::StepTimeout {
            step: "search".into(),
            timeout_secs: 5,
        };
        assert!(err.is_provider());
        assert!(QuillError::run_failed("r", err).is_provider());
        assert!(!QuillError::LoopLimitExceeded { limit: 2 }.is_provider());
    }
}
