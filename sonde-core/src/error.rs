//! Error types for the sonde research engine.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering LLM gateway, search gateway, configuration, and session
//! persistence domains. Budget exhaustion and failed convergence are
//! deliberately NOT errors: the engine reports them as terminal states
//! on the final report and still returns its best draft.

use std::path::PathBuf;

/// Top-level error type for the sonde core library.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM gateway interactions.
///
/// Variants split into transient (retry with backoff) and permanent
/// (degrade the current unit of work to a deterministic fallback, never
/// abort the task).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Context window exceeded: used {used} of {limit} tokens")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider unavailable: {message}")]
    ProviderDown { message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

impl LlmError {
    /// Transient failures worth a bounded retry. Everything else either
    /// degrades the current step or signals a caller bug.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited { .. } | LlmError::Timeout { .. } | LlmError::Connection { .. }
        )
    }
}

/// Errors from search gateway interactions.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Search request failed: {message}")]
    Network { message: String },

    #[error("Search timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Search response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SearchError::Network { .. } | SearchError::Timeout { .. }
        )
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from session persistence.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session not found: {id}")]
    NotFound { id: String },

    #[error("Failed to load session: {message}")]
    LoadFailed { message: String },

    #[error("Failed to save session: {message}")]
    SaveFailed { message: String },
}

/// A type alias for results using the top-level `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_llm() {
        let err = EngineError::Llm(LlmError::ApiRequest {
            message: "connection refused".into(),
        });
        assert_eq!(
            err.to_string(),
            "LLM error: API request failed: connection refused"
        );
    }

    #[test]
    fn test_error_display_search() {
        let err = EngineError::Search(SearchError::Timeout { timeout_secs: 30 });
        assert_eq!(err.to_string(), "Search error: Search timed out after 30s");
    }

    #[test]
    fn test_error_display_config() {
        let err = EngineError::Config(ConfigError::EnvVarMissing {
            var: "SONDE_API_KEY".into(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: Environment variable not set: SONDE_API_KEY"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: EngineError = serde_err.into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }

    #[test]
    fn test_llm_retryable_split() {
        assert!(
            LlmError::RateLimited {
                retry_after_secs: 5
            }
            .is_retryable()
        );
        assert!(LlmError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(
            LlmError::Connection {
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::AuthFailed {
                provider: "openai".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ResponseParse {
                message: "bad json".into()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ProviderDown {
                message: "503".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_search_retryable_split() {
        assert!(SearchError::Timeout { timeout_secs: 30 }.is_retryable());
        assert!(
            !SearchError::InvalidQuery {
                reason: "empty".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_llm_error_variants() {
        let err = LlmError::ContextOverflow {
            used: 150_000,
            limit: 128_000,
        };
        assert_eq!(
            err.to_string(),
            "Context window exceeded: used 150000 of 128000 tokens"
        );

        let err = LlmError::RateLimited {
            retry_after_secs: 60,
        };
        assert_eq!(err.to_string(), "Rate limited by provider, retry after 60s");
    }
}
