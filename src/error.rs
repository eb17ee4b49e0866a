//! Error types for docforge operations.
//!
//! Defines the error taxonomy used across the orchestration core:
//! - Backend invocation (transport, timeout, validation signals)
//! - Generation (adapter-level outcomes after retries)
//! - Evaluation (judge calls and result parsing)
//! - Persistence
//! - Run configuration and run-level preconditions

use std::time::Duration;

use thiserror::Error;

use crate::generation::ValidationCode;

/// Errors raised at the backend invocation boundary.
///
/// This is the tagged transport result every backend returns. Classification
/// into transient versus terminal happens in [`BackendError::is_transient`]
/// and nowhere else.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend reported validation failure: {0}")]
    Validation(ValidationCode),

    #[error("Process exited with code {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("Failed to parse backend output: {0}")]
    Parse(String),

    #[error("Fatal backend error: {0}")]
    Fatal(String),
}

impl BackendError {
    /// Returns true if the error belongs to the transient set: rate limiting,
    /// 502/503/504, connection resets and timeouts.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::RateLimited(_) => true,
            BackendError::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            BackendError::Connection(_) => true,
            BackendError::Timeout(_) => true,
            BackendError::ProcessFailed { stderr, .. } => looks_transient(stderr),
            BackendError::Validation(_) | BackendError::Parse(_) | BackendError::Fatal(_) => false,
        }
    }
}

/// Heuristic for process stderr that carries a transient condition.
fn looks_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("timed out")
        || lower.contains("timeout")
}

/// Errors that terminate a generation attempt sequence.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("Content rejected after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },

    #[error("Transient backend failure persisted after retries: {0}")]
    TransientExhausted(String),

    #[error("Fatal generation error: {0}")]
    Fatal(String),
}

/// Errors that can occur during evaluation.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("Judge call failed: {0}")]
    Judge(String),

    #[error("Failed to parse judge response: {0}")]
    Parse(String),

    #[error("Score {score} for criterion '{criterion}' outside 1-10")]
    ScoreOutOfRange { criterion: String, score: f64 },

    #[error("Document '{0}' has no successful generation and cannot be evaluated")]
    NotEvaluable(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Run '{id}' is in status '{actual}', expected '{expected}'")]
    StatusConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Illegal run transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Append-only record already exists: {0}")]
    Duplicate(String),

    #[error("Query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Errors in the run configuration snapshot.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Run-level errors. These are the only errors that can drive a run to
/// `failed`; task-level errors downgrade to `partial` instead.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("No valid documents in run configuration")]
    NoDocuments,

    #[error("Run precondition failed: {0}")]
    Precondition(String),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: {0} environment variable not set")]
    MissingApiKey(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl From<LlmError> for BackendError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited(msg) => BackendError::RateLimited(msg),
            LlmError::ApiError { code, message } => BackendError::Http {
                status: code,
                message,
            },
            LlmError::RequestFailed(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("connection") || lower.contains("reset") {
                    BackendError::Connection(msg)
                } else {
                    BackendError::Fatal(msg)
                }
            }
            LlmError::Timeout(duration) => BackendError::Timeout(duration),
            LlmError::ParseError(msg) => BackendError::Parse(msg),
            LlmError::MissingApiKey(var) => {
                BackendError::Fatal(format!("missing API key in {}", var))
            }
        }
    }
}

impl From<BackendError> for LlmError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::RateLimited(msg) => LlmError::RateLimited(msg),
            BackendError::Http { status, message } => LlmError::ApiError {
                code: status,
                message,
            },
            BackendError::Timeout(duration) => LlmError::Timeout(duration),
            BackendError::Parse(msg) => LlmError::ParseError(msg),
            other => LlmError::RequestFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_set() {
        assert!(BackendError::RateLimited("slow down".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(BackendError::Connection("reset by peer".into()).is_transient());
        for status in [502, 503, 504] {
            assert!(BackendError::Http {
                status,
                message: String::new()
            }
            .is_transient());
        }
    }

    #[test]
    fn test_non_transient() {
        assert!(!BackendError::Http {
            status: 500,
            message: "boom".into()
        }
        .is_transient());
        assert!(!BackendError::Http {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!BackendError::Fatal("bad key".into()).is_transient());
        assert!(!BackendError::Validation(ValidationCode::MissingGrounding).is_transient());
    }

    #[test]
    fn test_process_stderr_classification() {
        let transient = BackendError::ProcessFailed {
            code: 1,
            stderr: "upstream returned 503 Service Unavailable".into(),
        };
        assert!(transient.is_transient());

        let fatal = BackendError::ProcessFailed {
            code: 2,
            stderr: "unknown flag --foo".into(),
        };
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_llm_error_conversion() {
        let err: BackendError = LlmError::ApiError {
            code: 503,
            message: "overloaded".into(),
        }
        .into();
        assert!(err.is_transient());

        let err: BackendError = LlmError::MissingApiKey("OPENROUTER_API_KEY".into()).into();
        assert!(!err.is_transient());
    }
}
