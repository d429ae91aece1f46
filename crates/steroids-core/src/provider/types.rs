//! Provider invocation types.
//!
//! Results are a closed sum: [`InvokeResult`] for anything the provider
//! process produced, [`ProviderError`] for classified failures.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Role;

/// Default invocation timeout (15 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 900;

/// Options for one provider invocation.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    /// Model identifier; `None` uses the provider's role default.
    pub model: Option<String>,
    /// Working directory for the provider CLI.
    pub working_dir: PathBuf,
    /// Optional file the prompt was also written to, for CLIs that take a
    /// prompt path instead of an argument.
    pub prompt_file: Option<PathBuf>,
    /// Role of this invocation.
    pub role: Role,
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Provider session to resume, if any.
    pub session_id: Option<String>,
    /// NDJSON activity log destination.
    pub activity_log: Option<PathBuf>,
    /// Invocation id stamped into activity events.
    pub invocation_id: Option<String>,
    /// Run the child under a sandbox home with symlinked auth files.
    pub sandbox_home: bool,
}

impl InvokeOptions {
    /// Options with defaults for a role in a working directory.
    #[must_use]
    pub fn new(role: Role, working_dir: PathBuf) -> Self {
        Self {
            model: None,
            working_dir,
            prompt_file: None,
            role,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            session_id: None,
            activity_log: None,
            invocation_id: None,
            sandbox_home: false,
        }
    }
}

/// Token accounting reported by a provider, when available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
}

/// Everything a finished provider process produced.
#[derive(Debug, Clone)]
pub struct InvokeResult {
    /// Whether the process exited zero within the timeout.
    pub success: bool,
    /// Exit code; -1 when killed.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether the timeout fired.
    pub timed_out: bool,
    /// Provider session id, when the CLI reports one.
    pub session_id: Option<String>,
    /// Token usage, when the CLI reports it.
    pub token_usage: Option<TokenUsage>,
}

/// Classified provider failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credits, quota, or billing exhausted. Not retryable.
    CreditExhaustion,
    /// Rate limited; retry after a delay.
    RateLimit,
    /// Authentication failure. Not retryable.
    AuthError,
    /// Transient connectivity failure. Retryable.
    NetworkError,
    /// The requested model does not exist. Not retryable.
    ModelNotFound,
    /// Prompt exceeded the context window. Not retryable.
    ContextExceeded,
    /// Unclassified failure. Retryable.
    Unknown,
}

impl ErrorKind {
    /// Stable string form for logs and envelopes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreditExhaustion => "credit_exhaustion",
            Self::RateLimit => "rate_limit",
            Self::AuthError => "auth_error",
            Self::NetworkError => "network_error",
            Self::ModelNotFound => "model_not_found",
            Self::ContextExceeded => "context_exceeded",
            Self::Unknown => "unknown",
        }
    }

    /// Whether retrying the invocation may succeed on its own.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::RateLimit | Self::NetworkError | Self::Unknown)
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, Error)]
#[error("{} ({}): {message}", kind.as_str(), if *retryable { "retryable" } else { "fatal" })]
pub struct ProviderError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether retrying may succeed.
    pub retryable: bool,
    /// Suggested delay before retrying, seconds.
    pub retry_after: Option<u64>,
}

impl ProviderError {
    /// Build from a kind with its default retry policy.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
            retry_after: match kind {
                ErrorKind::RateLimit => Some(60),
                _ => None,
            },
        }
    }
}

/// Raised to the host loop when any invocation classifies as credit
/// exhaustion.
#[derive(Debug, Clone)]
pub struct PauseAlert {
    /// Provider that ran dry.
    pub provider: String,
    /// Model in use.
    pub model: Option<String>,
    /// Role of the failing invocation.
    pub role: Role,
    /// Classified message.
    pub message: String,
}

/// How the host loop resolved a pause alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseResolution {
    /// Configuration changed; continue the loop.
    ConfigChanged,
    /// Stop the loop cleanly.
    Stopped,
    /// Exit the process with status 1.
    ImmediateFail,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let err = ProviderError::new(ErrorKind::RateLimit, "slow down");
        assert!(err.retryable);
        assert_eq!(err.retry_after, Some(60));

        let err = ProviderError::new(ErrorKind::CreditExhaustion, "dry");
        assert!(!err.retryable);
        assert_eq!(err.retry_after, None);
    }

    #[test]
    fn test_display_carries_kind() {
        let err = ProviderError::new(ErrorKind::AuthError, "bad key");
        let text = err.to_string();
        assert!(text.contains("auth_error"));
        assert!(text.contains("fatal"));
    }
}
