//! Provider error classification.
//!
//! A precedence chain over stderr (falling back to stdout). Structured
//! JSON error codes win over substring classes, so a quota exhaustion that
//! also mentions "429" still classifies as credit exhaustion.

use regex::Regex;
use serde_json::Value;

use super::types::{ErrorKind, ProviderError};

/// Reusable default classifier. Providers embed one and may layer their
/// own rules before delegating.
#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    credit_re: Option<Regex>,
    model_re: Option<Regex>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Build the default chain. The patterns are static; a pattern that
    /// failed to compile simply never matches.
    #[must_use]
    pub fn new() -> Self {
        let credit_re = Regex::new(
            r"(?i)insufficient\s+(credits?|funds?|balance|quota)|payment\s+required|out\s+of\s+tokens|usage\s+limit\s+reached|plan\s+limit|subscription\s+expired",
        )
        .ok();
        let model_re = Regex::new(
            r"(?i)(model\s+.*not\s+(found|available|supported))|unknown\s+model|no\s+such\s+model",
        )
        .ok();
        Self { credit_re, model_re }
    }

    /// Classify a failed invocation from its exit code and output.
    #[must_use]
    pub fn classify(&self, exit_code: i32, stderr: &str, stdout: &str) -> ProviderError {
        let text = if stderr.trim().is_empty() { stdout } else { stderr };
        let lowered = text.to_lowercase();

        // 1. Structured JSON error codes beat every substring class.
        if let Some(code) = structured_error_code(text) {
            if code == "insufficient_quota" || code == "billing_hard_limit_reached" {
                return ProviderError::new(
                    ErrorKind::CreditExhaustion,
                    format!("provider reported {code}"),
                );
            }
        }

        // 2. RESOURCE_EXHAUSTED needs disambiguation: per-minute quotas are
        // rate limits, billing quotas are hard stops.
        if text.contains("RESOURCE_EXHAUSTED") {
            if lowered.contains("billing")
                || lowered.contains("budget")
                || lowered.contains("hard limit")
            {
                return ProviderError::new(ErrorKind::CreditExhaustion, first_line(text));
            }
            if lowered.contains("per minute")
                || lowered.contains("per second")
                || lowered.contains("retry after")
            {
                return ProviderError::new(ErrorKind::RateLimit, first_line(text));
            }
            return ProviderError::new(ErrorKind::RateLimit, first_line(text));
        }

        // 3. Credit exhaustion phrasings.
        if self.credit_re.as_ref().is_some_and(|re| re.is_match(text)) {
            return ProviderError::new(ErrorKind::CreditExhaustion, first_line(text));
        }

        // 4. Rate limiting.
        if lowered.contains("rate limit")
            || lowered.contains("429")
            || lowered.contains("overloaded")
            || lowered.contains("capacity")
            || lowered.contains("busy")
        {
            return ProviderError::new(ErrorKind::RateLimit, first_line(text));
        }

        // 5. Authentication.
        if lowered.contains("unauthorized") || lowered.contains("auth") {
            return ProviderError::new(ErrorKind::AuthError, first_line(text));
        }

        // 6. Connectivity.
        if lowered.contains("connection")
            || lowered.contains("timeout")
            || lowered.contains("network")
            || lowered.contains("econnrefused")
        {
            return ProviderError::new(ErrorKind::NetworkError, first_line(text));
        }

        // 7. Model resolution.
        if self.model_re.as_ref().is_some_and(|re| re.is_match(text)) {
            return ProviderError::new(ErrorKind::ModelNotFound, first_line(text));
        }

        // 8. Context window.
        if lowered.contains("context length")
            || lowered.contains("context window")
            || lowered.contains("maximum context")
            || lowered.contains("too many tokens")
        {
            return ProviderError::new(ErrorKind::ContextExceeded, first_line(text));
        }

        // 9. Unknown, retryable.
        ProviderError::new(
            ErrorKind::Unknown,
            format!("exit {exit_code}: {}", first_line(text)),
        )
    }
}

/// Extract `error.code` from a JSON payload embedded in provider output.
fn structured_error_code(text: &str) -> Option<String> {
    // Whole-output JSON first, then the first JSON object on any line.
    let candidates = std::iter::once(text.trim())
        .chain(text.lines().map(str::trim))
        .filter(|l| l.starts_with('{'));
    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if let Some(code) = value
                .get("error")
                .and_then(|e| e.get("code"))
                .and_then(Value::as_str)
            {
                return Some(code.to_string());
            }
            if let Some(code) = value.get("code").and_then(Value::as_str) {
                return Some(code.to_string());
            }
        }
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ErrorClassifier {
        ErrorClassifier::new()
    }

    #[test]
    fn test_structured_quota_beats_429() {
        let err = classifier().classify(
            1,
            r#"{"error":{"code":"insufficient_quota","message":"HTTP 429: quota exceeded"}}"#,
            "",
        );
        assert_eq!(err.kind, ErrorKind::CreditExhaustion);
        assert!(!err.retryable);
    }

    #[test]
    fn test_billing_hard_limit_structured() {
        let err = classifier().classify(
            1,
            r#"{"error":{"code":"billing_hard_limit_reached"}}"#,
            "",
        );
        assert_eq!(err.kind, ErrorKind::CreditExhaustion);
    }

    #[test]
    fn test_resource_exhausted_rate_vs_billing() {
        let err = classifier().classify(
            1,
            "RESOURCE_EXHAUSTED: Quota exceeded for requests per minute",
            "",
        );
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert!(err.retryable);

        let err = classifier().classify(1, "RESOURCE_EXHAUSTED: billing quota exhausted", "");
        assert_eq!(err.kind, ErrorKind::CreditExhaustion);
    }

    #[test]
    fn test_credit_phrasings() {
        for text in [
            "Error: insufficient credits remaining",
            "insufficient funds for this request",
            "Payment required to continue",
            "You are out of tokens",
            "usage limit reached for this billing period",
            "plan limit exceeded",
            "subscription expired on 2026-07-01",
        ] {
            let err = classifier().classify(1, text, "");
            assert_eq!(err.kind, ErrorKind::CreditExhaustion, "text: {text}");
        }
    }

    #[test]
    fn test_rate_limit_suggests_delay() {
        let err = classifier().classify(1, "HTTP 429 Too Many Requests", "");
        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(60));

        let err = classifier().classify(1, "server overloaded, try again", "");
        assert_eq!(err.kind, ErrorKind::RateLimit);
    }

    #[test]
    fn test_auth_and_network() {
        let err = classifier().classify(1, "401 Unauthorized", "");
        assert_eq!(err.kind, ErrorKind::AuthError);
        assert!(!err.retryable);

        let err = classifier().classify(1, "connection refused (ECONNREFUSED)", "");
        assert_eq!(err.kind, ErrorKind::NetworkError);
        assert!(err.retryable);
    }

    #[test]
    fn test_model_and_context() {
        let err = classifier().classify(1, "model 'gpt-9' not found", "");
        assert_eq!(err.kind, ErrorKind::ModelNotFound);

        let err = classifier().classify(1, "prompt exceeds maximum context window", "");
        assert_eq!(err.kind, ErrorKind::ContextExceeded);
    }

    #[test]
    fn test_unknown_is_retryable() {
        let err = classifier().classify(7, "segfault", "");
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(err.retryable);
    }

    #[test]
    fn test_stdout_fallback_when_stderr_empty() {
        let err = classifier().classify(1, "  ", "rate limit exceeded");
        assert_eq!(err.kind, ErrorKind::RateLimit);
    }
}
