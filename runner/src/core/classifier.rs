//! Deterministic classification of runner failures.
//!
//! This module is the only place that decides whether a failure is retried
//! and how it degrades once retries are over. Typed [`RunnerError`] variants
//! are matched structurally: infrastructure failures (config, workspace,
//! capabilities, lifecycle misuse, cancellation, local I/O) are
//! `INFRASTRUCTURE`, never retried and never degraded. Only subprocess stderr
//! goes through the substring table below (first match wins):
//!
//! | match                                            | code                | retry | fallback |
//! |--------------------------------------------------|---------------------|-------|----------|
//! | `timeout`, `deadline exceeded`                   | `TIMEOUT`           | yes   | Retry    |
//! | `rate limit`, `429`                              | `RATE_LIMITED`      | yes   | Retry    |
//! | `401`, `unauthorized`, `authentication`          | `UNAUTHORIZED`      | no    | Skip     |
//! | `500` .. `504`                                   | `SERVER_ERROR`      | yes   | Retry    |
//! | `too large`, `exceeds limit`, `context length`   | `CONTENT_TOO_LARGE` | no    | Partial  |
//! | binary not found                                 | `CLAUDE_NOT_FOUND`  | no    | Skip     |
//! | anything else                                    | `UNKNOWN`           | yes   | Retry    |
//!
//! Status codes match anywhere in the text, so `HTTP429` is rate limited.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::RunnerError;

/// Stable classification codes, reported in metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Timeout,
    RateLimited,
    Unauthorized,
    ServerError,
    ContentTooLarge,
    ClaudeNotFound,
    Infrastructure,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ServerError => "SERVER_ERROR",
            ErrorCode::ContentTooLarge => "CONTENT_TOO_LARGE",
            ErrorCode::ClaudeNotFound => "CLAUDE_NOT_FOUND",
            ErrorCode::Infrastructure => "INFRASTRUCTURE",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }

    fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::RateLimited | ErrorCode::ServerError | ErrorCode::Unknown
        )
    }

    fn fallback_action(self) -> FallbackAction {
        match self {
            ErrorCode::Timeout
            | ErrorCode::RateLimited
            | ErrorCode::ServerError
            | ErrorCode::Unknown => FallbackAction::Retry,
            ErrorCode::Unauthorized | ErrorCode::ClaudeNotFound => FallbackAction::Skip,
            ErrorCode::ContentTooLarge => FallbackAction::Partial,
            ErrorCode::Infrastructure => FallbackAction::Fail,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a terminal failure is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    Retry,
    Skip,
    Cache,
    Partial,
    Fail,
}

impl FallbackAction {
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackAction::Retry => "retry",
            FallbackAction::Skip => "skip",
            FallbackAction::Cache => "cache",
            FallbackAction::Partial => "partial",
            FallbackAction::Fail => "fail",
        }
    }
}

impl fmt::Display for FallbackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure mapped to its retry/fallback policy.
///
/// Only constructed by [`classify`] and [`classify_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    code: ErrorCode,
    message: String,
    retryable: bool,
    fallback_action: FallbackAction,
}

impl ClassifiedError {
    fn new(code: ErrorCode, message: String) -> Self {
        Self {
            code,
            message,
            retryable: code.retryable(),
            fallback_action: code.fallback_action(),
        }
    }

    /// Same classification with a different action, for exercising handlers
    /// on actions no table row produces.
    #[cfg(test)]
    pub(crate) fn with_action(mut self, action: FallbackAction) -> Self {
        self.fallback_action = action;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retryable(&self) -> bool {
        self.retryable
    }

    pub fn fallback_action(&self) -> FallbackAction {
        self.fallback_action
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

static SERVER_ERROR_STATUS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"50[0-4]").unwrap());

/// Classify a runner error.
///
/// Typed variants are matched by identity. Only subprocess failures are
/// matched on text (their stderr).
pub fn classify(err: &RunnerError) -> ClassifiedError {
    let message = err.to_string();
    match err {
        RunnerError::MaxRetriesExceeded { source, .. } => {
            let inner = classify(source);
            ClassifiedError::new(inner.code, message)
        }
        RunnerError::Timeout { .. } => ClassifiedError::new(ErrorCode::Timeout, message),
        RunnerError::BinaryNotFound { .. } => {
            ClassifiedError::new(ErrorCode::ClaudeNotFound, message)
        }
        RunnerError::ResourceLimit(_) => ClassifiedError::new(ErrorCode::ContentTooLarge, message),
        RunnerError::Subprocess { stderr, .. } => {
            ClassifiedError::new(code_for_text(stderr), message)
        }
        RunnerError::NotInitialized { .. }
        | RunnerError::AlreadyStarted
        | RunnerError::Cancelled
        | RunnerError::DuplicateProcess { .. }
        | RunnerError::ProcessNotFound { .. }
        | RunnerError::NotStarted
        | RunnerError::ShuttingDown
        | RunnerError::Capability(_)
        | RunnerError::InvalidOutput(_)
        | RunnerError::Config(_)
        | RunnerError::Workspace(_)
        | RunnerError::Cache(_)
        | RunnerError::Io(_)
        | RunnerError::TaskPanicked(_) => ClassifiedError::new(ErrorCode::Infrastructure, message),
    }
}

/// Classify opaque error text (first match wins).
pub fn classify_message(message: &str) -> ClassifiedError {
    ClassifiedError::new(code_for_text(message), message.to_string())
}

fn code_for_text(text: &str) -> ErrorCode {
    let lower = text.to_lowercase();
    if lower.contains("timeout") || lower.contains("deadline exceeded") {
        ErrorCode::Timeout
    } else if lower.contains("rate limit") || lower.contains("429") {
        ErrorCode::RateLimited
    } else if lower.contains("401")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
    {
        ErrorCode::Unauthorized
    } else if SERVER_ERROR_STATUS.is_match(&lower) {
        ErrorCode::ServerError
    } else if lower.contains("too large")
        || lower.contains("exceeds limit")
        || lower.contains("context length")
    {
        ErrorCode::ContentTooLarge
    } else if lower.contains("binary not found") {
        ErrorCode::ClaudeNotFound
    } else {
        ErrorCode::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assert_policy(text: &str, code: ErrorCode, retryable: bool, action: FallbackAction) {
        let classified = classify_message(text);
        assert_eq!(classified.code(), code, "{text}");
        assert_eq!(classified.retryable(), retryable, "{text}");
        assert_eq!(classified.fallback_action(), action, "{text}");
    }

    #[test]
    fn table_rows_map_to_policy() {
        assert_policy("request timeout", ErrorCode::Timeout, true, FallbackAction::Retry);
        assert_policy(
            "context deadline exceeded",
            ErrorCode::Timeout,
            true,
            FallbackAction::Retry,
        );
        assert_policy(
            "Rate limit exceeded",
            ErrorCode::RateLimited,
            true,
            FallbackAction::Retry,
        );
        assert_policy("HTTP 429", ErrorCode::RateLimited, true, FallbackAction::Retry);
        assert_policy("HTTP 401", ErrorCode::Unauthorized, false, FallbackAction::Skip);
        assert_policy(
            "Authentication failed",
            ErrorCode::Unauthorized,
            false,
            FallbackAction::Skip,
        );
        assert_policy("upstream 502", ErrorCode::ServerError, true, FallbackAction::Retry);
        assert_policy(
            "prompt is too large",
            ErrorCode::ContentTooLarge,
            false,
            FallbackAction::Partial,
        );
        assert_policy(
            "input exceeds context length",
            ErrorCode::ContentTooLarge,
            false,
            FallbackAction::Partial,
        );
        assert_policy(
            "claude binary not found",
            ErrorCode::ClaudeNotFound,
            false,
            FallbackAction::Skip,
        );
        assert_policy("segfault", ErrorCode::Unknown, true, FallbackAction::Retry);
    }

    #[test]
    fn any_message_with_timeout_is_retried() {
        for text in ["timeout", "TIMEOUT: 401 unauthorized", "read timeout after 429"] {
            assert_policy(text, ErrorCode::Timeout, true, FallbackAction::Retry);
        }
    }

    #[test]
    fn any_message_with_401_is_skipped() {
        for text in ["401", "status=401 body=nope", "got 401 from upstream 503"] {
            assert_policy(text, ErrorCode::Unauthorized, false, FallbackAction::Skip);
        }
    }

    #[test]
    fn status_codes_match_as_substrings() {
        assert_policy("HTTP429", ErrorCode::RateLimited, true, FallbackAction::Retry);
        assert_policy("status:401;", ErrorCode::Unauthorized, false, FallbackAction::Skip);
        assert_policy("code=5031", ErrorCode::ServerError, true, FallbackAction::Retry);
        assert_policy("505 version", ErrorCode::Unknown, true, FallbackAction::Retry);
    }

    #[test]
    fn infrastructure_errors_ignore_their_text() {
        let errors = [
            RunnerError::Capability(
                "unknown capability authentication-audit".to_string(),
            ),
            RunnerError::Workspace("workspace /ci/pr-401/src: timeout".to_string()),
            RunnerError::Config("payload too large for 429 slots".to_string()),
            RunnerError::InvalidOutput("parse json: \"unauthorized\"".to_string()),
            RunnerError::DuplicateProcess {
                id: "review-401-run-1-attempt-1".to_string(),
            },
            RunnerError::ShuttingDown,
            RunnerError::Cancelled,
            RunnerError::Io(std::io::Error::other("deadline exceeded")),
        ];
        for err in &errors {
            let classified = classify(err);
            assert_eq!(classified.code(), ErrorCode::Infrastructure, "{err}");
            assert!(!classified.retryable(), "{err}");
            assert_eq!(classified.fallback_action(), FallbackAction::Fail, "{err}");
        }
    }

    #[test]
    fn typed_errors_match_by_identity() {
        let timeout = classify(&RunnerError::Timeout {
            after: Some(Duration::from_secs(3)),
        });
        assert_eq!(timeout.code(), ErrorCode::Timeout);

        let missing = classify(&RunnerError::BinaryNotFound {
            binary: "claude".to_string(),
        });
        assert_eq!(missing.code(), ErrorCode::ClaudeNotFound);
        assert!(!missing.retryable());
        assert_eq!(missing.fallback_action(), FallbackAction::Skip);
    }

    #[test]
    fn subprocess_errors_match_on_stderr_only() {
        let err = RunnerError::Subprocess {
            exit_code: Some(1),
            stderr: "Error: rate limit exceeded (429)".to_string(),
            stdout: "this review mentions a timeout".to_string(),
        };
        let classified = classify(&err);
        assert_eq!(classified.code(), ErrorCode::RateLimited);
        assert!(classified.message().contains("rate limit exceeded"));
    }

    #[test]
    fn exhaustion_keeps_inner_code() {
        let err = RunnerError::MaxRetriesExceeded {
            attempts: 4,
            source: Box::new(RunnerError::Subprocess {
                exit_code: Some(1),
                stderr: "upstream returned 503".to_string(),
                stdout: String::new(),
            }),
        };
        let classified = classify(&err);
        assert_eq!(classified.code(), ErrorCode::ServerError);
        assert_eq!(classified.fallback_action(), FallbackAction::Retry);
        assert!(classified.message().starts_with("max retries exceeded"));
    }
}
