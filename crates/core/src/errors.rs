use std::fmt;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a model invocation: an optional upstream status code
/// and whatever message the provider returned.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{}", render_model_error(.status, .message))]
pub struct ModelError {
    pub status: Option<u16>,
    pub message: String,
}

fn render_model_error(status: &Option<u16>, message: &str) -> String {
    match status {
        Some(status) => format!("model request failed with status {status}: {message}"),
        None => format!("model request failed: {message}"),
    }
}

impl ModelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { status: None, message: message.into() }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self { status: Some(status), message: message.into() }
    }

    pub fn reason(&self) -> FailoverReason {
        classify_error(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    Auth,
    Billing,
    RateLimit,
    Timeout,
    Format,
    ContextOverflow,
    Unknown,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Billing => "billing",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Format => "format",
            Self::ContextOverflow => "context_overflow",
            Self::Unknown => "unknown",
        }
    }

    /// Transient conditions that a retry may clear.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout)
    }

    /// Failures specific to the model that served the request; another
    /// provider may succeed where this one cannot.
    pub fn is_model_specific(&self) -> bool {
        matches!(self, Self::Format | Self::ContextOverflow)
    }

    pub fn warrants_failover(&self) -> bool {
        self.is_retryable() || self.is_model_specific()
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_retryable(reason: FailoverReason) -> bool {
    reason.is_retryable()
}

struct Pattern {
    reason: FailoverReason,
    statuses: &'static [u16],
    regex: Option<Regex>,
}

fn pattern(reason: FailoverReason, statuses: &'static [u16], expression: &str) -> Pattern {
    let regex = RegexBuilder::new(expression).case_insensitive(true).build().ok();
    Pattern { reason, statuses, regex }
}

fn patterns() -> &'static [Pattern] {
    static PATTERNS: OnceLock<Vec<Pattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            pattern(
                FailoverReason::RateLimit,
                &[429],
                r"rate.?limit|too many requests|resource_exhausted|quota exceeded",
            ),
            pattern(
                FailoverReason::Timeout,
                &[],
                r"timeout|timed out|deadline exceeded|ETIMEDOUT|ECONNRESET",
            ),
            pattern(FailoverReason::Auth, &[401, 403], r"invalid api key|unauthorized|forbidden"),
            pattern(FailoverReason::Billing, &[402], r"payment required|insufficient credits"),
            pattern(FailoverReason::Format, &[], r"invalid request|tool_use\.id"),
            pattern(
                FailoverReason::ContextOverflow,
                &[],
                r"context length exceeded|maximum context|too many tokens",
            ),
        ]
    })
}

/// Maps a model failure to a failover reason. Categories are checked in
/// priority order; within a category the status code is checked before the
/// message text. Never fails: unrecognized input is `Unknown`.
pub fn classify_error(error: &ModelError) -> FailoverReason {
    classify(error.status, &error.message)
}

pub fn classify(status: Option<u16>, message: &str) -> FailoverReason {
    for pattern in patterns() {
        if status.is_some_and(|status| pattern.statuses.contains(&status)) {
            return pattern.reason;
        }
        if pattern.regex.as_ref().is_some_and(|regex| regex.is_match(message)) {
            return pattern.reason;
        }
    }

    FailoverReason::Unknown
}

#[cfg(test)]
mod tests {
    use super::{classify, classify_error, is_retryable, FailoverReason, ModelError};

    #[test]
    fn status_429_is_rate_limit_and_retryable() {
        let reason = classify_error(&ModelError::with_status(429, "slow down"));
        assert_eq!(reason, FailoverReason::RateLimit);
        assert!(is_retryable(reason));
    }

    #[test]
    fn invalid_api_key_message_is_auth_and_not_retryable() {
        let reason = classify_error(&ModelError::new("Invalid API key"));
        assert_eq!(reason, FailoverReason::Auth);
        assert!(!is_retryable(reason));
    }

    #[test]
    fn unmatched_input_is_unknown() {
        assert_eq!(classify(None, "the model produced a haiku instead"), FailoverReason::Unknown);
        assert_eq!(classify(Some(500), ""), FailoverReason::Unknown);
    }

    #[test]
    fn status_codes_map_to_their_categories() {
        assert_eq!(classify(Some(401), ""), FailoverReason::Auth);
        assert_eq!(classify(Some(403), ""), FailoverReason::Auth);
        assert_eq!(classify(Some(402), ""), FailoverReason::Billing);
    }

    #[test]
    fn message_patterns_are_case_insensitive() {
        assert_eq!(classify(None, "Rate-Limit reached"), FailoverReason::RateLimit);
        assert_eq!(classify(None, "RESOURCE_EXHAUSTED"), FailoverReason::RateLimit);
        assert_eq!(classify(None, "Request Timed Out"), FailoverReason::Timeout);
        assert_eq!(classify(None, "connect ETIMEDOUT 10.0.0.1:443"), FailoverReason::Timeout);
        assert_eq!(classify(None, "Payment Required"), FailoverReason::Billing);
        assert_eq!(classify(None, "Invalid request: bad schema"), FailoverReason::Format);
        assert_eq!(classify(None, "unexpected tool_use.id in message"), FailoverReason::Format);
        assert_eq!(
            classify(None, "This model's maximum context length is 8192 tokens"),
            FailoverReason::ContextOverflow
        );
    }

    #[test]
    fn earlier_categories_win_over_later_ones() {
        // rate_limit is checked before auth even when the status says auth
        assert_eq!(classify(Some(401), "quota exceeded"), FailoverReason::RateLimit);
        // timeout text beats a billing status because timeout is checked first
        assert_eq!(classify(Some(402), "gateway timeout"), FailoverReason::Timeout);
    }

    #[test]
    fn only_rate_limit_and_timeout_are_retryable() {
        let retryable: Vec<_> = [
            FailoverReason::Auth,
            FailoverReason::Billing,
            FailoverReason::RateLimit,
            FailoverReason::Timeout,
            FailoverReason::Format,
            FailoverReason::ContextOverflow,
            FailoverReason::Unknown,
        ]
        .into_iter()
        .filter(|reason| reason.is_retryable())
        .collect();

        assert_eq!(retryable, vec![FailoverReason::RateLimit, FailoverReason::Timeout]);
    }

    #[test]
    fn model_specific_failures_warrant_failover() {
        assert!(FailoverReason::Format.warrants_failover());
        assert!(FailoverReason::ContextOverflow.warrants_failover());
        assert!(!FailoverReason::Auth.warrants_failover());
        assert!(!FailoverReason::Billing.warrants_failover());
        assert!(!FailoverReason::Unknown.warrants_failover());
    }

    #[test]
    fn model_error_display_includes_status_when_present() {
        assert_eq!(
            ModelError::with_status(429, "slow down").to_string(),
            "model request failed with status 429: slow down"
        );
        assert_eq!(ModelError::new("boom").to_string(), "model request failed: boom");
    }
}
