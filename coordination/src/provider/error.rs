//! Provider failure taxonomy with retry classification.
//!
//! Every way a remote text-generation call can fail is represented here.
//! Callers query `is_retryable()` / `retry_category()` instead of matching
//! on message strings.
//!
//! | Category   | Retryable | Examples                          |
//! |------------|-----------|-----------------------------------|
//! | Timeout    | yes       | request deadline, HTTP 408        |
//! | RateLimit  | yes       | HTTP 429, "too many requests"     |
//! | Server     | yes       | HTTP 5xx                          |
//! | Network    | yes       | connect/reset/DNS failures        |
//! | Auth       | no        | HTTP 401/403, missing credential  |
//! | Malformed  | no        | unparseable or empty response     |
//! | Rejected   | no        | other HTTP 4xx                    |

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Substrings that mark a free-text failure as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "429",
    "connection",
    "network",
    "temporary",
    "unavailable",
    "500",
    "502",
    "503",
    "504",
];

/// Coarse classification that drives retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Timeout,
    RateLimit,
    Server,
    Network,
    Auth,
    Malformed,
    Rejected,
}

impl RetryCategory {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimit | Self::Server | Self::Network
        )
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Server => write!(f, "server"),
            Self::Network => write!(f, "network"),
            Self::Auth => write!(f, "auth"),
            Self::Malformed => write!(f, "malformed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A single failed provider call.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    // ── Retryable ─────────────────────────────────────────────────────────
    #[error("{provider}: request timed out after {}ms", .after.as_millis())]
    Timeout { provider: String, after: Duration },

    #[error("{provider}: rate limited{}", .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default())]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("{provider}: server error ({status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("{provider}: network error: {message}")]
    Network { provider: String, message: String },

    // ── Terminal ──────────────────────────────────────────────────────────
    #[error("{provider}: authentication rejected ({status})")]
    Auth { provider: String, status: u16 },

    #[error("{provider}: malformed response: {message}")]
    Malformed { provider: String, message: String },

    #[error("{provider}: request rejected ({status}): {message}")]
    Rejected {
        provider: String,
        status: u16,
        message: String,
    },
}

impl ProviderError {
    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            after,
        }
    }

    pub fn malformed(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn network(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Map a non-success HTTP status and body onto the taxonomy.
    pub fn from_status(
        provider: impl Into<String>,
        status: u16,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let provider = provider.into();
        let message = truncate(body, 300);
        match status {
            401 | 403 => Self::Auth { provider, status },
            408 => Self::Timeout {
                provider,
                after: Duration::ZERO,
            },
            429 => Self::RateLimited {
                provider,
                retry_after,
            },
            500..=599 => Self::Server {
                provider,
                status,
                message,
            },
            _ => Self::Rejected {
                provider,
                status,
                message,
            },
        }
    }

    /// Classify a free-text failure by well-known transient patterns.
    ///
    /// Anything that does not look transient is treated as terminal.
    pub fn from_message(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        let lower = message.to_lowercase();

        if !RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
            return Self::Rejected {
                provider,
                status: 0,
                message,
            };
        }

        if ["rate limit", "rate_limit", "ratelimit", "429", "too many"]
            .iter()
            .any(|p| lower.contains(p))
        {
            Self::RateLimited {
                provider,
                retry_after: None,
            }
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout {
                provider,
                after: Duration::ZERO,
            }
        } else if let Some(status) = [500u16, 502, 503, 504]
            .into_iter()
            .find(|s| lower.contains(&s.to_string()))
        {
            Self::Server {
                provider,
                status,
                message,
            }
        } else {
            Self::Network { provider, message }
        }
    }

    /// Map a transport-level reqwest failure.
    pub fn from_reqwest(provider: impl Into<String>, err: &reqwest::Error, after: Duration) -> Self {
        let provider = provider.into();
        if err.is_timeout() {
            Self::Timeout { provider, after }
        } else if err.is_decode() {
            Self::Malformed {
                provider,
                message: err.to_string(),
            }
        } else {
            Self::Network {
                provider,
                message: err.to_string(),
            }
        }
    }

    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::Timeout { .. } => RetryCategory::Timeout,
            Self::RateLimited { .. } => RetryCategory::RateLimit,
            Self::Server { .. } => RetryCategory::Server,
            Self::Network { .. } => RetryCategory::Network,
            Self::Auth { .. } => RetryCategory::Auth,
            Self::Malformed { .. } => RetryCategory::Malformed,
            Self::Rejected { .. } => RetryCategory::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_category().is_retryable()
    }

    /// Identity of the provider that failed.
    pub fn provider(&self) -> &str {
        match self {
            Self::Timeout { provider, .. }
            | Self::RateLimited { provider, .. }
            | Self::Server { provider, .. }
            | Self::Network { provider, .. }
            | Self::Auth { provider, .. }
            | Self::Malformed { provider, .. }
            | Self::Rejected { provider, .. } => provider,
        }
    }

    /// Server-requested minimum wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status("a", 429, "", None).is_retryable());
        assert!(ProviderError::from_status("a", 503, "down", None).is_retryable());
        assert!(ProviderError::from_status("a", 408, "", None).is_retryable());
        assert!(!ProviderError::from_status("a", 401, "", None).is_retryable());
        assert!(!ProviderError::from_status("a", 403, "", None).is_retryable());
        assert!(!ProviderError::from_status("a", 400, "bad", None).is_retryable());
    }

    #[test]
    fn test_message_classification() {
        let err = ProviderError::from_message("a", "Rate limit exceeded");
        assert_eq!(err.retry_category(), RetryCategory::RateLimit);

        let err = ProviderError::from_message("a", "request timed out");
        assert_eq!(err.retry_category(), RetryCategory::Timeout);

        let err = ProviderError::from_message("a", "upstream returned 502");
        assert_eq!(err.retry_category(), RetryCategory::Server);

        let err = ProviderError::from_message("a", "connection reset by peer");
        assert_eq!(err.retry_category(), RetryCategory::Network);

        let err = ProviderError::from_message("a", "invalid api key");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_words_containing_rate_are_not_rate_limits() {
        let err = ProviderError::from_message("a", "generate failed: upstream 503");
        assert_eq!(err.retry_category(), RetryCategory::Server);

        let err = ProviderError::from_message("a", "could not generate, connection dropped");
        assert_eq!(err.retry_category(), RetryCategory::Network);

        let err = ProviderError::from_message("a", "ratelimit hit");
        assert_eq!(err.retry_category(), RetryCategory::RateLimit);
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let err = ProviderError::from_status("a", 429, "", Some(Duration::from_secs(7)));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(err.provider(), "a");
        assert!(ProviderError::from_status("a", 500, "", None)
            .retry_after()
            .is_none());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match ProviderError::from_status("a", 500, &body, None) {
            ProviderError::Server { message, .. } => assert!(message.len() < 400),
            other => panic!("unexpected {other:?}"),
        }
    }
}
