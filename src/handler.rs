//! Unified error handling: retry decisions, user-facing messages, statistics.
//!
//! Wraps the classifier in [`crate::retry`] with per-invocation bookkeeping
//! and produces actionable multi-line messages for the categories users can
//! do something about. Statistics live under their own read-write lock so
//! stats reads never block the operational path.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::retry::{ErrorCategory, RetryPolicy, classify};

/// User-facing descriptor for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureAdvice {
    /// What happened.
    pub what: &'static str,
    /// Why it likely happened.
    pub why: &'static str,
    /// What the user can do about it.
    pub fix: &'static str,
}

/// Aggregated handler statistics.
#[derive(Debug, Clone, Default)]
pub struct HandlerStats {
    /// Total errors handled.
    pub total: u64,
    /// Errors by category label.
    pub by_category: HashMap<&'static str, u64>,
    /// Retry attempts recommended.
    pub retry_attempts: u64,
    /// Retries later reported as successful.
    pub retry_successes: u64,
}

/// Wraps the classifier with statistics, user-facing messages, and
/// per-invocation retry decisions.
#[derive(Debug)]
pub struct ErrorHandler {
    policy: RetryPolicy,
    stats: RwLock<HandlerStats>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl ErrorHandler {
    /// Creates a handler over the given policy.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            stats: RwLock::new(HandlerStats::default()),
        }
    }

    /// Classifies `err` and decides whether `operation` should run again.
    ///
    /// `attempt` is 1-indexed (the attempt that just failed); `max` is an
    /// optional caller override of the per-category cap. Returns the
    /// decision and the delay to apply before the next attempt.
    pub fn handle(
        &self,
        status: Option<u16>,
        message: &str,
        operation: &str,
        attempt: u32,
        max: Option<u32>,
        retry_after: Option<Duration>,
    ) -> (bool, Duration) {
        let category = classify(status, message);
        let cap = max.unwrap_or_else(|| self.policy.max_attempts(category));
        let should_retry = category.is_retryable() && attempt < cap;
        let delay = self.policy.delay(category, attempt, retry_after);

        debug!(
            operation,
            category = %category,
            attempt,
            cap,
            should_retry,
            delay_ms = delay.as_millis(),
            "handled error"
        );

        {
            let mut stats = self.stats.write();
            stats.total += 1;
            *stats.by_category.entry(category.label()).or_insert(0) += 1;
            if should_retry {
                stats.retry_attempts += 1;
            }
        }

        (should_retry, delay)
    }

    /// Records that a previously recommended retry went on to succeed.
    pub fn record_retry_success(&self) {
        self.stats.write().retry_successes += 1;
    }

    /// Wraps a raw error message in a localized, actionable multi-line
    /// message for its category.
    ///
    /// Specific sub-cases (bad filename, exhausted quota, corrupt parent
    /// id) are recognized by substring first and get targeted messages.
    #[must_use]
    pub fn user_message(&self, status: Option<u16>, message: &str) -> String {
        if let Some(specific) = specific_advice(message) {
            return format_advice(specific, message);
        }
        let category = classify(status, message);
        format_advice(category_advice(category), message)
    }

    /// Snapshot of the handler statistics.
    #[must_use]
    pub fn stats(&self) -> HandlerStats {
        self.stats.read().clone()
    }

    /// Clears all statistics.
    pub fn reset(&self) {
        *self.stats.write() = HandlerStats::default();
    }
}

fn format_advice(advice: FailureAdvice, message: &str) -> String {
    format!(
        "{what}\n  cause: {message}\n  {why}\n  Suggestion: {fix}",
        what = advice.what,
        why = advice.why,
        fix = advice.fix,
    )
}

/// Substring pre-processor for common sub-cases that deserve a more
/// targeted message than their category would produce.
fn specific_advice(message: &str) -> Option<FailureAdvice> {
    let lower = message.to_lowercase();
    if lower.contains("invalid file name")
        || lower.contains("filename invalid")
        || lower.contains("文件名不合法")
    {
        return Some(FailureAdvice {
            what: "The drive rejected the file name",
            why: "Names with reserved characters or over-long components are refused server-side.",
            fix: "Rename the file to plain characters and retry.",
        });
    }
    if lower.contains("quota")
        || lower.contains("insufficient space")
        || lower.contains("空间不足")
    {
        return Some(FailureAdvice {
            what: "The drive is out of space",
            why: "The account quota is exhausted; uploads will keep failing until space is freed.",
            fix: "Free space or upgrade the account quota, then retry.",
        });
    }
    if lower.contains("parent") && (lower.contains("invalid") || lower.contains("corrupt")) {
        return Some(FailureAdvice {
            what: "A cached parent directory id is stale",
            why: "The directory was moved or deleted remotely after its id was cached.",
            fix: "The path will be re-resolved automatically; rerun the operation.",
        });
    }
    None
}

fn category_advice(category: ErrorCategory) -> FailureAdvice {
    match category {
        ErrorCategory::Auth => FailureAdvice {
            what: "Authentication failed",
            why: "The stored token was rejected or has expired.",
            fix: "Refresh the token/cookie for this drive and retry.",
        },
        ErrorCategory::Permission => FailureAdvice {
            what: "Permission denied",
            why: "The account is not allowed to perform this operation on the target.",
            fix: "Check the sharing/ACL settings for the target path.",
        },
        ErrorCategory::RateLimit => FailureAdvice {
            what: "The drive is rate limiting requests",
            why: "Too many API calls were made in a short window.",
            fix: "Lower the transfer concurrency or wait before retrying.",
        },
        ErrorCategory::ServerOverload => FailureAdvice {
            what: "The drive is overloaded",
            why: "The server returned a transient 5xx failure.",
            fix: "Wait a little while; the operation will be retried automatically.",
        },
        ErrorCategory::UrlExpired => FailureAdvice {
            what: "The signed download URL expired",
            why: "Download URLs are time-limited and this one aged out mid-transfer.",
            fix: "A fresh URL is fetched automatically; no action needed.",
        },
        ErrorCategory::NetworkTimeout => FailureAdvice {
            what: "The network connection gave out",
            why: "The connection was reset or the server stopped responding in time.",
            fix: "Check connectivity and retry; completed chunks are kept.",
        },
        ErrorCategory::NotFound => FailureAdvice {
            what: "The remote object was not found",
            why: "It was deleted or moved remotely, or a cached path is stale.",
            fix: "Re-list the parent directory and retry with the current path.",
        },
        ErrorCategory::Fatal | ErrorCategory::Unknown => FailureAdvice {
            what: "The operation failed",
            why: "The error did not match a known recoverable condition.",
            fix: "Inspect the logs; rerun to resume from persisted state.",
        },
    }
}
