//! Error classification and retry policy for wire errors.
//!
//! Every failure observed by the downloader or uploader is classified into
//! exactly one [`ErrorCategory`]; the [`RetryPolicy`] then decides whether
//! another attempt is worth making and how long to wait first.
//!
//! # Overview
//!
//! Classification prefers the HTTP status when one is available and falls
//! back to substring matching against a fixed vocabulary of wire-error
//! phrases. Both drives return a mix of English and localized messages, so
//! the vocabulary carries both.
//!
//! # Example
//!
//! ```
//! use drivebridge::retry::{ErrorCategory, RetryPolicy, classify};
//!
//! let policy = RetryPolicy::default();
//! let category = classify(Some(503), "service unavailable");
//! assert_eq!(category, ErrorCategory::ServerOverload);
//! assert!(policy.should_retry(category, 1));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Default base delay for exponential backoff.
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Cap on the exponential backoff for overload errors (15 seconds).
const OVERLOAD_DELAY_CAP: Duration = Duration::from_secs(15);

/// Fixed delay after a rate-limit response when the server suggests nothing.
const RATE_LIMIT_DELAY: Duration = Duration::from_secs(30);

/// Fixed delay after a network timeout.
const TIMEOUT_DELAY: Duration = Duration::from_secs(2);

/// Maximum jitter added by [`RetryPolicy::backoff_with_jitter`].
const MAX_JITTER: Duration = Duration::from_millis(500);

/// What kind of failure a wire or local error represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 5xx or an explicit overload message. Retry with backoff.
    ServerOverload,
    /// A signed download URL was rejected or marked invalid. Retry with a
    /// fresh URL, no delay.
    UrlExpired,
    /// Connection reset/refused, deadline exceeded, broken pipe.
    NetworkTimeout,
    /// HTTP 429. Retry after the server-suggested delay or 30 seconds.
    RateLimit,
    /// HTTP 401 or token trouble. Never retried.
    Auth,
    /// HTTP 403. Never retried.
    Permission,
    /// HTTP 404. Never retried.
    NotFound,
    /// Explicit non-retryable sentinel.
    Fatal,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// All categories, in a stable order (used by the stats surfaces).
    pub const ALL: [ErrorCategory; 9] = [
        Self::ServerOverload,
        Self::UrlExpired,
        Self::NetworkTimeout,
        Self::RateLimit,
        Self::Auth,
        Self::Permission,
        Self::NotFound,
        Self::Fatal,
        Self::Unknown,
    ];

    /// Short machine-readable label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ServerOverload => "server_overload",
            Self::UrlExpired => "url_expired",
            Self::NetworkTimeout => "network_timeout",
            Self::RateLimit => "rate_limit",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::NotFound => "not_found",
            Self::Fatal => "fatal",
            Self::Unknown => "unknown",
        }
    }

    /// Whether the category is ever retried.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            Self::Auth | Self::Permission | Self::NotFound | Self::Fatal
        )
    }

    fn index(self) -> usize {
        Self::ALL
            .iter()
            .position(|c| *c == self)
            .unwrap_or(Self::ALL.len() - 1)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Process-wide classification counters, incremented once per
/// [`classify`] call.
static CLASSIFY_COUNTS: [AtomicU64; 9] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Snapshot of the process-wide classification counters.
#[must_use]
pub fn classification_counts() -> Vec<(ErrorCategory, u64)> {
    ErrorCategory::ALL
        .iter()
        .map(|c| (*c, CLASSIFY_COUNTS[c.index()].load(Ordering::Relaxed)))
        .collect()
}

/// Phrases that mark a signed URL as dead. The drives return these with
/// assorted statuses, so the message check runs even when a status exists.
const URL_EXPIRED_PHRASES: &[&str] = &[
    "invalid signature",
    "signature expired",
    "url expired",
    "link expired",
    "expired url",
    "access denied by url",
    "签名无效",
    "签名过期",
    "链接已过期",
    "地址已失效",
];

const OVERLOAD_PHRASES: &[&str] = &[
    "server overload",
    "server is busy",
    "service unavailable",
    "internal server error",
    "bad gateway",
    "gateway timeout",
    "服务器繁忙",
    "系统繁忙",
    "服务不可用",
];

const TIMEOUT_PHRASES: &[&str] = &[
    "connection reset",
    "connection refused",
    "broken pipe",
    "deadline exceeded",
    "timed out",
    "timeout",
    "no route to host",
    "连接超时",
    "网络超时",
];

const RATE_LIMIT_PHRASES: &[&str] = &[
    "too many requests",
    "rate limit",
    "qps limit",
    "request was throttled",
    "频率过高",
    "操作过于频繁",
    "请求太频繁",
];

const AUTH_PHRASES: &[&str] = &[
    "unauthorized",
    "token expired",
    "invalid token",
    "not logged in",
    "login required",
    "请先登录",
    "登录已过期",
];

const PERMISSION_PHRASES: &[&str] = &["forbidden", "permission denied", "没有权限", "无权访问"];

const NOT_FOUND_PHRASES: &[&str] = &["not found", "no such file", "文件不存在", "目录不存在"];

fn contains_any(haystack: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| haystack.contains(p))
}

/// Classifies an error into exactly one category.
///
/// `status` wins when present; otherwise the lowercased `message` is matched
/// against the phrase vocabulary. URL-expiry phrases are checked before the
/// status because both drives report dead signed URLs under 403.
#[must_use]
pub fn classify(status: Option<u16>, message: &str) -> ErrorCategory {
    let category = classify_inner(status, message);
    CLASSIFY_COUNTS[category.index()].fetch_add(1, Ordering::Relaxed);
    category
}

fn classify_inner(status: Option<u16>, message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();

    if contains_any(&lower, URL_EXPIRED_PHRASES) {
        return ErrorCategory::UrlExpired;
    }

    if let Some(status) = status {
        return match status {
            401 => ErrorCategory::Auth,
            403 => ErrorCategory::Permission,
            404 => ErrorCategory::NotFound,
            429 => ErrorCategory::RateLimit,
            s if (500..600).contains(&s) => ErrorCategory::ServerOverload,
            _ => classify_message(&lower),
        };
    }

    classify_message(&lower)
}

fn classify_message(lower: &str) -> ErrorCategory {
    if contains_any(lower, RATE_LIMIT_PHRASES) {
        ErrorCategory::RateLimit
    } else if contains_any(lower, OVERLOAD_PHRASES) {
        ErrorCategory::ServerOverload
    } else if contains_any(lower, TIMEOUT_PHRASES) {
        ErrorCategory::NetworkTimeout
    } else if contains_any(lower, AUTH_PHRASES) {
        ErrorCategory::Auth
    } else if contains_any(lower, PERMISSION_PHRASES) {
        ErrorCategory::Permission
    } else if contains_any(lower, NOT_FOUND_PHRASES) {
        ErrorCategory::NotFound
    } else {
        ErrorCategory::Unknown
    }
}

/// Per-category retry budget and delay policy.
///
/// # Default attempt caps
///
/// | Category | Max attempts |
/// |----------|--------------|
/// | ServerOverload | 3 |
/// | UrlExpired | 4 |
/// | NetworkTimeout | 2 |
/// | RateLimit | 3 |
/// | Unknown | 2 |
/// | Auth / Permission / NotFound / Fatal | 0 |
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: [u32; 9],
    base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut max_attempts = [0u32; 9];
        max_attempts[ErrorCategory::ServerOverload.index()] = 3;
        max_attempts[ErrorCategory::UrlExpired.index()] = 4;
        max_attempts[ErrorCategory::NetworkTimeout.index()] = 2;
        max_attempts[ErrorCategory::RateLimit.index()] = 3;
        max_attempts[ErrorCategory::Unknown.index()] = 2;
        Self {
            max_attempts,
            base_delay: BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Overrides the attempt cap for one category.
    #[must_use]
    pub fn with_max_attempts(mut self, category: ErrorCategory, attempts: u32) -> Self {
        self.max_attempts[category.index()] = attempts;
        self
    }

    /// Maximum attempts for a category.
    #[must_use]
    pub fn max_attempts(&self, category: ErrorCategory) -> u32 {
        self.max_attempts[category.index()]
    }

    /// Whether attempt number `attempt` (1-indexed, the attempt that just
    /// failed) should be followed by another.
    #[must_use]
    pub fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        attempt < self.max_attempts(category)
    }

    /// Delay before the next attempt. Independent of the retry decision.
    ///
    /// `retry_after` is the server-suggested delay from a rate-limit
    /// response; when present it overrides the 30-second default.
    #[must_use]
    pub fn delay(
        &self,
        category: ErrorCategory,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> Duration {
        match category {
            ErrorCategory::UrlExpired => Duration::ZERO,
            ErrorCategory::RateLimit => retry_after.unwrap_or(RATE_LIMIT_DELAY),
            ErrorCategory::NetworkTimeout => TIMEOUT_DELAY,
            _ => self.overload_backoff(attempt),
        }
    }

    /// `base_delay * 2^attempt`, capped at 15 seconds.
    fn overload_backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(10);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(OVERLOAD_DELAY_CAP)
    }

    /// Jittered exponential backoff used by internal retry loops (hash
    /// upload, source re-opens). Jitter spreads simultaneous retries so
    /// failed workers do not stampede the API.
    #[must_use]
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.overload_backoff(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }
}

/// Parses a `Retry-After` header value into a duration.
///
/// Accepts both delta-seconds (`"120"`) and HTTP-date forms. Values beyond
/// one hour are clamped.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

    let trimmed = value.trim();
    let delay = if let Ok(secs) = trimmed.parse::<u64>() {
        Duration::from_secs(secs)
    } else {
        let when = httpdate::parse_http_date(trimmed).ok()?;
        when.duration_since(std::time::SystemTime::now()).ok()?
    };

    if delay > MAX_RETRY_AFTER {
        debug!(
            requested_secs = delay.as_secs(),
            clamped_secs = MAX_RETRY_AFTER.as_secs(),
            "clamping excessive Retry-After"
        );
        return Some(MAX_RETRY_AFTER);
    }
    Some(delay)
}
