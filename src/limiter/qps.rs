//! Token-bucket API rate limiting.
//!
//! Each backend gets a bucket sized to its preset burst, refilled at its
//! preset QPS. `wait` blocks until a token is available or the caller is
//! cancelled; `try_wait` never blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::backend::{Backend, UNKNOWN_BACKEND_BURST, UNKNOWN_BACKEND_QPS};

/// Aggregate counters for a rate limiter.
#[derive(Debug, Clone, Default)]
pub struct RateLimiterStats {
    /// Total `wait`/`try_wait` calls.
    pub total_calls: u64,
    /// Calls that had to block for a token.
    pub blocked_calls: u64,
    /// Moving average of the time blocked callers waited.
    pub avg_wait: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter for one backend's API traffic.
///
/// Designed to be wrapped in `Arc` and shared across every task that talks
/// to the backend, so the whole process stays inside the drive's budget.
#[derive(Debug)]
pub struct ApiRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
    total_calls: AtomicU64,
    blocked_calls: AtomicU64,
    total_wait_micros: AtomicU64,
}

impl ApiRateLimiter {
    /// Creates a limiter with the preset budget for `backend`.
    #[must_use]
    pub fn for_backend(backend: Backend) -> Self {
        Self::new(backend.api_qps(), backend.api_burst())
    }

    /// Creates a limiter with the default budget for an unknown backend.
    #[must_use]
    pub fn for_unknown_backend() -> Self {
        Self::new(UNKNOWN_BACKEND_QPS, UNKNOWN_BACKEND_BURST)
    }

    /// Creates a limiter with an explicit budget.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(0.1),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            total_calls: AtomicU64::new(0),
            blocked_calls: AtomicU64::new(0),
            total_wait_micros: AtomicU64::new(0),
        }
    }

    /// Blocks until a token is available or `cancel` fires.
    ///
    /// Returns `false` when cancelled before a token was obtained.
    #[instrument(level = "trace", skip(self, cancel))]
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let mut blocked = false;

        loop {
            let sleep_for = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    if blocked {
                        let waited = started.elapsed();
                        self.blocked_calls.fetch_add(1, Ordering::Relaxed);
                        self.total_wait_micros
                            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
                        debug!(waited_ms = waited.as_millis(), "rate limiter released");
                    }
                    return true;
                }
                // Time until one token accrues.
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.qps)
            };

            blocked = true;
            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                () = cancel.cancelled() => return false,
            }
        }
    }

    /// Takes a token if one is immediately available.
    pub async fn try_wait(&self) -> bool {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Instantaneous QPS this limiter enforces.
    #[must_use]
    pub fn qps(&self) -> f64 {
        self.qps
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let blocked = self.blocked_calls.load(Ordering::Relaxed);
        let avg_wait = if blocked == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_wait_micros.load(Ordering::Relaxed) / blocked)
        };
        RateLimiterStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            blocked_calls: blocked,
            avg_wait,
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        bucket.last_refill = now;
    }
}
