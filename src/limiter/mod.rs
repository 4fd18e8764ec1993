//! Rate, concurrency, and refresh limiting.
//!
//! Three cooperating throttles keep the drives' APIs happy:
//!
//! - [`ApiRateLimiter`] - token-bucket QPS limiting per backend
//! - [`TransferConcurrencyLimiter`] - ceiling on in-flight transfers
//! - [`RefreshLimiter`] - decides whether a directory listing is worth
//!   refreshing right now

mod concurrency;
mod qps;
mod refresh;

pub use concurrency::{ConcurrencyError, TransferConcurrencyLimiter, TransferPermit};
pub use qps::{ApiRateLimiter, RateLimiterStats};
pub use refresh::{RefreshDecision, RefreshLimiter};
