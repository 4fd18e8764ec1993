//! Refresh decision engine for directory listings.
//!
//! Answers "should this directory be listed again right now?" from three
//! signals: how recently it was refreshed, how busy the API currently is,
//! and how often the directory has historically changed. Directories that
//! never change stop being refreshed almost entirely; hot directories are
//! revisited sooner.

use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::Config;

/// Rolling per-directory access history cap.
const MAX_ACCESS_HISTORY: usize = 100;

/// Rolling per-directory change-event cap.
const MAX_CHANGE_HISTORY: usize = 10;

/// Window over which current QPS is measured.
const QPS_WINDOW: Duration = Duration::from_secs(10);

/// A directory is considered static when it is quiet for this long and its
/// change rate is below the configured threshold.
const STATIC_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// A change within this window shortens the refresh interval.
const RECENT_CHANGE_WINDOW: Duration = Duration::from_secs(60 * 60);

fn skip_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(^|/)(temp|tmp|cache|logs?)($|/)").unwrap_or_else(|_| unreachable!())
    })
}

fn busy_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(^|/)(downloads?|working?|incoming)($|/)").unwrap_or_else(|_| unreachable!())
    })
}

/// Outcome of a refresh query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshDecision {
    /// Refresh the directory now.
    Refresh,
    /// Skip: refreshed too recently for its dynamic interval.
    TooSoon,
    /// Skip: the API is currently over the QPS threshold.
    ApiBusy,
    /// Skip: the directory has been static for over a day.
    Static,
    /// Skip: scratch directories are never proactively refreshed.
    ScratchDirectory,
}

impl RefreshDecision {
    /// Whether the caller should go ahead and list the directory.
    #[must_use]
    pub fn should_refresh(&self) -> bool {
        matches!(self, Self::Refresh)
    }
}

#[derive(Debug, Default)]
struct DirHistory {
    first_seen: Option<Instant>,
    accesses: VecDeque<Instant>,
    changes: VecDeque<Instant>,
    refreshes: u64,
    changed_refreshes: u64,
    last_refresh: Option<Instant>,
}

impl DirHistory {
    fn change_rate(&self) -> f64 {
        if self.refreshes == 0 {
            // No history yet; assume the directory changes so it gets
            // refreshed until evidence accumulates.
            return 1.0;
        }
        self.changed_refreshes as f64 / self.refreshes as f64
    }

    fn last_change(&self) -> Option<Instant> {
        self.changes.back().copied()
    }
}

/// Decides whether directory listings should be refreshed from the remote.
#[derive(Debug)]
pub struct RefreshLimiter {
    min_interval: Duration,
    max_interval: Duration,
    qps_threshold: f64,
    change_rate_threshold: f64,
    dirs: DashMap<String, DirHistory>,
    recent_calls: Mutex<VecDeque<Instant>>,
}

impl RefreshLimiter {
    /// Creates a limiter from the configured knobs.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            min_interval: config.refresh_min_interval,
            max_interval: config.refresh_max_interval,
            qps_threshold: config.refresh_qps_threshold,
            change_rate_threshold: config.refresh_change_rate_threshold,
            dirs: DashMap::new(),
            recent_calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Records an API call for QPS tracking. The projection cache calls
    /// this for every remote operation, not just listings.
    pub fn record_api_call(&self) {
        let now = Instant::now();
        let mut calls = self.recent_calls.lock();
        calls.push_back(now);
        while let Some(front) = calls.front() {
            if now.duration_since(*front) > QPS_WINDOW {
                calls.pop_front();
            } else {
                break;
            }
        }
    }

    /// API calls per second over the trailing window.
    #[must_use]
    pub fn current_qps(&self) -> f64 {
        let now = Instant::now();
        let calls = self.recent_calls.lock();
        let in_window = calls
            .iter()
            .filter(|t| now.duration_since(**t) <= QPS_WINDOW)
            .count();
        in_window as f64 / QPS_WINDOW.as_secs_f64()
    }

    /// Decides whether `dir` should be re-listed right now.
    ///
    /// Records the access in the directory's rolling history either way.
    pub fn check(&self, dir: &str) -> RefreshDecision {
        let now = Instant::now();
        let mut history = self.dirs.entry(dir.to_string()).or_default();
        history.first_seen.get_or_insert(now);
        history.accesses.push_back(now);
        while history.accesses.len() > MAX_ACCESS_HISTORY {
            history.accesses.pop_front();
        }

        if skip_name_pattern().is_match(dir) {
            trace!(dir, "scratch directory, refresh skipped");
            return RefreshDecision::ScratchDirectory;
        }

        let qps = self.current_qps();
        if qps > self.qps_threshold {
            debug!(dir, qps, threshold = self.qps_threshold, "refresh blocked, API busy");
            return RefreshDecision::ApiBusy;
        }

        // A directory with no change on record is only "quiet" since we
        // first saw it, not since forever.
        let change_rate = history.change_rate();
        let quiet_since = history.last_change().or(history.first_seen);
        let quiet_for = quiet_since
            .map(|t| now.duration_since(t))
            .unwrap_or(Duration::ZERO);
        if history.refreshes > 0
            && change_rate < self.change_rate_threshold
            && quiet_for > STATIC_AFTER
        {
            debug!(dir, change_rate, "directory considered static");
            return RefreshDecision::Static;
        }

        let interval = self.dynamic_interval(dir, &history, qps);
        if let Some(last) = history.last_refresh {
            let since = now.duration_since(last);
            if since < interval {
                trace!(
                    dir,
                    since_ms = since.as_millis(),
                    interval_ms = interval.as_millis(),
                    "refresh blocked, too soon"
                );
                return RefreshDecision::TooSoon;
            }
        }

        RefreshDecision::Refresh
    }

    /// Records the outcome of an actual refresh: whether the listing showed
    /// any change against the cached state.
    pub fn record_refresh(&self, dir: &str, changed: bool) {
        let now = Instant::now();
        let mut history = self.dirs.entry(dir.to_string()).or_default();
        history.refreshes += 1;
        history.last_refresh = Some(now);
        if changed {
            history.changed_refreshes += 1;
            history.changes.push_back(now);
            while history.changes.len() > MAX_CHANGE_HISTORY {
                history.changes.pop_front();
            }
        }
    }

    /// Drops all per-directory history.
    pub fn reset(&self) {
        self.dirs.clear();
        self.recent_calls.lock().clear();
    }

    /// Interval this directory currently has to sit out between refreshes.
    fn dynamic_interval(&self, dir: &str, history: &DirHistory, qps: f64) -> Duration {
        let mut interval = self.min_interval;

        // Busy API stretches everything.
        if qps > self.qps_threshold / 2.0 {
            interval = interval.saturating_mul(2);
        }

        // Rarely-changing directories wait longer.
        if history.refreshes > 0 && history.change_rate() < self.change_rate_threshold {
            interval = interval.saturating_mul(2);
        }

        // Root and deep paths churn less in practice.
        let depth = dir.matches('/').count();
        if dir.is_empty() || dir == "/" || depth > 2 {
            interval = interval.saturating_mul(2);
        }

        // Active landing directories get revisited sooner.
        if busy_name_pattern().is_match(dir) {
            interval = interval / 2;
        }

        // A change within the last hour means the directory is live.
        if let Some(last_change) = history.last_change() {
            if Instant::now().duration_since(last_change) < RECENT_CHANGE_WINDOW {
                interval = interval / 2;
            }
        }

        interval.clamp(Duration::from_secs(1), self.max_interval)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter() -> RefreshLimiter {
        let config = Config::default()
            .with_refresh_intervals(Duration::from_secs(30), Duration::from_secs(600));
        RefreshLimiter::new(&config)
    }

    #[tokio::test(start_paused = true)]
    async fn first_check_refreshes() {
        let limiter = limiter();
        assert_eq!(limiter.check("media/shows"), RefreshDecision::Refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn second_check_is_too_soon() {
        let limiter = limiter();
        assert_eq!(limiter.check("media/shows"), RefreshDecision::Refresh);
        limiter.record_refresh("media/shows", true);
        assert_eq!(limiter.check("media/shows"), RefreshDecision::TooSoon);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_elapses() {
        let limiter = limiter();
        assert_eq!(limiter.check("media/shows"), RefreshDecision::Refresh);
        limiter.record_refresh("media/shows", true);
        // Changed within the hour halves the 30s minimum to 15s.
        tokio::time::advance(Duration::from_secs(16)).await;
        assert_eq!(limiter.check("media/shows"), RefreshDecision::Refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn scratch_directories_never_refresh() {
        let limiter = limiter();
        assert_eq!(limiter.check("tmp"), RefreshDecision::ScratchDirectory);
        assert_eq!(
            limiter.check("media/cache/posters"),
            RefreshDecision::ScratchDirectory
        );
        assert_eq!(limiter.check("var/log"), RefreshDecision::ScratchDirectory);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_api_blocks_everything() {
        let limiter = limiter();
        // 5 qps threshold over a 10s window needs >50 calls.
        for _ in 0..60 {
            limiter.record_api_call();
        }
        assert_eq!(limiter.check("media/shows"), RefreshDecision::ApiBusy);
    }

    #[tokio::test(start_paused = true)]
    async fn static_directory_is_blocked() {
        let limiter = limiter();
        assert_eq!(limiter.check("archive/2019"), RefreshDecision::Refresh);
        // Twenty refreshes, none of which changed anything.
        for _ in 0..20 {
            limiter.record_refresh("archive/2019", false);
        }
        tokio::time::advance(Duration::from_secs(25 * 60 * 60)).await;
        assert_eq!(limiter.check("archive/2019"), RefreshDecision::Static);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanging_directory_waits_longer() {
        let limiter = limiter();
        assert_eq!(limiter.check("stills"), RefreshDecision::Refresh);
        for _ in 0..10 {
            limiter.record_refresh("stills", false);
        }
        // Change rate 0 < 0.1 doubles the interval: 60s, not 30s.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(limiter.check("stills"), RefreshDecision::TooSoon);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.check("stills"), RefreshDecision::Refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn download_directories_refresh_sooner() {
        let limiter = limiter();
        assert_eq!(limiter.check("downloads"), RefreshDecision::Refresh);
        limiter.record_refresh("downloads", true);
        // Half of min_interval (landing dir), halved again by the recent
        // change: 7.5s.
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(limiter.check("downloads"), RefreshDecision::Refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn qps_window_expires() {
        let limiter = limiter();
        for _ in 0..60 {
            limiter.record_api_call();
        }
        assert!(limiter.current_qps() > 5.0);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(limiter.current_qps() < 0.1);
    }
}
