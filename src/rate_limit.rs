//! Per-caller sliding-window admission control.
//!
//! Independent of the session pool: a caller can be rejected here while the
//! pool sits idle, and vice versa.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// `<count>/<second|minute>`, e.g. `10/minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    pub count: usize,
    pub window: Duration,
}

impl LimitSpec {
    pub fn parse(spec: &str) -> Option<Self> {
        let (count, unit) = spec.trim().split_once('/')?;
        let count: usize = count.trim().parse().ok()?;
        if count == 0 {
            return None;
        }
        let window = match unit.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" => Duration::from_secs(1),
            "m" | "min" | "minute" => Duration::from_secs(60),
            _ => return None,
        };
        Some(Self { count, window })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: usize,
    /// Zero when allowed
    pub retry_after_secs: u64,
}

struct RateWindow {
    timestamps: VecDeque<Instant>,
    window: Duration,
}

impl RateWindow {
    fn evict(&mut self, now: Instant) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    fallback: LimitSpec,
}

impl RateLimiter {
    /// `default_spec` applies whenever a caller's own spec does not parse.
    pub fn new(default_spec: &str) -> Self {
        let fallback = LimitSpec::parse(default_spec).unwrap_or(LimitSpec {
            count: 10,
            window: Duration::from_secs(60),
        });
        Self {
            windows: DashMap::new(),
            fallback,
        }
    }

    pub fn admit(&self, key: &str, spec: &str) -> RateDecision {
        let limit = LimitSpec::parse(spec).unwrap_or_else(|| {
            debug!(spec, "Invalid rate limit spec, using default");
            self.fallback
        });
        let now = Instant::now();

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| RateWindow {
                timestamps: VecDeque::new(),
                window: limit.window,
            });
        window.window = limit.window;
        window.evict(now);

        if window.timestamps.len() >= limit.count {
            let retry_after = window
                .timestamps
                .front()
                .map(|&oldest| (oldest + limit.window).saturating_duration_since(now))
                .unwrap_or(limit.window);
            crate::metrics::record_rate_limited();
            return RateDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: ceil_secs(retry_after).max(1),
            };
        }

        window.timestamps.push_back(now);
        RateDecision {
            allowed: true,
            remaining: limit.count - window.timestamps.len(),
            retry_after_secs: 0,
        }
    }

    /// Drop expired timestamps and forget callers whose window is empty.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.evict(now);
            !window.timestamps.is_empty()
        });
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[test]
    fn parses_specs() {
        assert_eq!(
            LimitSpec::parse("2/second"),
            Some(LimitSpec {
                count: 2,
                window: Duration::from_secs(1)
            })
        );
        assert_eq!(LimitSpec::parse(" 30 / Minute ").map(|s| s.count), Some(30));
        assert_eq!(LimitSpec::parse("0/second"), None);
        assert_eq!(LimitSpec::parse("5/hour"), None);
        assert_eq!(LimitSpec::parse("lots"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_allows_then_rejects_then_recovers() {
        let limiter = RateLimiter::new("10/minute");

        let first = limiter.admit("caller", "2/second");
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        advance(Duration::from_millis(100)).await;
        assert!(limiter.admit("caller", "2/second").allowed);
        advance(Duration::from_millis(100)).await;

        let third = limiter.admit("caller", "2/second");
        assert!(!third.allowed);
        assert!(third.retry_after_secs >= 1);

        advance(Duration::from_secs(1)).await;
        assert!(limiter.admit("caller", "2/second").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new("10/minute");
        assert!(limiter.admit("a", "1/second").allowed);
        assert!(!limiter.admit("a", "1/second").allowed);
        assert!(limiter.admit("b", "1/second").allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_spec_falls_back_to_default() {
        let limiter = RateLimiter::new("1/minute");
        assert!(limiter.admit("a", "garbage").allowed);
        let rejected = limiter.admit("a", "garbage");
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_secs, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_tracks_oldest_timestamp() {
        let limiter = RateLimiter::new("10/minute");
        limiter.admit("a", "2/minute");
        advance(Duration::from_secs(20)).await;
        limiter.admit("a", "2/minute");
        advance(Duration::from_secs(10)).await;

        let rejected = limiter.admit("a", "2/minute");
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after_secs, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_forgets_idle_callers() {
        let limiter = RateLimiter::new("10/minute");
        limiter.admit("idle", "5/second");
        limiter.admit("busy", "5/minute");

        advance(Duration::from_secs(2)).await;
        assert_eq!(limiter.prune(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
