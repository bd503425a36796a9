//! Combined view of the two upstream rate limits.
//!
//! The daemon answers to two independent budgets: the GitHub REST API
//! (remaining/reset, refreshed on demand and at least once per minute) and
//! the AI tool's own cooldown (parsed from its error output). A task is
//! admitted only when both allow it; otherwise the check reports which
//! budget is blocking and for how long.
//!
//! Per-task retry state lives here as well: exponential backoff with
//! symmetric jitter, capped attempts, and a typed decision so callers can
//! surface terminal failures as values.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::RateLimitConfig;

/// Which upstream budget blocked an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    GitHub,
    AiTool,
}

/// Outcome of an admission check against both budgets.
#[derive(Debug, Clone)]
pub struct LimitCheck {
    pub limited: bool,
    pub which: Option<ApiKind>,
    pub wait: Duration,
}

impl LimitCheck {
    fn clear() -> Self {
        Self {
            limited: false,
            which: None,
            wait: Duration::ZERO,
        }
    }
}

/// Retry decision for one failing task.
#[derive(Debug, Clone)]
pub struct BackoffDecision {
    pub delay: Duration,
    pub attempt: u32,
    pub should_retry: bool,
}

#[derive(Debug, Clone)]
struct GitHubBudget {
    remaining: u32,
    reset_at: DateTime<Utc>,
    fetched_at: DateTime<Utc>,
}

/// How stale the GitHub budget may get before a refresh is demanded.
const BUDGET_MAX_AGE_SECS: i64 = 60;

/// Tracks upstream budgets and per-task backoff state.
pub struct RateLimiter {
    config: RateLimitConfig,
    github: Mutex<Option<GitHubBudget>>,
    ai_cooldown_until: Mutex<Option<DateTime<Utc>>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    /// Create a limiter with the given backoff policy.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            github: Mutex::new(None),
            ai_cooldown_until: Mutex::new(None),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Record a fresh GitHub budget observation.
    pub fn record_github_budget(&self, remaining: u32, reset_at: DateTime<Utc>) {
        *self.github.lock().unwrap() = Some(GitHubBudget {
            remaining,
            reset_at,
            fetched_at: Utc::now(),
        });
    }

    /// Deduct calls we are about to spend from the cached budget.
    pub fn consume_github_calls(&self, calls: u32) {
        if let Some(budget) = self.github.lock().unwrap().as_mut() {
            budget.remaining = budget.remaining.saturating_sub(calls);
        }
    }

    /// Whether the GitHub budget is unknown or older than one minute.
    pub fn needs_github_refresh(&self) -> bool {
        match self.github.lock().unwrap().as_ref() {
            Some(budget) => {
                Utc::now() - budget.fetched_at > chrono::Duration::seconds(BUDGET_MAX_AGE_SECS)
            }
            None => true,
        }
    }

    /// Begin an AI-tool cooldown until the given instant.
    pub fn note_ai_cooldown(&self, until: DateTime<Utc>) {
        let mut guard = self.ai_cooldown_until.lock().unwrap();
        // Keep the later of two overlapping cooldowns
        if guard.map(|cur| until > cur).unwrap_or(true) {
            *guard = Some(until);
        }
    }

    /// Check whether `required_calls` GitHub calls plus one AI execution
    /// would currently be admitted.
    pub fn check(&self, required_calls: u32) -> LimitCheck {
        let now = Utc::now();

        if let Some(budget) = self.github.lock().unwrap().as_ref() {
            if budget.remaining < required_calls && budget.reset_at > now {
                let wait = (budget.reset_at - now).to_std().unwrap_or(Duration::ZERO);
                return LimitCheck {
                    limited: true,
                    which: Some(ApiKind::GitHub),
                    wait,
                };
            }
        }

        if let Some(until) = *self.ai_cooldown_until.lock().unwrap() {
            if until > now {
                let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
                return LimitCheck {
                    limited: true,
                    which: Some(ApiKind::AiTool),
                    wait,
                };
            }
        }

        LimitCheck::clear()
    }

    /// Sleep until the currently blocking budget resets.
    pub async fn wait_for_reset(&self) {
        let check = self.check(1);
        if check.limited && !check.wait.is_zero() {
            log::info!(
                "rate limited by {:?}, waiting {:.1}s",
                check.which,
                check.wait.as_secs_f64()
            );
            tokio::time::sleep(check.wait).await;
        }
    }

    /// Register one more failure for a task and compute its retry delay.
    ///
    /// The delay grows as `initial * multiplier^(attempt-1)` capped at the
    /// configured maximum, with symmetric jitter of ±`jitter_fraction`.
    /// `should_retry` turns false once the attempt count reaches the cap.
    pub fn backoff_for(&self, task_id: &str) -> BackoffDecision {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(task_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let base = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);
        let jitter = if self.config.jitter_fraction > 0.0 {
            let j = self.config.jitter_fraction;
            rand::rng().random_range(-j..=j)
        } else {
            0.0
        };
        let delay_ms = (capped * (1.0 + jitter)).max(0.0) as u64;
        BackoffDecision {
            delay: Duration::from_millis(delay_ms),
            attempt,
            should_retry: attempt < self.config.max_retries,
        }
    }

    /// Forget accumulated failures for a task (called on success).
    pub fn reset_backoff(&self, task_id: &str) {
        self.attempts.lock().unwrap().remove(task_id);
    }

    /// Extract a reset instant from an upstream error message, if the
    /// message carries one.
    pub fn parse_remote_error(message: &str) -> Option<DateTime<Utc>> {
        static RESET_EPOCH: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"(?i)reset(?:s)?(?:[ _-]?(?:at|time))?\D{0,4}(\d{9,11})").unwrap()
        });
        static RETRY_AFTER: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i)retry[ -]?after\D{0,4}(\d{1,6})").unwrap());

        if let Some(caps) = RESET_EPOCH.captures(message) {
            let epoch: i64 = caps[1].parse().ok()?;
            return Utc.timestamp_opt(epoch, 0).single();
        }
        if let Some(caps) = RETRY_AFTER.captures(message) {
            let secs: i64 = caps[1].parse().ok()?;
            return Some(Utc::now() + chrono::Duration::seconds(secs));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter_fraction: 0.0,
            max_retries: 3,
        })
    }

    #[test]
    fn test_unknown_budget_admits() {
        let rl = limiter();
        assert!(!rl.check(5).limited);
        assert!(rl.needs_github_refresh());
    }

    #[test]
    fn test_exhausted_github_budget_blocks_until_reset() {
        let rl = limiter();
        rl.record_github_budget(0, Utc::now() + chrono::Duration::seconds(30));
        let check = rl.check(1);
        assert!(check.limited);
        assert_eq!(check.which, Some(ApiKind::GitHub));
        assert!(check.wait <= Duration::from_secs(30));
        assert!(check.wait >= Duration::from_secs(28));
    }

    #[test]
    fn test_elapsed_reset_admits_again() {
        let rl = limiter();
        rl.record_github_budget(0, Utc::now() - chrono::Duration::seconds(1));
        assert!(!rl.check(1).limited);
    }

    #[test]
    fn test_ai_cooldown_blocks() {
        let rl = limiter();
        rl.record_github_budget(100, Utc::now() + chrono::Duration::seconds(3600));
        rl.note_ai_cooldown(Utc::now() + chrono::Duration::seconds(10));
        let check = rl.check(1);
        assert!(check.limited);
        assert_eq!(check.which, Some(ApiKind::AiTool));
    }

    #[test]
    fn test_cooldown_keeps_later_instant() {
        let rl = limiter();
        let far = Utc::now() + chrono::Duration::seconds(60);
        rl.note_ai_cooldown(far);
        rl.note_ai_cooldown(Utc::now() + chrono::Duration::seconds(5));
        let check = rl.check(1);
        assert!(check.wait > Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let rl = limiter();
        let d1 = rl.backoff_for("t");
        let d2 = rl.backoff_for("t");
        let d3 = rl.backoff_for("t");
        assert_eq!(d1.delay, Duration::from_millis(100));
        assert_eq!(d2.delay, Duration::from_millis(200));
        assert_eq!(d3.delay, Duration::from_millis(400));
        assert_eq!(d3.attempt, 3);
        // Attempt 3 reaches the cap of max_retries=3
        assert!(!d3.should_retry);
        assert!(d1.should_retry && d2.should_retry);
    }

    #[test]
    fn test_backoff_reset_restarts_sequence() {
        let rl = limiter();
        rl.backoff_for("t");
        rl.backoff_for("t");
        rl.reset_backoff("t");
        let d = rl.backoff_for("t");
        assert_eq!(d.attempt, 1);
        assert_eq!(d.delay, Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let rl = RateLimiter::new(RateLimitConfig {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
            jitter_fraction: 0.2,
            max_retries: 5,
        });
        for _ in 0..50 {
            let d = rl.backoff_for("fresh");
            rl.reset_backoff("fresh");
            assert!(d.delay >= Duration::from_millis(800), "delay {:?}", d.delay);
            assert!(d.delay <= Duration::from_millis(1_200), "delay {:?}", d.delay);
        }
    }

    #[test]
    fn test_wait_for_reset_returns_immediately_when_clear() {
        let rl = limiter();
        tokio_test::block_on(rl.wait_for_reset());
    }

    #[test]
    fn test_parse_reset_epoch() {
        let reset = RateLimiter::parse_remote_error(
            "API rate limit exceeded, reset at 1700000000",
        )
        .unwrap();
        assert_eq!(reset.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let before = Utc::now();
        let reset =
            RateLimiter::parse_remote_error("429 too many requests, retry-after: 90").unwrap();
        let delta = reset - before;
        assert!(delta >= chrono::Duration::seconds(89));
        assert!(delta <= chrono::Duration::seconds(91));
    }

    #[test]
    fn test_parse_without_time_is_none() {
        assert!(RateLimiter::parse_remote_error("rate limit exceeded").is_none());
        assert!(RateLimiter::parse_remote_error("all good").is_none());
    }
}
