//! Configuration for room orchestration.

use roomlog_core::TimelineConfig;
use std::time::Duration;

/// Configuration for a [`Room`](crate::Room).
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Timeline and writer configuration.
    pub timeline: TimelineConfig,
    /// Number of events requested per gap fill.
    pub page_size: usize,
    /// Retry configuration for gap fetches.
    pub retry: RetryConfig,
}

impl RoomConfig {
    /// Creates a room configuration for `own_user_id`.
    pub fn new(own_user_id: impl Into<String>) -> Self {
        Self {
            timeline: TimelineConfig::new(own_user_id),
            page_size: 30,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the timeline configuration.
    #[must_use]
    pub fn with_timeline(mut self, timeline: TimelineConfig) -> Self {
        self.timeline = timeline;
        self
    }

    /// Sets the gap fill page size.
    #[must_use]
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Retry policy for gap fetches.
///
/// Delays double per attempt up to `max_delay`. With `spread` on, each delay
/// grows by up to a quarter, derived from the pagination token, so rooms
/// retrying at the same moment don't hit the server in lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub first_delay: Duration,
    /// Upper bound for the doubled delay.
    pub max_delay: Duration,
    /// Whether delays are spread per token.
    pub spread: bool,
}

impl RetryConfig {
    /// Creates a policy allowing `max_attempts` fetches.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            first_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            spread: true,
        }
    }

    /// A policy that fetches once and never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            first_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            spread: false,
        }
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_first_delay(mut self, delay: Duration) -> Self {
        self.first_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Turns per-token spreading on or off.
    #[must_use]
    pub fn with_spread(mut self, spread: bool) -> Self {
        self.spread = spread;
        self
    }

    /// Delay before fetch number `attempt` (0-indexed) from `token`.
    pub fn delay_for_attempt(&self, attempt: u32, token: &str) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let doublings = (attempt - 1).min(16);
        let delay = self
            .first_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay);
        if !self.spread {
            return delay;
        }
        let per_mille = u32::try_from(token_hash(token, attempt) % 1000).unwrap_or(0);
        delay.saturating_add(delay.saturating_mul(per_mille) / 4000)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

fn token_hash(token: &str, attempt: u32) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    attempt.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_config_builder() {
        let config = RoomConfig::new("@me:hs")
            .with_page_size(50)
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.timeline.own_user_id, "@me:hs");
        assert_eq!(config.page_size, 50);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn delays_double_until_capped() {
        let config = RetryConfig::new(10)
            .with_first_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_spread(false);

        assert_eq!(config.delay_for_attempt(0, "t1"), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1, "t1"), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2, "t1"), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3, "t1"), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4, "t1"), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(u32::MAX, "t1"), Duration::from_millis(500));
    }

    #[test]
    fn spread_is_stable_per_token_and_bounded() {
        let config = RetryConfig::new(5).with_first_delay(Duration::from_millis(400));
        for token in ["t1", "s72_4_9", ""] {
            let delay = config.delay_for_attempt(1, token);
            assert_eq!(delay, config.delay_for_attempt(1, token));
            assert!(delay >= Duration::from_millis(400));
            assert!(delay < Duration::from_millis(500));
        }
    }

    #[test]
    fn no_retry_never_waits() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(3, "t1"), Duration::ZERO);
    }
}
