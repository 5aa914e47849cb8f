//! Cache configuration.
//!
//! Runtime knobs for staleness, garbage collection, retries, and event
//! consumption. Populated from the `[cache]` section of `tessera.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_STALE_TIME_MS: u64 = 60_000;
const DEFAULT_GC_TIME_MS: u64 = 300_000;
const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
const DEFAULT_MAX_ENTRIES: usize = 1_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;
const DEFAULT_EVENT_QUEUE_LIMIT: usize = 1_024;
const DEFAULT_SEEN_EVENTS_LIMIT: usize = 512;

/// Exponential backoff for transient fetch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Settle on the first failure.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (zero-based): `min(base * 2^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

/// Cache configuration from `tessera.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Staleness window for definitions that do not set their own.
    pub stale_time_ms: u64,
    /// How long an entry without subscribers survives.
    pub gc_time_ms: u64,
    /// Cadence of the background sweep.
    pub gc_interval_ms: u64,
    /// Upper bound on stored entries; idle ones are evicted LRU-first above it.
    pub max_entries: usize,
    /// Retries after the first failed attempt.
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
    /// Pending events kept before the oldest is dropped.
    pub event_queue_limit: usize,
    /// Remembered `(event id, status)` pairs for duplicate suppression.
    pub seen_events_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time_ms: DEFAULT_STALE_TIME_MS,
            gc_time_ms: DEFAULT_GC_TIME_MS,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            seen_events_limit: DEFAULT_SEEN_EVENTS_LIMIT,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            stale_time_ms: settings.stale_time_ms,
            gc_time_ms: settings.gc_time_ms,
            gc_interval_ms: settings.gc_interval_ms,
            max_entries: settings.max_entries,
            retry_max_attempts: settings.retry_max_attempts,
            retry_base_delay_ms: settings.retry_base_delay_ms,
            retry_max_delay_ms: settings.retry_max_delay_ms,
            consume_batch_limit: settings.consume_batch_limit,
            event_queue_limit: settings.event_queue_limit,
            seen_events_limit: settings.seen_events_limit,
        }
    }
}

impl CacheConfig {
    pub fn stale_time(&self) -> Duration {
        Duration::from_millis(self.stale_time_ms)
    }

    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// Clamped to one millisecond so interval timers never spin.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    /// Returns the entry cap as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the event queue limit as NonZeroUsize, clamping to 1 if zero.
    pub fn event_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.event_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the duplicate-suppression window as NonZeroUsize, clamping to 1 if zero.
    pub fn seen_events_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.seen_events_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.stale_time(), Duration::from_secs(60));
        assert_eq!(config.gc_time(), Duration::from_secs(300));
        assert_eq!(config.max_entries, 1_000);
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.consume_batch_limit, 100);
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(30));
        assert_eq!(policy.delay_for(64), Duration::from_secs(30));
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            max_entries: 0,
            event_queue_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.max_entries_non_zero().get(), 1);
        assert_eq!(config.event_queue_limit_non_zero().get(), 1);
    }

    #[test]
    fn deserializes_partial_table() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"gc_time_ms": 1000}"#).expect("partial config parses");
        assert_eq!(config.gc_time(), Duration::from_secs(1));
        assert_eq!(config.stale_time_ms, 60_000);
    }
}
