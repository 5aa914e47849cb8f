//! Cache entry state.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use super::error::QueryError;
use super::keys::KeyPath;

/// Cached payload. Shared so readers never copy the JSON tree.
pub type QueryData = Arc<Value>;

/// Lifecycle of a [`CacheEntry`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

impl QueryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Loading => "loading",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one key's state.
///
/// `Success` always carries `data`, `Error` always carries `error`, and
/// `stale_at` is `last_fetched_at + stale_time` (absent when the data never
/// goes stale by age). Marking an entry stale sets `invalidated` instead of
/// rewriting the timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: KeyPath,
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    pub last_fetched_at: Option<Instant>,
    pub stale_at: Option<Instant>,
    pub invalidated: bool,
    pub subscriber_count: usize,
}

impl CacheEntry {
    pub fn idle(key: KeyPath) -> Self {
        Self {
            key,
            data: None,
            status: QueryStatus::Idle,
            error: None,
            last_fetched_at: None,
            stale_at: None,
            invalidated: false,
            subscriber_count: 0,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        self.invalidated || self.stale_at.is_some_and(|at| now >= at)
    }

    /// Servable without a network call.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.status == QueryStatus::Success && !self.is_stale(now)
    }

    pub fn is_fetching(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    pub(crate) fn begin_loading(&mut self) {
        self.status = QueryStatus::Loading;
    }

    /// Authoritative data arrived, from a fetch or a patch.
    pub(crate) fn record_data(&mut self, data: QueryData, now: Instant, stale_time: Option<Duration>) {
        self.data = Some(data);
        self.status = QueryStatus::Success;
        self.error = None;
        self.last_fetched_at = Some(now);
        self.stale_at = stale_time.and_then(|window| now.checked_add(window));
        self.invalidated = false;
    }

    /// Previous data is kept for display.
    pub(crate) fn record_error(&mut self, error: QueryError) {
        self.status = QueryStatus::Error;
        self.error = Some(error);
    }

    /// Reset to `Idle`, keeping only the key and the live subscriber count.
    pub(crate) fn reset(&mut self) {
        let subscribers = self.subscriber_count;
        *self = Self::idle(self.key.clone());
        self.subscriber_count = subscribers;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::idle(KeyPath::root("regions"))
    }

    #[tokio::test(start_paused = true)]
    async fn data_goes_stale_after_window() {
        let mut entry = entry();
        let now = Instant::now();
        entry.record_data(Arc::new(json!([])), now, Some(Duration::from_secs(30)));

        assert!(entry.is_fresh(now));
        assert!(entry.is_fresh(now + Duration::from_secs(29)));
        assert!(entry.is_stale(now + Duration::from_secs(30)));
        assert_eq!(entry.stale_at, Some(now + Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn never_stale_without_window_unless_invalidated() {
        let mut entry = entry();
        let now = Instant::now();
        entry.record_data(Arc::new(json!([])), now, None);

        assert!(entry.is_fresh(now + Duration::from_secs(86_400)));
        entry.invalidated = true;
        assert!(!entry.is_fresh(now));
    }

    #[test]
    fn error_keeps_previous_data() {
        let mut entry = entry();
        entry.record_data(Arc::new(json!({"id": 1})), Instant::now(), None);
        entry.record_error(QueryError::network("reset"));

        assert_eq!(entry.status, QueryStatus::Error);
        assert!(entry.data.is_some());
        assert!(entry.error.is_some());
    }

    #[test]
    fn reset_keeps_subscribers() {
        let mut entry = entry();
        entry.subscriber_count = 2;
        entry.record_data(Arc::new(json!(1)), Instant::now(), None);
        entry.reset();

        assert_eq!(entry.status, QueryStatus::Idle);
        assert_eq!(entry.data, None);
        assert_eq!(entry.subscriber_count, 2);
    }
}
