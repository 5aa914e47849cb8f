//! The cache table.
//!
//! [`CacheStore`] owns every [`CacheEntry`]. Reads are lock-free for callers
//! in the sense that they never suspend; every write goes through
//! [`CacheStore::with_slots`], which the fetch, invalidation, and mutation
//! engines use to apply a batch of changes under one write lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use super::config::CacheConfig;
use super::entry::{CacheEntry, QueryData};
use super::error::QueryError;
use super::keys::KeyPath;
use super::lock::{rw_read, rw_write};
use super::subscription::Subscription;

const SOURCE: &str = "cache::store";
const METRIC_CACHE_EVICT: &str = "tessera_cache_evict_total";
const METRIC_CACHE_ENTRIES: &str = "tessera_cache_entries";

/// Outcome of one fetch, awaitable by any number of callers.
pub(crate) type SharedFetch = Shared<BoxFuture<'static, Result<QueryData, QueryError>>>;

pub(crate) struct InFlight {
    pub(crate) future: SharedFetch,
    /// The fetch began after the entry was marked stale.
    pub(crate) covers_invalidation: bool,
}

pub(crate) struct Slot {
    pub(crate) entry: CacheEntry,
    /// Identity of this slot; subscriptions release against it.
    pub(crate) id: u64,
    /// Bumped on reset; fetches started under an older epoch are discarded.
    pub(crate) epoch: u64,
    pub(crate) stale_time: Option<Duration>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) refetch_on_settle: bool,
    pub(crate) idle_since: Option<Instant>,
    notifier: watch::Sender<CacheEntry>,
}

impl Slot {
    fn new(key: KeyPath, id: u64, stale_time: Option<Duration>, now: Instant) -> Self {
        let entry = CacheEntry::idle(key);
        let (notifier, _) = watch::channel(entry.clone());
        Self {
            entry,
            id,
            epoch: id,
            stale_time,
            in_flight: None,
            refetch_on_settle: false,
            idle_since: Some(now),
            notifier,
        }
    }

    /// Push the current entry to every subscriber.
    pub(crate) fn publish(&self) {
        self.notifier.send_replace(self.entry.clone());
    }

    /// Mirror the subscriber count without waking anyone.
    fn sync_subscribers(&self) {
        let count = self.entry.subscriber_count;
        self.notifier.send_if_modified(|entry| {
            entry.subscriber_count = count;
            false
        });
    }

    pub(crate) fn is_evictable(&self) -> bool {
        self.entry.subscriber_count == 0 && self.in_flight.is_none()
    }
}

/// Mutable view of the table handed to [`CacheStore::with_slots`] callers.
pub(crate) struct Slots<'a> {
    table: &'a mut LruCache<KeyPath, Slot>,
    store: &'a CacheStore,
    pub(crate) now: Instant,
}

impl Slots<'_> {
    /// Fetch a slot, creating an `Idle` one, and mark it most recently used.
    pub(crate) fn get_or_insert(&mut self, key: &KeyPath) -> &mut Slot {
        let store = self.store;
        let now = self.now;
        self.table.get_or_insert_mut(key.clone(), || {
            Slot::new(
                key.clone(),
                store.next_id(),
                Some(store.config.stale_time()),
                now,
            )
        })
    }

    pub(crate) fn get_mut(&mut self, key: &KeyPath) -> Option<&mut Slot> {
        self.table.get_mut(key)
    }

    pub(crate) fn peek_mut(&mut self, key: &KeyPath) -> Option<&mut Slot> {
        self.table.peek_mut(key)
    }

    pub(crate) fn pop(&mut self, key: &KeyPath) -> Option<Slot> {
        self.table.pop(key)
    }

    /// Keys under `prefix`, most recently used first.
    pub(crate) fn matching(&self, prefix: &KeyPath) -> Vec<KeyPath> {
        self.table
            .iter()
            .filter(|(key, _)| prefix.is_ancestor_of(key))
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn next_epoch(&self) -> u64 {
        self.store.next_id()
    }

    /// Insert a slot restored from a snapshot.
    pub(crate) fn restore(&mut self, entry: CacheEntry, stale_time: Option<Duration>) {
        let key = entry.key.clone();
        let now = self.now;
        let slot = self.get_or_insert(&key);
        let subscribers = slot.entry.subscriber_count;
        slot.entry = entry;
        slot.entry.subscriber_count = subscribers;
        slot.stale_time = stale_time;
        if subscribers == 0 && slot.idle_since.is_none() {
            slot.idle_since = Some(now);
        }
        slot.publish();
    }
}

/// Table of cache entries keyed by [`KeyPath`].
///
/// Constructed explicitly and shared through `Arc`; independent stores in one
/// process never see each other's entries.
pub struct CacheStore {
    slots: RwLock<LruCache<KeyPath, Slot>>,
    config: CacheConfig,
    ids: AtomicU64,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            slots: RwLock::new(LruCache::unbounded()),
            config,
            ids: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current state of `key`; an absent key reads as `Idle`.
    pub fn read(&self, key: &KeyPath) -> CacheEntry {
        rw_read(&self.slots, SOURCE, "read")
            .peek(key)
            .map(|slot| slot.entry.clone())
            .unwrap_or_else(|| CacheEntry::idle(key.clone()))
    }

    pub fn contains(&self, key: &KeyPath) -> bool {
        rw_read(&self.slots, SOURCE, "contains").contains(key)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.slots, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored keys, most recently used first.
    pub fn keys(&self) -> Vec<KeyPath> {
        rw_read(&self.slots, SOURCE, "keys")
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Start observing `key`. The entry is created `Idle` if absent.
    pub fn subscribe(self: &Arc<Self>, key: &KeyPath) -> Subscription {
        self.with_slots("subscribe", |slots| {
            let slot = slots.get_or_insert(key);
            slot.entry.subscriber_count += 1;
            slot.idle_since = None;
            slot.sync_subscribers();
            Subscription::new(
                Arc::clone(self),
                key.clone(),
                slot.id,
                slot.notifier.subscribe(),
            )
        })
    }

    pub(crate) fn unsubscribe(&self, key: &KeyPath, slot_id: u64) {
        self.with_slots("unsubscribe", |slots| {
            let now = slots.now;
            let Some(slot) = slots.peek_mut(key) else {
                return;
            };
            if slot.id != slot_id || slot.entry.subscriber_count == 0 {
                return;
            }
            slot.entry.subscriber_count -= 1;
            if slot.entry.subscriber_count == 0 {
                slot.idle_since = Some(now);
            }
            slot.sync_subscribers();
        });
    }

    /// Evict entries idle for longer than `gc_time`, then trim idle entries
    /// least-recently-used first while the table exceeds `max_entries`.
    ///
    /// Entries with subscribers or an in-flight fetch are never evicted.
    pub fn collect_garbage(&self) -> usize {
        let gc_time = self.config.gc_time();
        let max_entries = self.config.max_entries_non_zero().get();

        self.with_slots("collect_garbage", |slots| {
            let now = slots.now;
            let expired: Vec<KeyPath> = slots
                .table
                .iter()
                .filter(|(_, slot)| {
                    slot.is_evictable()
                        && slot
                            .idle_since
                            .is_some_and(|since| now.saturating_duration_since(since) >= gc_time)
                })
                .map(|(key, _)| key.clone())
                .collect();

            let mut evicted = 0;
            for key in expired {
                slots.table.pop(&key);
                counter!(METRIC_CACHE_EVICT, "reason" => "expired").increment(1);
                evicted += 1;
            }

            let overflow = slots.table.len().saturating_sub(max_entries);
            if overflow > 0 {
                let victims: Vec<KeyPath> = slots
                    .table
                    .iter()
                    .rev()
                    .filter(|(_, slot)| slot.is_evictable())
                    .take(overflow)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in victims {
                    slots.table.pop(&key);
                    counter!(METRIC_CACHE_EVICT, "reason" => "capacity").increment(1);
                    evicted += 1;
                }
            }

            if evicted > 0 {
                debug!(evicted, remaining = slots.table.len(), "Cache garbage collected");
            }
            evicted
        })
    }

    /// Run `f` under the table's write lock.
    pub(crate) fn with_slots<R>(&self, op: &'static str, f: impl FnOnce(&mut Slots<'_>) -> R) -> R {
        let mut guard = rw_write(&self.slots, SOURCE, op);
        let mut slots = Slots {
            table: &mut guard,
            store: self,
            now: Instant::now(),
        };
        let result = f(&mut slots);
        let len = slots.table.len();
        drop(guard);
        gauge!(METRIC_CACHE_ENTRIES).set(len as f64);
        result
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use serde_json::json;

    use super::*;
    use crate::cache::entry::QueryStatus;

    fn key(name: &str) -> KeyPath {
        KeyPath::root("volumes").child(name)
    }

    fn populate(store: &CacheStore, key: &KeyPath) {
        store.with_slots("test", |slots| {
            let now = slots.now;
            let slot = slots.get_or_insert(key);
            slot.entry
                .record_data(Arc::new(json!({"id": 1})), now, Some(Duration::from_secs(60)));
            slot.publish();
        });
    }

    #[test]
    fn absent_key_reads_idle() {
        let store = CacheStore::new(CacheConfig::default());
        let entry = store.read(&key("list"));

        assert_eq!(entry.status, QueryStatus::Idle);
        assert_eq!(entry.data, None);
        assert!(!store.contains(&key("list")));
    }

    #[tokio::test]
    async fn subscription_lifecycle_drives_count() {
        let store = Arc::new(CacheStore::new(CacheConfig::default()));
        let first = store.subscribe(&key("list"));
        let second = store.subscribe(&key("list"));
        assert_eq!(store.read(&key("list")).subscriber_count, 2);
        assert_eq!(first.current().subscriber_count, 2);

        first.dispose();
        assert_eq!(store.read(&key("list")).subscriber_count, 1);

        drop(second);
        assert_eq!(store.read(&key("list")).subscriber_count, 0);
    }

    #[tokio::test]
    async fn subscribers_see_published_transitions() {
        let store = Arc::new(CacheStore::new(CacheConfig::default()));
        let mut subscription = store.subscribe(&key("list"));

        populate(&store, &key("list"));

        let entry = subscription.changed().await.expect("store still alive");
        assert_eq!(entry.status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_collection_waits_for_gc_time() {
        let config = CacheConfig {
            gc_time_ms: 1_000,
            ..Default::default()
        };
        let store = Arc::new(CacheStore::new(config));
        populate(&store, &key("idle"));
        let held = store.subscribe(&key("held"));

        assert_eq!(store.collect_garbage(), 0);
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert_eq!(store.collect_garbage(), 1);
        assert!(!store.contains(&key("idle")));
        assert!(store.contains(&key("held")));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_trims_least_recently_used_idle_entries() {
        let config = CacheConfig {
            max_entries: 2,
            ..Default::default()
        };
        let store = Arc::new(CacheStore::new(config));
        let _oldest_but_watched = store.subscribe(&key("a"));
        populate(&store, &key("b"));
        populate(&store, &key("c"));
        populate(&store, &key("d"));

        assert_eq!(store.collect_garbage(), 2);
        assert!(store.contains(&key("a")));
        assert!(!store.contains(&key("b")));
        assert!(!store.contains(&key("c")));
        assert!(store.contains(&key("d")));
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = CacheStore::new(CacheConfig::default());
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.slots.write().expect("slots lock should be acquired");
            panic!("poison slots lock");
        }));

        populate(&store, &key("list"));
        assert_eq!(store.read(&key("list")).status, QueryStatus::Success);
    }
}
