//! Prefix invalidation and removal.
//!
//! Invalidation marks entries stale and refetches the subscribed ones right
//! away; unsubscribed entries stay stale until someone subscribes again.
//! Removal drops data: unsubscribed entries are evicted, subscribed ones are
//! reset to `Idle` in place so their views empty out instead of refetching.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use metrics::counter;
use tracing::{info, instrument, warn};

use super::fetcher::{Begin, FetchCoordinator, FetchMode};
use super::keys::KeyPath;
use super::store::Slots;

const METRIC_INVALIDATE: &str = "tessera_invalidate_total";

/// What one invalidation or removal touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Entries under the prefix.
    pub matched: usize,
    /// Subscribed entries now fetching.
    pub refetching: usize,
    /// Entries evicted or reset to `Idle`.
    pub removed: usize,
}

impl AddAssign for InvalidationReport {
    fn add_assign(&mut self, other: Self) {
        self.matched += other.matched;
        self.refetching += other.refetching;
        self.removed += other.removed;
    }
}

impl fmt::Display for InvalidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matched={} refetching={} removed={}",
            self.matched, self.refetching, self.removed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Prefix,
    Exact,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Exact => "exact",
        }
    }
}

/// Entry point for invalidation outside a mutation.
pub struct InvalidationEngine {
    fetcher: Arc<FetchCoordinator>,
}

impl InvalidationEngine {
    pub fn new(fetcher: Arc<FetchCoordinator>) -> Self {
        Self { fetcher }
    }

    /// Mark every entry under `prefix` stale.
    #[instrument(skip(self, prefix), fields(prefix = %prefix))]
    pub fn invalidate(&self, prefix: &KeyPath) -> InvalidationReport {
        let report = self.fetcher.store().with_slots("invalidate", |slots| {
            invalidate_locked(&self.fetcher, slots, prefix, Scope::Prefix)
        });
        info!(prefix = %prefix, %report, "Cache invalidated");
        report
    }

    /// Mark only `key` stale.
    #[instrument(skip(self, key), fields(key = %key))]
    pub fn invalidate_exact(&self, key: &KeyPath) -> InvalidationReport {
        let report = self.fetcher.store().with_slots("invalidate_exact", |slots| {
            invalidate_locked(&self.fetcher, slots, key, Scope::Exact)
        });
        info!(key = %key, %report, "Cache entry invalidated");
        report
    }

    /// Drop the data of every entry under `prefix`.
    #[instrument(skip(self, prefix), fields(prefix = %prefix))]
    pub fn remove(&self, prefix: &KeyPath) -> InvalidationReport {
        let report = self
            .fetcher
            .store()
            .with_slots("remove", |slots| remove_locked(slots, prefix));
        info!(prefix = %prefix, %report, "Cache entries removed");
        report
    }
}

pub(crate) fn invalidate_locked(
    fetcher: &Arc<FetchCoordinator>,
    slots: &mut Slots<'_>,
    target: &KeyPath,
    scope: Scope,
) -> InvalidationReport {
    let keys = match scope {
        Scope::Prefix => slots.matching(target),
        Scope::Exact => slots
            .peek_mut(target)
            .map(|_| vec![target.clone()])
            .unwrap_or_default(),
    };

    let mut report = InvalidationReport::default();
    for key in keys {
        let Some(slot) = slots.peek_mut(&key) else {
            continue;
        };
        report.matched += 1;
        let subscribed = slot.entry.subscriber_count > 0;

        if let Some(in_flight) = &slot.in_flight {
            // A fetch that began before this mark may return pre-write data.
            if !in_flight.covers_invalidation {
                slot.refetch_on_settle = true;
            }
            if !slot.entry.invalidated {
                slot.entry.invalidated = true;
                slot.publish();
            }
            if subscribed {
                report.refetching += 1;
            }
            continue;
        }

        let newly_stale = !slot.entry.invalidated;
        slot.entry.invalidated = true;
        if !subscribed {
            if newly_stale {
                slot.publish();
            }
            continue;
        }

        match fetcher.begin_locked(slots, &key, FetchMode::IfStale) {
            Ok(Begin::Pending(_)) => report.refetching += 1,
            Ok(Begin::Fresh(_)) => {}
            Err(err) => warn!(key = %key, error = %err, "Refetch after invalidation not started"),
        }
    }

    counter!(METRIC_INVALIDATE, "scope" => scope.as_str()).increment(report.matched as u64);
    report
}

pub(crate) fn remove_locked(slots: &mut Slots<'_>, prefix: &KeyPath) -> InvalidationReport {
    let mut report = InvalidationReport::default();
    for key in slots.matching(prefix) {
        let epoch = slots.next_epoch();
        let Some(slot) = slots.peek_mut(&key) else {
            continue;
        };
        report.matched += 1;
        report.removed += 1;

        if slot.entry.subscriber_count == 0 {
            slots.pop(&key);
            continue;
        }

        slot.epoch = epoch;
        slot.in_flight = None;
        slot.refetch_on_settle = false;
        slot.entry.reset();
        slot.publish();
    }

    counter!(METRIC_INVALIDATE, "scope" => "remove").increment(report.matched as u64);
    report
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::entry::QueryStatus;
    use crate::cache::keys::Params;
    use crate::cache::registry::{Fetcher, KeyPattern, QueryRegistry, Staleness};
    use crate::cache::store::CacheStore;

    struct Harness {
        fetcher: Arc<FetchCoordinator>,
        engine: InvalidationEngine,
        calls: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = Arc::new(QueryRegistry::new());
        registry
            .register_fn(
                "volumes",
                KeyPattern::new().exact("volumes").subtree(),
                Fetcher::from_fn(move |_ctx| {
                    let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(json!({ "call": call }))
                    }
                }),
                Staleness::Never,
            )
            .expect("register");
        let fetcher = FetchCoordinator::new(Arc::new(CacheStore::new(CacheConfig::default())), registry);
        Harness {
            engine: InvalidationEngine::new(Arc::clone(&fetcher)),
            fetcher,
            calls,
        }
    }

    fn page(page: u32) -> KeyPath {
        KeyPath::root("volumes")
            .child("list")
            .child_with("paginated", Params::new().with("page", page))
    }

    fn detail(id: u64) -> KeyPath {
        KeyPath::root("volumes").child_with("detail", Params::new().with("id", id))
    }

    #[tokio::test(start_paused = true)]
    async fn only_subscribed_entries_refetch() {
        let h = harness();
        h.fetcher.ensure_fresh(&page(1)).await.expect("page 1");
        h.fetcher.ensure_fresh(&page(2)).await.expect("page 2");
        h.fetcher.ensure_fresh(&detail(7)).await.expect("detail");
        let _watching = h.fetcher.store().subscribe(&page(1));

        let report = h.engine.invalidate(&KeyPath::root("volumes").child("list"));

        assert_eq!(report.matched, 2);
        assert_eq!(report.refetching, 1);
        let store = h.fetcher.store();
        assert_eq!(store.read(&page(1)).status, QueryStatus::Loading);
        let unsubscribed = store.read(&page(2));
        assert_eq!(unsubscribed.status, QueryStatus::Success);
        assert!(unsubscribed.invalidated);
        assert!(!store.read(&detail(7)).invalidated);

        h.fetcher.ensure_fresh(&page(1)).await.expect("joins the refetch");
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_invalidation_is_a_no_op() {
        let h = harness();
        h.fetcher.ensure_fresh(&page(1)).await.expect("page 1");
        let _watching = h.fetcher.store().subscribe(&page(1));

        h.engine.invalidate(&KeyPath::root("volumes"));
        h.engine.invalidate(&KeyPath::root("volumes"));
        h.fetcher.ensure_fresh(&page(1)).await.expect("refetched");

        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
        assert!(!h.fetcher.store().read(&page(1)).invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_during_older_fetch_schedules_follow_up() {
        let h = harness();
        let mut subscription = h.fetcher.store().subscribe(&page(1));
        let pending = h.fetcher.start(&page(1), FetchMode::IfStale).expect("begin");

        let report = h.engine.invalidate(&page(1));
        assert_eq!(report.refetching, 1);

        pending.outcome().await.expect("first fetch");
        let settled = subscription
            .wait_for(|entry| entry.status == QueryStatus::Success && !entry.invalidated)
            .await
            .expect("follow-up settles");

        assert_eq!(settled.data.as_deref(), Some(&json!({"call": 2})));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exact_invalidation_skips_descendants() {
        let h = harness();
        let scoped = detail(7).child("snapshots");
        h.fetcher.ensure_fresh(&detail(7)).await.expect("detail");
        h.fetcher.ensure_fresh(&scoped).await.expect("scoped");

        let report = h.engine.invalidate_exact(&detail(7));

        assert_eq!(report.matched, 1);
        assert!(h.fetcher.store().read(&detail(7)).invalidated);
        assert!(!h.fetcher.store().read(&scoped).invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_evicts_idle_and_resets_subscribed() {
        let h = harness();
        h.fetcher.ensure_fresh(&detail(7)).await.expect("detail");
        h.fetcher.ensure_fresh(&detail(7).child("snapshots")).await.expect("child");
        let watching = h.fetcher.store().subscribe(&detail(7));

        let report = h.engine.remove(&detail(7));

        assert_eq!(report.removed, 2);
        let store = h.fetcher.store();
        let entry = store.read(&detail(7));
        assert_eq!(entry.status, QueryStatus::Idle);
        assert_eq!(entry.data, None);
        assert_eq!(entry.subscriber_count, 1);
        assert!(!store.contains(&detail(7).child("snapshots")));
        assert_eq!(watching.current().status, QueryStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_then_ensure_fresh_fetches_once() {
        let h = harness();
        h.fetcher.ensure_fresh(&detail(7)).await.expect("detail");
        h.engine.remove(&detail(7));

        let data = h.fetcher.ensure_fresh(&detail(7)).await.expect("repopulated");

        assert_eq!(*data, json!({"call": 2}));
        assert_eq!(h.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn remove_discards_in_flight_result() {
        let h = harness();
        let _watching = h.fetcher.store().subscribe(&detail(7));
        let pending = h.fetcher.start(&detail(7), FetchMode::IfStale).expect("begin");

        h.engine.remove(&detail(7));
        pending.outcome().await.expect("fetch still resolves");

        assert_eq!(h.fetcher.store().read(&detail(7)).status, QueryStatus::Idle);
    }
}
