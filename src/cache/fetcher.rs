//! Fetch coordination.
//!
//! Serves fresh entries from the store and otherwise starts exactly one fetch
//! per key. The fetch runs on a spawned task wrapped in a
//! [`Shared`](futures::future::Shared) future, so every caller that arrives
//! while it is in flight awaits the same outcome, and dropping all of them
//! never cancels it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::config::RetryPolicy;
use super::entry::QueryData;
use super::error::QueryError;
use super::keys::KeyPath;
use super::pages::InfinitePages;
use super::registry::{FetchContext, Pagination, QueryDefinition, QueryKind, QueryRegistry, Resolved};
use super::store::{CacheStore, InFlight, SharedFetch, Slots};

const METRIC_CACHE_HIT: &str = "tessera_cache_hit_total";
const METRIC_CACHE_MISS: &str = "tessera_cache_miss_total";
const METRIC_CACHE_COALESCED: &str = "tessera_cache_coalesced_total";
const METRIC_FETCH_MS: &str = "tessera_fetch_ms";
const METRIC_FETCH_RETRY: &str = "tessera_fetch_retry_total";
const METRIC_FETCH_ERROR: &str = "tessera_fetch_error_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Serve fresh data from the store.
    IfStale,
    /// Fetch regardless of freshness.
    Force,
    /// Append one page to an infinite query.
    NextPage,
}

pub(crate) enum Begin {
    Fresh(QueryData),
    Pending(SharedFetch),
}

impl Begin {
    pub(crate) async fn outcome(self) -> Result<QueryData, QueryError> {
        match self {
            Self::Fresh(data) => Ok(data),
            Self::Pending(future) => future.await,
        }
    }
}

enum FetchPlan {
    Single,
    /// Load pages from the first onward, `count` of them at most.
    Pages { pagination: Pagination, count: usize },
    /// Fetch the page after the last one in `existing`.
    Append { existing: InfinitePages, param: Value },
}

/// Drives fetches into a [`CacheStore`].
pub struct FetchCoordinator {
    store: Arc<CacheStore>,
    registry: Arc<QueryRegistry>,
}

impl FetchCoordinator {
    pub fn new(store: Arc<CacheStore>, registry: Arc<QueryRegistry>) -> Arc<Self> {
        Arc::new(Self { store, registry })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        &self.registry
    }

    /// Data for `key`, from the store while fresh, otherwise from the
    /// resolved fetch function. Concurrent callers share one fetch.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn ensure_fresh(self: &Arc<Self>, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.start(key, FetchMode::IfStale)?.outcome().await
    }

    /// Fetch `key` even if fresh; joins a fetch already in flight.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn refetch(self: &Arc<Self>, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.start(key, FetchMode::Force)?.outcome().await
    }

    /// Append the next page of an infinite query. Resolves with the current
    /// data when there is no further page.
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn fetch_next_page(self: &Arc<Self>, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.start(key, FetchMode::NextPage)?.outcome().await
    }

    /// Re-trigger every subscribed entry that is stale. Returns how many
    /// fetches were started.
    pub fn refetch_stale_subscribed(self: &Arc<Self>) -> usize {
        self.store.with_slots("refetch_stale_subscribed", |slots| {
            let now = slots.now;
            let mut started = 0;
            for key in slots.matching(&KeyPath::empty()) {
                let due = slots.peek_mut(&key).is_some_and(|slot| {
                    slot.entry.subscriber_count > 0
                        && slot.in_flight.is_none()
                        && slot.entry.data.is_some()
                        && slot.entry.is_stale(now)
                });
                if due && matches!(self.begin_locked(slots, &key, FetchMode::IfStale), Ok(Begin::Pending(_))) {
                    started += 1;
                }
            }
            if started > 0 {
                debug!(started, "Stale subscribed entries refetched");
            }
            started
        })
    }

    pub(crate) fn start(self: &Arc<Self>, key: &KeyPath, mode: FetchMode) -> Result<Begin, QueryError> {
        self.store
            .with_slots("begin_fetch", |slots| self.begin_locked(slots, key, mode))
    }

    /// Begin a fetch for `key` under an already held store lock.
    pub(crate) fn begin_locked(
        self: &Arc<Self>,
        slots: &mut Slots<'_>,
        key: &KeyPath,
        mode: FetchMode,
    ) -> Result<Begin, QueryError> {
        let now = slots.now;
        let resolved = match self.registry.resolve(key) {
            Ok(resolved) => resolved,
            Err(err) => {
                let error = QueryError::unregistered(key, &err);
                warn!(key = %key, error = %err, "No query definition for key");
                let slot = slots.get_or_insert(key);
                if slot.in_flight.is_none() {
                    slot.entry.record_error(error.clone());
                    slot.publish();
                }
                return Err(error);
            }
        };
        let definition = &resolved.definition;

        let slot = slots.get_or_insert(key);
        if let Some(in_flight) = &slot.in_flight {
            counter!(METRIC_CACHE_COALESCED).increment(1);
            debug!(key = %key, "Fetch coalesced with in-flight request");
            return Ok(Begin::Pending(in_flight.future.clone()));
        }

        let existing = slot.entry.data.clone();
        let plan = match (definition.kind, mode) {
            (QueryKind::Single, FetchMode::IfStale | FetchMode::NextPage)
            | (QueryKind::Infinite(_), FetchMode::IfStale)
                if slot.entry.is_fresh(now) =>
            {
                if let Some(data) = existing {
                    counter!(METRIC_CACHE_HIT).increment(1);
                    debug!(key = %key, "Cache hit");
                    return Ok(Begin::Fresh(data));
                }
                plan_for(definition.kind, None)
            }
            (QueryKind::Infinite(pagination), FetchMode::NextPage) => {
                match existing.as_deref().and_then(InfinitePages::from_value) {
                    Some(pages) if !pages.is_empty() => match pages.next_param(pagination) {
                        Some(param) => FetchPlan::Append {
                            existing: pages,
                            param,
                        },
                        None => {
                            if let Some(data) = existing {
                                return Ok(Begin::Fresh(data));
                            }
                            plan_for(definition.kind, None)
                        }
                    },
                    _ => plan_for(definition.kind, None),
                }
            }
            _ => plan_for(definition.kind, existing.as_deref()),
        };

        counter!(METRIC_CACHE_MISS).increment(1);
        slot.stale_time = definition
            .staleness
            .window(self.store.config().stale_time());
        let epoch = slot.epoch;
        let covers_invalidation = slot.entry.invalidated;
        let future = self.spawn_fetch(key.clone(), epoch, resolved.clone(), plan);

        slot.in_flight = Some(InFlight {
            future: future.clone(),
            covers_invalidation,
        });
        slot.refetch_on_settle = false;
        slot.entry.begin_loading();
        slot.publish();

        debug!(key = %key, fetch_key = %resolved.fetch_key, "Fetch started");
        Ok(Begin::Pending(future))
    }

    fn spawn_fetch(self: &Arc<Self>, key: KeyPath, epoch: u64, resolved: Resolved, plan: FetchPlan) -> SharedFetch {
        let coordinator = Arc::clone(self);
        let retry = resolved
            .definition
            .retry
            .unwrap_or_else(|| self.store.config().retry_policy());

        let handle = tokio::spawn(async move {
            let started_at = tokio::time::Instant::now();
            let outcome = AssertUnwindSafe(run_plan(&resolved, retry, plan))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(QueryError::aborted("fetch function panicked")))
                .map(Arc::new);

            let result = if outcome.is_ok() { "success" } else { "error" };
            histogram!(METRIC_FETCH_MS, "result" => result)
                .record(started_at.elapsed().as_secs_f64() * 1_000.0);

            coordinator.settle(&key, epoch, &outcome);
            outcome
        });

        async move {
            handle
                .await
                .unwrap_or_else(|err| Err(QueryError::aborted(err.to_string())))
        }
        .boxed()
        .shared()
    }

    /// Write a fetch outcome back, unless the slot was removed or reset
    /// since the fetch began.
    fn settle(self: &Arc<Self>, key: &KeyPath, epoch: u64, outcome: &Result<QueryData, QueryError>) {
        self.store.with_slots("settle_fetch", |slots| {
            let now = slots.now;
            let Some(slot) = slots.peek_mut(key) else {
                debug!(key = %key, "Fetch result discarded; key no longer cached");
                return;
            };
            if slot.epoch != epoch {
                debug!(key = %key, "Fetch result discarded; entry reset while in flight");
                return;
            }

            slot.in_flight = None;
            match outcome {
                Ok(data) => {
                    let stale_time = slot.stale_time;
                    slot.entry.record_data(Arc::clone(data), now, stale_time);
                }
                Err(error) => {
                    counter!(METRIC_FETCH_ERROR, "kind" => error.kind()).increment(1);
                    warn!(key = %key, error = %error, "Fetch failed");
                    slot.entry.record_error(error.clone());
                }
            }

            let follow_up = std::mem::take(&mut slot.refetch_on_settle);
            if follow_up {
                slot.entry.invalidated = true;
            }
            slot.publish();

            if follow_up && slot.entry.subscriber_count > 0 {
                debug!(key = %key, "Entry invalidated during fetch; refetching");
                if let Err(err) = self.begin_locked(slots, key, FetchMode::IfStale) {
                    warn!(key = %key, error = %err, "Follow-up fetch not started");
                }
            }
        });
    }
}

fn plan_for(kind: QueryKind, existing: Option<&Value>) -> FetchPlan {
    match kind {
        QueryKind::Single => FetchPlan::Single,
        QueryKind::Infinite(pagination) => FetchPlan::Pages {
            pagination,
            count: existing
                .and_then(InfinitePages::from_value)
                .map_or(1, |pages| pages.len().max(1)),
        },
    }
}

async fn run_plan(resolved: &Resolved, retry: RetryPolicy, plan: FetchPlan) -> Result<Value, QueryError> {
    let definition = &resolved.definition;
    let context = FetchContext::new(resolved.fetch_key.clone());

    match plan {
        FetchPlan::Single => fetch_with_retry(definition, context, retry).await,
        FetchPlan::Pages { pagination, count } => {
            let mut pages = InfinitePages::default();
            let mut param = pagination.initial_param();
            loop {
                let page =
                    fetch_with_retry(definition, context.clone().with_page_param(param.clone()), retry)
                        .await?;
                let next = pagination.next_param(&page);
                pages.push(page, param);
                match next {
                    Some(next) if pages.len() < count => param = Some(next),
                    _ => break,
                }
            }
            Ok(pages.to_value())
        }
        FetchPlan::Append {
            existing: mut pages,
            param,
        } => {
            let page =
                fetch_with_retry(definition, context.with_page_param(Some(param.clone())), retry).await?;
            pages.push(page, Some(param));
            Ok(pages.to_value())
        }
    }
}

async fn fetch_with_retry(
    definition: &QueryDefinition,
    context: FetchContext,
    retry: RetryPolicy,
) -> Result<Value, QueryError> {
    let mut attempt = 0;
    loop {
        match definition.fetcher.fetch(context.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                attempt += 1;
                counter!(METRIC_FETCH_RETRY).increment(1);
                warn!(
                    key = %context.key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient fetch failure; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::entry::QueryStatus;
    use crate::cache::registry::{Fetcher, KeyPattern, Staleness};

    fn key() -> KeyPath {
        KeyPath::root("regions").child("list")
    }

    fn coordinator_with(
        definition: impl FnOnce(KeyPattern) -> QueryDefinition,
    ) -> Arc<FetchCoordinator> {
        let registry = Arc::new(QueryRegistry::new());
        registry
            .register(definition(KeyPattern::new().exact("regions").exact("list")))
            .expect("register");
        FetchCoordinator::new(Arc::new(CacheStore::new(CacheConfig::default())), registry)
    }

    fn counting(calls: Arc<AtomicUsize>) -> Fetcher {
        Fetcher::from_fn(move |_ctx| {
            let calls = Arc::clone(&calls);
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!({ "call": call }))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_are_served_without_fetching() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(Arc::clone(&calls));
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));

        let first = coordinator.ensure_fresh(&key()).await.expect("first fetch");
        let second = coordinator.ensure_fresh(&key()).await.expect("cached");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(Arc::clone(&calls));
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));

        let (key_a, key_b) = (key(), key());
        let (a, b) = tokio::join!(coordinator.ensure_fresh(&key_a), coordinator.ensure_fresh(&key_b));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.expect("a"), b.expect("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_window_expiry_triggers_refetch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(Arc::clone(&calls));
        let coordinator = coordinator_with(|pattern| {
            QueryDefinition::new("regions", pattern, fetcher)
                .staleness(Staleness::After(Duration::from_secs(5)))
        });

        coordinator.ensure_fresh(&key()).await.expect("first");
        tokio::time::advance(Duration::from_secs(6)).await;
        let data = coordinator.ensure_fresh(&key()).await.expect("refetched");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*data, json!({"call": 2}));
    }

    #[tokio::test(start_paused = true)]
    async fn loading_preserves_previous_data() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(Arc::clone(&calls));
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));
        coordinator.ensure_fresh(&key()).await.expect("first");

        let pending = coordinator.start(&key(), FetchMode::Force).expect("begin");
        let entry = coordinator.store().read(&key());
        assert_eq!(entry.status, QueryStatus::Loading);
        assert_eq!(entry.data.as_deref(), Some(&json!({"call": 1})));

        pending.outcome().await.expect("refetch");
        assert_eq!(coordinator.store().read(&key()).status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::from_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(QueryError::network("connection reset")),
                    1 => Err(QueryError::server(503, "unavailable")),
                    _ => Ok(json!("ok")),
                }
            }
        });
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));

        let started = tokio::time::Instant::now();
        let data = coordinator.ensure_fresh(&key()).await.expect("third attempt succeeds");

        assert_eq!(*data, json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_settle_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let fetcher = Fetcher::from_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::authorization(403, "forbidden")) }
        });
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));

        let err = coordinator.ensure_fresh(&key()).await.expect_err("forbidden");

        assert_eq!(err, QueryError::authorization(403, "forbidden"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let entry = coordinator.store().read(&key());
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.error, Some(err));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_error() {
        let fetcher = Fetcher::from_fn(|_ctx| async { Err(QueryError::network("down")) });
        let coordinator = coordinator_with(|pattern| {
            QueryDefinition::new("regions", pattern, fetcher).retry(RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            })
        });

        let err = coordinator.ensure_fresh(&key()).await.expect_err("still down");
        assert!(err.is_retryable());
        assert_eq!(coordinator.store().read(&key()).status, QueryStatus::Error);
    }

    #[tokio::test]
    async fn unregistered_keys_record_an_error() {
        let coordinator = coordinator_with(|pattern| {
            QueryDefinition::new("regions", pattern, Fetcher::from_fn(|_ctx| async { Ok(json!([])) }))
        });
        let unknown = KeyPath::root("nowhere");

        let err = coordinator.ensure_fresh(&unknown).await.expect_err("unregistered");

        assert_eq!(err.kind(), "unregistered");
        assert_eq!(coordinator.store().read(&unknown).status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn infinite_queries_append_and_refetch_in_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let generation = Arc::new(AtomicUsize::new(0));
        let current = Arc::clone(&generation);
        let fetcher = Fetcher::from_fn(move |ctx: FetchContext| {
            let page = ctx.page_param.as_ref().and_then(Value::as_u64).unwrap_or(1);
            log.lock().expect("log").push(page);
            let id = page * 10 + current.load(Ordering::SeqCst) as u64;
            async move {
                Ok(json!({
                    "data": [{"id": id}],
                    "page": page,
                    "pages": 3,
                    "results": 3,
                }))
            }
        });
        let coordinator = coordinator_with(|pattern| {
            QueryDefinition::new("regions", pattern, fetcher).infinite(Pagination::PageNumber)
        });

        coordinator.ensure_fresh(&key()).await.expect("first page");
        let data = coordinator.fetch_next_page(&key()).await.expect("second page");
        let pages = InfinitePages::from_value(&data).expect("infinite layout");
        assert_eq!(pages.len(), 2);
        assert_eq!(pages.page_params, vec![json!(1), json!(2)]);

        generation.store(1, Ordering::SeqCst);
        let data = coordinator.refetch(&key()).await.expect("refetch");
        let pages = InfinitePages::from_value(&data).expect("infinite layout");
        let ids: Vec<_> = pages.items().filter_map(|item| item["id"].as_u64()).collect();

        assert_eq!(ids, vec![11, 21]);
        assert_eq!(*seen.lock().expect("log"), vec![1, 2, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn results_for_removed_keys_are_discarded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = counting(Arc::clone(&calls));
        let coordinator = coordinator_with(|pattern| QueryDefinition::new("regions", pattern, fetcher));

        let pending = coordinator.start(&key(), FetchMode::IfStale).expect("begin");
        coordinator.store().with_slots("test_remove", |slots| {
            slots.pop(&key());
        });

        let data = pending.outcome().await.expect("waiters still get the result");
        assert_eq!(*data, json!({"call": 1}));
        assert!(!coordinator.store().contains(&key()));
    }
}
