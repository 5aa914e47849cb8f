//! Downstream facade over the cache engines.
//!
//! [`QueryClient`] owns one [`CacheStore`] and the engines that write to it.
//! UI code reads through [`QueryClient::use_query`], which returns a
//! [`QueryObserver`], and writes through [`QueryClient::use_mutation`].

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::{
    CacheConfig, CacheEntry, CacheStore, EventConsumer, EventInvalidator, EventQueue, EventSource,
    EventsPoller, FetchCoordinator, InvalidationEngine, InvalidationReport, KeyPath,
    MutationCoordinator, MutationDefinition, MutationEffect, MutationHandle, PollerConfig,
    QueryData, QueryError, QueryRegistry, QueryStatus, RegistryError, ServerEvent, Subscription,
};
use crate::cache::{EffectSummary, FetchMode};
use crate::infra::api::ApiClient;
use crate::queries::{self, MutationCatalog};

/// What a UI component sees of one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub data: Option<QueryData>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    pub is_stale: bool,
    pub is_fetching: bool,
}

impl QueryState {
    pub fn from_entry(entry: &CacheEntry, now: Instant) -> Self {
        Self {
            data: entry.data.clone(),
            status: entry.status,
            error: entry.error.clone(),
            is_stale: entry.data.is_some() && entry.is_stale(now),
            is_fetching: entry.is_fetching(),
        }
    }

    /// First load: nothing to show yet.
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && matches!(self.status, QueryStatus::Idle | QueryStatus::Loading)
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, QueryStatus::Success | QueryStatus::Error)
    }
}

/// A live query. Dropping it releases the subscription.
pub struct QueryObserver {
    fetcher: Arc<FetchCoordinator>,
    subscription: Subscription,
}

impl QueryObserver {
    pub fn key(&self) -> &KeyPath {
        self.subscription.key()
    }

    pub fn state(&self) -> QueryState {
        QueryState::from_entry(&self.subscription.current(), Instant::now())
    }

    /// Next state transition; `None` once the entry has been dropped.
    pub async fn changed(&mut self) -> Option<QueryState> {
        let entry = self.subscription.changed().await?;
        Some(QueryState::from_entry(&entry, Instant::now()))
    }

    /// Wait for the current fetch, if any, to settle.
    pub async fn settled(&mut self) -> Option<QueryState> {
        let entry = self
            .subscription
            .wait_for(|entry| matches!(entry.status, QueryStatus::Success | QueryStatus::Error))
            .await?;
        Some(QueryState::from_entry(&entry, Instant::now()))
    }

    pub async fn refetch(&self) -> Result<QueryData, QueryError> {
        self.fetcher.refetch(self.key()).await
    }

    /// Append the next page; only meaningful for infinite queries.
    pub async fn fetch_next_page(&self) -> Result<QueryData, QueryError> {
        self.fetcher.fetch_next_page(self.key()).await
    }

    pub fn dispose(self) {
        self.subscription.dispose();
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("key", self.key())
            .finish()
    }
}

/// Entry point for reads, writes and server events against one store.
#[derive(Clone)]
pub struct QueryClient {
    config: CacheConfig,
    store: Arc<CacheStore>,
    fetcher: Arc<FetchCoordinator>,
    invalidation: Arc<InvalidationEngine>,
    mutations: Arc<MutationCoordinator>,
    catalog: Arc<MutationCatalog>,
    invalidator: Arc<EventInvalidator>,
}

impl QueryClient {
    pub fn new(config: CacheConfig, registry: Arc<QueryRegistry>, catalog: MutationCatalog) -> Self {
        let store = Arc::new(CacheStore::new(config.clone()));
        let fetcher = FetchCoordinator::new(Arc::clone(&store), registry);
        let invalidation = Arc::new(InvalidationEngine::new(Arc::clone(&fetcher)));
        let mutations = Arc::new(MutationCoordinator::new(Arc::clone(&fetcher)));

        let queue = Arc::new(EventQueue::new_with_limit(config.event_queue_limit_non_zero()));
        let consumer = Arc::new(EventConsumer::new(
            config.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&queue),
        ));
        let invalidator = Arc::new(EventInvalidator::new(&config, queue, consumer));

        Self {
            config,
            store,
            fetcher,
            invalidation,
            mutations,
            catalog: Arc::new(catalog),
            invalidator,
        }
    }

    /// Client with every API domain registered against `api`.
    pub fn with_defaults(config: CacheConfig, api: &ApiClient) -> Result<Self, RegistryError> {
        let registry = QueryRegistry::new();
        queries::register_defaults(&registry, api)?;
        info!(
            domains = registry.domains().len(),
            definitions = registry.len(),
            "Query definitions registered"
        );
        Ok(Self::new(config, Arc::new(registry), queries::default_mutations(api)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn fetcher(&self) -> &Arc<FetchCoordinator> {
        &self.fetcher
    }

    pub fn registry(&self) -> &Arc<QueryRegistry> {
        self.fetcher.registry()
    }

    pub fn catalog(&self) -> &MutationCatalog {
        &self.catalog
    }

    pub fn invalidator(&self) -> &Arc<EventInvalidator> {
        &self.invalidator
    }

    /// Subscribe to `key` and fetch it unless fresh data is cached.
    ///
    /// Must be called inside a tokio runtime. A key without a definition
    /// surfaces as an `Error` state on the observer.
    pub fn use_query(&self, key: &KeyPath) -> QueryObserver {
        let subscription = self.store.subscribe(key);
        if let Err(err) = self.fetcher.start(key, FetchMode::IfStale) {
            debug!(key = %key, error = %err, "Query observer started without a fetch");
        }
        QueryObserver {
            fetcher: Arc::clone(&self.fetcher),
            subscription,
        }
    }

    /// Handle for the catalog operation `operation_id`.
    pub fn use_mutation(&self, operation_id: &str) -> Result<MutationHandle, RegistryError> {
        let definition = self
            .catalog
            .get(operation_id)
            .ok_or_else(|| RegistryError::Unresolved {
                key: operation_id.to_string(),
            })?;
        Ok(MutationHandle::new(Arc::clone(&self.mutations), definition))
    }

    /// Handle for a definition outside the catalog.
    pub fn use_mutation_with(&self, definition: MutationDefinition) -> MutationHandle {
        MutationHandle::new(Arc::clone(&self.mutations), Arc::new(definition))
    }

    pub async fn mutate(&self, definition: &MutationDefinition, payload: Value) -> Result<Value, QueryError> {
        self.mutations.mutate(definition, payload).await
    }

    /// Apply `effects` as one batch, outside any mutation.
    pub fn apply_effects(&self, effects: &[MutationEffect]) -> EffectSummary {
        self.mutations.apply(effects)
    }

    pub fn read(&self, key: &KeyPath) -> CacheEntry {
        self.store.read(key)
    }

    pub async fn ensure_fresh(&self, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.fetcher.ensure_fresh(key).await
    }

    pub async fn refetch(&self, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.fetcher.refetch(key).await
    }

    pub async fn fetch_next_page(&self, key: &KeyPath) -> Result<QueryData, QueryError> {
        self.fetcher.fetch_next_page(key).await
    }

    pub fn invalidate(&self, prefix: &KeyPath) -> InvalidationReport {
        self.invalidation.invalidate(prefix)
    }

    pub fn invalidate_exact(&self, key: &KeyPath) -> InvalidationReport {
        self.invalidation.invalidate_exact(key)
    }

    pub fn remove(&self, prefix: &KeyPath) -> InvalidationReport {
        self.invalidation.remove(prefix)
    }

    /// Refetch subscribed entries that went stale, e.g. when the window
    /// regains focus.
    pub fn refetch_stale_subscribed(&self) -> usize {
        self.fetcher.refetch_stale_subscribed()
    }

    pub fn collect_garbage(&self) -> usize {
        self.store.collect_garbage()
    }

    pub fn on_server_event(&self, event: ServerEvent) -> bool {
        self.invalidator.on_server_event(event)
    }

    pub fn on_server_events(&self, events: impl IntoIterator<Item = ServerEvent>) -> usize {
        self.invalidator.on_server_events(events)
    }

    /// Poller feeding account events from `source` into this client.
    pub fn events_poller(&self, source: Arc<dyn EventSource>, config: PollerConfig) -> Arc<EventsPoller> {
        Arc::new(EventsPoller::new(
            source,
            Arc::clone(&self.invalidator),
            Arc::clone(&self.mutations),
            config,
        ))
    }

    /// Run garbage collection every `gc_interval` until aborted.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.config.gc_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = store.collect_garbage();
                if evicted > 0 {
                    debug!(evicted, remaining = store.len(), "Cache maintenance pass");
                }
            }
        })
    }
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("entries", &self.store.len())
            .field("mutations", &self.catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::{EntityType, Fetcher, KeyPattern, Staleness};

    fn client(calls: Arc<AtomicUsize>) -> QueryClient {
        let registry = QueryRegistry::new();
        registry
            .register_fn(
                "volumes",
                KeyPattern::new().exact("volumes").any("detail"),
                Fetcher::from_fn(move |ctx| {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(json!({"id": EntityType::id_of(&ctx.key), "label": "db"}))
                    }
                }),
                Staleness::Default,
            )
            .expect("register");
        QueryClient::new(CacheConfig::default(), Arc::new(registry), MutationCatalog::new())
    }

    #[tokio::test]
    async fn observer_loads_then_serves_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = client(Arc::clone(&calls));
        let key = EntityType::Volume.detail_key(7);

        let mut first = client.use_query(&key);
        let state = first.settled().await.expect("settles");
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data.as_deref(), Some(&json!({"id": 7, "label": "db"})));

        let second = client.use_query(&key);
        assert_eq!(second.state().status, QueryStatus::Success);
        assert!(!second.state().is_fetching);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.read(&key).subscriber_count, 2);
    }

    #[tokio::test]
    async fn unknown_key_surfaces_as_error_state() {
        let client = client(Arc::new(AtomicUsize::new(0)));

        let observer = client.use_query(&EntityType::Region.list_key());

        let state = observer.state();
        assert_eq!(state.status, QueryStatus::Error);
        assert!(matches!(state.error, Some(QueryError::Unregistered { .. })));
    }

    #[tokio::test]
    async fn unknown_operation_is_rejected() {
        let client = client(Arc::new(AtomicUsize::new(0)));
        assert!(client.use_mutation("volumes.teleport").is_err());
    }

    #[tokio::test]
    async fn dropping_observer_releases_subscription() {
        let client = client(Arc::new(AtomicUsize::new(0)));
        let key = EntityType::Volume.detail_key(9);

        let mut observer = client.use_query(&key);
        observer.settled().await.expect("settles");
        drop(observer);

        assert_eq!(client.read(&key).subscriber_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_data_is_flagged_but_kept() {
        let client = client(Arc::new(AtomicUsize::new(0)));
        let key = EntityType::Volume.detail_key(7);
        client.ensure_fresh(&key).await.expect("fetch");

        tokio::time::advance(client.config().stale_time() + Duration::from_millis(1)).await;

        let state = QueryState::from_entry(&client.read(&key), Instant::now());
        assert!(state.is_stale);
        assert!(state.data.is_some());
        assert!(!state.is_loading());
    }
}
