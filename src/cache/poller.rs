//! Account events polling.
//!
//! Polls the account events feed and hands new or newly finished events to
//! the [`EventInvalidator`]. The cadence tightens while any event is still in
//! progress so its completion is picked up quickly.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tessera_api_types::AccountEvent;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::effects::{MutationEffect, Updater};
use super::entity::EntityType;
use super::error::QueryError;
use super::events::ServerEvent;
use super::lock::mutex_lock;
use super::mutation::MutationCoordinator;
use super::pages::InfinitePages;
use super::trigger::EventInvalidator;

const SOURCE: &str = "cache::poller";

const DEFAULT_INTERVAL_MS: u64 = 16_000;
const DEFAULT_FAST_INTERVAL_MS: u64 = 2_000;

/// Where account events come from.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events with an id greater than `after_id`, or the most recent page
    /// when `after_id` is `None`.
    async fn events_since(&self, after_id: Option<u64>) -> Result<Vec<AccountEvent>, QueryError>;

    /// Current state of one event.
    async fn event(&self, id: u64) -> Result<AccountEvent, QueryError>;
}

/// Poller cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_ms: u64,
    /// Used while any tracked event is still in progress.
    pub fast_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
            fast_interval_ms: DEFAULT_FAST_INTERVAL_MS,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Events returned by the source, including re-polled ones.
    pub received: usize,
    /// Events accepted by the invalidator.
    pub dispatched: usize,
    /// Events still in progress after this poll.
    pub in_progress: usize,
}

#[derive(Debug, Default)]
struct PollState {
    /// Highest event id seen; `None` until the first poll sets the baseline.
    last_seen: Option<u64>,
    in_progress: BTreeSet<u64>,
}

pub struct EventsPoller {
    source: Arc<dyn EventSource>,
    invalidator: Arc<EventInvalidator>,
    mutations: Arc<MutationCoordinator>,
    config: PollerConfig,
    state: Mutex<PollState>,
}

impl EventsPoller {
    pub fn new(
        source: Arc<dyn EventSource>,
        invalidator: Arc<EventInvalidator>,
        mutations: Arc<MutationCoordinator>,
        config: PollerConfig,
    ) -> Self {
        Self {
            source,
            invalidator,
            mutations,
            config,
            state: Mutex::new(PollState::default()),
        }
    }

    /// Delay before the next poll.
    pub fn next_delay(&self) -> Duration {
        let busy = !mutex_lock(&self.state, SOURCE, "next_delay")
            .in_progress
            .is_empty();
        let ms = if busy {
            self.config.fast_interval_ms
        } else {
            self.config.interval_ms
        };
        Duration::from_millis(ms.max(1))
    }

    /// Poll once.
    ///
    /// The first poll only records a baseline: events that finished before
    /// it are not replayed, but events still running are tracked.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PollReport, QueryError> {
        let (after, tracked) = {
            let state = mutex_lock(&self.state, SOURCE, "poll_once");
            (state.last_seen, state.in_progress.iter().copied().collect::<Vec<_>>())
        };

        let mut fresh = self.source.events_since(after).await?;
        let mut repolled = Vec::with_capacity(tracked.len());
        for id in tracked {
            if fresh.iter().any(|event| event.id == id) {
                continue;
            }
            match self.source.event(id).await {
                Ok(event) => repolled.push(event),
                Err(QueryError::NotFound { .. }) => {
                    debug!(server_event_id = id, "Tracked event disappeared");
                    mutex_lock(&self.state, SOURCE, "poll_once").in_progress.remove(&id);
                }
                Err(err) => return Err(err),
            }
        }
        fresh.sort_by_key(|event| event.id);

        let baseline = after.is_none();
        let mut report = PollReport {
            received: fresh.len() + repolled.len(),
            ..Default::default()
        };
        {
            let mut state = mutex_lock(&self.state, SOURCE, "poll_once");
            if let Some(max) = fresh.iter().map(|event| event.id).max() {
                state.last_seen = Some(state.last_seen.map_or(max, |seen| seen.max(max)));
            } else if baseline {
                state.last_seen = Some(0);
            }
            for event in fresh.iter().chain(&repolled) {
                if event.is_in_progress() {
                    state.in_progress.insert(event.id);
                } else {
                    state.in_progress.remove(&event.id);
                }
            }
            report.in_progress = state.in_progress.len();
        }

        if !baseline && !fresh.is_empty() {
            self.prepend_to_feed(&fresh);
        }

        let dispatch: Vec<ServerEvent> = fresh
            .iter()
            .filter(|event| !baseline || event.is_in_progress())
            .chain(&repolled)
            .filter_map(|event| match ServerEvent::try_from(event) {
                Ok(mapped) => Some(mapped),
                Err(unmapped) => {
                    debug!(error = %unmapped, "Event skipped");
                    None
                }
            })
            .collect();
        report.dispatched = self.invalidator.on_server_events(dispatch);

        if report.received > 0 {
            info!(
                received = report.received,
                dispatched = report.dispatched,
                in_progress = report.in_progress,
                "Account events polled"
            );
        }
        Ok(report)
    }

    /// Newest events go to the front of every loaded events feed.
    fn prepend_to_feed(&self, events: &[AccountEvent]) {
        let items: Vec<Value> = events
            .iter()
            .rev()
            .filter_map(|event| serde_json::to_value(event).ok())
            .collect();
        let effect = MutationEffect::patch_matching(
            EntityType::Event.list_key(),
            Updater::new(move |current| prepend_items(current?, &items)),
        );
        self.mutations.apply(&[effect]);
    }

    /// Poll until the task is aborted. Errors are logged and retried on the
    /// regular cadence.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(err) = self.poll_once().await {
                    warn!(error = %err, "Account events poll failed");
                }
                tokio::time::sleep(self.next_delay()).await;
            }
        })
    }
}

fn prepend_items(current: &Value, items: &[Value]) -> Option<Value> {
    let mut pages = InfinitePages::from_value(current)?;
    let first = pages.pages.first_mut()?.get_mut("data")?.as_array_mut()?;
    let known: BTreeSet<u64> = first
        .iter()
        .filter_map(|item| item.get("id").and_then(Value::as_u64))
        .collect();
    let mut added: Vec<Value> = items
        .iter()
        .filter(|item| {
            item.get("id")
                .and_then(Value::as_u64)
                .is_some_and(|id| !known.contains(&id))
        })
        .cloned()
        .collect();
    if added.is_empty() {
        return None;
    }
    added.append(first);
    *first = added;
    Some(pages.to_value())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use tessera_api_types::EventStatus;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::consumer::EventConsumer;
    use crate::cache::events::EventQueue;
    use crate::cache::fetcher::FetchCoordinator;
    use crate::cache::registry::{Fetcher, KeyPattern, QueryRegistry, Staleness};
    use crate::cache::store::CacheStore;

    #[derive(Default)]
    struct ScriptedSource {
        feed: Mutex<Vec<AccountEvent>>,
        by_id: Mutex<HashMap<u64, AccountEvent>>,
    }

    impl ScriptedSource {
        fn push(&self, event: AccountEvent) {
            self.by_id
                .lock()
                .expect("lock")
                .insert(event.id, event.clone());
            self.feed.lock().expect("lock").push(event);
        }

        fn update(&self, event: AccountEvent) {
            self.by_id.lock().expect("lock").insert(event.id, event);
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn events_since(&self, after_id: Option<u64>) -> Result<Vec<AccountEvent>, QueryError> {
            let feed = self.feed.lock().expect("lock");
            Ok(feed
                .iter()
                .filter(|event| after_id.is_none_or(|after| event.id > after))
                .cloned()
                .collect())
        }

        async fn event(&self, id: u64) -> Result<AccountEvent, QueryError> {
            self.by_id
                .lock()
                .expect("lock")
                .get(&id)
                .cloned()
                .ok_or_else(|| QueryError::not_found(format!("event {id}")))
        }
    }

    fn account_event(id: u64, action: &str, status: EventStatus, volume: u64) -> AccountEvent {
        serde_json::from_value(json!({
            "id": id,
            "action": action,
            "status": status,
            "entity": {"id": volume, "type": "volume"},
            "created": "2024-05-01T10:00:00"
        }))
        .expect("event")
    }

    struct Harness {
        poller: EventsPoller,
        source: Arc<ScriptedSource>,
        fetcher: Arc<FetchCoordinator>,
    }

    fn harness() -> Harness {
        let config = CacheConfig::default();
        let registry = Arc::new(QueryRegistry::new());
        registry
            .register_fn(
                "volumes",
                KeyPattern::new().exact("volumes").subtree(),
                Fetcher::from_fn(|_ctx| async { Ok(json!({"id": 7})) }),
                Staleness::Never,
            )
            .expect("register");
        let fetcher = FetchCoordinator::new(Arc::new(CacheStore::new(config.clone())), registry);
        let queue = Arc::new(EventQueue::new());
        let consumer = Arc::new(EventConsumer::new(
            config.clone(),
            Arc::clone(&fetcher),
            Arc::clone(&queue),
        ));
        let invalidator = Arc::new(EventInvalidator::new(&config, queue, consumer));
        let source = Arc::new(ScriptedSource::default());
        let poller = EventsPoller::new(
            Arc::clone(&source) as Arc<dyn EventSource>,
            invalidator,
            Arc::new(MutationCoordinator::new(Arc::clone(&fetcher))),
            PollerConfig::default(),
        );
        Harness {
            poller,
            source,
            fetcher,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_poll_sets_baseline_without_replay() {
        let h = harness();
        let detail = EntityType::Volume.detail_key(7);
        h.fetcher.ensure_fresh(&detail).await.expect("detail");
        h.source
            .push(account_event(10, "volume_update", EventStatus::Finished, 7));

        let report = h.poller.poll_once().await.expect("poll");

        assert_eq!(report.received, 1);
        assert_eq!(report.dispatched, 0);
        assert!(!h.fetcher.store().read(&detail).invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn new_terminal_event_invalidates() {
        let h = harness();
        let detail = EntityType::Volume.detail_key(7);
        h.poller.poll_once().await.expect("baseline");
        h.fetcher.ensure_fresh(&detail).await.expect("detail");

        h.source
            .push(account_event(11, "volume_resize", EventStatus::Finished, 7));
        let report = h.poller.poll_once().await.expect("poll");

        assert_eq!(report.dispatched, 1);
        assert!(h.fetcher.store().read(&detail).invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_events_are_repolled_until_finished() {
        let h = harness();
        let detail = EntityType::Volume.detail_key(7);
        h.poller.poll_once().await.expect("baseline");
        h.fetcher.ensure_fresh(&detail).await.expect("detail");

        h.source
            .push(account_event(12, "volume_resize", EventStatus::Started, 7));
        let report = h.poller.poll_once().await.expect("started");
        assert_eq!(report.in_progress, 1);
        assert_eq!(h.poller.next_delay(), Duration::from_secs(2));
        assert!(!h.fetcher.store().read(&detail).invalidated);

        h.source
            .update(account_event(12, "volume_resize", EventStatus::Finished, 7));
        let report = h.poller.poll_once().await.expect("finished");

        assert_eq!(report.in_progress, 0);
        assert_eq!(h.poller.next_delay(), Duration::from_secs(16));
        assert!(h.fetcher.store().read(&detail).invalidated);
    }

    #[test]
    fn prepend_skips_known_events() {
        let mut pages = InfinitePages::default();
        pages.push(json!({"data": [{"id": 5}], "page": 1, "pages": 1}), None);

        let next = prepend_items(&pages.to_value(), &[json!({"id": 6}), json!({"id": 5})])
            .expect("changed");
        let ids: Vec<_> = InfinitePages::from_value(&next)
            .expect("layout")
            .items()
            .filter_map(|item| item["id"].as_u64())
            .collect();
        assert_eq!(ids, vec![6, 5]);

        assert!(prepend_items(&next, &[json!({"id": 6})]).is_none());
    }
}
