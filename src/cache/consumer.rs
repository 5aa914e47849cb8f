//! Event consumer for executing invalidation plans.
//!
//! Drains server events from the queue, merges them into a plan and applies
//! the plan to the store as one batch.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::CacheConfig;
use super::effects::{EffectSummary, apply_locked};
use super::events::EventQueue;
use super::fetcher::FetchCoordinator;
use super::planner::InvalidationPlan;

const METRIC_EVENT_CONSUME_MS: &str = "tessera_event_consume_ms";

/// Event consumer that keeps the store consistent with server-side changes.
///
/// The consumer:
/// 1. Drains events from the queue
/// 2. Generates an invalidation plan from the events
/// 3. Applies removals then invalidations under one store lock
pub struct EventConsumer {
    config: CacheConfig,
    fetcher: Arc<FetchCoordinator>,
    queue: Arc<EventQueue>,
}

impl EventConsumer {
    pub fn new(config: CacheConfig, fetcher: Arc<FetchCoordinator>, queue: Arc<EventQueue>) -> Self {
        Self {
            config,
            fetcher,
            queue,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns the number of events drained.
    #[instrument(skip(self))]
    pub fn consume(&self) -> usize {
        let consume_started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit.max(1));
        if events.is_empty() {
            return 0;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let plan = InvalidationPlan::from_events(events);

        info!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Event consumption starting"
        );

        let summary = if plan.is_empty() {
            debug!("Event batch carries no cache changes");
            EffectSummary::default()
        } else {
            let effects = plan.to_effects();
            self.fetcher
                .store()
                .with_slots("consume_events", |slots| apply_locked(&self.fetcher, slots, &effects))
        };

        info!(
            event_count,
            removed = summary.invalidation.removed,
            matched = summary.invalidation.matched,
            refetching = summary.invalidation.refetching,
            "Event consumption complete"
        );

        histogram!(METRIC_EVENT_CONSUME_MS)
            .record(consume_started_at.elapsed().as_secs_f64() * 1000.0);

        event_count
    }

    /// Consume batches until the queue is empty.
    pub fn consume_all(&self) -> usize {
        let mut total = 0;
        loop {
            let consumed = self.consume();
            if consumed == 0 {
                return total;
            }
            total += consumed;
        }
    }

    /// Get the underlying event queue.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}
