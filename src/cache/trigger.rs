//! Server event intake.
//!
//! Provides the high-level API for feeding server notifications into the
//! cache and consuming them immediately or later.

use std::sync::{Arc, Mutex};

use lru::LruCache;
use tessera_api_types::EventStatus;
use tracing::debug;

use super::config::CacheConfig;
use super::consumer::EventConsumer;
use super::events::{EventQueue, ServerEvent};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::trigger";

/// Entry point for server events.
///
/// Redelivered `(event id, status)` pairs are dropped before they reach the
/// queue; the window is bounded by `seen_events_limit`.
///
/// # Usage
///
/// ```ignore
/// // A volume finished resizing on another session:
/// invalidator.on_server_event(event);
/// ```
pub struct EventInvalidator {
    queue: Arc<EventQueue>,
    consumer: Arc<EventConsumer>,
    seen: Mutex<LruCache<(u64, EventStatus), ()>>,
}

impl EventInvalidator {
    pub fn new(config: &CacheConfig, queue: Arc<EventQueue>, consumer: Arc<EventConsumer>) -> Self {
        Self {
            queue,
            consumer,
            seen: Mutex::new(LruCache::new(config.seen_events_limit_non_zero())),
        }
    }

    /// Queue one event and consume it right away.
    ///
    /// Returns false when the event was a redelivery.
    pub fn on_server_event(&self, event: ServerEvent) -> bool {
        let accepted = self.enqueue(event);
        if accepted {
            self.consumer.consume_all();
        }
        accepted
    }

    /// Queue a batch and consume it as one plan where the batch limit allows.
    ///
    /// Returns the number of events accepted.
    pub fn on_server_events(&self, events: impl IntoIterator<Item = ServerEvent>) -> usize {
        let accepted = events
            .into_iter()
            .filter(|event| self.enqueue(event.clone()))
            .count();
        if accepted > 0 {
            self.consumer.consume_all();
        }
        accepted
    }

    /// Queue an event without consuming it.
    pub fn enqueue(&self, event: ServerEvent) -> bool {
        let delivery = (event.id, event.status);
        {
            let mut seen = mutex_lock(&self.seen, SOURCE, "enqueue");
            if seen.put(delivery, ()).is_some() {
                debug!(
                    server_event_id = event.id,
                    status = event.status.as_str(),
                    "Duplicate server event skipped"
                );
                return false;
            }
        }
        self.queue.publish(event);
        true
    }

    /// Get the underlying event queue.
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Get the underlying consumer.
    pub fn consumer(&self) -> &Arc<EventConsumer> {
        &self.consumer
    }
}
