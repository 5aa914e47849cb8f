//! Server event model and the in-memory event queue.
//!
//! Server notifications arrive out of band (the account events feed, or a
//! push channel supplied by the embedding application) and are queued here
//! until the consumer turns them into invalidations.

use std::collections::VecDeque;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use tessera_api_types::{AccountEvent, EventEntity, EventStatus};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::entity::EntityType;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

const METRIC_EVENT_QUEUE_LEN: &str = "tessera_event_queue_len";
const METRIC_EVENT_DROPPED: &str = "tessera_event_dropped_total";

/// Monotonic epoch for ordering events.
///
/// Each queued event gets a unique, monotonically increasing epoch. The
/// planner uses it to decide which event is the latest for an entity when a
/// batch carries several.
pub type Epoch = u64;

/// What happened to the entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    /// Power or lifecycle transitions (boot, shutdown, resize, migrate).
    StatusChanged,
}

impl EventAction {
    const STATUS_SUFFIXES: [&'static str; 8] = [
        "_boot",
        "_reboot",
        "_shutdown",
        "_resize",
        "_migrate",
        "_rebuild",
        "_attach",
        "_detach",
    ];

    /// Classify an API action name such as `linode_create` or `volume_attach`.
    pub fn from_api_action(action: &str) -> Self {
        if action.ends_with("_create") {
            Self::Created
        } else if action.ends_with("_delete") {
            Self::Deleted
        } else if Self::STATUS_SUFFIXES
            .iter()
            .any(|suffix| action.ends_with(suffix))
        {
            Self::StatusChanged
        } else {
            Self::Updated
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::StatusChanged => "status_changed",
        }
    }
}

/// An entity referenced by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityType,
    pub id: u64,
}

impl EntityRef {
    pub fn new(kind: EntityType, id: u64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.api_type(), self.id)
    }
}

/// A server notification about one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    /// Server-assigned id; with `status` it identifies a delivery.
    pub id: u64,
    pub entity: EntityRef,
    pub action: EventAction,
    pub status: EventStatus,
    /// Another entity the event touches, such as the linode a volume was
    /// attached to.
    pub secondary: Option<EntityRef>,
    pub timestamp: OffsetDateTime,
}

impl ServerEvent {
    pub fn new(id: u64, entity: EntityRef, action: EventAction, status: EventStatus) -> Self {
        Self {
            id,
            entity,
            action,
            status,
            secondary: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_secondary(mut self, secondary: EntityRef) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// An account event that names no entity the cache knows about.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("event {event_id} ({action}) has no cacheable entity")]
pub struct UnmappedEvent {
    pub event_id: u64,
    pub action: String,
}

fn entity_ref(entity: &EventEntity) -> Option<EntityRef> {
    EntityType::from_api_type(&entity.kind).map(|kind| EntityRef::new(kind, entity.id))
}

impl TryFrom<&AccountEvent> for ServerEvent {
    type Error = UnmappedEvent;

    fn try_from(event: &AccountEvent) -> Result<Self, Self::Error> {
        let entity = event
            .entity
            .as_ref()
            .and_then(entity_ref)
            .ok_or_else(|| UnmappedEvent {
                event_id: event.id,
                action: event.action.clone(),
            })?;

        Ok(Self {
            id: event.id,
            entity,
            action: EventAction::from_api_action(&event.action),
            status: event.status,
            secondary: event.secondary_entity.as_ref().and_then(entity_ref),
            timestamp: event.created,
        })
    }
}

/// A queued server event.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Queue identity (UUIDv4); a redelivered server event gets a new one.
    pub id: Uuid,
    /// Monotonic epoch for ordering within this process.
    pub epoch: Epoch,
    pub event: ServerEvent,
    pub received_at: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(event: ServerEvent, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            event,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// In-memory FIFO of server events awaiting consumption.
///
/// When a limit is set and the queue is full, the oldest event is dropped to
/// make room; dropped events are counted and logged.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: Option<NonZeroUsize>,
    dropped: AtomicU64,
}

impl EventQueue {
    /// Create an unbounded queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: None,
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a queue holding at most `limit` pending events.
    pub fn new_with_limit(limit: NonZeroUsize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new()
        }
    }

    /// Get the next epoch number.
    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Enqueue `event`, returning its queue id.
    pub fn publish(&self, event: ServerEvent) -> Uuid {
        let epoch = self.next_epoch();
        let queued = CacheEvent::new(event, epoch);
        let id = queued.id;

        info!(
            event_id = %id,
            event_epoch = epoch,
            server_event_id = queued.event.id,
            entity = %queued.event.entity,
            action = queued.event.action.as_str(),
            status = queued.event.status.as_str(),
            "Cache event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        if let Some(limit) = self.limit {
            while queue.len() >= limit.get() {
                let Some(oldest) = queue.pop_front() else {
                    break;
                };
                self.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_EVENT_DROPPED).increment(1);
                warn!(
                    event_id = %oldest.id,
                    event_epoch = oldest.epoch,
                    limit = limit.get(),
                    "Event queue full, dropped oldest event"
                );
            }
        }
        queue.push_back(queued);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        id
    }

    /// Drain up to `limit` events from the queue.
    ///
    /// Returns the events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained: Vec<_> = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    /// Get the current queue length.
    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Clear all events from the queue.
    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
