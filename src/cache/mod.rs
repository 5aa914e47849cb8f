//! Tessera query cache.
//!
//! One [`CacheStore`] holds an entry per [`KeyPath`]. Three engines write to
//! it:
//!
//! - **[`FetchCoordinator`]**: coalesced, retried fetches through the
//!   definitions in the [`QueryRegistry`]
//! - **[`InvalidationEngine`]**: prefix invalidation and removal
//! - **[`MutationCoordinator`]**: remote writes with declarative effects and
//!   optimistic rollback
//!
//! Server events reach the store through the [`EventInvalidator`], fed by the
//! [`EventsPoller`] or by the embedding application.
//!
//! ## Configuration
//!
//! Runtime knobs come from the `[cache]` section of `tessera.toml`:
//!
//! ```toml
//! [cache]
//! stale_time_ms = 60000
//! gc_time_ms = 300000
//! max_entries = 1000
//! # ... see config.rs for all options
//! ```

mod config;
mod consumer;
mod effects;
mod entity;
mod entry;
mod error;
mod events;
mod fetcher;
mod invalidation;
mod keys;
mod lock;
mod mutation;
mod pages;
mod planner;
mod poller;
mod registry;
mod store;
mod subscription;
mod trigger;

pub use config::{CacheConfig, RetryPolicy};
pub use consumer::EventConsumer;
pub use effects::{
    EFFECT_TABLE, EffectContext, EffectRule, EffectSummary, EffectTable, EffectTemplate,
    MutationEffect, Operation, Updater, as_id, lookup,
};
pub use entity::{EntityType, PageRequest};
pub use entry::{CacheEntry, QueryData, QueryStatus};
pub use error::{QueryError, RegistryError};
pub use events::{
    CacheEvent, EntityRef, Epoch, EventAction, EventQueue, ServerEvent, UnmappedEvent,
};
pub use fetcher::FetchCoordinator;
pub(crate) use fetcher::FetchMode;
pub use invalidation::{InvalidationEngine, InvalidationReport};
pub use keys::{KeyPath, ParamValue, Params, Segment};
pub use mutation::{
    MutationCoordinator, MutationDefinition, MutationFn, MutationHandle, MutationOutcome,
    MutationState, MutationStatus, WriteFuture,
};
pub use pages::InfinitePages;
pub use planner::InvalidationPlan;
pub use poller::{EventSource, EventsPoller, PollReport, PollerConfig};
pub use registry::{
    FetchContext, FetchFuture, Fetcher, KeyMap, KeyPattern, Pagination, QueryDefinition, QueryFn,
    QueryKind, QueryRegistry, Resolved, Staleness,
};
pub use store::CacheStore;
pub use subscription::Subscription;
pub use trigger::EventInvalidator;
