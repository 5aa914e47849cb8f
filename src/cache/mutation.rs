//! Remote writes and their cache effects.
//!
//! A mutation runs in four steps:
//! 1. optional optimistic patches, applied after snapshotting every entry
//!    they touch;
//! 2. the remote write;
//! 3. on success, the snapshot is dropped and the effects derived from the
//!    server response are applied;
//! 4. on failure, the snapshot is restored as one batch and the error is
//!    returned.
//!
//! Mutations are never retried.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::effects::{
    EffectContext, EffectSummary, EffectTable, MutationEffect, Operation, apply_locked, as_id, lookup,
};
use super::entity::EntityType;
use super::entry::{CacheEntry, QueryStatus};
use super::error::QueryError;
use super::fetcher::{FetchCoordinator, FetchMode};
use super::keys::KeyPath;
use super::store::Slots;

const METRIC_MUTATION: &str = "tessera_mutation_total";
const METRIC_MUTATION_ROLLBACK: &str = "tessera_mutation_rollback_total";

pub type WriteFuture = BoxFuture<'static, Result<Value, QueryError>>;

/// The remote write of a mutation.
pub trait MutationFn: Send + Sync {
    fn write(&self, payload: Value) -> WriteFuture;
}

struct FnMutation<F>(F);

impl<F, Fut> MutationFn for FnMutation<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
{
    fn write(&self, payload: Value) -> WriteFuture {
        (self.0)(payload).boxed()
    }
}

/// Result of a successful write, handed to custom effect rules.
#[derive(Debug, Clone, Copy)]
pub struct MutationOutcome<'a> {
    pub payload: &'a Value,
    pub response: &'a Value,
    pub entity_id: Option<u64>,
}

type OptimisticRule = Arc<dyn Fn(&Value) -> Vec<MutationEffect> + Send + Sync>;
type EffectRuleFn = Arc<dyn Fn(&MutationOutcome<'_>) -> Vec<MutationEffect> + Send + Sync>;

/// A named write operation and how it affects the cache.
#[derive(Clone)]
pub struct MutationDefinition {
    pub id: &'static str,
    pub entity: EntityType,
    pub operation: Operation,
    /// Payload path of the id of the entity written.
    pub id_field: &'static str,
    write: Arc<dyn MutationFn>,
    optimistic: Option<OptimisticRule>,
    rules: Vec<EffectRuleFn>,
}

impl MutationDefinition {
    pub fn new(id: &'static str, entity: EntityType, operation: Operation, write: impl MutationFn + 'static) -> Self {
        Self {
            id,
            entity,
            operation,
            id_field: "id",
            write: Arc::new(write),
            optimistic: None,
            rules: Vec::new(),
        }
    }

    pub fn from_fn<F, Fut>(id: &'static str, entity: EntityType, operation: Operation, write: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        Self::new(id, entity, operation, FnMutation(write))
    }

    pub fn id_field(mut self, field: &'static str) -> Self {
        self.id_field = field;
        self
    }

    /// Patches applied before the write and rolled back if it fails. Only
    /// `Patch` and `PatchMatching` effects are honoured here.
    pub fn optimistic(
        mut self,
        rule: impl Fn(&Value) -> Vec<MutationEffect> + Send + Sync + 'static,
    ) -> Self {
        self.optimistic = Some(Arc::new(rule));
        self
    }

    /// Effects applied after a successful write, on top of the effect table.
    pub fn effect(
        mut self,
        rule: impl Fn(&MutationOutcome<'_>) -> Vec<MutationEffect> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(Arc::new(rule));
        self
    }

    pub fn has_optimistic(&self) -> bool {
        self.optimistic.is_some()
    }

    fn entity_id(&self, payload: &Value, response: Option<&Value>) -> Option<u64> {
        lookup(payload, self.id_field)
            .and_then(as_id)
            .or_else(|| response.and_then(|response| response.get("id")).and_then(as_id))
    }
}

impl fmt::Debug for MutationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDefinition")
            .field("id", &self.id)
            .field("entity", &self.entity)
            .field("operation", &self.operation)
            .field("optimistic", &self.optimistic.is_some())
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// Entries as they were before optimistic patches; `None` marks an absent key.
struct Snapshot {
    entries: Vec<(KeyPath, Option<(CacheEntry, Option<Duration>)>)>,
}

impl Snapshot {
    fn capture(slots: &mut Slots<'_>, effects: &[MutationEffect]) -> Self {
        let mut keys: Vec<KeyPath> = Vec::new();
        for effect in effects {
            match effect {
                MutationEffect::Patch { key, .. } => keys.push(key.clone()),
                MutationEffect::PatchMatching { prefix, .. } => keys.extend(slots.matching(prefix)),
                _ => {}
            }
        }
        keys.sort();
        keys.dedup();

        let entries = keys
            .into_iter()
            .map(|key| {
                let saved = slots
                    .peek_mut(&key)
                    .map(|slot| (slot.entry.clone(), slot.stale_time));
                (key, saved)
            })
            .collect();
        Self { entries }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Executes [`MutationDefinition`]s against the store.
pub struct MutationCoordinator {
    fetcher: Arc<FetchCoordinator>,
}

impl MutationCoordinator {
    pub fn new(fetcher: Arc<FetchCoordinator>) -> Self {
        Self { fetcher }
    }

    /// Run `definition` with `payload`. The error of a failed write is
    /// returned after any optimistic patch has been rolled back.
    #[instrument(skip(self, definition, payload), fields(operation = definition.id))]
    pub async fn mutate(&self, definition: &MutationDefinition, payload: Value) -> Result<Value, QueryError> {
        let store = self.fetcher.store();
        let entity_id = definition.entity_id(&payload, None);
        let previous = entity_id.and_then(|id| store.read(&definition.entity.detail_key(id)).data);

        let snapshot = definition
            .optimistic
            .as_ref()
            .map(|rule| self.apply_optimistic(definition, rule(&payload)));

        match definition.write.write(payload.clone()).await {
            Ok(response) => {
                counter!(METRIC_MUTATION, "operation" => definition.id, "result" => "success").increment(1);
                let entity_id = entity_id.or_else(|| definition.entity_id(&payload, Some(&response)));
                let ctx = EffectContext {
                    entity: definition.entity,
                    entity_id,
                    payload: &payload,
                    response: Some(&response),
                    previous: previous.as_deref(),
                };
                let outcome = MutationOutcome {
                    payload: &payload,
                    response: &response,
                    entity_id,
                };

                let mut effects = EffectTable::expand(definition.operation, &ctx);
                for rule in &definition.rules {
                    effects.extend(rule(&outcome));
                }
                let summary = self.apply(&effects);
                info!(
                    operation = definition.id,
                    entity_id,
                    effects = effects.len(),
                    patched = summary.patched,
                    invalidated = summary.invalidation.matched,
                    refetching = summary.invalidation.refetching,
                    removed = summary.invalidation.removed,
                    "Mutation applied"
                );
                Ok(response)
            }
            Err(error) => {
                counter!(METRIC_MUTATION, "operation" => definition.id, "result" => "error").increment(1);
                if let Some(snapshot) = snapshot {
                    let restored = snapshot.len();
                    self.rollback(snapshot);
                    counter!(METRIC_MUTATION_ROLLBACK, "operation" => definition.id).increment(1);
                    warn!(operation = definition.id, restored, error = %error, "Mutation failed; optimistic update rolled back");
                } else {
                    warn!(operation = definition.id, error = %error, "Mutation failed");
                }

                let effects = failure_effects(definition.entity, entity_id, &error);
                if !effects.is_empty() {
                    self.apply(&effects);
                }
                Err(error)
            }
        }
    }

    /// Apply `effects` as one batch.
    pub fn apply(&self, effects: &[MutationEffect]) -> EffectSummary {
        self.fetcher
            .store()
            .with_slots("apply_effects", |slots| apply_locked(&self.fetcher, slots, effects))
    }

    fn apply_optimistic(&self, definition: &MutationDefinition, effects: Vec<MutationEffect>) -> Snapshot {
        let (patches, ignored): (Vec<_>, Vec<_>) = effects.into_iter().partition(MutationEffect::is_patch);
        for effect in &ignored {
            warn!(operation = definition.id, %effect, "Only patches may be applied optimistically; skipped");
        }

        self.fetcher.store().with_slots("optimistic_patch", |slots| {
            let snapshot = Snapshot::capture(slots, &patches);
            let summary = apply_locked(&self.fetcher, slots, &patches);
            debug!(
                operation = definition.id,
                snapshot = snapshot.len(),
                patched = summary.patched,
                "Optimistic update applied"
            );
            snapshot
        })
    }

    /// Restore every snapshotted entry under one lock.
    fn rollback(&self, snapshot: Snapshot) {
        self.fetcher.store().with_slots("rollback", |slots| {
            for (key, saved) in snapshot.entries {
                match saved {
                    Some((entry, stale_time)) => {
                        let was_loading = entry.status == QueryStatus::Loading;
                        slots.restore(entry, stale_time);
                        // The patch detached the fetch that was in flight.
                        if was_loading
                            && let Err(err) = self.fetcher.begin_locked(slots, &key, FetchMode::Force)
                        {
                            warn!(key = %key, error = %err, "Fetch not resumed after rollback");
                        }
                    }
                    None => {
                        let epoch = slots.next_epoch();
                        let Some(slot) = slots.peek_mut(&key) else {
                            continue;
                        };
                        if slot.entry.subscriber_count == 0 {
                            slots.pop(&key);
                        } else {
                            slot.epoch = epoch;
                            slot.in_flight = None;
                            slot.entry.reset();
                            slot.publish();
                        }
                    }
                }
            }
        });
    }
}

/// Cache reaction to a failed write.
fn failure_effects(entity: EntityType, entity_id: Option<u64>, error: &QueryError) -> Vec<MutationEffect> {
    match error {
        QueryError::Conflict { .. } => vec![MutationEffect::Invalidate(entity.root())],
        QueryError::NotFound { .. } => entity_id
            .map(|id| MutationEffect::Remove(entity.detail_key(id)))
            .into_iter()
            .chain([MutationEffect::Invalidate(entity.list_key())])
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// Observable state of a [`MutationHandle`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
}

impl MutationState {
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

/// Reusable write primitive bound to one operation.
pub struct MutationHandle {
    coordinator: Arc<MutationCoordinator>,
    definition: Arc<MutationDefinition>,
    state: watch::Sender<MutationState>,
}

impl MutationHandle {
    pub fn new(coordinator: Arc<MutationCoordinator>, definition: Arc<MutationDefinition>) -> Self {
        let (state, _) = watch::channel(MutationState::default());
        Self {
            coordinator,
            definition,
            state,
        }
    }

    pub fn operation_id(&self) -> &'static str {
        self.definition.id
    }

    pub async fn mutate(&self, payload: Value) -> Result<Value, QueryError> {
        self.state.send_replace(MutationState {
            status: MutationStatus::Pending,
            data: None,
            error: None,
        });

        let result = self.coordinator.mutate(&self.definition, payload).await;
        self.state.send_replace(match &result {
            Ok(data) => MutationState {
                status: MutationStatus::Success,
                data: Some(data.clone()),
                error: None,
            },
            Err(error) => MutationState {
                status: MutationStatus::Error,
                data: None,
                error: Some(error.clone()),
            },
        });
        result
    }

    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    /// Back to `Idle`, forgetting the last result.
    pub fn reset(&self) {
        self.state.send_replace(MutationState::default());
    }
}

impl fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("operation", &self.definition.id)
            .field("status", &self.state.borrow().status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::config::CacheConfig;
    use crate::cache::effects::Updater;
    use crate::cache::entity::PageRequest;
    use crate::cache::registry::{Fetcher, KeyPattern, QueryRegistry, Staleness};
    use crate::cache::store::CacheStore;

    fn setup() -> (Arc<FetchCoordinator>, MutationCoordinator, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = Arc::new(QueryRegistry::new());
        registry
            .register_fn(
                "volumes",
                KeyPattern::new().exact("volumes").subtree(),
                Fetcher::from_fn(move |ctx| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let id = EntityType::id_of(&ctx.key).unwrap_or(0);
                    async move { Ok(json!({"id": id, "label": "fetched", "size": 20})) }
                }),
                Staleness::Never,
            )
            .expect("register");
        let fetcher = FetchCoordinator::new(Arc::new(CacheStore::new(CacheConfig::default())), registry);
        let mutations = MutationCoordinator::new(Arc::clone(&fetcher));
        (fetcher, mutations, calls)
    }

    fn rename(write: Result<Value, QueryError>) -> MutationDefinition {
        MutationDefinition::from_fn("volumes.update", EntityType::Volume, Operation::Update, move |_payload| {
            let write = write.clone();
            async move { write }
        })
        .optimistic(|payload| {
            let id = payload["id"].as_u64().unwrap_or_default();
            vec![
                MutationEffect::patch(
                    EntityType::Volume.detail_key(id),
                    Updater::merge(json!({"label": payload["label"].clone()})),
                ),
                MutationEffect::patch_matching(
                    EntityType::Volume.list_key(),
                    Updater::merge_item(json!({"id": id, "label": payload["label"].clone()})),
                ),
            ]
        })
    }

    #[tokio::test]
    async fn success_patches_from_server_response() {
        let (fetcher, mutations, _) = setup();
        let detail = EntityType::Volume.detail_key(7);
        fetcher.ensure_fresh(&detail).await.expect("detail");
        let _watching = fetcher.store().subscribe(&detail);

        let response = json!({"id": 7, "label": "server-label", "size": 20});
        mutations
            .mutate(&rename(Ok(response.clone())), json!({"id": 7, "label": "client-label"}))
            .await
            .expect("write succeeds");

        let entry = fetcher.store().read(&detail);
        assert_eq!(entry.data.as_deref(), Some(&response));
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.subscriber_count, 1);
    }

    #[tokio::test]
    async fn failure_restores_snapshot_exactly() {
        let (fetcher, mutations, _) = setup();
        let detail = EntityType::Volume.detail_key(7);
        let page = EntityType::Volume.paginated_key(&PageRequest::first());
        fetcher.ensure_fresh(&detail).await.expect("detail");
        fetcher.store().with_slots("seed_page", |slots| {
            let now = slots.now;
            let slot = slots.get_or_insert(&page);
            slot.entry.record_data(
                Arc::new(json!({"data": [{"id": 7, "label": "fetched"}], "page": 1, "pages": 1, "results": 1})),
                now,
                None,
            );
            slot.publish();
        });
        let before_detail = fetcher.store().read(&detail);
        let before_page = fetcher.store().read(&page);

        let definition = rename(Err(QueryError::validation(Vec::new())));
        let mut state = fetcher.store().subscribe(&detail);
        let mutation = mutations.mutate(&definition, json!({"id": 7, "label": "optimistic"}));
        let err = mutation.await.expect_err("write rejected");

        assert!(matches!(err, QueryError::Validation { .. }));
        let mut after_detail = fetcher.store().read(&detail);
        after_detail.subscriber_count = 0;
        assert_eq!(after_detail, before_detail);
        assert_eq!(fetcher.store().read(&page), before_page);
        assert_eq!(state.current().data, before_detail.data);
        state.changed().await.expect("rollback notified");
    }

    #[tokio::test]
    async fn optimistic_patch_is_visible_before_write_completes() {
        let (fetcher, mutations, _) = setup();
        let detail = EntityType::Volume.detail_key(7);
        fetcher.ensure_fresh(&detail).await.expect("detail");

        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));
        let definition = MutationDefinition::from_fn("volumes.update", EntityType::Volume, Operation::Update, move |_| {
            let gate = Arc::clone(&gate);
            async move {
                if let Some(gate) = gate.lock().await.take() {
                    let _ = gate.await;
                }
                Err(QueryError::server(500, "boom"))
            }
        })
        .optimistic(|payload| {
            vec![MutationEffect::patch(
                EntityType::Volume.detail_key(7),
                Updater::merge(payload.clone()),
            )]
        });

        let mutation = mutations.mutate(&definition, json!({"id": 7, "label": "optimistic"}));
        tokio::pin!(mutation);
        assert!(futures::poll!(&mut mutation).is_pending());
        assert_eq!(
            fetcher.store().read(&detail).data.as_deref().map(|data| data["label"].clone()),
            Some(json!("optimistic"))
        );

        release.send(()).expect("gate open");
        mutation.await.expect_err("server error");
        assert_eq!(
            fetcher.store().read(&detail).data.as_deref().map(|data| data["label"].clone()),
            Some(json!("fetched"))
        );
    }

    #[tokio::test]
    async fn rollback_drops_entries_created_optimistically() {
        let (fetcher, mutations, _) = setup();
        let detail = EntityType::Volume.detail_key(99);
        let definition = MutationDefinition::from_fn("volumes.create", EntityType::Volume, Operation::Create, |_| async {
            Err(QueryError::network("offline"))
        })
        .optimistic(|payload| vec![MutationEffect::patch(EntityType::Volume.detail_key(99), Updater::replace(payload.clone()))]);

        mutations
            .mutate(&definition, json!({"id": 99, "label": "draft"}))
            .await
            .expect_err("offline");

        assert!(!fetcher.store().contains(&detail));
    }

    #[tokio::test]
    async fn conflict_invalidates_namespace() {
        let (fetcher, mutations, calls) = setup();
        let detail = EntityType::Volume.detail_key(7);
        fetcher.ensure_fresh(&detail).await.expect("detail");
        let definition = MutationDefinition::from_fn("volumes.resize", EntityType::Volume, Operation::Action, |_| async {
            Err(QueryError::conflict("volume busy"))
        });

        mutations
            .mutate(&definition, json!({"id": 7, "size": 40}))
            .await
            .expect_err("conflict");

        assert!(fetcher.store().read(&detail).invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_removes_detail() {
        let (fetcher, mutations, _) = setup();
        let detail = EntityType::Volume.detail_key(7);
        fetcher.ensure_fresh(&detail).await.expect("detail");
        let definition = MutationDefinition::from_fn("volumes.delete", EntityType::Volume, Operation::Delete, |_| async {
            Err(QueryError::not_found("volume 7"))
        });

        mutations.mutate(&definition, json!({"id": 7})).await.expect_err("gone");

        assert!(!fetcher.store().contains(&detail));
    }

    #[tokio::test]
    async fn handle_tracks_status() {
        let (fetcher, mutations, _) = setup();
        let definition = Arc::new(MutationDefinition::from_fn(
            "volumes.create",
            EntityType::Volume,
            Operation::Create,
            |payload: Value| async move { Ok(json!({"id": 5, "label": payload["label"].clone()})) },
        ));
        let handle = MutationHandle::new(Arc::new(mutations), definition);
        assert_eq!(handle.state().status, MutationStatus::Idle);

        handle.mutate(json!({"label": "new"})).await.expect("created");

        let state = handle.state();
        assert_eq!(state.status, MutationStatus::Success);
        assert_eq!(state.data, Some(json!({"id": 5, "label": "new"})));
        assert_eq!(
            fetcher.store().read(&EntityType::Volume.detail_key(5)).data.as_deref(),
            Some(&json!({"id": 5, "label": "new"}))
        );

        handle.reset();
        assert_eq!(handle.state(), MutationState::default());
    }
}
