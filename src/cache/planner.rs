//! Invalidation plan generation.
//!
//! Merges a batch of server events into one set of removals and
//! invalidations.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use tessera_api_types::EventStatus;

use super::effects::MutationEffect;
use super::entity::EntityType;
use super::events::{CacheEvent, EntityRef, Epoch, EventAction};
use super::keys::KeyPath;

/// Removals and invalidations for one event batch.
///
/// Removals run first so a deleted entity's detail drops out before its
/// lists refetch.
#[derive(Debug, Default)]
pub struct InvalidationPlan {
    /// Prefixes to remove.
    pub remove: BTreeSet<KeyPath>,
    /// Prefixes to mark stale.
    pub invalidate: BTreeSet<KeyPath>,
    /// Progress events that carry no cache consequence.
    pub ignored: usize,
    /// Redeliveries within the batch.
    pub duplicates: usize,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ remove: {}, invalidate: {}, ignored: {}, duplicates: {} }}",
            self.remove.len(),
            self.invalidate.len(),
            self.ignored,
            self.duplicates,
        )
    }
}

impl InvalidationPlan {
    /// Merge a batch of events into a plan.
    ///
    /// - Deduplicates by queue id and by `(event id, status)`
    /// - Ignores events that are still in progress
    /// - Keeps the latest epoch per entity
    pub fn from_events(events: Vec<CacheEvent>) -> Self {
        let mut plan = Self::default();
        let mut seen_ids = HashSet::new();
        let mut seen_deliveries: HashSet<(u64, EventStatus)> = HashSet::new();
        let mut latest: HashMap<EntityRef, (Epoch, EventAction)> = HashMap::new();

        for queued in events {
            let event = &queued.event;
            if !seen_ids.insert(queued.id) || !seen_deliveries.insert((event.id, event.status)) {
                plan.duplicates += 1;
                continue;
            }
            if !event.is_terminal() {
                plan.ignored += 1;
                continue;
            }

            latest
                .entry(event.entity)
                .and_modify(|(epoch, action)| {
                    if queued.epoch > *epoch {
                        *epoch = queued.epoch;
                        *action = event.action;
                    }
                })
                .or_insert((queued.epoch, event.action));

            if let Some(secondary) = event.secondary {
                plan.invalidate.insert(entity_scope(secondary));
            }
        }

        for (entity, (_, action)) in latest {
            if !has_detail(entity.kind) {
                plan.invalidate.insert(entity.kind.root());
                continue;
            }
            let detail = entity.kind.detail_key(entity.id);
            if action == EventAction::Deleted {
                plan.invalidate.remove(&detail);
                plan.remove.insert(detail);
            } else {
                plan.invalidate.insert(detail);
            }
            plan.invalidate.insert(entity.kind.list_key());
        }

        // A removed prefix already covers anything below it.
        let removed: Vec<KeyPath> = plan.remove.iter().cloned().collect();
        plan.invalidate
            .retain(|key| !removed.iter().any(|prefix| prefix.is_ancestor_of(key)));

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.invalidate.is_empty()
    }

    /// The plan as one effect batch, removals first.
    pub fn to_effects(&self) -> Vec<MutationEffect> {
        self.remove
            .iter()
            .cloned()
            .map(MutationEffect::Remove)
            .chain(self.invalidate.iter().cloned().map(MutationEffect::Invalidate))
            .collect()
    }
}

fn has_detail(kind: EntityType) -> bool {
    !matches!(kind, EntityType::Account | EntityType::Region | EntityType::Event)
}

fn entity_scope(entity: EntityRef) -> KeyPath {
    if has_detail(entity.kind) {
        entity.kind.detail_key(entity.id)
    } else {
        entity.kind.root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::events::ServerEvent;

    fn queued(epoch: Epoch, event: ServerEvent) -> CacheEvent {
        CacheEvent::new(event, epoch)
    }

    fn volume(id: u64, event_id: u64, action: EventAction, status: EventStatus) -> ServerEvent {
        ServerEvent::new(event_id, EntityRef::new(EntityType::Volume, id), action, status)
    }

    #[test]
    fn empty_events_produce_empty_plan() {
        let plan = InvalidationPlan::from_events(vec![]);
        assert!(plan.is_empty());
    }

    #[test]
    fn terminal_update_invalidates_detail_and_lists() {
        let plan = InvalidationPlan::from_events(vec![queued(
            0,
            volume(7, 1, EventAction::Updated, EventStatus::Finished),
        )]);

        assert!(plan.remove.is_empty());
        assert!(plan.invalidate.contains(&EntityType::Volume.detail_key(7)));
        assert!(plan.invalidate.contains(&EntityType::Volume.list_key()));
    }

    #[test]
    fn progress_events_are_ignored() {
        let plan = InvalidationPlan::from_events(vec![
            queued(0, volume(7, 1, EventAction::Updated, EventStatus::Scheduled)),
            queued(1, volume(7, 1, EventAction::Updated, EventStatus::Started)),
        ]);

        assert!(plan.is_empty());
        assert_eq!(plan.ignored, 2);
    }

    #[test]
    fn failed_and_notification_events_are_terminal() {
        let plan = InvalidationPlan::from_events(vec![
            queued(0, volume(7, 1, EventAction::Updated, EventStatus::Failed)),
            queued(1, volume(8, 2, EventAction::Updated, EventStatus::Notification)),
        ]);

        assert!(plan.invalidate.contains(&EntityType::Volume.detail_key(7)));
        assert!(plan.invalidate.contains(&EntityType::Volume.detail_key(8)));
    }

    #[test]
    fn deletion_removes_detail() {
        let plan = InvalidationPlan::from_events(vec![queued(
            0,
            volume(7, 1, EventAction::Deleted, EventStatus::Finished),
        )]);

        assert!(plan.remove.contains(&EntityType::Volume.detail_key(7)));
        assert!(!plan.invalidate.contains(&EntityType::Volume.detail_key(7)));
        assert!(plan.invalidate.contains(&EntityType::Volume.list_key()));
    }

    #[test]
    fn latest_epoch_wins_per_entity() {
        let plan = InvalidationPlan::from_events(vec![
            queued(5, volume(7, 2, EventAction::Updated, EventStatus::Finished)),
            queued(3, volume(7, 1, EventAction::Deleted, EventStatus::Finished)),
        ]);

        assert!(plan.remove.is_empty());
        assert!(plan.invalidate.contains(&EntityType::Volume.detail_key(7)));
    }

    #[test]
    fn redelivered_events_are_counted_once() {
        let plan = InvalidationPlan::from_events(vec![
            queued(0, volume(7, 1, EventAction::Updated, EventStatus::Finished)),
            queued(1, volume(7, 1, EventAction::Updated, EventStatus::Finished)),
        ]);

        assert_eq!(plan.duplicates, 1);
        assert_eq!(plan.invalidate.len(), 2);
    }

    #[test]
    fn secondary_entity_detail_is_invalidated() {
        let event = volume(7, 1, EventAction::StatusChanged, EventStatus::Finished)
            .with_secondary(EntityRef::new(EntityType::Linode, 42));
        let plan = InvalidationPlan::from_events(vec![queued(0, event)]);

        assert!(plan.invalidate.contains(&EntityType::Linode.detail_key(42)));
    }

    #[test]
    fn entities_without_detail_invalidate_namespace() {
        let event = ServerEvent::new(
            1,
            EntityRef::new(EntityType::Account, 0),
            EventAction::Updated,
            EventStatus::Notification,
        );
        let plan = InvalidationPlan::from_events(vec![queued(0, event)]);

        assert_eq!(
            plan.invalidate.iter().collect::<Vec<_>>(),
            vec![&EntityType::Account.root()]
        );
    }

    #[test]
    fn effects_put_removals_first() {
        let plan = InvalidationPlan::from_events(vec![
            queued(0, volume(7, 1, EventAction::Deleted, EventStatus::Finished)),
            queued(1, volume(8, 2, EventAction::Updated, EventStatus::Finished)),
        ]);

        let effects = plan.to_effects();
        assert!(matches!(effects.first(), Some(MutationEffect::Remove(_))));
        assert_eq!(effects.iter().filter(|e| matches!(e, MutationEffect::Remove(_))).count(), 1);
    }

    #[test]
    fn plan_display() {
        let plan = InvalidationPlan::from_events(vec![queued(
            0,
            volume(7, 1, EventAction::Updated, EventStatus::Finished),
        )]);
        let display = plan.to_string();
        assert!(display.contains("InvalidationPlan"));
        assert!(display.contains("invalidate: 2"));
    }
}
