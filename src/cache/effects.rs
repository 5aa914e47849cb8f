//! Mutation cache effects.
//!
//! A [`MutationEffect`] is one declarative change to the store. Which effects
//! follow a write is decided in one place, [`EFFECT_TABLE`], keyed by entity
//! type and operation; mutation definitions may add their own on top.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::entity::EntityType;
use super::fetcher::FetchCoordinator;
use super::invalidation::{InvalidationReport, Scope, invalidate_locked, remove_locked};
use super::keys::KeyPath;
use super::store::Slots;

type UpdateFn = dyn Fn(Option<&Value>) -> Option<Value> + Send + Sync;

/// Computes the next data of an entry from its current data. Returning
/// `None` leaves the entry untouched.
#[derive(Clone)]
pub struct Updater(Arc<UpdateFn>);

impl Updater {
    pub fn new(update: impl Fn(Option<&Value>) -> Option<Value> + Send + Sync + 'static) -> Self {
        Self(Arc::new(update))
    }

    /// Unconditionally store `value`.
    pub fn replace(value: Value) -> Self {
        Self::new(move |_| Some(value.clone()))
    }

    /// Shallow-merge the fields of `fields` into existing object data.
    pub fn merge(fields: Value) -> Self {
        Self::new(move |current| {
            let mut next = current?.clone();
            merge_fields(&mut next, &fields);
            Some(next)
        })
    }

    /// Merge `item` into every element with the same `id` inside list data:
    /// a bare array, a page envelope, or infinite pages.
    pub fn merge_item(item: Value) -> Self {
        Self::new(move |current| {
            let id = item.get("id")?;
            let mut next = current?.clone();
            merge_into_items(&mut next, id, &item).then_some(next)
        })
    }

    /// Drop every element with `id` from list data.
    pub fn remove_item(id: u64) -> Self {
        Self::new(move |current| {
            let mut next = current?.clone();
            remove_from_items(&mut next, id).then_some(next)
        })
    }

    pub fn apply(&self, current: Option<&Value>) -> Option<Value> {
        (self.0)(current)
    }
}

impl fmt::Debug for Updater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Updater(..)")
    }
}

fn merge_fields(target: &mut Value, fields: &Value) {
    match (target, fields) {
        (Value::Object(target), Value::Object(fields)) => {
            for (name, value) in fields {
                target.insert(name.clone(), value.clone());
            }
        }
        (target, fields) => *target = fields.clone(),
    }
}

fn merge_into_items(container: &mut Value, id: &Value, item: &Value) -> bool {
    match container {
        Value::Array(items) => {
            let mut changed = false;
            for entry in items.iter_mut().filter(|entry| entry.get("id") == Some(id)) {
                merge_fields(entry, item);
                changed = true;
            }
            changed
        }
        Value::Object(map) => {
            if let Some(data) = map.get_mut("data") {
                return merge_into_items(data, id, item);
            }
            match map.get_mut("pages") {
                Some(Value::Array(pages)) => pages
                    .iter_mut()
                    .fold(false, |changed, page| merge_into_items(page, id, item) || changed),
                _ => false,
            }
        }
        _ => false,
    }
}

fn remove_from_items(container: &mut Value, id: u64) -> bool {
    match container {
        Value::Array(items) => {
            let before = items.len();
            items.retain(|entry| entry.get("id").and_then(Value::as_u64) != Some(id));
            items.len() != before
        }
        Value::Object(map) => {
            if let Some(data) = map.get_mut("data") {
                return remove_from_items(data, id);
            }
            match map.get_mut("pages") {
                Some(Value::Array(pages)) => pages
                    .iter_mut()
                    .fold(false, |changed, page| remove_from_items(page, id) || changed),
                _ => false,
            }
        }
        _ => false,
    }
}

/// One change to the store.
#[derive(Debug, Clone)]
pub enum MutationEffect {
    /// Update one entry, creating it when absent.
    Patch { key: KeyPath, updater: Updater },
    /// Update every existing entry under `prefix`.
    PatchMatching { prefix: KeyPath, updater: Updater },
    Invalidate(KeyPath),
    InvalidateExact(KeyPath),
    Remove(KeyPath),
}

impl MutationEffect {
    pub fn patch(key: KeyPath, updater: Updater) -> Self {
        Self::Patch { key, updater }
    }

    pub fn patch_matching(prefix: KeyPath, updater: Updater) -> Self {
        Self::PatchMatching { prefix, updater }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Self::Patch { .. } | Self::PatchMatching { .. })
    }
}

impl fmt::Display for MutationEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch { key, .. } => write!(f, "patch({key})"),
            Self::PatchMatching { prefix, .. } => write!(f, "patch_matching({prefix})"),
            Self::Invalidate(prefix) => write!(f, "invalidate({prefix})"),
            Self::InvalidateExact(key) => write!(f, "invalidate_exact({key})"),
            Self::Remove(prefix) => write!(f, "remove({prefix})"),
        }
    }
}

/// Totals of one applied batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EffectSummary {
    pub patched: usize,
    pub invalidation: InvalidationReport,
}

/// Apply `effects` in order under the held store lock.
pub(crate) fn apply_locked(
    fetcher: &Arc<FetchCoordinator>,
    slots: &mut Slots<'_>,
    effects: &[MutationEffect],
) -> EffectSummary {
    let mut summary = EffectSummary::default();
    for effect in effects {
        match effect {
            MutationEffect::Patch { key, updater } => {
                summary.patched += usize::from(patch_locked(slots, key, updater, true));
            }
            MutationEffect::PatchMatching { prefix, updater } => {
                for key in slots.matching(prefix) {
                    summary.patched += usize::from(patch_locked(slots, &key, updater, false));
                }
            }
            MutationEffect::Invalidate(prefix) => {
                summary.invalidation += invalidate_locked(fetcher, slots, prefix, Scope::Prefix);
            }
            MutationEffect::InvalidateExact(key) => {
                summary.invalidation += invalidate_locked(fetcher, slots, key, Scope::Exact);
            }
            MutationEffect::Remove(prefix) => {
                summary.invalidation += remove_locked(slots, prefix);
            }
        }
    }
    summary
}

/// Write the updater's result as authoritative data. Any fetch in flight for
/// the key is detached so it cannot overwrite the patch.
fn patch_locked(slots: &mut Slots<'_>, key: &KeyPath, updater: &Updater, create: bool) -> bool {
    let current = slots.peek_mut(key).map(|slot| slot.entry.data.clone());
    if current.is_none() && !create {
        return false;
    }
    let Some(next) = updater.apply(current.flatten().as_deref()) else {
        return false;
    };

    let now = slots.now;
    let epoch = slots.next_epoch();
    let slot = slots.get_or_insert(key);
    slot.epoch = epoch;
    slot.in_flight = None;
    slot.refetch_on_settle = false;
    let stale_time = slot.stale_time;
    slot.entry.record_data(Arc::new(next), now, stale_time);
    slot.publish();
    true
}

/// Kind of write a mutation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Any other state-changing call (boot, resize, attach, ...).
    Action,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Action => "action",
        }
    }
}

/// Inputs available to effect templates.
#[derive(Debug, Clone, Copy)]
pub struct EffectContext<'a> {
    pub entity: EntityType,
    /// Id of the entity written.
    pub entity_id: Option<u64>,
    pub payload: &'a Value,
    /// Server response; absent on failure.
    pub response: Option<&'a Value>,
    /// Detail data cached before the write.
    pub previous: Option<&'a Value>,
}

impl EffectContext<'_> {
    /// Distinct ids found at `path` in the response, the payload, then the
    /// previously cached detail.
    pub fn ids_at(&self, path: &str) -> Vec<u64> {
        let mut ids = Vec::new();
        for source in [self.response, Some(self.payload), self.previous].into_iter().flatten() {
            if let Some(id) = lookup(source, path).and_then(as_id)
                && !ids.contains(&id)
            {
                ids.push(id);
            }
        }
        ids
    }
}

/// Read a dotted path; numeric components index arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Array(items) => part.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => current.get(part),
    })
}

/// Entity ids arrive as numbers, occasionally as numeric strings.
pub fn as_id(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|text| text.parse().ok()))
}

/// Effect shapes the table is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectTemplate {
    /// Store the response as the entity's detail.
    StoreDetail,
    /// Merge the response into copies of the entity inside cached lists.
    PatchListItems,
    InvalidateLists,
    /// Invalidate the detail and its sub-resources.
    InvalidateDetail,
    RemoveDetail,
    /// Invalidate the entity's lists scoped to each parent found at `field`.
    InvalidateParentScoped { parent: EntityType, field: &'static str },
    /// Invalidate the detail of each `entity` found at `field`.
    InvalidateRelated { entity: EntityType, field: &'static str },
    InvalidateRelatedLists(EntityType),
}

impl EffectTemplate {
    pub fn expand(self, ctx: &EffectContext<'_>) -> Vec<MutationEffect> {
        let entity = ctx.entity;
        match self {
            Self::StoreDetail => match (ctx.entity_id, ctx.response) {
                (Some(id), Some(response)) if response.get("id").is_some() => vec![MutationEffect::patch(
                    entity.detail_key(id),
                    Updater::replace(response.clone()),
                )],
                _ => Vec::new(),
            },
            Self::PatchListItems => match ctx.response {
                Some(response) if response.get("id").is_some() => vec![MutationEffect::patch_matching(
                    entity.list_key(),
                    Updater::merge_item(response.clone()),
                )],
                _ => Vec::new(),
            },
            Self::InvalidateLists => vec![MutationEffect::Invalidate(entity.list_key())],
            Self::InvalidateDetail => ctx
                .entity_id
                .map(|id| MutationEffect::Invalidate(entity.detail_key(id)))
                .into_iter()
                .collect(),
            Self::RemoveDetail => ctx
                .entity_id
                .map(|id| MutationEffect::Remove(entity.detail_key(id)))
                .into_iter()
                .collect(),
            Self::InvalidateParentScoped { parent, field } => ctx
                .ids_at(field)
                .into_iter()
                .map(|parent_id| MutationEffect::Invalidate(parent.scoped_list_key(parent_id, entity)))
                .collect(),
            Self::InvalidateRelated { entity: related, field } => ctx
                .ids_at(field)
                .into_iter()
                .map(|id| MutationEffect::Invalidate(related.detail_key(id)))
                .collect(),
            Self::InvalidateRelatedLists(related) => vec![MutationEffect::Invalidate(related.list_key())],
        }
    }
}

/// One row of [`EFFECT_TABLE`].
#[derive(Debug)]
pub struct EffectRule {
    pub entity: EntityType,
    pub operation: Operation,
    pub templates: &'static [EffectTemplate],
}

use EffectTemplate::{
    InvalidateDetail, InvalidateLists, InvalidateParentScoped, InvalidateRelated, InvalidateRelatedLists,
    PatchListItems, RemoveDetail, StoreDetail,
};

const VOLUME_PARENT: EffectTemplate = InvalidateParentScoped {
    parent: EntityType::Linode,
    field: "linode_id",
};
const LINODE_PLACEMENT_GROUP: EffectTemplate = InvalidateRelated {
    entity: EntityType::PlacementGroup,
    field: "placement_group.id",
};

/// Which namespaces each write implicates.
pub static EFFECT_TABLE: &[EffectRule] = &[
    EffectRule {
        entity: EntityType::Linode,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists, LINODE_PLACEMENT_GROUP, InvalidateRelatedLists(EntityType::Firewall)],
    },
    EffectRule {
        entity: EntityType::Linode,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Linode,
        operation: Operation::Delete,
        templates: &[
            RemoveDetail,
            InvalidateLists,
            LINODE_PLACEMENT_GROUP,
            InvalidateRelatedLists(EntityType::Volume),
            InvalidateRelatedLists(EntityType::Firewall),
        ],
    },
    EffectRule {
        entity: EntityType::Linode,
        operation: Operation::Action,
        templates: &[InvalidateDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Volume,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists, VOLUME_PARENT],
    },
    EffectRule {
        entity: EntityType::Volume,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists, VOLUME_PARENT],
    },
    EffectRule {
        entity: EntityType::Volume,
        operation: Operation::Delete,
        templates: &[RemoveDetail, InvalidateLists, VOLUME_PARENT],
    },
    EffectRule {
        entity: EntityType::Volume,
        operation: Operation::Action,
        templates: &[StoreDetail, InvalidateLists, VOLUME_PARENT],
    },
    EffectRule {
        entity: EntityType::Firewall,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Firewall,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Firewall,
        operation: Operation::Delete,
        templates: &[RemoveDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Firewall,
        operation: Operation::Action,
        templates: &[
            InvalidateDetail,
            InvalidateLists,
            InvalidateParentScoped {
                parent: EntityType::Linode,
                field: "linode_id",
            },
        ],
    },
    EffectRule {
        entity: EntityType::NodeBalancer,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists, InvalidateRelatedLists(EntityType::Firewall)],
    },
    EffectRule {
        entity: EntityType::NodeBalancer,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::NodeBalancer,
        operation: Operation::Delete,
        templates: &[RemoveDetail, InvalidateLists, InvalidateRelatedLists(EntityType::Firewall)],
    },
    EffectRule {
        entity: EntityType::NodeBalancer,
        operation: Operation::Action,
        templates: &[InvalidateDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Database,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Database,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Database,
        operation: Operation::Delete,
        templates: &[RemoveDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::Database,
        operation: Operation::Action,
        templates: &[InvalidateDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::PlacementGroup,
        operation: Operation::Create,
        templates: &[StoreDetail, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::PlacementGroup,
        operation: Operation::Update,
        templates: &[StoreDetail, PatchListItems, InvalidateLists],
    },
    EffectRule {
        entity: EntityType::PlacementGroup,
        operation: Operation::Delete,
        templates: &[RemoveDetail, InvalidateLists, InvalidateRelatedLists(EntityType::Linode)],
    },
    EffectRule {
        entity: EntityType::PlacementGroup,
        operation: Operation::Action,
        templates: &[
            InvalidateDetail,
            InvalidateLists,
            InvalidateRelated {
                entity: EntityType::Linode,
                field: "linodes.0",
            },
        ],
    },
];

/// Lookup over [`EFFECT_TABLE`].
pub struct EffectTable;

impl EffectTable {
    pub fn templates(entity: EntityType, operation: Operation) -> &'static [EffectTemplate] {
        EFFECT_TABLE
            .iter()
            .find(|rule| rule.entity == entity && rule.operation == operation)
            .map(|rule| rule.templates)
            .unwrap_or(&[])
    }

    pub fn expand(operation: Operation, ctx: &EffectContext<'_>) -> Vec<MutationEffect> {
        Self::templates(ctx.entity, operation)
            .iter()
            .flat_map(|template| template.expand(ctx))
            .collect()
    }
}
