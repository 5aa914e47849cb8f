//! Linode instances and their sub-resources.

use std::time::Duration;

use serde_json::{Value, json};

use crate::cache::{
    EntityType, KeyPath, KeyPattern, MutationDefinition, MutationEffect, Operation, PageRequest,
    QueryRegistry, RegistryError, Staleness, Updater,
};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{
    Collection, Write, page_request, register_document, register_scoped_pages, scoped_pages_key,
};

pub const COLLECTION: Collection = Collection::new(EntityType::Linode, "linode/instances");

const STATS_STALE_TIME: Duration = Duration::from_secs(5 * 60);

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)?;

    for (name, template) in [
        ("configs", "linode/instances/{id}/configs"),
        ("disks", "linode/instances/{id}/disks"),
        ("firewalls", "linode/instances/{id}/firewalls"),
    ] {
        register_scoped_pages(registry, api, EntityType::Linode, name, template)?;
    }
    register_document(registry, api, EntityType::Linode, "ips", "linode/instances/{id}/ips", Staleness::Default)?;
    register_document(registry, api, EntityType::Linode, "backups", "linode/instances/{id}/backups", Staleness::Default)?;
    register_document(
        registry,
        api,
        EntityType::Linode,
        "stats",
        "linode/instances/{id}/stats",
        Staleness::After(STATS_STALE_TIME),
    )?;

    // Volumes attached to a linode are the volumes list filtered by linode.
    registry.delegate(
        EntityType::Linode.namespace(),
        KeyPattern::new()
            .exact(EntityType::Linode.namespace())
            .any("detail")
            .exact(EntityType::Volume.namespace())
            .any("paginated"),
        KeyPattern::new()
            .exact(EntityType::Volume.namespace())
            .exact("list")
            .any("paginated"),
        scoped_volumes_to_list,
    )
}

/// `linodes.detail{id=N}.volumes.paginated{..}` → `volumes.list.paginated{..}`
/// filtered by `linode_id = N`.
fn scoped_volumes_to_list(key: &KeyPath) -> KeyPath {
    let request = page_request(key);
    let mut filter = match request.filter {
        Value::Object(fields) => fields,
        _ => Default::default(),
    };
    if let Some(linode_id) = EntityType::id_of(key) {
        filter.insert("linode_id".to_string(), json!(linode_id));
    }
    let request = PageRequest::new(request.page, request.page_size).with_filter(Value::Object(filter));
    EntityType::Volume.paginated_key(&request)
}

pub fn configs_key(linode_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::Linode, linode_id, "configs", request)
}

pub fn disks_key(linode_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::Linode, linode_id, "disks", request)
}

pub fn firewalls_key(linode_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::Linode, linode_id, "firewalls", request)
}

pub fn volumes_key(linode_id: u64, request: &PageRequest) -> KeyPath {
    EntityType::Linode.scoped_paginated_key(linode_id, EntityType::Volume, request)
}

pub fn ips_key(linode_id: u64) -> KeyPath {
    EntityType::Linode.detail_key(linode_id).child("ips")
}

pub fn backups_key(linode_id: u64) -> KeyPath {
    EntityType::Linode.detail_key(linode_id).child("backups")
}

pub fn stats_key(linode_id: u64) -> KeyPath {
    EntityType::Linode.detail_key(linode_id).child("stats")
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    let entity = EntityType::Linode;
    catalog.extend([
        COLLECTION.mutation(api, "linodes.create", Operation::Create, Write::Post("linode/instances")),
        COLLECTION
            .mutation(api, "linodes.update", Operation::Update, Write::Put("linode/instances/{id}"))
            .optimistic(move |payload| label_patch(entity, payload)),
        COLLECTION.mutation(api, "linodes.delete", Operation::Delete, Write::Delete("linode/instances/{id}")),
        power_action(api, "linodes.boot", "linode/instances/{id}/boot", "booting"),
        power_action(api, "linodes.reboot", "linode/instances/{id}/reboot", "rebooting"),
        power_action(api, "linodes.shutdown", "linode/instances/{id}/shutdown", "shutting_down"),
        COLLECTION.mutation(api, "linodes.resize", Operation::Action, Write::Post("linode/instances/{id}/resize")),
    ]);
}

/// Boot, reboot and shutdown show the transitional status right away.
fn power_action(
    api: &ApiClient,
    id: &'static str,
    template: &'static str,
    status: &'static str,
) -> MutationDefinition {
    COLLECTION
        .mutation(api, id, Operation::Action, Write::Post(template))
        .optimistic(move |payload| {
            let Some(linode_id) = payload.get("id").and_then(Value::as_u64) else {
                return Vec::new();
            };
            let fields = json!({"id": linode_id, "status": status});
            vec![
                MutationEffect::patch(EntityType::Linode.detail_key(linode_id), Updater::merge(fields.clone())),
                MutationEffect::patch_matching(EntityType::Linode.list_key(), Updater::merge_item(fields)),
            ]
        })
}

/// Label and tag edits are shown before the server confirms them.
pub(crate) fn label_patch(entity: EntityType, payload: &Value) -> Vec<MutationEffect> {
    let Some(id) = payload.get("id").and_then(Value::as_u64) else {
        return Vec::new();
    };
    let mut fields = payload.clone();
    if let Value::Object(map) = &mut fields {
        map.retain(|name, _| matches!(name.as_str(), "id" | "label" | "tags"));
    }
    if fields.as_object().is_none_or(|map| map.len() < 2) {
        return Vec::new();
    }
    vec![
        MutationEffect::patch(entity.detail_key(id), Updater::merge(fields.clone())),
        MutationEffect::patch_matching(entity.list_key(), Updater::merge_item(fields)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_volumes_map_to_filtered_list() {
        let scoped = volumes_key(42, &PageRequest::new(2, 50).with_filter(json!({"region": "us-east"})));

        let mapped = scoped_volumes_to_list(&scoped);

        let expected = EntityType::Volume.paginated_key(
            &PageRequest::new(2, 50).with_filter(json!({"region": "us-east", "linode_id": 42})),
        );
        assert_eq!(mapped, expected);
    }

    #[test]
    fn label_patch_touches_detail_and_lists() {
        let effects = label_patch(EntityType::Linode, &json!({"id": 7, "label": "web-2", "type": "g6-standard-2"}));

        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].to_string(), "patch(linodes.detail{id=7})");
        assert_eq!(effects[1].to_string(), "patch_matching(linodes.list)");
    }

    #[test]
    fn label_patch_needs_an_editable_field() {
        assert!(label_patch(EntityType::Linode, &json!({"id": 7, "type": "g6-standard-2"})).is_empty());
        assert!(label_patch(EntityType::Linode, &json!({"label": "web"})).is_empty());
    }
}
