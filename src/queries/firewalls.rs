//! Cloud firewalls, their rules and their devices.

use serde_json::Value;

use crate::cache::{
    EntityType, KeyPath, MutationEffect, MutationOutcome, Operation, PageRequest, QueryRegistry,
    RegistryError, Staleness, Updater,
};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write, register_document, register_scoped_pages, scoped_pages_key};
use super::linodes::label_patch;

pub const COLLECTION: Collection = Collection::new(EntityType::Firewall, "networking/firewalls");

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)?;
    register_scoped_pages(
        registry,
        api,
        EntityType::Firewall,
        "devices",
        "networking/firewalls/{id}/devices",
    )?;
    register_document(
        registry,
        api,
        EntityType::Firewall,
        "rules",
        "networking/firewalls/{id}/rules",
        Staleness::Default,
    )
}

pub fn devices_key(firewall_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::Firewall, firewall_id, "devices", request)
}

pub fn rules_key(firewall_id: u64) -> KeyPath {
    EntityType::Firewall.detail_key(firewall_id).child("rules")
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        COLLECTION.mutation(api, "firewalls.create", Operation::Create, Write::Post("networking/firewalls")),
        COLLECTION
            .mutation(api, "firewalls.update", Operation::Update, Write::Put("networking/firewalls/{id}"))
            .optimistic(|payload| label_patch(EntityType::Firewall, payload)),
        COLLECTION.mutation(api, "firewalls.delete", Operation::Delete, Write::Delete("networking/firewalls/{id}")),
        COLLECTION
            .mutation(api, "firewalls.rules.update", Operation::Update, Write::Put("networking/firewalls/{id}/rules"))
            .optimistic(rules_patch)
            .effect(store_rules),
        // Payload: `{firewall_id, id, type}` where `id` is the device entity.
        COLLECTION
            .mutation(
                api,
                "firewalls.devices.add",
                Operation::Action,
                Write::Post("networking/firewalls/{firewall_id}/devices"),
            )
            .id_field("firewall_id")
            .effect(invalidate_device_owner),
        // Payload: `{firewall_id, device_id}`, plus `linode_id` to refresh
        // that linode's firewall list.
        COLLECTION
            .mutation(
                api,
                "firewalls.devices.remove",
                Operation::Action,
                Write::Delete("networking/firewalls/{firewall_id}/devices/{device_id}"),
            )
            .id_field("firewall_id"),
    ]);
}

/// New rules replace the cached ones while the write is pending.
fn rules_patch(payload: &Value) -> Vec<MutationEffect> {
    let Some(id) = payload.get("id").and_then(Value::as_u64) else {
        return Vec::new();
    };
    let mut rules = payload.clone();
    if let Value::Object(fields) = &mut rules {
        fields.remove("id");
    }
    vec![MutationEffect::patch(rules_key(id), Updater::replace(rules))]
}

fn store_rules(outcome: &MutationOutcome<'_>) -> Vec<MutationEffect> {
    outcome
        .entity_id
        .map(|id| MutationEffect::patch(rules_key(id), Updater::replace(outcome.response.clone())))
        .into_iter()
        .collect()
}

/// A linode gaining a firewall has its firewall list refreshed.
fn invalidate_device_owner(outcome: &MutationOutcome<'_>) -> Vec<MutationEffect> {
    let entity = outcome.response.get("entity").unwrap_or(outcome.payload);
    let is_linode = entity.get("type").and_then(Value::as_str) == Some(EntityType::Linode.api_type());
    match entity.get("id").and_then(Value::as_u64) {
        Some(linode_id) if is_linode => vec![MutationEffect::Invalidate(
            EntityType::Linode.scoped_list_key(linode_id, EntityType::Firewall),
        )],
        _ => Vec::new(),
    }
}
