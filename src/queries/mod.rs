//! Query definitions and mutations for every API domain.
//!
//! [`register_defaults`] fills a [`QueryRegistry`] with the definitions of
//! all domains; [`default_mutations`] builds the operation catalog behind
//! `use_mutation`.

pub mod account;
mod catalog;
pub mod collection;
pub mod databases;
pub mod events;
pub mod firewalls;
pub mod linodes;
pub mod nodebalancers;
pub mod placement_groups;
pub mod regions;
pub mod volumes;

pub use catalog::MutationCatalog;
pub use collection::{Collection, Write};

use crate::cache::{QueryRegistry, RegistryError};
use crate::infra::api::ApiClient;

/// Register every domain's definitions.
pub fn register_defaults(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    account::register(registry, api)?;
    regions::register(registry, api)?;
    // Scoped linode volumes delegate to the volumes list.
    volumes::register(registry, api)?;
    linodes::register(registry, api)?;
    firewalls::register(registry, api)?;
    databases::register(registry, api)?;
    nodebalancers::register(registry, api)?;
    placement_groups::register(registry, api)?;
    events::register(registry, api)
}

/// Every mutation of every domain.
pub fn default_mutations(api: &ApiClient) -> MutationCatalog {
    let mut catalog = MutationCatalog::new();
    account::mutations(api, &mut catalog);
    linodes::mutations(api, &mut catalog);
    volumes::mutations(api, &mut catalog);
    firewalls::mutations(api, &mut catalog);
    databases::mutations(api, &mut catalog);
    nodebalancers::mutations(api, &mut catalog);
    placement_groups::mutations(api, &mut catalog);
    events::mutations(api, &mut catalog);
    catalog
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::cache::{EntityType, PageRequest, Staleness};

    fn api() -> ApiClient {
        let base = Url::parse("http://localhost:9/v4/").expect("url");
        ApiClient::build(base, None, Duration::from_secs(1)).expect("client")
    }

    fn registry() -> QueryRegistry {
        let registry = QueryRegistry::new();
        register_defaults(&registry, &api()).expect("defaults register without conflicts");
        registry
    }

    #[test]
    fn every_entity_view_resolves() {
        let registry = registry();
        let request = PageRequest::first().with_filter(json!({"region": "us-east"}));

        for entity in EntityType::ALL {
            if matches!(entity, EntityType::Account | EntityType::Event) {
                continue;
            }
            for key in [
                entity.paginated_key(&request),
                entity.all_key(&json!(null)),
                entity.infinite_key(&json!(null)),
                entity.detail_key(7),
            ] {
                assert!(registry.resolve(&key).is_ok(), "{key} should resolve");
            }
        }
    }

    #[test]
    fn sub_resources_resolve() {
        let registry = registry();
        let request = PageRequest::first();

        for key in [
            linodes::configs_key(42, &request),
            linodes::disks_key(42, &request),
            linodes::firewalls_key(42, &request),
            linodes::ips_key(42),
            linodes::stats_key(42),
            firewalls::devices_key(3, &request),
            firewalls::rules_key(3),
            nodebalancers::configs_key(5, &request),
            account::account_key(),
            account::settings_key(),
            account::notifications_key(&request),
            events::feed_key(&json!(null)),
            EntityType::Event.detail_key(900),
        ] {
            assert!(registry.resolve(&key).is_ok(), "{key} should resolve");
        }
    }

    #[test]
    fn scoped_volumes_delegate_to_volume_list() {
        let registry = registry();

        let resolved = registry
            .resolve(&linodes::volumes_key(42, &PageRequest::first()))
            .expect("resolves");

        assert_eq!(resolved.definition.domain, "volumes");
        assert_eq!(
            resolved.fetch_key,
            EntityType::Volume.paginated_key(&PageRequest::first().with_filter(json!({"linode_id": 42})))
        );
    }

    #[test]
    fn regions_and_events_never_go_stale() {
        let registry = registry();

        let region = registry.resolve(&EntityType::Region.detail_key(1)).expect("region");
        let feed = registry.resolve(&events::feed_key(&json!(null))).expect("events");

        assert_eq!(region.definition.staleness, Staleness::Never);
        assert_eq!(feed.definition.staleness, Staleness::Never);
    }

    #[test]
    fn catalog_covers_every_write() {
        let catalog = default_mutations(&api());

        for id in [
            "linodes.create",
            "linodes.update",
            "linodes.delete",
            "linodes.boot",
            "linodes.reboot",
            "linodes.shutdown",
            "linodes.resize",
            "volumes.attach",
            "volumes.detach",
            "volumes.resize",
            "firewalls.rules.update",
            "firewalls.devices.add",
            "firewalls.devices.remove",
            "placement_groups.assign",
        ] {
            assert!(catalog.contains(id), "missing {id}");
        }
        assert!(catalog.get("linodes.update").is_some_and(|definition| definition.has_optimistic()));
        assert!(catalog.get("volumes.update").is_some_and(|definition| definition.has_optimistic()));
        assert!(catalog.get("firewalls.rules.update").is_some_and(|definition| definition.has_optimistic()));
    }
}
