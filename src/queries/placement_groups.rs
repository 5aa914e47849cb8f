//! Placement groups.

use crate::cache::{EntityType, Operation, QueryRegistry, RegistryError};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write};

pub const COLLECTION: Collection = Collection::new(EntityType::PlacementGroup, "placement/groups");

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        COLLECTION.mutation(api, "placement_groups.create", Operation::Create, Write::Post("placement/groups")),
        COLLECTION.mutation(api, "placement_groups.update", Operation::Update, Write::Put("placement/groups/{id}")),
        COLLECTION.mutation(api, "placement_groups.delete", Operation::Delete, Write::Delete("placement/groups/{id}")),
        // Payload: `{id, linodes: [linode ids]}`.
        COLLECTION.mutation(api, "placement_groups.assign", Operation::Action, Write::Post("placement/groups/{id}/assign")),
        COLLECTION.mutation(
            api,
            "placement_groups.unassign",
            Operation::Action,
            Write::Post("placement/groups/{id}/unassign"),
        ),
    ]);
}
