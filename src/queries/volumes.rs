//! Block storage volumes.

use crate::cache::{EntityType, MutationEffect, Operation, QueryRegistry, RegistryError};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write};
use super::linodes::label_patch;

pub const COLLECTION: Collection = Collection::new(EntityType::Volume, "volumes");

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        COLLECTION.mutation(api, "volumes.create", Operation::Create, Write::Post("volumes")),
        COLLECTION
            .mutation(api, "volumes.update", Operation::Update, Write::Put("volumes/{id}"))
            .optimistic(|payload| label_patch(EntityType::Volume, payload)),
        COLLECTION.mutation(api, "volumes.delete", Operation::Delete, Write::Delete("volumes/{id}")),
        COLLECTION.mutation(api, "volumes.attach", Operation::Action, Write::Post("volumes/{id}/attach")),
        // Detach answers with an empty body; the linode comes from the cached detail.
        COLLECTION
            .mutation(api, "volumes.detach", Operation::Action, Write::Post("volumes/{id}/detach"))
            .effect(|outcome| {
                outcome
                    .entity_id
                    .map(|id| MutationEffect::Invalidate(EntityType::Volume.detail_key(id)))
                    .into_iter()
                    .collect()
            }),
        COLLECTION.mutation(api, "volumes.resize", Operation::Action, Write::Post("volumes/{id}/resize")),
    ]);
}
