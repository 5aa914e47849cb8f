//! NodeBalancers and their configs.

use crate::cache::{EntityType, KeyPath, Operation, PageRequest, QueryRegistry, RegistryError};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write, register_scoped_pages, scoped_pages_key};

pub const COLLECTION: Collection = Collection::new(EntityType::NodeBalancer, "nodebalancers");

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)?;
    register_scoped_pages(registry, api, EntityType::NodeBalancer, "configs", "nodebalancers/{id}/configs")?;
    register_scoped_pages(registry, api, EntityType::NodeBalancer, "firewalls", "nodebalancers/{id}/firewalls")
}

pub fn configs_key(nodebalancer_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::NodeBalancer, nodebalancer_id, "configs", request)
}

pub fn firewalls_key(nodebalancer_id: u64, request: &PageRequest) -> KeyPath {
    scoped_pages_key(EntityType::NodeBalancer, nodebalancer_id, "firewalls", request)
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        COLLECTION.mutation(api, "nodebalancers.create", Operation::Create, Write::Post("nodebalancers")),
        COLLECTION.mutation(api, "nodebalancers.update", Operation::Update, Write::Put("nodebalancers/{id}")),
        COLLECTION.mutation(api, "nodebalancers.delete", Operation::Delete, Write::Delete("nodebalancers/{id}")),
        // Config writes are actions on the balancer.
        COLLECTION.mutation(
            api,
            "nodebalancers.configs.create",
            Operation::Action,
            Write::Post("nodebalancers/{id}/configs"),
        ),
        COLLECTION.mutation(
            api,
            "nodebalancers.configs.delete",
            Operation::Action,
            Write::Delete("nodebalancers/{id}/configs/{config_id}"),
        ),
    ]);
}
