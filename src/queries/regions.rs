//! Regions. Reference data, fresh until invalidated.

use crate::cache::{EntityType, QueryRegistry, RegistryError, Staleness};
use crate::infra::api::ApiClient;

use super::collection::Collection;

pub const COLLECTION: Collection =
    Collection::new(EntityType::Region, "regions").with_staleness(Staleness::Never);

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register(registry, api)
}
