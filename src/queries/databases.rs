//! Managed databases.
//!
//! Instances live under an engine-specific path (`databases/mysql/instances`),
//! so the detail is looked up through the engine-agnostic list instead.
//! Writes take the engine from the `engine_type` payload field.

use serde_json::{Value, json};

use crate::cache::{
    EntityType, FetchContext, Fetcher, Operation, PageRequest, QueryError, QueryRegistry,
    RegistryError,
};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write};

pub const COLLECTION: Collection = Collection::new(EntityType::Database, "databases/instances");

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    COLLECTION.register_lists(registry, api)?;
    COLLECTION.register_detail(registry, detail_by_filter(api))
}

fn detail_by_filter(api: &ApiClient) -> Fetcher {
    let api = api.clone();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let id = EntityType::id_of(&ctx.key);
        async move {
            let id = id.ok_or_else(|| QueryError::not_found(format!("`{}` has no database id", ctx.key)))?;
            let request = PageRequest::new(1, 1).with_filter(json!({ "id": id }));
            let page = api.get_page(COLLECTION.path, &request).await?;
            first_item(&page).ok_or_else(|| QueryError::not_found(format!("database {id}")))
        }
    })
}

fn first_item(page: &Value) -> Option<Value> {
    page.get("data")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned()
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.extend([
        COLLECTION.mutation(api, "databases.create", Operation::Create, Write::Post("databases/{engine_type}/instances")),
        COLLECTION.mutation(
            api,
            "databases.update",
            Operation::Update,
            Write::Put("databases/{engine_type}/instances/{id}"),
        ),
        COLLECTION.mutation(
            api,
            "databases.delete",
            Operation::Delete,
            Write::Delete("databases/{engine_type}/instances/{id}"),
        ),
        COLLECTION.mutation(
            api,
            "databases.suspend",
            Operation::Action,
            Write::Post("databases/{engine_type}/instances/{id}/suspend"),
        ),
        COLLECTION.mutation(
            api,
            "databases.resume",
            Operation::Action,
            Write::Post("databases/{engine_type}/instances/{id}/resume"),
        ),
    ]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detail_is_first_item_of_filtered_page() {
        let page = json!({"data": [{"id": 5, "engine": "mysql"}], "page": 1, "pages": 1, "results": 1});
        assert_eq!(first_item(&page), Some(json!({"id": 5, "engine": "mysql"})));
        assert_eq!(first_item(&json!({"data": [], "page": 1, "pages": 1, "results": 0})), None);
    }
}
