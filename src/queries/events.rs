//! Account events feed.
//!
//! The feed is an infinite list paged by last-id cursor, newest first. It
//! never goes stale by age: the events poller prepends new events to it.

use serde_json::{Value, json};

use crate::cache::{
    EntityType, FetchContext, Fetcher, KeyPath, MutationEffect, Operation, PageRequest, Pagination,
    QueryDefinition, QueryRegistry, RegistryError, Staleness,
};
use crate::infra::api::ApiClient;

use super::catalog::MutationCatalog;
use super::collection::{Collection, Write, detail_fetcher, filter_of};

pub const COLLECTION: Collection =
    Collection::new(EntityType::Event, "account/events").with_staleness(Staleness::Never);

pub fn register(registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
    registry.register(
        QueryDefinition::new(
            EntityType::Event.namespace(),
            COLLECTION.list_pattern().any("infinite"),
            feed_fetcher(api),
        )
        .staleness(Staleness::Never)
        .infinite(Pagination::LastId),
    )?;
    COLLECTION.register_detail(registry, detail_fetcher(api, "account/events/{id}"))
}

pub fn feed_key(filter: &Value) -> KeyPath {
    EntityType::Event.infinite_key(filter)
}

/// `X-Filter` of one feed page: newest first, older than `cursor`.
pub fn feed_filter(filter: &Value, cursor: Option<&Value>) -> Value {
    let mut merged = match filter {
        Value::Object(fields) => Value::Object(fields.clone()),
        _ => json!({}),
    };
    merged["+order_by"] = json!("id");
    merged["+order"] = json!("desc");
    if let Some(cursor) = cursor.filter(|cursor| !cursor.is_null()) {
        merged["id"] = json!({ "+lt": cursor });
    }
    merged
}

fn feed_fetcher(api: &ApiClient) -> Fetcher {
    let api = api.clone();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let filter = feed_filter(&filter_of(&ctx.key), ctx.page_param.as_ref());
        async move {
            let request = PageRequest::first().with_filter(filter);
            api.get_page(COLLECTION.path, &request).await
        }
    })
}

pub fn mutations(api: &ApiClient, catalog: &mut MutationCatalog) {
    catalog.insert(
        COLLECTION
            .mutation(api, "events.mark_seen", Operation::Action, Write::Post("account/events/{id}/seen"))
            .effect(|_| vec![MutationEffect::Invalidate(EntityType::Event.list_key())]),
    );
}
