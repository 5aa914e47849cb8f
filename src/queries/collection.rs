//! Query shapes shared by every entity collection.
//!
//! A collection registers four definitions under its namespace: the
//! paginated list, the "all" aggregate, the infinite list and the detail.
//! Sub-resources of a detail (configs, disks, devices, ...) register a
//! paginated list or a single document with [`register_scoped_pages`] and
//! [`register_document`].

use std::sync::Arc;

use serde_json::{Map, Value};
use tessera_api_types::FieldError;

use crate::cache::{
    EntityType, FetchContext, Fetcher, KeyPath, KeyPattern, MutationDefinition, Operation,
    PageRequest, Pagination, QueryDefinition, QueryError, QueryRegistry, RegistryError, Staleness,
    as_id, lookup,
};
use crate::infra::api::ApiClient;
use crate::views::collect_all;

/// An entity namespace backed by one API collection.
#[derive(Debug, Clone, Copy)]
pub struct Collection {
    pub entity: EntityType,
    /// Collection path below the API base URL.
    pub path: &'static str,
    pub staleness: Staleness,
}

impl Collection {
    pub const fn new(entity: EntityType, path: &'static str) -> Self {
        Self {
            entity,
            path,
            staleness: Staleness::Default,
        }
    }

    pub const fn with_staleness(mut self, staleness: Staleness) -> Self {
        self.staleness = staleness;
        self
    }

    pub fn list_pattern(&self) -> KeyPattern {
        KeyPattern::new()
            .exact(self.entity.namespace())
            .exact("list")
    }

    pub fn detail_pattern(&self) -> KeyPattern {
        KeyPattern::new()
            .exact(self.entity.namespace())
            .any("detail")
    }

    /// Register the list views and the detail.
    pub fn register(&self, registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
        self.register_lists(registry, api)?;
        self.register_detail(registry, detail_fetcher(api, format!("{}/{{id}}", self.path)))
    }

    pub fn register_lists(&self, registry: &QueryRegistry, api: &ApiClient) -> Result<(), RegistryError> {
        let domain = self.entity.namespace();
        registry.register(
            QueryDefinition::new(domain, self.list_pattern().any("paginated"), page_fetcher(api, self.path))
                .staleness(self.staleness),
        )?;
        registry.register(
            QueryDefinition::new(domain, self.list_pattern().any("all"), all_fetcher(api, self.path))
                .staleness(self.staleness),
        )?;
        registry.register(
            QueryDefinition::new(domain, self.list_pattern().any("infinite"), infinite_fetcher(api, self.path))
                .staleness(self.staleness)
                .infinite(Pagination::PageNumber),
        )
    }

    pub fn register_detail(&self, registry: &QueryRegistry, fetcher: Fetcher) -> Result<(), RegistryError> {
        registry.register(
            QueryDefinition::new(self.entity.namespace(), self.detail_pattern(), fetcher)
                .staleness(self.staleness),
        )
    }

    /// Mutation writing through `write`.
    pub fn mutation(
        &self,
        api: &ApiClient,
        id: &'static str,
        operation: Operation,
        write: Write,
    ) -> MutationDefinition {
        mutation(api, id, self.entity, operation, write)
    }
}

/// `parent.detail{id=N}.<name>.paginated{..}` served from `template`, where
/// `{id}` is the parent id.
pub fn register_scoped_pages(
    registry: &QueryRegistry,
    api: &ApiClient,
    parent: EntityType,
    name: &'static str,
    template: &'static str,
) -> Result<(), RegistryError> {
    let pattern = KeyPattern::new()
        .exact(parent.namespace())
        .any("detail")
        .exact(name)
        .any("paginated");
    registry.register(QueryDefinition::new(parent.namespace(), pattern, page_fetcher(api, template)))
}

/// `parent.detail{id=N}.<name>` served as one document from `template`.
pub fn register_document(
    registry: &QueryRegistry,
    api: &ApiClient,
    parent: EntityType,
    name: &'static str,
    template: &'static str,
    staleness: Staleness,
) -> Result<(), RegistryError> {
    let pattern = KeyPattern::new()
        .exact(parent.namespace())
        .any("detail")
        .exact(name);
    registry.register(
        QueryDefinition::new(parent.namespace(), pattern, detail_fetcher(api, template)).staleness(staleness),
    )
}

/// Key of a paginated sub-resource list of `parent`.
pub fn scoped_pages_key(parent: EntityType, parent_id: u64, name: &str, request: &PageRequest) -> KeyPath {
    parent
        .detail_key(parent_id)
        .child(name)
        .child_with("paginated", request.to_params())
}

/// Fill `{id}` from the entity id of `key`.
pub fn resolve_template(template: &str, key: &KeyPath) -> Result<String, QueryError> {
    if !template.contains("{id}") {
        return Ok(template.to_string());
    }
    EntityType::id_of(key)
        .map(|id| template.replace("{id}", &id.to_string()))
        .ok_or_else(|| QueryError::Unregistered {
            key: key.to_string(),
            reason: "key carries no entity id".to_string(),
        })
}

/// Page request encoded in the last segment of `key`.
pub fn page_request(key: &KeyPath) -> PageRequest {
    PageRequest::from_params(key.last().and_then(|segment| segment.params()))
}

/// `filter` parameter of the last segment of `key`, `null` when absent.
pub fn filter_of(key: &KeyPath) -> Value {
    key.last()
        .and_then(|segment| segment.param("filter"))
        .map(|filter| filter.to_json())
        .unwrap_or(Value::Null)
}

pub fn page_fetcher(api: &ApiClient, template: impl Into<Arc<str>>) -> Fetcher {
    let api = api.clone();
    let template: Arc<str> = template.into();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let path = resolve_template(&template, &ctx.key);
        async move {
            let path = path?;
            api.get_page(&path, &page_request(&ctx.key)).await
        }
    })
}

pub fn detail_fetcher(api: &ApiClient, template: impl Into<Arc<str>>) -> Fetcher {
    let api = api.clone();
    let template: Arc<str> = template.into();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let path = resolve_template(&template, &ctx.key);
        async move { api.get(&path?).await }
    })
}

/// Every item of the collection, fetched page by page.
pub fn all_fetcher(api: &ApiClient, path: &'static str) -> Fetcher {
    let api = api.clone();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let filter = filter_of(&ctx.key);
        async move {
            collect_all(filter, |request| {
                let api = api.clone();
                async move { api.get_page(path, &request).await }
            })
            .await
        }
    })
}

/// One page of an infinite list; the page parameter is the page number.
pub fn infinite_fetcher(api: &ApiClient, path: &'static str) -> Fetcher {
    let api = api.clone();
    Fetcher::from_fn(move |ctx: FetchContext| {
        let api = api.clone();
        let page = ctx
            .page_param
            .as_ref()
            .and_then(Value::as_u64)
            .and_then(|page| u32::try_from(page).ok())
            .unwrap_or(1);
        let request = PageRequest::new(page, PageRequest::DEFAULT_PAGE_SIZE).with_filter(filter_of(&ctx.key));
        async move { api.get_page(path, &request).await }
    })
}

/// HTTP call behind a mutation.
///
/// `{field}` placeholders in the path are filled from the payload; the
/// fields used that way are left out of the request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Post(&'static str),
    Put(&'static str),
    Delete(&'static str),
}

pub fn mutation(
    api: &ApiClient,
    id: &'static str,
    entity: EntityType,
    operation: Operation,
    write: Write,
) -> MutationDefinition {
    let api = api.clone();
    MutationDefinition::from_fn(id, entity, operation, move |payload: Value| {
        let api = api.clone();
        async move {
            match write {
                Write::Post(template) => {
                    let (path, body) = render_path(template, &payload)?;
                    api.post(&path, &body).await
                }
                Write::Put(template) => {
                    let (path, body) = render_path(template, &payload)?;
                    api.put(&path, &body).await
                }
                Write::Delete(template) => {
                    let (path, _) = render_path(template, &payload)?;
                    api.delete(&path).await
                }
            }
        }
    })
}

/// Fill `{field}` placeholders of `template` from `payload`. Returns the path
/// and the payload without the fields consumed by the path.
pub fn render_path(template: &str, payload: &Value) -> Result<(String, Value), QueryError> {
    let mut path = String::with_capacity(template.len());
    let mut consumed = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}').map(|offset| open + offset) else {
            break;
        };
        let field = &rest[open + 1..close];
        let value = lookup(payload, field)
            .and_then(path_value)
            .ok_or_else(|| QueryError::validation(vec![FieldError::new(Some(field), "is required")]))?;
        path.push_str(&rest[..open]);
        path.push_str(&value);
        consumed.push(field);
        rest = &rest[close + 1..];
    }
    path.push_str(rest);

    let body = match payload {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(name, _)| !consumed.contains(&name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    };
    Ok((path, body))
}

fn path_value(value: &Value) -> Option<String> {
    as_id(value)
        .map(|id| id.to_string())
        .or_else(|| value.as_str().filter(|text| !text.is_empty()).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn path_fields_leave_the_body() {
        let payload = json!({"id": 7, "linode_id": 42, "config_id": null});

        let (path, body) = render_path("volumes/{id}/attach", &payload).expect("render");

        assert_eq!(path, "volumes/7/attach");
        assert_eq!(body, json!({"linode_id": 42, "config_id": null}));
    }

    #[test]
    fn missing_path_field_is_a_validation_error() {
        let error = render_path("linode/instances/{id}/boot", &json!({})).expect_err("missing id");

        assert_eq!(
            error,
            QueryError::validation(vec![FieldError::new(Some("id"), "is required")])
        );
    }

    #[test]
    fn templates_resolve_parent_id_from_key() {
        let key = scoped_pages_key(EntityType::Linode, 42, "configs", &PageRequest::first());

        assert_eq!(
            resolve_template("linode/instances/{id}/configs", &key).expect("resolve"),
            "linode/instances/42/configs"
        );
        assert!(resolve_template("linode/instances/{id}", &EntityType::Linode.list_key()).is_err());
    }

    #[test]
    fn filter_is_read_from_last_segment() {
        let key = EntityType::Volume.all_key(&json!({"region": "us-east"}));
        assert_eq!(filter_of(&key), json!({"region": "us-east"}));
        assert_eq!(filter_of(&EntityType::Volume.all_key(&Value::Null)), Value::Null);
    }
}
