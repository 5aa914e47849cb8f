use serde_json::Value;
use tessera_api_types::ResourcePage;

use crate::cache::{EntityType, KeyPath, PageRequest, QueryError};
use crate::client::{QueryClient, QueryObserver};

/// One page of a list, keyed `<base>.paginated{filter,page,page_size}`.
#[derive(Debug, Clone)]
pub struct PaginatedView {
    client: QueryClient,
    base: KeyPath,
    request: PageRequest,
}

impl PaginatedView {
    pub fn new(client: &QueryClient, entity: EntityType, request: PageRequest) -> Self {
        Self::under(client, entity.list_key(), request)
    }

    /// Pages of any list rooted at `base`.
    pub fn under(client: &QueryClient, base: KeyPath, request: PageRequest) -> Self {
        Self {
            client: client.clone(),
            base,
            request,
        }
    }

    pub fn client(&self) -> &QueryClient {
        &self.client
    }

    pub fn request(&self) -> &PageRequest {
        &self.request
    }

    pub fn key(&self) -> KeyPath {
        self.base.child_with("paginated", self.request.to_params())
    }

    /// The page, from cache while fresh.
    pub async fn fetch(&self) -> Result<ResourcePage, QueryError> {
        let data = self.client.ensure_fresh(&self.key()).await?;
        decode_page(&data)
    }

    /// Cached page without fetching.
    pub fn cached(&self) -> Option<ResourcePage> {
        self.client
            .read(&self.key())
            .data
            .and_then(|data| decode_page(&data).ok())
    }

    pub fn observe(&self) -> QueryObserver {
        self.client.use_query(&self.key())
    }

    /// Same list and filter, another page.
    pub fn page(&self, page: u32) -> Self {
        Self {
            request: PageRequest::new(page, self.request.page_size).with_filter(self.request.filter.clone()),
            ..self.clone()
        }
    }

    pub fn next(&self) -> Self {
        self.page(self.request.page + 1)
    }
}

pub fn decode_page(data: &Value) -> Result<ResourcePage, QueryError> {
    serde_json::from_value(data.clone()).map_err(|err| QueryError::decode(format!("not a page envelope: {err}")))
}
