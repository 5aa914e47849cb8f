use serde_json::Value;
use tokio::time::Instant;

use crate::cache::{EntityType, InfinitePages, KeyPath, QueryData, QueryError, QueryKind};
use crate::client::{QueryClient, QueryObserver};

/// Cursor-scrolled list: one entry per filter holding every loaded page.
///
/// Loading more appends to the entry without touching earlier pages. An
/// invalidation marks the whole entry stale and the refetch walks the pages
/// again from the first one, up to as many as were loaded.
#[derive(Debug, Clone)]
pub struct InfiniteView {
    client: QueryClient,
    key: KeyPath,
}

impl InfiniteView {
    pub fn new(client: &QueryClient, entity: EntityType, filter: &Value) -> Self {
        Self::from_key(client, entity.infinite_key(filter))
    }

    pub fn from_key(client: &QueryClient, key: KeyPath) -> Self {
        Self {
            client: client.clone(),
            key,
        }
    }

    pub fn key(&self) -> &KeyPath {
        &self.key
    }

    /// Loaded pages; fetches the first page when nothing is cached.
    pub async fn fetch(&self) -> Result<InfinitePages, QueryError> {
        let data = self.client.ensure_fresh(&self.key).await?;
        decode_pages(&data)
    }

    /// Append the page after the last loaded one.
    pub async fn fetch_next_page(&self) -> Result<InfinitePages, QueryError> {
        let data = self.client.fetch_next_page(&self.key).await?;
        decode_pages(&data)
    }

    pub fn observe(&self) -> QueryObserver {
        self.client.use_query(&self.key)
    }

    pub fn pages(&self) -> Option<InfinitePages> {
        self.client
            .read(&self.key)
            .data
            .and_then(|data| InfinitePages::from_value(&data))
    }

    /// Items of every loaded page, in order.
    pub fn items(&self) -> Vec<Value> {
        self.pages()
            .map(|pages| pages.items().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_next_page(&self) -> bool {
        let Ok(resolved) = self.client.registry().resolve(&self.key) else {
            return false;
        };
        let QueryKind::Infinite(pagination) = resolved.definition.kind else {
            return false;
        };
        self.pages()
            .is_some_and(|pages| pages.next_param(pagination).is_some())
    }

    /// Loaded pages are stale as one unit.
    pub fn all_pages_stale(&self) -> bool {
        let entry = self.client.read(&self.key);
        entry.data.is_some() && entry.is_stale(Instant::now())
    }
}

fn decode_pages(data: &QueryData) -> Result<InfinitePages, QueryError> {
    InfinitePages::from_value(data).ok_or_else(|| QueryError::decode("not an infinite query layout"))
}
