use std::future::Future;

use serde_json::Value;

use crate::cache::{EntityType, KeyPath, PageRequest, QueryError};
use crate::client::{QueryClient, QueryObserver};

use super::paginated::decode_page;

/// Every item of a collection, gathered from as many pages as it takes.
#[derive(Debug, Clone)]
pub struct AllView {
    client: QueryClient,
    key: KeyPath,
}

impl AllView {
    pub fn new(client: &QueryClient, entity: EntityType, filter: &Value) -> Self {
        Self {
            client: client.clone(),
            key: entity.all_key(filter),
        }
    }

    pub fn key(&self) -> &KeyPath {
        &self.key
    }

    pub async fn fetch(&self) -> Result<Vec<Value>, QueryError> {
        let data = self.client.ensure_fresh(&self.key).await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    pub fn cached(&self) -> Option<Vec<Value>> {
        self.client
            .read(&self.key)
            .data
            .and_then(|data| data.as_array().cloned())
    }

    pub fn observe(&self) -> QueryObserver {
        self.client.use_query(&self.key)
    }
}

/// Fetch pages from the first onward at the largest page size and
/// concatenate their items.
///
/// Stops after a short page or the last page the envelope reports.
pub async fn collect_all<F, Fut>(filter: Value, mut fetch_page: F) -> Result<Value, QueryError>
where
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Value, QueryError>>,
{
    let mut request = PageRequest::new(1, PageRequest::MAX_PAGE_SIZE).with_filter(filter);
    let mut items = Vec::new();
    loop {
        let page = decode_page(&fetch_page(request.clone()).await?)?;
        let short = page.data.len() < request.page_size as usize;
        let last = short || !page.has_next();
        items.extend(page.data);
        if last {
            return Ok(Value::Array(items));
        }
        request = request.next();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    fn page(ids: std::ops::Range<u64>, page: u32, pages: u32) -> Value {
        let data: Vec<Value> = ids.map(|id| json!({"id": id})).collect();
        json!({"results": data.len(), "data": data, "page": page, "pages": pages})
    }

    #[tokio::test]
    async fn stops_after_short_page() {
        let requested = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requested);

        let items = collect_all(json!({"region": "us-east"}), move |request: PageRequest| {
            seen.lock().expect("lock").push(request.page);
            let body = match request.page {
                1 => page(0..500, 1, 9),
                _ => page(500..510, 2, 9),
            };
            async move { Ok(body) }
        })
        .await
        .expect("collect");

        assert_eq!(items.as_array().map(Vec::len), Some(510));
        assert_eq!(*requested.lock().expect("lock"), vec![1, 2]);
    }

    #[tokio::test]
    async fn stops_at_last_reported_page() {
        let items = collect_all(Value::Null, |request: PageRequest| {
            let body = page(0..500, request.page, 1);
            async move { Ok(body) }
        })
        .await
        .expect("collect");

        assert_eq!(items.as_array().map(Vec::len), Some(500));
    }

    #[tokio::test]
    async fn page_errors_propagate() {
        let result = collect_all(Value::Null, |request: PageRequest| async move {
            if request.page == 1 {
                Ok(page(0..500, 1, 2))
            } else {
                Err(QueryError::server(503, "unavailable"))
            }
        })
        .await;

        assert_eq!(result, Err(QueryError::server(503, "unavailable")));
    }
}
