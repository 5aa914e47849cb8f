//! HTTP transport for the cloud API.
//!
//! Every request carries the bearer token; list requests add `page`,
//! `page_size` and, when filtered, the `X-Filter` header. Failures are
//! classified into [`QueryError`] so the fetch layer can decide on retries.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::{Value, json};
use tessera_api_types::{AccountEvent, ApiErrorBody, FieldError, ResourcePage};
use tracing::{debug, instrument};
use url::Url;

use crate::cache::{EventSource, PageRequest, QueryError};
use crate::config::ApiSettings;

use super::error::InfraError;

const FILTER_HEADER: &str = "X-Filter";
const EVENTS_PAGE_SIZE: u32 = 25;

/// Client for the cloud REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        Self::build(settings.base_url.clone(), settings.token.as_deref(), settings.timeout)
    }

    /// `base_url` must end with `/`; request paths are joined below it.
    pub fn build(base_url: Url, token: Option<&str>, timeout: Duration) -> Result<Self, InfraError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| InfraError::configuration(format!("invalid api token: {err}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `GET path`.
    pub async fn get(&self, path: &str) -> Result<Value, QueryError> {
        self.send(Method::GET, path, None, &[], &Value::Null).await
    }

    /// `GET path` for one page of a list. Returns the page envelope.
    pub async fn get_page(&self, path: &str, request: &PageRequest) -> Result<Value, QueryError> {
        let query = [
            ("page", request.page.to_string()),
            ("page_size", request.page_size.to_string()),
        ];
        let page = self
            .send(Method::GET, path, None, &query, &request.filter)
            .await?;
        // Reject bodies that are not page envelopes before they reach the cache.
        serde_json::from_value::<ResourcePage>(page.clone())
            .map_err(|err| QueryError::decode(format!("{path}: not a page envelope: {err}")))?;
        Ok(page)
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, QueryError> {
        self.send(Method::POST, path, Some(body), &[], &Value::Null).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value, QueryError> {
        self.send(Method::PUT, path, Some(body), &[], &Value::Null).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, QueryError> {
        self.send(Method::DELETE, path, None, &[], &Value::Null).await
    }

    #[instrument(skip(self, body, query, filter), fields(method = %method, path = %path))]
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
        filter: &Value,
    ) -> Result<Value, QueryError> {
        let mut url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| QueryError::invalid_request(format!("invalid request path `{path}`: {err}")))?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in query {
                pairs.append_pair(name, value);
            }
        }

        let mut request = self.http.request(method.clone(), url);
        if !filter.is_null() {
            request = request.header(FILTER_HEADER, filter.to_string());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(transport_error)?;
        debug!(status = status.as_u16(), bytes = bytes.len(), "API response");

        if !status.is_success() {
            return Err(classify(status, &bytes));
        }
        if bytes.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| QueryError::decode(format!("{method} {path}: {err}")))
    }
}

fn transport_error(err: reqwest::Error) -> QueryError {
    if err.is_decode() {
        QueryError::decode(err.to_string())
    } else {
        QueryError::network(err.to_string())
    }
}

/// Map a non-2xx response to the error taxonomy.
pub fn classify(status: StatusCode, body: &[u8]) -> QueryError {
    let errors = serde_json::from_slice::<ApiErrorBody>(body)
        .map(|body| body.errors)
        .unwrap_or_default();
    let message = if errors.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("unexpected status")
            .to_string()
    } else {
        errors
            .iter()
            .map(|error| error.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    };

    let code = status.as_u16();
    match code {
        401 | 403 => QueryError::authorization(code, message),
        404 | 410 => QueryError::not_found(message),
        409 => QueryError::conflict(message),
        400 | 422 => QueryError::validation(if errors.is_empty() {
            vec![FieldError::new(None, message)]
        } else {
            errors
        }),
        408 | 429 | 500..=599 => QueryError::server(code, message),
        _ => QueryError::rejected(code, message),
    }
}

#[async_trait]
impl EventSource for ApiClient {
    async fn events_since(&self, after_id: Option<u64>) -> Result<Vec<AccountEvent>, QueryError> {
        let mut filter = json!({"+order_by": "id", "+order": "desc"});
        if let Some(after) = after_id {
            filter["id"] = json!({ "+gt": after });
        }
        let mut request = PageRequest::new(1, EVENTS_PAGE_SIZE).with_filter(filter);
        let mut events = Vec::new();
        loop {
            let page = self.get_page("account/events", &request).await?;
            let page: ResourcePage<AccountEvent> = serde_json::from_value(page)
                .map_err(|err| QueryError::decode(format!("account/events: {err}")))?;
            let more = page.has_next();
            events.extend(page.data);
            // The baseline poll only needs the newest page; a catch-up walks
            // every page newer than `after_id` so no event is skipped.
            if after_id.is_none() || !more {
                return Ok(events);
            }
            request = request.next();
        }
    }

    async fn event(&self, id: u64) -> Result<AccountEvent, QueryError> {
        let path = format!("account/events/{id}");
        let event = self.get(&path).await?;
        serde_json::from_value(event).map_err(|err| QueryError::decode(format!("{path}: {err}")))
    }
}
