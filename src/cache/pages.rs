//! Stored layout of infinite queries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::Pagination;

/// Pages of one infinite query, in load order, with the parameter each page
/// was fetched with (`null` for a first page fetched without a cursor).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfinitePages {
    pub pages: Vec<Value>,
    pub page_params: Vec<Value>,
}

impl InfinitePages {
    /// `None` when `value` does not have the infinite layout.
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "pages": self.pages,
            "page_params": self.page_params,
        })
    }

    pub fn push(&mut self, page: Value, param: Option<Value>) {
        self.pages.push(page);
        self.page_params.push(param.unwrap_or(Value::Null));
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Parameter of the page after the last loaded one.
    pub fn next_param(&self, pagination: Pagination) -> Option<Value> {
        self.pages
            .last()
            .and_then(|page| pagination.next_param(page))
    }

    /// Items of every loaded page, flattened in order.
    pub fn items(&self) -> impl Iterator<Item = &Value> {
        self.pages
            .iter()
            .filter_map(|page| page.get("data").and_then(Value::as_array))
            .flatten()
    }
}
