//! Entity namespaces and their key builders.
//!
//! Every key the crate produces for an entity goes through [`EntityType`], so
//! invalidation scopes line up with the keys views actually cache:
//!
//! ```text
//! volumes                                   namespace
//! volumes.list                              every list view
//! volumes.list.paginated{page=1,page_size=25}
//! volumes.list.all
//! volumes.list.infinite{filter=..}
//! volumes.detail{id=7}                      detail and its sub-resources
//! linodes.detail{id=42}.volumes             volumes scoped to linode 42
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::keys::{KeyPath, ParamValue, Params};

/// Entity kinds known to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityType {
    Account,
    Linode,
    Volume,
    Region,
    Firewall,
    Database,
    NodeBalancer,
    PlacementGroup,
    Event,
}

impl EntityType {
    pub const ALL: [EntityType; 9] = [
        Self::Account,
        Self::Linode,
        Self::Volume,
        Self::Region,
        Self::Firewall,
        Self::Database,
        Self::NodeBalancer,
        Self::PlacementGroup,
        Self::Event,
    ];

    /// Root segment of every key of this entity.
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Linode => "linodes",
            Self::Volume => "volumes",
            Self::Region => "regions",
            Self::Firewall => "firewalls",
            Self::Database => "databases",
            Self::NodeBalancer => "nodebalancers",
            Self::PlacementGroup => "placement_groups",
            Self::Event => "events",
        }
    }

    /// Entity type as reported by the API in event payloads.
    pub fn api_type(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Linode => "linode",
            Self::Volume => "volume",
            Self::Region => "region",
            Self::Firewall => "firewall",
            Self::Database => "database",
            Self::NodeBalancer => "nodebalancer",
            Self::PlacementGroup => "placement_group",
            Self::Event => "event",
        }
    }

    pub fn from_api_type(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|entity| entity.api_type() == kind)
    }

    pub fn root(self) -> KeyPath {
        KeyPath::root(self.namespace())
    }

    /// Prefix of every list view.
    pub fn list_key(self) -> KeyPath {
        self.root().child("list")
    }

    pub fn paginated_key(self, request: &PageRequest) -> KeyPath {
        self.list_key().child_with("paginated", request.to_params())
    }

    pub fn all_key(self, filter: &Value) -> KeyPath {
        with_filter(self.list_key(), "all", filter)
    }

    pub fn infinite_key(self, filter: &Value) -> KeyPath {
        with_filter(self.list_key(), "infinite", filter)
    }

    /// Detail entry; also the prefix of the entity's sub-resources.
    pub fn detail_key(self, id: u64) -> KeyPath {
        self.root()
            .child_with("detail", Params::new().with("id", id))
    }

    /// Prefix of the `child` lists scoped to entity `parent_id`.
    pub fn scoped_list_key(self, parent_id: u64, child: EntityType) -> KeyPath {
        self.detail_key(parent_id).child(child.namespace())
    }

    pub fn scoped_paginated_key(self, parent_id: u64, child: EntityType, request: &PageRequest) -> KeyPath {
        self.scoped_list_key(parent_id, child)
            .child_with("paginated", request.to_params())
    }

    /// Entity id from the `detail` segment of a key.
    pub fn id_of(key: &KeyPath) -> Option<u64> {
        key.param("detail", "id")
            .and_then(ParamValue::as_u64)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

impl FromStr for EntityType {
    type Err = String;

    /// Accepts the namespace (`volumes`) or the API type (`volume`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|entity| entity.namespace() == value || entity.api_type() == value)
            .ok_or_else(|| format!("unknown entity type `{value}`"))
    }
}

fn with_filter(base: KeyPath, name: &str, filter: &Value) -> KeyPath {
    if filter.is_null() {
        base.child(name)
    } else {
        base.child_with(name, Params::new().with("filter", filter))
    }
}

/// Page, page size and `X-Filter` of a list request.
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    /// `null` when unfiltered.
    pub filter: Value,
}

impl PageRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 25;
    /// Largest page the API serves; used by aggregate views.
    pub const MAX_PAGE_SIZE: u32 = 500;

    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
            filter: Value::Null,
        }
    }

    pub fn first() -> Self {
        Self::new(1, Self::DEFAULT_PAGE_SIZE)
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.filter = filter;
        self
    }

    pub fn next(&self) -> Self {
        Self {
            page: self.page + 1,
            ..self.clone()
        }
    }

    pub fn to_params(&self) -> Params {
        let params = Params::new()
            .with("page", self.page)
            .with("page_size", self.page_size);
        if self.filter.is_null() {
            params
        } else {
            params.with("filter", &self.filter)
        }
    }

    /// Inverse of [`to_params`](Self::to_params); missing fields take defaults.
    pub fn from_params(params: Option<&Params>) -> Self {
        let number = |name: &str, default: u32| {
            params
                .and_then(|params| params.get(name))
                .and_then(|value| value.as_i64())
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(default)
        };
        Self {
            page: number("page", 1).max(1),
            page_size: number("page_size", Self::DEFAULT_PAGE_SIZE).max(1),
            filter: params
                .and_then(|params| params.get("filter"))
                .map(|filter| filter.to_json())
                .unwrap_or(Value::Null),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first()
    }
}
