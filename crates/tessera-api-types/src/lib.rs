//! Wire types for the cloud API consumed by the tessera query cache.
//!
//! Only the shapes the cache needs to key, page, and invalidate entries are
//! modelled here; entity bodies travel as opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Page envelope returned by every list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePage<T = Value> {
    pub data: Vec<T>,
    pub page: u32,
    pub pages: u32,
    pub results: u32,
}

impl<T> ResourcePage<T> {
    /// Whether the server reports further pages after this one.
    pub fn has_next(&self) -> bool {
        self.page < self.pages
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Error body returned with non-2xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub errors: Vec<FieldError>,
}

/// One entry of an [`ApiErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            field: field.map(str::to_string),
            reason: reason.into(),
        }
    }
}

/// Lifecycle status of an account event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Scheduled,
    Started,
    Finished,
    Failed,
    Notification,
}

impl EventStatus {
    /// Statuses after which the event never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Notification)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Notification => "notification",
        }
    }
}

/// Entity reference embedded in an account event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntity {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// An account event as returned by `GET /account/events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub id: u64,
    pub action: String,
    pub status: EventStatus,
    #[serde(default)]
    pub entity: Option<EventEntity>,
    #[serde(default)]
    pub secondary_entity: Option<EventEntity>,
    #[serde(with = "api_timestamp")]
    pub created: OffsetDateTime,
    #[serde(default)]
    pub percent_complete: Option<u8>,
}

impl AccountEvent {
    pub fn is_in_progress(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Timestamps arrive either as RFC 3339 or as naive UTC (`2024-05-01T10:00:00`).
mod api_timestamp {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _, ser::Error as _};
    use time::{
        OffsetDateTime, PrimitiveDateTime, format_description::well_known::Rfc3339,
        macros::format_description,
    };

    pub fn serialize<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        let text = value.format(&Rfc3339).map_err(S::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<OffsetDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        if let Ok(value) = OffsetDateTime::parse(&text, &Rfc3339) {
            return Ok(value);
        }
        PrimitiveDateTime::parse(
            &text,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
        .map(PrimitiveDateTime::assume_utc)
        .map_err(D::Error::custom)
    }
}
