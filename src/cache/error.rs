//! Error taxonomy of the query layer.

use tessera_api_types::FieldError;
use thiserror::Error;

/// Failure of a fetch or a mutation.
///
/// Cloneable because one fetch outcome is shared by every coalesced waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("not authorized ({status}): {message}")]
    Authorization { status: u16, message: String },
    #[error("not found: {message}")]
    NotFound { message: String },
    #[error("validation failed: {}", summarize(.errors))]
    Validation { errors: Vec<FieldError> },
    #[error("conflict: {message}")]
    Conflict { message: String },
    /// Any other 4xx: the request will not succeed as sent.
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("failed to decode response: {message}")]
    Decode { message: String },
    #[error("no query definition resolves `{key}`: {reason}")]
    Unregistered { key: String, reason: String },
    #[error("fetch aborted: {message}")]
    Aborted { message: String },
}

impl QueryError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn authorization(status: u16, message: impl Into<String>) -> Self {
        Self::Authorization {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn validation(errors: Vec<FieldError>) -> Self {
        Self::Validation { errors }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Server { .. })
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Server { .. } => "server",
            Self::Authorization { .. } => "authorization",
            Self::NotFound { .. } => "not_found",
            Self::Validation { .. } => "validation",
            Self::Conflict { .. } => "conflict",
            Self::Rejected { .. } => "rejected",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Decode { .. } => "decode",
            Self::Unregistered { .. } => "unregistered",
            Self::Aborted { .. } => "aborted",
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    if errors.is_empty() {
        return "no details".to_string();
    }
    errors
        .iter()
        .map(|error| match &error.field {
            Some(field) => format!("{field}: {}", error.reason),
            None => error.reason.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Rejected registry operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("`{pattern}` overlaps `{existing}` which uses a different fetcher")]
    Conflict { pattern: String, existing: String },
    #[error("delegation from `{pattern}` forms a cycle")]
    Cycle { pattern: String },
    #[error("delegation target `{target}` is not registered")]
    MissingTarget { target: String },
    #[error("no definition matches `{key}`")]
    Unresolved { key: String },
}

impl QueryError {
    pub(crate) fn unregistered(key: impl ToString, error: &RegistryError) -> Self {
        Self::Unregistered {
            key: key.to_string(),
            reason: error.to_string(),
        }
    }
}
