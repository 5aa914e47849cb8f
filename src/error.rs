use thiserror::Error;

use crate::cache::{QueryError, RegistryError};
use crate::config::LoadError;
use crate::infra::error::InfraError;

/// Failure surfaced by the `tessera` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("failed to load configuration: {0}")]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("query registration failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Query(QueryError::Authorization { .. }) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_configuration_and_auth() {
        let config = AppError::from(LoadError::Invalid {
            key: "api.base_url",
            reason: "bad".to_string(),
        });
        assert_eq!(config.exit_code(), 2);

        let auth = AppError::from(QueryError::authorization(401, "Invalid Token"));
        assert_eq!(auth.exit_code(), 3);

        assert_eq!(AppError::unexpected("boom").exit_code(), 1);
    }
}
