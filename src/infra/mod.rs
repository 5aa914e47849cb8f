//! Infrastructure adapters: HTTP transport and telemetry bootstrap.

pub mod api;
pub mod error;
pub mod telemetry;
