//! Client-resident query cache for a cloud-infrastructure REST API.
//!
//! - [`cache`]: keys, store, fetch coordination, invalidation, mutations and
//!   server-event handling
//! - [`queries`]: query definitions and mutations for every API domain
//! - [`views`]: paginated, infinite, aggregate and parent-scoped views
//! - [`client`]: the [`QueryClient`](client::QueryClient) facade

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod infra;
pub mod queries;
pub mod views;
