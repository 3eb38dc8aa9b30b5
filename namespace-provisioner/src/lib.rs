// Library interface for the namespace provisioner binary, so integration
// tests (and the two bin targets) can share the API router and config.

pub mod api;
pub mod commands;
pub mod config;

pub use api::{create_router, internal_router, AppState};
pub use config::ProvisionerConfig;
