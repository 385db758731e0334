#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Pawgate server: configuration, component wiring and the HTTP API.

/// `pawgate.toml` loading and validation.
#[path = "../config.rs"]
pub mod config;

/// Operational log subscriber.
#[path = "../logging.rs"]
pub mod logging;

/// Builds the shared state from a configuration.
#[path = "../bootstrap.rs"]
pub mod bootstrap;

/// axum router and handlers.
#[path = "../api.rs"]
pub mod api;

pub use api::{router, serve, ApiError, SharedState};
pub use bootstrap::{build, build_state, Services};
pub use config::{ConfigError, PawgateConfig};
