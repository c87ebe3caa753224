//! Configuration system
//!
//! Loads ~/.config/collectkit/config.yaml with:
//! - Engine-wide request knobs (retries, timeout, default hourly budget)
//! - The SQLite database location
//! - Connections (endpoint, credentials, per-connection budget)

mod connection;
mod engine_config;
pub mod validation;

pub use connection::{AuthConfig, ConnectionConfig};
pub use engine_config::EngineConfig;
pub use validation::{validate_config, validate_config_result, ValidationError};
