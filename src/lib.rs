//! collectkit - Rate-limited, resumable collection engine for engineering APIs
//!
//! Pulls issues, pull requests, commits and similar records from third-party
//! REST and GraphQL APIs into a three-layer store (raw, normalized,
//! canonical). Collection is incremental and survives crashes: committed
//! pages are never fetched twice, and the watermark only moves after a run
//! succeeds.
//!
//! # Architecture
//!
//! - **client**: Per-connection async client (rate budget, workers, retries, auth)
//! - **collector**: REST and GraphQL pagination, incremental state, resume ledger
//! - **pipeline**: Extract and convert stages, scope runner
//! - **store**: Persistence traits and the SQLite implementation
//! - **config**: Engine and connection configuration
//! - **metrics**: Prometheus counters for requests, pages and stages
//!
//! Deterministic canonical identifiers come from the [`didgen`] crate.

// Core modules
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod store;

// Engine
pub mod client;
pub mod collector;
pub mod pipeline;

// Re-exports
pub use didgen;
pub use error::{CollectError, ErrorKind, Result};
