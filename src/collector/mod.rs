//! Collectors: fetch a remote resource page by page into the raw layer
//!
//! - **rest**: offset/page pagination over a URL template
//! - **graphql**: cursor pagination over a GraphQL query
//! - **state**: full vs. incremental decision and the watermark
//! - **paging**: finish predicate and the resume ledger
//! - **input**: input rows for input-driven collection

pub mod graphql;
pub mod input;
pub mod paging;
pub mod params;
pub mod rest;
mod run;
pub mod state;
pub mod template;

pub use graphql::{
    split_aliased, AliasBatch, GraphqlCollector, GraphqlError, GraphqlQuery, GraphqlResponse,
    GraphqlSource, PageInfo,
};
pub use input::{InputSource, NormalizedInput, StaticInput};
pub use paging::{finish_at_watermark, timestamp_field, PageControl};
pub use params::{Pager, RequestData, ScopeParams};
pub use rest::{RestCollector, RestSource};
pub use run::{CollectSummary, CollectorArgs, CollectorStores};
pub use state::{StateKey, StateTracker, SyncPolicy};
pub use template::UrlTemplate;
