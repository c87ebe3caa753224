//! Scope pipeline: collect, then extract, then convert
//!
//! The collect stage is a collector from [`crate::collector`]; extraction and
//! conversion are plugin-supplied [`Extractor`]s and [`Converter`]s wrapped in
//! stages that stream rows through the store.

pub mod converter;
pub mod cursor;
pub mod extractor;
pub mod runner;

pub use converter::{Converter, ConverterStage};
pub use cursor::NormalizedCursor;
pub use extractor::{Extractor, ExtractorStage};
pub use runner::{
    run_scopes, RunOutcome, ScopePipeline, ScopeReport, Stage, StageContext, StageOutcome,
    StageReport,
};

use crate::collector::CollectorStores;
use crate::store::{DomainStore, RawStore, StateStore, ToolStore};
use std::sync::Arc;

/// Every store a pipeline touches
#[derive(Clone)]
pub struct PipelineStores {
    pub raw: Arc<dyn RawStore>,
    pub state: Arc<dyn StateStore>,
    pub tool: Arc<dyn ToolStore>,
    pub domain: Arc<dyn DomainStore>,
}

impl PipelineStores {
    /// All four roles served by one store (e.g. [`crate::store::SqliteStore`])
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RawStore + StateStore + ToolStore + DomainStore + 'static,
    {
        Self {
            raw: store.clone(),
            state: store.clone(),
            tool: store.clone(),
            domain: store,
        }
    }

    pub fn collector(&self) -> CollectorStores {
        CollectorStores {
            raw: self.raw.clone(),
            state: self.state.clone(),
        }
    }
}
