//! Extract stage: raw units into normalized rows

use super::runner::{Stage, StageContext, StageOutcome};
use super::PipelineStores;
use crate::collector::ScopeParams;
use crate::store::{NormalizedRecord, RawStore, RawUnit, StageState, StateStore, ToolStore};
use crate::{CollectError, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

/// Pure mapping from one raw unit to normalized rows
///
/// Must not touch the network or depend on other rows. The output is
/// upserted by `(kind, connection, native id)`, so running it again over the
/// same unit is harmless. It may return rows of several kinds (e.g. the
/// author found inside a comment).
pub trait Extractor: Send + Sync {
    fn extract(&self, unit: &RawUnit) -> Result<Vec<NormalizedRecord>>;

    /// Changes whenever the same unit would extract differently
    fn config_fingerprint(&self) -> String {
        String::new()
    }
}

pub struct ExtractorStage<E: Extractor> {
    name: String,
    raw_table: String,
    params: String,
    stores: PipelineStores,
    extractor: E,
    batch_size: usize,
}

impl<E: Extractor> ExtractorStage<E> {
    pub fn new(
        name: impl Into<String>,
        raw_table: impl Into<String>,
        params: &ScopeParams,
        stores: PipelineStores,
        extractor: E,
    ) -> Self {
        Self {
            name: name.into(),
            raw_table: raw_table.into(),
            params: params.fingerprint().to_string(),
            stores,
            extractor,
            batch_size: 500,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Extract raw units not yet processed (or all of them on a full pass)
    pub fn extract(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let fingerprint = self.extractor.config_fingerprint();
        let stored = self.stores.state.load_stage_state(&self.name, &self.params)?;
        let incremental =
            ctx.incremental && stored.as_ref().is_some_and(|s| s.config == fingerprint);

        let mut last_id = match (&stored, incremental) {
            (Some(state), true) => state.last_raw_id,
            _ => {
                let deleted = self
                    .stores
                    .tool
                    .delete_normalized_origin(&self.raw_table, &self.params)?;
                debug!(
                    stage = %self.name,
                    params = %self.params,
                    deleted,
                    "Full extraction, cleared previous output"
                );
                0
            }
        };

        let mut written = 0;
        loop {
            if ctx.cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let units = self.stores.raw.raw_units_after(
                &self.raw_table,
                &self.params,
                last_id,
                self.batch_size,
            )?;
            let Some(last) = units.last() else {
                break;
            };
            last_id = last.id;

            let mut rows = Vec::new();
            for unit in &units {
                if ctx.cancel.is_cancelled() {
                    return Err(CollectError::Cancelled);
                }
                let extracted = self
                    .extractor
                    .extract(unit)
                    .map_err(|e| e.with_context(&self.raw_table, &self.params, unit.page))?;
                rows.extend(extracted.into_iter().map(|mut row| {
                    row.params = self.params.clone();
                    row.raw_table = self.raw_table.clone();
                    row
                }));
            }

            self.stores.tool.upsert_normalized(&rows)?;
            self.stores.state.save_stage_state(&StageState {
                stage: self.name.clone(),
                params: self.params.clone(),
                last_raw_id: last_id,
                config: fingerprint.clone(),
                updated_at: Utc::now(),
            })?;
            written += rows.len();

            if units.len() < self.batch_size {
                break;
            }
        }

        if !incremental {
            // Record the new config even when there was nothing to extract.
            self.stores.state.save_stage_state(&StageState {
                stage: self.name.clone(),
                params: self.params.clone(),
                last_raw_id: last_id,
                config: fingerprint,
                updated_at: Utc::now(),
            })?;
        }

        info!(
            stage = %self.name,
            params = %self.params,
            incremental,
            rows = written,
            "Extraction complete"
        );
        Ok(StageOutcome {
            incremental,
            records: written,
        })
    }
}

#[async_trait]
impl<E: Extractor> Stage for ExtractorStage<E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        self.extract(ctx)
    }
}
