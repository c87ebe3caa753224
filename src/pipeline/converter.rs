//! Convert stage: normalized rows into canonical domain rows

use super::cursor::NormalizedCursor;
use super::runner::{Stage, StageContext, StageOutcome};
use super::PipelineStores;
use crate::collector::ScopeParams;
use crate::store::{CanonicalRecord, DomainStore, NormalizedRecord};
use crate::{CollectError, Result};
use async_trait::async_trait;
use tracing::{debug, info};

/// Maps one normalized row to canonical rows
///
/// Identifiers must come from a [`didgen::DomainIdGenerator`] so that the
/// same native row always lands on the same canonical key.
pub trait Converter: Send + Sync {
    /// Normalized kind this converter reads
    fn source_kind(&self) -> &str;

    /// Canonical tables this converter writes
    fn domain_tables(&self) -> Vec<String>;

    fn convert(&self, record: &NormalizedRecord) -> Result<Vec<CanonicalRecord>>;
}

pub struct ConverterStage<C: Converter> {
    name: String,
    params: String,
    stores: PipelineStores,
    converter: C,
    batch_size: usize,
}

impl<C: Converter> ConverterStage<C> {
    pub fn new(
        name: impl Into<String>,
        params: &ScopeParams,
        stores: PipelineStores,
        converter: C,
    ) -> Self {
        Self {
            name: name.into(),
            params: params.fingerprint().to_string(),
            stores,
            converter,
            batch_size: NormalizedCursor::DEFAULT_BATCH,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Stream every normalized row of the scope and upsert its canonical rows
    ///
    /// A full pass first deletes the canonical rows this scope produced;
    /// rows contributed by other scopes are never touched.
    pub fn convert(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let tables = self.converter.domain_tables();
        if !ctx.incremental {
            for table in &tables {
                let deleted = self.stores.domain.delete_canonical_origin(table, &self.params)?;
                debug!(stage = %self.name, table = %table, deleted, "Cleared scope's canonical rows");
            }
        }

        let kind = self.converter.source_kind();
        let cursor = NormalizedCursor::new(self.stores.tool.clone(), kind, &self.params)
            .with_batch_size(self.batch_size);

        let mut pending: Vec<CanonicalRecord> = Vec::with_capacity(self.batch_size);
        let mut written = 0;
        for row in cursor {
            if ctx.cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let record = row?;
            let converted = self
                .converter
                .convert(&record)
                .map_err(|e| e.with_context(kind, &self.params, None))?;

            for mut out in converted {
                if !tables.iter().any(|t| *t == out.table) {
                    return Err(CollectError::Convert(format!(
                        "{} wrote undeclared table '{}'",
                        self.name, out.table
                    ))
                    .with_context(kind, &self.params, None));
                }
                out.params = self.params.clone();
                pending.push(out);
            }

            if pending.len() >= self.batch_size {
                self.stores.domain.upsert_canonical(&pending)?;
                written += pending.len();
                pending.clear();
            }
        }
        self.stores.domain.upsert_canonical(&pending)?;
        written += pending.len();

        info!(
            stage = %self.name,
            params = %self.params,
            incremental = ctx.incremental,
            rows = written,
            "Conversion complete"
        );
        Ok(StageOutcome {
            incremental: ctx.incremental,
            records: written,
        })
    }
}

#[async_trait]
impl<C: Converter> Stage for ConverterStage<C> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        self.convert(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, ToolStore};
    use didgen::DomainIdGenerator;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct Issues {
        ids: DomainIdGenerator,
    }

    impl Converter for Issues {
        fn source_kind(&self) -> &str {
            "issue"
        }

        fn domain_tables(&self) -> Vec<String> {
            vec!["issues".to_string()]
        }

        fn convert(&self, record: &NormalizedRecord) -> Result<Vec<CanonicalRecord>> {
            let id = self.ids.generate(record.connection_id, &record.native_id);
            Ok(vec![CanonicalRecord::new(
                "issues",
                id,
                json!({ "title": record.data["title"] }),
            )])
        }
    }

    fn issues() -> Issues {
        Issues {
            ids: DomainIdGenerator::new("github", "Issue"),
        }
    }

    fn seed(store: &SqliteStore, params: &str, native_ids: &[u64]) {
        let rows: Vec<NormalizedRecord> = native_ids
            .iter()
            .map(|n| {
                let mut row = NormalizedRecord::new("issue", 7, n, json!({ "title": format!("#{n}") }));
                row.params = params.to_string();
                row.raw_table = "raw_issues".into();
                row
            })
            .collect();
        store.upsert_normalized(&rows).unwrap();
    }

    fn scope(name: &str) -> ScopeParams {
        ScopeParams::new(&json!({ "name": name })).unwrap()
    }

    #[test]
    fn test_converts_with_deterministic_ids() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let a = scope("a");
        seed(&store, a.fingerprint(), &[42, 43, 44]);

        let stage = ConverterStage::new("convert_issues", &a, PipelineStores::shared(store.clone()), issues())
            .with_batch_size(2);
        let outcome = stage.convert(&StageContext::new(CancellationToken::new())).unwrap();
        assert_eq!(outcome.records, 3);

        let rows = store.canonical_all("issues").unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].id.as_str(), "github:Issue:7:42");
        assert_eq!(rows[0].params, a.fingerprint());
    }

    #[test]
    fn test_full_pass_never_deletes_other_scopes() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let (a, b) = (scope("a"), scope("b"));
        seed(&store, a.fingerprint(), &[1, 2]);
        seed(&store, b.fingerprint(), &[3]);

        let ctx = StageContext::new(CancellationToken::new()).full();
        ConverterStage::new("convert_issues", &b, PipelineStores::shared(store.clone()), issues())
            .convert(&ctx)
            .unwrap();
        ConverterStage::new("convert_issues", &a, PipelineStores::shared(store.clone()), issues())
            .convert(&ctx)
            .unwrap();
        ConverterStage::new("convert_issues", &a, PipelineStores::shared(store.clone()), issues())
            .convert(&ctx)
            .unwrap();

        let ids: Vec<String> = store
            .canonical_all("issues")
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(
            ids,
            vec!["github:Issue:7:1", "github:Issue:7:2", "github:Issue:7:3"]
        );
    }

    struct Rogue;

    impl Converter for Rogue {
        fn source_kind(&self) -> &str {
            "issue"
        }

        fn domain_tables(&self) -> Vec<String> {
            vec!["issues".to_string()]
        }

        fn convert(&self, record: &NormalizedRecord) -> Result<Vec<CanonicalRecord>> {
            let id = DomainIdGenerator::new("github", "Board").generate(record.connection_id, &record.native_id);
            Ok(vec![CanonicalRecord::new("boards", id, json!({}))])
        }
    }

    #[test]
    fn test_undeclared_table_is_rejected() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let a = scope("a");
        seed(&store, a.fingerprint(), &[1]);
        let err = ConverterStage::new("convert_boards", &a, PipelineStores::shared(store.clone()), Rogue)
            .convert(&StageContext::new(CancellationToken::new()))
            .unwrap_err();
        assert!(matches!(err.root(), CollectError::Convert(_)));
        assert!(store.canonical_all("boards").unwrap().is_empty());
    }
}
