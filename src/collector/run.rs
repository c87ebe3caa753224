//! Run frame shared by the REST and GraphQL collectors
//!
//! Owns the state tracker, the resume ledger and the page writer for one
//! `(connection, scope, table)` run, and fans input rows out with bounded
//! concurrency.

use super::input::{batched, InputSource};
use super::paging::Ledger;
use super::params::{input_key, ScopeParams};
use super::state::{StateKey, StateTracker, SyncPolicy};
use crate::store::{NewRawUnit, PageRecord, RawStore, StateStore};
use crate::{metrics, CollectError, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stores a collector writes to
#[derive(Clone)]
pub struct CollectorStores {
    pub raw: Arc<dyn RawStore>,
    pub state: Arc<dyn StateStore>,
}

impl CollectorStores {
    /// Both roles served by one store (e.g. [`crate::store::SqliteStore`])
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RawStore + StateStore + 'static,
    {
        Self {
            raw: store.clone(),
            state: store,
        }
    }
}

/// What to collect and how
#[derive(Clone)]
pub struct CollectorArgs {
    pub connection_id: u64,
    pub params: ScopeParams,
    /// Raw table name
    pub table: String,
    /// `false` forces a full run whatever the stored watermark says
    pub incremental: bool,
    pub policy: SyncPolicy,
    pub input: Option<Arc<dyn InputSource>>,
    /// Input rows per request; above 1 the input is an array of rows
    pub input_step: usize,
    /// Inputs paginated at once; defaults to the client's worker count
    pub concurrency: Option<usize>,
}

impl CollectorArgs {
    pub fn new(connection_id: u64, params: ScopeParams, table: impl Into<String>) -> Self {
        Self {
            connection_id,
            params,
            table: table.into(),
            incremental: true,
            policy: SyncPolicy::default(),
            input: None,
            input_step: 1,
            concurrency: None,
        }
    }

    pub fn full(mut self) -> Self {
        self.incremental = false;
        self
    }

    pub fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_input(mut self, input: Arc<dyn InputSource>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_input_step(mut self, step: usize) -> Self {
        self.input_step = step.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    fn effective_policy(&self) -> SyncPolicy {
        SyncPolicy {
            full_sync: self.policy.full_sync || !self.incremental,
            ..self.policy
        }
    }
}

/// Result of a committed collection run
#[derive(Debug, Clone, PartialEq)]
pub struct CollectSummary {
    pub incremental: bool,
    pub resumed: bool,
    /// Raw units persisted by this run
    pub units: usize,
    /// Pages fetched by this run
    pub pages: usize,
    /// Pages replayed from the ledger of an interrupted run
    pub resumed_pages: usize,
    /// Items skipped because of an ignored status
    pub skipped: usize,
    pub watermark: Option<DateTime<Utc>>,
}

/// Persists pages of one run and keeps its counters
pub(crate) struct PageWriter {
    store: Arc<dyn RawStore>,
    tracker: StateTracker,
    ledger: Ledger,
    pub table: String,
    pub params: String,
    units: AtomicUsize,
    pages: AtomicUsize,
    resumed: AtomicUsize,
    skipped: AtomicUsize,
}

impl PageWriter {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.tracker.since()
    }

    /// Blank ledger entry for `(input, page)`
    ///
    /// Has no next page and is not `finished`, which is what a skipped page
    /// records: its sequence ends, but later pages of a known total still run.
    pub fn record(&self, input_key: &str, page: usize) -> PageRecord {
        PageRecord {
            table: self.table.clone(),
            params: self.params.clone(),
            input_key: input_key.to_string(),
            page,
            item_count: 0,
            total_pages: None,
            next_cursor: None,
            has_next: false,
            finished: false,
            max_updated_at: None,
        }
    }

    /// Ledger entry of an interrupted run; counts as collected
    pub fn replay(&self, input_key: &str, page: usize) -> Option<PageRecord> {
        let record = self.ledger.get(input_key, page)?.clone();
        if let Some(ts) = record.max_updated_at {
            self.tracker.observe(ts);
        }
        self.resumed.fetch_add(1, Ordering::Relaxed);
        metrics::record_page_resumed(&self.table);
        debug!(
            table = %self.table,
            input = input_key,
            page,
            "Replaying committed page from ledger"
        );
        Some(record)
    }

    /// Commit one page's units together with its ledger entry
    pub fn commit(&self, record: &PageRecord, units: &[NewRawUnit]) -> Result<()> {
        self.store.commit_page(record, units)?;
        if let Some(ts) = record.max_updated_at {
            self.tracker.observe(ts);
        }
        self.units.fetch_add(units.len(), Ordering::Relaxed);
        self.pages.fetch_add(1, Ordering::Relaxed);
        metrics::record_raw_units(&self.table, units.len());
        Ok(())
    }

    /// Record an item skipped because of an ignored status
    pub fn skip(&self, input_key: &str, page: usize) -> Result<()> {
        self.store.commit_page(&self.record(input_key, page), &[])?;
        self.skipped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Begin the run, execute `body`, and commit the watermark only on success
pub(crate) async fn run_collection<F, Fut>(
    stores: &CollectorStores,
    args: &CollectorArgs,
    body: F,
) -> Result<CollectSummary>
where
    F: FnOnce(Arc<PageWriter>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let table = args.table.as_str();
    let params = args.params.fingerprint();
    let key = StateKey::new(args.connection_id, params, table);
    let tracker = StateTracker::begin(
        stores.state.clone(),
        &key,
        args.effective_policy(),
        Utc::now(),
    )
    .map_err(|e| e.with_context(table, params, None))?;

    let incremental = tracker.can_incremental_collect();
    let resumed = tracker.is_resumed();
    let ledger = if resumed {
        Ledger::load(stores.raw.as_ref(), table, params)?
    } else {
        stores.raw.clear_ledger(table, params)?;
        if !incremental {
            let flushed = stores.raw.flush_raw(table, params)?;
            debug!(table, params, flushed, "Flushed raw units for full collection");
        }
        Ledger::default()
    };
    if resumed {
        info!(
            table,
            params,
            pages = ledger.len(),
            "Resuming interrupted collection"
        );
    }

    let writer = Arc::new(PageWriter {
        store: stores.raw.clone(),
        tracker,
        ledger,
        table: table.to_string(),
        params: params.to_string(),
        units: AtomicUsize::new(0),
        pages: AtomicUsize::new(0),
        resumed: AtomicUsize::new(0),
        skipped: AtomicUsize::new(0),
    });

    if let Err(e) = body(writer.clone()).await {
        if e.is_cancelled() {
            warn!(table, params, "Collection cancelled; watermark unchanged");
        }
        return Err(e.with_context(table, params, None));
    }

    let state = writer.tracker.commit()?;
    stores.raw.clear_ledger(table, params)?;

    let summary = CollectSummary {
        incremental,
        resumed,
        units: writer.units.load(Ordering::Relaxed),
        pages: writer.pages.load(Ordering::Relaxed),
        resumed_pages: writer.resumed.load(Ordering::Relaxed),
        skipped: writer.skipped.load(Ordering::Relaxed),
        watermark: state.since_cursor,
    };
    info!(
        table,
        params,
        units = summary.units,
        pages = summary.pages,
        resumed_pages = summary.resumed_pages,
        skipped = summary.skipped,
        "Collection complete"
    );
    Ok(summary)
}

/// Call `each` once without input, or once per input row (or batch)
///
/// Inputs run concurrently up to `concurrency`; the first error stops the
/// fan-out and is returned.
pub(crate) async fn for_each_input<F, Fut>(
    args: &CollectorArgs,
    concurrency: usize,
    cancel: &CancellationToken,
    each: F,
) -> Result<()>
where
    F: Fn(Option<Value>, String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(input) = &args.input else {
        return each(None, String::new()).await;
    };

    let rows = batched(input.open()?, args.input_step);
    let mut results = pin!(stream::iter(rows)
        .map(|row| {
            let each = &each;
            async move {
                if cancel.is_cancelled() {
                    return Err(CollectError::Cancelled);
                }
                let row = row?;
                let key = input_key(&row)?;
                each(Some(row), key).await
            }
        })
        .buffer_unordered(concurrency.max(1)));

    while let Some(result) = results.next().await {
        result?;
    }
    Ok(())
}
