//! Paginated REST collector
//!
//! Pagination strategies:
//! - **known total**: when [`RestSource::total_pages`] answers from the first
//!   page, the remaining pages are queued on the client at once and run as
//!   fast as the rate budget allows.
//! - **unknown total**: pages are requested one after another until a short
//!   page, or until [`RestSource::inspect_page`] returns
//!   [`PageControl::Finish`].
//!
//! Every page is committed together with its ledger entry, so an interrupted
//! run resumes without refetching committed pages.

use super::paging::{finish_at_watermark, timestamp_field, PageControl};
use super::params::{Pager, RequestData};
use super::run::{for_each_input, run_collection, CollectSummary, CollectorArgs, CollectorStores, PageWriter};
use super::template::UrlTemplate;
use crate::client::{ApiAsyncClient, ApiRequest, ApiResponse};
use crate::store::{NewRawUnit, PageRecord};
use crate::{CollectError, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Plugin hooks for one REST resource
pub trait RestSource: Send + Sync + 'static {
    /// URL template, relative to the connection endpoint
    fn url_template(&self) -> &str;

    /// Items per page; `0` means the resource is fetched with one request
    fn page_size(&self) -> usize {
        100
    }

    fn method(&self) -> Method {
        Method::GET
    }

    /// Query parameters for a page (page number, `since` filter, ...)
    fn query(&self, _req: &RequestData) -> Vec<(String, String)> {
        Vec::new()
    }

    /// JSON body, for POST-style search endpoints
    fn body(&self, _req: &RequestData) -> Option<Value> {
        None
    }

    /// Total page count read from the first response, if the API reports one
    fn total_pages(&self, _response: &ApiResponse, _req: &RequestData) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Split a response into the items it carries
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Value>> {
        Ok(match response.json::<Value>()? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            item => vec![item],
        })
    }

    /// Last-modified time of an item
    fn updated_at(&self, item: &Value) -> Option<DateTime<Utc>> {
        timestamp_field(item, "updated_at").or_else(|| timestamp_field(item, "updatedAt"))
    }

    /// Per-page callback; by default stops at the first item not newer than `since`
    fn inspect_page(&self, items: &[Value], req: &RequestData) -> Result<PageControl> {
        Ok(match req.since {
            Some(since) => finish_at_watermark(items, since, |item| self.updated_at(item)),
            None => PageControl::Continue,
        })
    }
}

/// Collector for one REST resource within one scope
pub struct RestCollector<S: RestSource> {
    client: ApiAsyncClient,
    stores: CollectorStores,
    args: CollectorArgs,
    source: Arc<S>,
    template: Arc<UrlTemplate>,
}

impl<S: RestSource> RestCollector<S> {
    pub fn new(
        client: ApiAsyncClient,
        stores: CollectorStores,
        args: CollectorArgs,
        source: S,
    ) -> Result<Self> {
        let template = UrlTemplate::parse(source.url_template())?;
        if template.uses_input() && args.input.is_none() {
            return Err(CollectError::Config(format!(
                "url template '{}' references .Input but no input was configured",
                template.as_str()
            )));
        }
        Ok(Self {
            client,
            stores,
            args,
            source: Arc::new(source),
            template: Arc::new(template),
        })
    }

    pub fn args(&self) -> &CollectorArgs {
        &self.args
    }

    /// Collect, then commit the watermark
    pub async fn execute(&self) -> Result<CollectSummary> {
        self.collect(&self.args).await
    }

    pub(crate) async fn collect(&self, args: &CollectorArgs) -> Result<CollectSummary> {
        let concurrency = args.concurrency.unwrap_or(self.client.worker_count());
        run_collection(&self.stores, args, |writer| async move {
            let fetcher = Fetcher {
                client: self.client.clone(),
                source: self.source.clone(),
                template: self.template.clone(),
                params: Arc::new(args.params.value().clone()),
                writer,
            };
            for_each_input(args, concurrency, self.client.cancel_token(), |input, key| {
                fetcher.clone().paginate(input, key)
            })
            .await
        })
        .await
    }
}

struct Fetcher<S> {
    client: ApiAsyncClient,
    source: Arc<S>,
    template: Arc<UrlTemplate>,
    params: Arc<Value>,
    writer: Arc<PageWriter>,
}

impl<S> Clone for Fetcher<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            source: self.source.clone(),
            template: self.template.clone(),
            params: self.params.clone(),
            writer: self.writer.clone(),
        }
    }
}

/// Input row of one pagination sequence
#[derive(Clone)]
struct Item {
    input: Option<Value>,
    json: Option<String>,
    key: String,
}

impl<S: RestSource> Fetcher<S> {
    async fn paginate(self, input: Option<Value>, key: String) -> Result<()> {
        let json = input.as_ref().map(serde_json::to_string).transpose()?;
        let item = Item { input, json, key };

        let first = match self.writer.replay(&item.key, 1) {
            Some(record) => record,
            None => self.fetch(&item, 1, None).await?,
        };
        if !first.has_next {
            return Ok(());
        }
        match first.total_pages {
            Some(total) => self.fan_out(item, total).await,
            None => self.sequential(&item).await,
        }
    }

    async fn sequential(&self, item: &Item) -> Result<()> {
        let mut page = 2;
        loop {
            if self.client.cancel_token().is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let record = match self.writer.replay(&item.key, page) {
                Some(record) => record,
                None => self.fetch(item, page, None).await?,
            };
            if !record.has_next {
                return Ok(());
            }
            page += 1;
        }
    }

    async fn fan_out(&self, item: Item, total: usize) -> Result<()> {
        let stop = Arc::new(AtomicBool::new(false));
        debug!(
            table = %self.writer.table,
            input = %item.key,
            total,
            "Queueing remaining pages"
        );

        // Only a page that ended pagination on its content stops the rest;
        // skipped pages are not `finished`.
        let mut group = self.client.task_group();
        for page in 2..=total {
            if let Some(record) = self.writer.replay(&item.key, page) {
                if record.finished && page < total {
                    stop.store(true, Ordering::Relaxed);
                }
                continue;
            }
            let fetcher = self.clone();
            let item = item.clone();
            let stop = stop.clone();
            group.spawn(async move {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                let record = fetcher.fetch(&item, page, Some(total)).await?;
                if record.finished && page < total {
                    stop.store(true, Ordering::Relaxed);
                }
                Ok(())
            });
        }

        group.wait_async().await
    }

    fn request_data(&self, item: &Item, page: usize) -> RequestData {
        RequestData {
            pager: Pager::new(page, self.source.page_size()),
            cursor: None,
            params: self.params.as_ref().clone(),
            input: item.input.clone(),
            since: self.writer.since(),
        }
    }

    async fn fetch(&self, item: &Item, page: usize, total: Option<usize>) -> Result<PageRecord> {
        let writer = &self.writer;
        let ctx = |e: CollectError| e.with_context(&writer.table, &writer.params, Some(page));

        let req = self.request_data(item, page);
        let request = ApiRequest {
            method: self.source.method(),
            path: self.template.render(&req).map_err(ctx)?,
            query: self.source.query(&req),
            headers: Vec::new(),
            body: self.source.body(&req),
        };

        let Some(response) = self.client.send(&request).await.map_err(ctx)? else {
            writer.skip(&item.key, page).map_err(ctx)?;
            return Ok(writer.record(&item.key, page));
        };

        let total_pages = match total {
            Some(total) => Some(total),
            None if page == 1 => self.source.total_pages(&response, &req).map_err(ctx)?,
            None => None,
        };
        let items = self.source.parse_response(&response).map_err(ctx)?;
        let (keep, finished_early) = match self.source.inspect_page(&items, &req).map_err(ctx)? {
            PageControl::Continue => (items.len(), false),
            PageControl::Finish { keep } => (keep.min(items.len()), true),
        };
        let has_next = !finished_early
            && match total_pages {
                Some(total) => page < total,
                None => {
                    let size = self.source.page_size();
                    size > 0 && items.len() >= size
                }
            };

        let kept = &items[..keep];
        let units = kept
            .iter()
            .map(|unit| {
                Ok(NewRawUnit {
                    params: writer.params.clone(),
                    input: item.json.clone(),
                    page: Some(page),
                    url: response.url.clone(),
                    data: serde_json::to_vec(unit)?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map_err(ctx)?;

        let record = PageRecord {
            item_count: units.len(),
            total_pages,
            has_next,
            finished: !has_next,
            max_updated_at: kept.iter().filter_map(|i| self.source.updated_at(i)).max(),
            ..writer.record(&item.key, page)
        };
        writer.commit(&record, &units).map_err(ctx)?;

        debug!(
            table = %writer.table,
            input = %item.key,
            page,
            items = items.len(),
            kept = units.len(),
            has_next,
            "Page committed"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientOptions, NoAuth, RetryConfig};
    use crate::collector::{ScopeParams, StaticInput};
    use crate::store::{RawStore, SqliteStore};
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    struct Numbers;

    impl RestSource for Numbers {
        fn url_template(&self) -> &str {
            "numbers"
        }

        fn page_size(&self) -> usize {
            10
        }

        fn query(&self, req: &RequestData) -> Vec<(String, String)> {
            vec![("page".into(), req.pager.page.to_string())]
        }

        fn total_pages(&self, response: &ApiResponse, _req: &RequestData) -> Result<Option<usize>> {
            Ok(response.header("x-total-pages").and_then(|v| v.parse().ok()))
        }
    }

    /// 25 items in pages of 10, optionally reporting the page count
    fn numbers_app(report_total: bool) -> Router {
        Router::new().route(
            "/numbers",
            get(move |Query(q): Query<HashMap<String, String>>| async move {
                let page: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
                let items: Vec<Value> = ((page - 1) * 10..(page * 10).min(25))
                    .map(|n| json!({ "n": n }))
                    .collect();
                let total = if report_total { "3" } else { "" };
                ([("x-total-pages", total)], Json(items))
            }),
        )
    }

    fn collector<S: RestSource>(
        endpoint: String,
        store: Arc<SqliteStore>,
        args: CollectorArgs,
        source: S,
    ) -> RestCollector<S> {
        let client = ApiAsyncClient::new(
            ClientOptions::new(1, endpoint).with_retry(RetryConfig::quick()),
            Arc::new(NoAuth),
            &CancellationToken::new(),
        )
        .unwrap();
        RestCollector::new(client, CollectorStores::shared(store), args, source).unwrap()
    }

    fn args() -> CollectorArgs {
        CollectorArgs::new(1, ScopeParams::new(&json!({ "name": "acme/widgets" })).unwrap(), "raw_numbers")
    }

    #[tokio::test]
    async fn test_unknown_total_stops_on_short_page() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let endpoint = serve(numbers_app(false)).await;
        let summary = collector(endpoint, store.clone(), args(), Numbers)
            .execute()
            .await
            .unwrap();

        assert_eq!(summary.units, 25);
        assert_eq!(summary.pages, 3);
        assert!(!summary.incremental);
        let params = args().params.fingerprint().to_string();
        assert_eq!(store.count_raw("raw_numbers", &params).unwrap(), 25);
        assert!(store.ledger_pages("raw_numbers", &params).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_known_total_fans_out() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let endpoint = serve(numbers_app(true)).await;
        let summary = collector(endpoint, store.clone(), args(), Numbers)
            .execute()
            .await
            .unwrap();
        assert_eq!(summary.units, 25);
        assert_eq!(summary.pages, 3);
    }

    #[tokio::test]
    async fn test_full_run_replaces_raw_units() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let endpoint = serve(numbers_app(false)).await;
        let c = collector(endpoint, store.clone(), args().full(), Numbers);
        c.execute().await.unwrap();
        c.execute().await.unwrap();
        let params = args().params.fingerprint().to_string();
        assert_eq!(store.count_raw("raw_numbers", &params).unwrap(), 25);
    }

    /// Four reported pages; page 2 is gone and page 4 fails while `failing` is set
    fn gappy_app(hits: Arc<std::sync::Mutex<Vec<usize>>>, failing: Arc<AtomicBool>) -> Router {
        Router::new().route(
            "/numbers",
            get(move |Query(q): Query<HashMap<String, String>>| {
                let hits = hits.clone();
                let failing = failing.clone();
                async move {
                    let page: usize = q.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
                    hits.lock().unwrap().push(page);
                    if page == 2 {
                        return (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" })))
                            .into_response();
                    }
                    if page == 4 && failing.load(Ordering::SeqCst) {
                        return (StatusCode::BAD_REQUEST, Json(json!({ "message": "nope" })))
                            .into_response();
                    }
                    let items: Vec<Value> = ((page - 1) * 10..page * 10)
                        .map(|n| json!({ "n": n }))
                        .collect();
                    ([("x-total-pages", "4")], Json(items)).into_response()
                }
            }),
        )
    }

    #[tokio::test]
    async fn test_resumed_fan_out_fetches_pages_after_a_skipped_one() {
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(true));
        let endpoint = serve(gappy_app(hits.clone(), failing.clone())).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let c = collector(endpoint, store.clone(), args(), Numbers);
        let params = args().params.fingerprint().to_string();

        let err = c.execute().await.unwrap_err();
        match &err {
            CollectError::Context { page, .. } => assert_eq!(*page, Some(4)),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.count_raw("raw_numbers", &params).unwrap(), 20);
        assert_eq!(store.ledger_pages("raw_numbers", &params).unwrap().len(), 3);

        failing.store(false, Ordering::SeqCst);
        let summary = c.execute().await.unwrap();
        assert!(summary.resumed);
        assert_eq!(summary.resumed_pages, 3);
        assert_eq!(summary.pages, 1);
        assert_eq!(summary.units, 10);
        assert_eq!(store.count_raw("raw_numbers", &params).unwrap(), 30);

        let hits = hits.lock().unwrap().clone();
        assert_eq!(hits.iter().filter(|p| **p == 4).count(), 2);
        assert_eq!(hits.iter().filter(|p| **p == 2).count(), 1);
    }

    #[tokio::test]
    async fn test_live_fan_out_continues_past_a_skipped_page() {
        let hits = Arc::new(std::sync::Mutex::new(Vec::new()));
        let endpoint = serve(gappy_app(hits, Arc::new(AtomicBool::new(false)))).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let summary = collector(endpoint, store.clone(), args(), Numbers)
            .execute()
            .await
            .unwrap();
        assert_eq!(summary.units, 30);
        assert_eq!(summary.skipped, 1);
    }

    struct PullCommits;

    impl RestSource for PullCommits {
        fn url_template(&self) -> &str {
            "pulls/{{ .Input.number }}/commits"
        }

        fn page_size(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_ignored_status_skips_only_that_input() {
        let app = Router::new().route(
            "/pulls/{number}/commits",
            get(|Path(number): Path<u32>| async move {
                if number == 2 {
                    (StatusCode::NOT_FOUND, Json(json!({ "message": "Not Found" }))).into_response()
                } else {
                    Json(json!([{ "sha": format!("{number}a") }, { "sha": format!("{number}b") }]))
                        .into_response()
                }
            }),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let input = StaticInput::new((1..=3).map(|n| json!({ "number": n })).collect());
        let args = args().with_input(Arc::new(input)).with_concurrency(2);

        let summary = collector(serve(app).await, store.clone(), args, PullCommits)
            .execute()
            .await
            .unwrap();
        assert_eq!(summary.units, 4);
        assert_eq!(summary.skipped, 1);

        let params = ScopeParams::new(&json!({ "name": "acme/widgets" })).unwrap();
        let units = store
            .raw_units_after("raw_numbers", params.fingerprint(), 0, 10)
            .unwrap();
        let mut inputs: Vec<Value> = units
            .iter()
            .map(|u| u.input_json::<Value>().unwrap().unwrap()["number"].clone())
            .collect();
        inputs.sort_by_key(|v| v.as_u64());
        assert_eq!(inputs, vec![json!(1), json!(1), json!(3), json!(3)]);
    }

    #[test]
    fn test_input_template_requires_input() {
        let client = ApiAsyncClient::new(
            ClientOptions::new(1, "http://127.0.0.1:9/"),
            Arc::new(NoAuth),
            &CancellationToken::new(),
        )
        .unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let result = RestCollector::new(client, CollectorStores::shared(store), args(), PullCommits);
        assert!(matches!(result, Err(CollectError::Config(_))));
    }
}
