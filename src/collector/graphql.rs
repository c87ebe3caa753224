//! GraphQL collector (cursor pagination)
//!
//! Each page POSTs `{query, variables}`; continuation is driven by a
//! `{hasNextPage, endCursor}` fragment the source extracts from the
//! response. The cursor is passed back verbatim through
//! [`RequestData::cursor`] and never interpreted here.

use super::paging::{finish_at_watermark, timestamp_field, PageControl};
use super::params::{Pager, RequestData};
use super::run::{for_each_input, run_collection, CollectSummary, CollectorArgs, CollectorStores, PageWriter};
use crate::client::{ApiAsyncClient, ApiRequest};
use crate::store::{NewRawUnit, PageRecord};
use crate::{CollectError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Query document plus variables for one page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphqlQuery {
    pub query: String,
    pub variables: Value,
}

/// Relay-style page info
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub end_cursor: Option<String>,
}

impl PageInfo {
    /// Read page info at a JSON pointer, e.g. `/repository/pullRequests/pageInfo`
    pub fn at(data: &Value, pointer: &str) -> Option<Self> {
        serde_json::from_value(data.pointer(pointer)?.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Value>,
}

/// Decoded response handed to the source
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Value,
    /// Field-level errors that came back alongside `data`
    #[serde(default)]
    pub errors: Vec<GraphqlError>,
}

impl GraphqlResponse {
    fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Plugin hooks for one GraphQL resource
pub trait GraphqlSource: Send + Sync + 'static {
    /// Path of the GraphQL endpoint, relative to the connection endpoint
    fn endpoint_path(&self) -> &str {
        "graphql"
    }

    fn page_size(&self) -> usize {
        100
    }

    fn build_query(&self, req: &RequestData) -> Result<GraphqlQuery>;

    /// Page info of the response; `None` means there are no more pages
    fn page_info(&self, data: &Value) -> Option<PageInfo>;

    /// Items carried by a response; partial errors are visible in `response.errors`
    fn parse_response(&self, response: &GraphqlResponse, req: &RequestData) -> Result<Vec<Value>>;

    /// Keep going when a response has data and field-level errors
    fn ignore_query_errors(&self) -> bool {
        false
    }

    fn updated_at(&self, item: &Value) -> Option<DateTime<Utc>> {
        timestamp_field(item, "updatedAt").or_else(|| timestamp_field(item, "updated_at"))
    }

    fn inspect_page(&self, items: &[Value], req: &RequestData) -> Result<PageControl> {
        Ok(match req.since {
            Some(since) => finish_at_watermark(items, since, |item| self.updated_at(item)),
            None => PageControl::Continue,
        })
    }
}

/// Collector for one GraphQL resource within one scope
pub struct GraphqlCollector<S: GraphqlSource> {
    client: ApiAsyncClient,
    stores: CollectorStores,
    args: CollectorArgs,
    source: Arc<S>,
}

impl<S: GraphqlSource> GraphqlCollector<S> {
    pub fn new(client: ApiAsyncClient, stores: CollectorStores, args: CollectorArgs, source: S) -> Self {
        Self {
            client,
            stores,
            args,
            source: Arc::new(source),
        }
    }

    pub fn args(&self) -> &CollectorArgs {
        &self.args
    }

    pub async fn execute(&self) -> Result<CollectSummary> {
        self.collect(&self.args).await
    }

    pub(crate) async fn collect(&self, args: &CollectorArgs) -> Result<CollectSummary> {
        let concurrency = args.concurrency.unwrap_or(self.client.worker_count());
        run_collection(&self.stores, args, |writer| async move {
            let params = Arc::new(args.params.value().clone());
            for_each_input(args, concurrency, self.client.cancel_token(), |input, key| {
                let pages = CursorPages {
                    client: &self.client,
                    source: self.source.as_ref(),
                    params: params.clone(),
                    writer: writer.clone(),
                    input,
                    key,
                };
                pages.run()
            })
            .await
        })
        .await
    }
}

/// Cursor pagination over one input row (or none)
struct CursorPages<'a, S> {
    client: &'a ApiAsyncClient,
    source: &'a S,
    params: Arc<Value>,
    writer: Arc<PageWriter>,
    input: Option<Value>,
    key: String,
}

impl<S: GraphqlSource> CursorPages<'_, S> {
    async fn run(self) -> Result<()> {
        let input_json = self.input.as_ref().map(serde_json::to_string).transpose()?;
        let mut cursor: Option<String> = None;
        let mut page = 1;

        loop {
            if self.client.cancel_token().is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let record = match self.writer.replay(&self.key, page) {
                Some(record) => record,
                None => self.fetch(page, cursor.take(), &input_json).await?,
            };
            if !record.has_next {
                return Ok(());
            }
            cursor = record.next_cursor;
            page += 1;
        }
    }

    async fn fetch(
        &self,
        page: usize,
        cursor: Option<String>,
        input_json: &Option<String>,
    ) -> Result<PageRecord> {
        let writer = &self.writer;
        let ctx = |e: CollectError| e.with_context(&writer.table, &writer.params, Some(page));

        let req = RequestData {
            pager: Pager::new(page, self.source.page_size()),
            cursor,
            params: self.params.as_ref().clone(),
            input: self.input.clone(),
            since: writer.since(),
        };
        let query = self.source.build_query(&req).map_err(ctx)?;
        let request = ApiRequest::post_json(
            self.source.endpoint_path(),
            json!({ "query": query.query, "variables": query.variables }),
        );

        let Some(response) = self.client.send(&request).await.map_err(ctx)? else {
            writer.skip(&self.key, page).map_err(ctx)?;
            return Ok(writer.record(&self.key, page));
        };
        let body: GraphqlResponse = response.json().map_err(ctx)?;

        if !body.errors.is_empty() {
            let summary = body.error_summary();
            if body.data.is_null() || !self.source.ignore_query_errors() {
                return Err(ctx(CollectError::GraphqlQuery(summary)));
            }
            warn!(
                table = %writer.table,
                page,
                errors = body.errors.len(),
                "Ignoring GraphQL field errors: {}",
                summary
            );
        }

        let items = self.source.parse_response(&body, &req).map_err(ctx)?;
        let (keep, finished_early) = match self.source.inspect_page(&items, &req).map_err(ctx)? {
            PageControl::Continue => (items.len(), false),
            PageControl::Finish { keep } => (keep.min(items.len()), true),
        };
        let next_cursor = self
            .source
            .page_info(&body.data)
            .filter(|info| info.has_next_page)
            .and_then(|info| info.end_cursor);
        let has_next = !finished_early && next_cursor.is_some();

        let kept = &items[..keep];
        let units = kept
            .iter()
            .map(|unit| {
                Ok(NewRawUnit {
                    params: writer.params.clone(),
                    input: input_json.clone(),
                    page: Some(page),
                    url: response.url.clone(),
                    data: serde_json::to_vec(unit)?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map_err(ctx)?;

        let record = PageRecord {
            item_count: units.len(),
            next_cursor,
            has_next,
            finished: !has_next,
            max_updated_at: kept.iter().filter_map(|i| self.source.updated_at(i)).max(),
            ..writer.record(&self.key, page)
        };
        writer.commit(&record, &units).map_err(ctx)?;

        debug!(
            table = %writer.table,
            input = %self.key,
            page,
            kept = units.len(),
            has_next,
            "GraphQL page committed"
        );
        Ok(record)
    }
}

/// Builds one query that repeats a sub-query per input row under aliases
///
/// ```text
/// query($owner: String!, $number_0: Int!, $number_1: Int!) {
///   q0: repository(owner: $owner) { pullRequest(number: $number_0) { id } }
///   q1: repository(owner: $owner) { pullRequest(number: $number_1) { id } }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct AliasBatch {
    field: String,
    vars: Vec<(String, String)>,
    shared: Vec<(String, String, Value)>,
}

impl AliasBatch {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            vars: Vec::new(),
            shared: Vec::new(),
        }
    }

    /// Per-row variable, renamed `$name_<row>` in each alias
    pub fn var(mut self, name: impl Into<String>, ty: impl Into<String>) -> Self {
        self.vars.push((name.into(), ty.into()));
        self
    }

    /// Variable with the same value in every alias
    pub fn shared(mut self, name: impl Into<String>, ty: impl Into<String>, value: Value) -> Self {
        self.shared.push((name.into(), ty.into(), value));
        self
    }

    pub fn build<F>(&self, rows: &[Value], bind: F) -> Result<GraphqlQuery>
    where
        F: Fn(&Value, &str) -> Option<Value>,
    {
        let mut defs = Vec::new();
        let mut variables = Map::new();
        for (name, ty, value) in &self.shared {
            defs.push(format!("${}: {}", name, ty));
            variables.insert(name.clone(), value.clone());
        }

        let per_row: HashSet<&str> = self.vars.iter().map(|(n, _)| n.as_str()).collect();
        let mut body = String::new();
        for (i, row) in rows.iter().enumerate() {
            for (name, ty) in &self.vars {
                let value = bind(row, name).ok_or_else(|| {
                    CollectError::Template(format!("row {} has no value for ${}", i, name))
                })?;
                let aliased = format!("{}_{}", name, i);
                defs.push(format!("${}: {}", aliased, ty));
                variables.insert(aliased, value);
            }
            body.push_str(&format!("  q{}: {}\n", i, rename_vars(&self.field, &per_row, i)));
        }

        let head = if defs.is_empty() {
            "query".to_string()
        } else {
            format!("query({})", defs.join(", "))
        };
        Ok(GraphqlQuery {
            query: format!("{} {{\n{}}}", head, body),
            variables: Value::Object(variables),
        })
    }
}

fn rename_vars(field: &str, per_row: &HashSet<&str>, row: usize) -> String {
    let mut out = String::with_capacity(field.len() + 8);
    let mut chars = field.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        out.push(c);
        if c != '$' {
            continue;
        }
        let mut end = start + 1;
        while let Some(&(i, next)) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                end = i + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }
        let name = &field[start + 1..end];
        out.push_str(name);
        if per_row.contains(name) {
            out.push_str(&format!("_{}", row));
        }
    }
    out
}

/// Per-row results of an [`AliasBatch`] query, in row order
pub fn split_aliased(data: &Value, rows: usize) -> Vec<Option<&Value>> {
    (0..rows)
        .map(|i| data.get(format!("q{}", i)).filter(|v| !v.is_null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientOptions, NoAuth, RetryConfig};
    use crate::collector::ScopeParams;
    use crate::store::{RawStore, SqliteStore};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    struct Pulls {
        ignore_errors: bool,
    }

    impl GraphqlSource for Pulls {
        fn page_size(&self) -> usize {
            2
        }

        fn build_query(&self, req: &RequestData) -> Result<GraphqlQuery> {
            Ok(GraphqlQuery {
                query: "query($after: String, $first: Int!) { pulls(first: $first, after: $after) { nodes { id } pageInfo { hasNextPage endCursor } } }".into(),
                variables: json!({ "after": req.cursor, "first": req.pager.size }),
            })
        }

        fn page_info(&self, data: &Value) -> Option<PageInfo> {
            PageInfo::at(data, "/pulls/pageInfo")
        }

        fn parse_response(&self, response: &GraphqlResponse, _req: &RequestData) -> Result<Vec<Value>> {
            Ok(response.data["pulls"]["nodes"]
                .as_array()
                .cloned()
                .unwrap_or_default())
        }

        fn ignore_query_errors(&self) -> bool {
            self.ignore_errors
        }
    }

    /// Three pages of two pulls; records every `after` it receives
    fn pulls_app(seen: Arc<Mutex<Vec<Value>>>, errors: Value) -> Router {
        Router::new().route(
            "/graphql",
            post(move |Json(body): Json<Value>| {
                let seen = seen.clone();
                let errors = errors.clone();
                async move {
                    let after = body["variables"]["after"].clone();
                    seen.lock().unwrap().push(after.clone());
                    let page = match after.as_str() {
                        None => 0,
                        Some("c1") => 1,
                        _ => 2,
                    };
                    Json(json!({
                        "data": { "pulls": {
                            "nodes": [{ "id": page * 2 }, { "id": page * 2 + 1 }],
                            "pageInfo": {
                                "hasNextPage": page < 2,
                                "endCursor": format!("c{}", page + 1)
                            }
                        }},
                        "errors": errors
                    }))
                }
            }),
        )
    }

    fn collector(endpoint: String, store: Arc<SqliteStore>, source: Pulls) -> GraphqlCollector<Pulls> {
        let client = ApiAsyncClient::new(
            ClientOptions::new(3, endpoint).with_retry(RetryConfig::quick()),
            Arc::new(NoAuth),
            &CancellationToken::new(),
        )
        .unwrap();
        let args = CollectorArgs::new(3, ScopeParams::new(&json!({ "repo": 9 })).unwrap(), "raw_pulls");
        GraphqlCollector::new(client, CollectorStores::shared(store), args, source)
    }

    #[tokio::test]
    async fn test_cursor_is_threaded_verbatim() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let endpoint = serve(pulls_app(seen.clone(), json!([]))).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());

        let summary = collector(endpoint, store.clone(), Pulls { ignore_errors: false })
            .execute()
            .await
            .unwrap();
        assert_eq!(summary.units, 6);
        assert_eq!(summary.pages, 3);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Null, json!("c1"), json!("c2")]
        );
        assert_eq!(store.count_raw("raw_pulls", r#"{"repo":9}"#).unwrap(), 6);
    }

    #[tokio::test]
    async fn test_partial_errors_follow_policy() {
        let errors = json!([{ "message": "Resource not accessible", "path": ["pulls", "nodes", 1] }]);

        let endpoint = serve(pulls_app(Arc::new(Mutex::new(Vec::new())), errors.clone())).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let err = collector(endpoint, store, Pulls { ignore_errors: false })
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err.root(), CollectError::GraphqlQuery(msg) if msg == "Resource not accessible"));

        let endpoint = serve(pulls_app(Arc::new(Mutex::new(Vec::new())), errors)).await;
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let summary = collector(endpoint, store, Pulls { ignore_errors: true })
            .execute()
            .await
            .unwrap();
        assert_eq!(summary.units, 6);
    }

    #[tokio::test]
    async fn test_errors_without_data_always_fail() {
        let app = Router::new().route(
            "/graphql",
            post(|| async { Json(json!({ "data": null, "errors": [{ "message": "bad query" }] })) }),
        );
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let err = collector(serve(app).await, store, Pulls { ignore_errors: true })
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err.root(), CollectError::GraphqlQuery(_)));
    }

    #[test]
    fn test_alias_batch() {
        let batch = AliasBatch::new("repository(owner: $owner) { pullRequest(number: $number) { id } }")
            .shared("owner", "String!", json!("acme"))
            .var("number", "Int!");
        let rows = vec![json!({ "number": 4 }), json!({ "number": 8 })];
        let query = batch.build(&rows, |row, name| row.get(name).cloned()).unwrap();

        assert_eq!(
            query.query,
            "query($owner: String!, $number_0: Int!, $number_1: Int!) {\n  q0: repository(owner: $owner) { pullRequest(number: $number_0) { id } }\n  q1: repository(owner: $owner) { pullRequest(number: $number_1) { id } }\n}"
        );
        assert_eq!(
            query.variables,
            json!({ "owner": "acme", "number_0": 4, "number_1": 8 })
        );

        assert!(batch.build(&[json!({})], |row, name| row.get(name).cloned()).is_err());
    }

    #[test]
    fn test_split_aliased() {
        let data = json!({ "q0": { "id": 1 }, "q1": null, "q2": { "id": 3 } });
        let rows = split_aliased(&data, 4);
        assert_eq!(rows[0], Some(&json!({ "id": 1 })));
        assert_eq!(rows[1], None);
        assert_eq!(rows[2], Some(&json!({ "id": 3 })));
        assert_eq!(rows[3], None);
    }
}
