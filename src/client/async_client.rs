//! Rate-limited concurrent API client for one connection
//!
//! Every request goes through the same gates in order:
//! 1. a worker permit (bounded pool, sized from the rate budget)
//! 2. a rate-limit slot (sliding window, may sleep)
//! 3. the authenticator (credential rotation)
//! 4. status classification of the response
//!
//! Transient failures are retried, each retry re-acquiring a rate slot. An
//! authentication failure cancels the client's token, which stops every
//! queued request of the connection while in-flight ones finish.

use super::auth::{self, Authenticator};
use super::rate_limit::{DynamicRateLimit, RateBudget, RateLimiter};
use super::retry::{with_retry, RetryConfig};
use super::status::{parse_error_envelope, StatusRegistry};
use crate::config::{ConnectionConfig, EngineConfig};
use crate::{metrics, CollectError, ErrorKind, Result};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Client settings for one connection
#[derive(Clone)]
pub struct ClientOptions {
    pub connection_id: u64,
    /// Base URL; relative request paths are joined onto it
    pub endpoint: String,
    pub budget: RateBudget,
    /// Worker pool size; derived from the budget when unset
    pub workers: Option<usize>,
    pub timeout: Duration,
    pub retry: RetryConfig,
    /// Statuses that mark an item as skippable
    pub ignore_statuses: Vec<u16>,
    pub registry: StatusRegistry,
    pub dynamic_rate_limit: Option<Arc<dyn DynamicRateLimit>>,
}

impl ClientOptions {
    pub fn new(connection_id: u64, endpoint: impl Into<String>) -> Self {
        Self {
            connection_id,
            endpoint: endpoint.into(),
            budget: RateBudget::per_hour(18000),
            workers: None,
            timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
            ignore_statuses: vec![404],
            registry: StatusRegistry::default(),
            dynamic_rate_limit: None,
        }
    }

    /// Options for a configured connection
    pub fn from_config(engine: &EngineConfig, conn: &ConnectionConfig) -> Self {
        Self {
            budget: RateBudget::per_hour(conn.effective_rate_limit(engine.api_requests_per_hour)),
            timeout: engine.api_timeout(),
            retry: RetryConfig::with_max_retries(engine.api_retry),
            ignore_statuses: conn.ignore_statuses.clone(),
            ..Self::new(conn.id, conn.endpoint.clone())
        }
    }

    pub fn with_budget(mut self, budget: RateBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dynamic_rate_limit(mut self, dynamic: Arc<dyn DynamicRateLimit>) -> Self {
        self.dynamic_rate_limit = Some(dynamic);
        self
    }

    pub fn with_registry(mut self, registry: StatusRegistry) -> Self {
        self.registry = registry;
        self
    }
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Relative to the endpoint, or an absolute URL
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::get(path)
        }
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query.extend(query);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Final URL including the query string
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode the body; a mismatch is a malformed response
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| CollectError::Parse(format!("{}: {}", self.url, e)))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

struct ClientInner {
    connection_id: u64,
    endpoint: String,
    http: Client,
    auth: Arc<dyn Authenticator>,
    limiter: RateLimiter,
    workers: Semaphore,
    worker_count: usize,
    retry: RetryConfig,
    registry: StatusRegistry,
    ignore: HashSet<u16>,
    dynamic: Option<Arc<dyn DynamicRateLimit>>,
    cancel: CancellationToken,
}

/// Shared, cheaply cloneable handle to a connection's client
#[derive(Clone)]
pub struct ApiAsyncClient {
    inner: Arc<ClientInner>,
}

impl ApiAsyncClient {
    /// Create a client whose token is a child of `parent`
    ///
    /// Cancelling `parent` stops the client; a fatal error inside the client
    /// cancels only the client's own token.
    pub fn new(
        options: ClientOptions,
        auth: Arc<dyn Authenticator>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        if options.budget.requests == 0 || options.budget.window.is_zero() {
            return Err(CollectError::Config(format!(
                "connection {} has an empty rate budget ({} requests per {}s)",
                options.connection_id,
                options.budget.requests,
                options.budget.window.as_secs()
            )));
        }

        let http = Client::builder()
            .timeout(options.timeout)
            .default_headers({
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::USER_AGENT,
                    header::HeaderValue::from_static("collectkit/0.1"),
                );
                headers.insert(
                    header::ACCEPT,
                    header::HeaderValue::from_static("application/json"),
                );
                headers
            })
            .build()?;

        let worker_count = options
            .workers
            .unwrap_or_else(|| options.budget.worker_count());

        debug!(
            connection = options.connection_id,
            endpoint = %options.endpoint,
            requests = options.budget.requests,
            window_secs = options.budget.window.as_secs(),
            workers = worker_count,
            credentials = auth.credential_count(),
            "Creating API client"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection_id: options.connection_id,
                endpoint: options.endpoint,
                http,
                auth,
                limiter: RateLimiter::new(options.budget),
                workers: Semaphore::new(worker_count),
                worker_count,
                retry: options.retry,
                registry: options.registry,
                ignore: options.ignore_statuses.into_iter().collect(),
                dynamic: options.dynamic_rate_limit,
                cancel: parent.child_token(),
            }),
        })
    }

    /// Client for a configured connection
    pub fn from_config(
        engine: &EngineConfig,
        conn: &ConnectionConfig,
        parent: &CancellationToken,
    ) -> Result<Self> {
        Self::new(
            ClientOptions::from_config(engine, conn),
            auth::from_config(&conn.auth)?,
            parent,
        )
    }

    pub fn connection_id(&self) -> u64 {
        self.inner.connection_id
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Token cancelled by fatal errors or by the parent
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.inner.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send one request
    ///
    /// Returns `Ok(None)` when the response status is in the connection's
    /// ignore set, so the caller can skip the item and carry on.
    pub async fn send(&self, request: &ApiRequest) -> Result<Option<ApiResponse>> {
        let inner = &self.inner;
        let _permit = tokio::select! {
            _ = inner.cancel.cancelled() => return Err(CollectError::Cancelled),
            permit = inner.workers.acquire() => permit
                .map_err(|_| CollectError::Other("worker pool closed".to_string()))?,
        };

        let result = with_retry(&inner.retry, "api_request", &inner.cancel, |attempt| {
            self.attempt(request, attempt)
        })
        .await;

        if let Err(e) = &result {
            if e.is_fatal() {
                error!(
                    connection = inner.connection_id,
                    path = %request.path,
                    "Fatal API error, stopping connection: {}",
                    e
                );
                inner.cancel.cancel();
            }
        }
        result
    }

    async fn attempt(&self, request: &ApiRequest, attempt: u32) -> Result<Option<ApiResponse>> {
        let inner = &self.inner;
        inner.limiter.acquire(&inner.cancel).await?;
        metrics::record_dispatch(inner.connection_id);

        let url = self.url_for(&request.path);
        let mut builder = inner.http.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder = inner.auth.authenticate(builder);

        debug!(
            connection = inner.connection_id,
            method = %request.method,
            url = %url,
            attempt,
            "Dispatching request"
        );

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::record_response(inner.connection_id, None);
                return Err(e.into());
            }
        };

        let status = response.status().as_u16();
        metrics::record_response(inner.connection_id, Some(status));
        let headers = response.headers().clone();
        let final_url = response.url().to_string();

        if let Some(dynamic) = &inner.dynamic {
            if let Some(budget) = dynamic.budget(&headers) {
                inner.limiter.update(budget);
            }
        }

        let body = response.bytes().await?.to_vec();

        if (200..300).contains(&status) {
            return Ok(Some(ApiResponse {
                status,
                url: final_url,
                headers,
                body,
            }));
        }

        self.classify_failure(status, &headers, &final_url, &body)
    }

    fn classify_failure(
        &self,
        status: u16,
        headers: &HeaderMap,
        url: &str,
        body: &[u8],
    ) -> Result<Option<ApiResponse>> {
        let kind = self.inner.registry.classify(status);
        let message = parse_error_envelope(body)
            .unwrap_or_else(|| String::from_utf8_lossy(body).chars().take(200).collect());

        if kind == ErrorKind::Unauthorized {
            return Err(CollectError::Unauthorized(format!(
                "HTTP {} from {}: {}",
                status, url, message
            )));
        }

        if self.inner.ignore.contains(&status) {
            debug!(
                connection = self.inner.connection_id,
                status,
                url,
                "Ignoring response status, skipping item"
            );
            return Ok(None);
        }

        if kind == ErrorKind::RateLimited {
            let retry_after = headers
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(60);
            warn!(
                connection = self.inner.connection_id,
                retry_after,
                "Provider rate limit hit"
            );
            return Err(CollectError::RateLimited(retry_after));
        }

        Err(CollectError::Api {
            status,
            kind,
            message,
        })
    }

    /// New group for tasks that must be awaited together
    pub fn task_group(&self) -> TaskGroup {
        TaskGroup {
            cancel: self.inner.cancel.clone(),
            tasks: JoinSet::new(),
        }
    }
}

/// Tasks queued by one caller of a client
///
/// A group joins only its own tasks. The worker pool, rate budget and
/// cancellation token stay shared with every other user of the client.
pub struct TaskGroup {
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl TaskGroup {
    /// Queue a task; collect its result with [`Self::wait_async`]
    ///
    /// Tasks still queued when the client's token is cancelled resolve to
    /// `Cancelled` without running. A fatal error cancels the client.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            if cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }
            let result = task.await;
            if let Err(e) = &result {
                if e.is_fatal() {
                    cancel.cancel();
                }
            }
            result
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every task of the group; returns the first real error
    ///
    /// Cancellations caused by another task's failure never mask that failure.
    pub async fn wait_async(mut self) -> Result<()> {
        let mut first: Option<CollectError> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) => CollectError::Other(format!("request task failed: {}", e)),
            };
            let replace = match &first {
                None => true,
                Some(prev) => prev.is_cancelled() && !err.is_cancelled(),
            };
            if replace {
                first = Some(err);
            }
        }

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
