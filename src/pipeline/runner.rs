//! Scope pipeline runner
//!
//! Stages of one scope run strictly in order; each stage's writes are
//! committed before the next stage starts. Independent scopes run
//! concurrently and never affect each other's outcome.

use crate::collector::{GraphqlCollector, GraphqlSource, RestCollector, RestSource};
use crate::{metrics, CollectError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Inputs every stage receives from its host
#[derive(Debug, Clone)]
pub struct StageContext {
    pub cancel: CancellationToken,
    /// `false` asks every stage for a full pass
    pub incremental: bool,
}

impl StageContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            incremental: true,
        }
    }

    pub fn full(mut self) -> Self {
        self.incremental = false;
        self
    }
}

/// What a stage did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOutcome {
    /// The stage processed only new data
    pub incremental: bool,
    /// Rows written (raw units, normalized rows or canonical rows)
    pub records: usize,
}

/// One step of a scope pipeline (collect, extract or convert)
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome>;
}

#[async_trait]
impl<S: RestSource> Stage for RestCollector<S> {
    fn name(&self) -> &str {
        &self.args().table
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let summary = if ctx.incremental {
            self.execute().await?
        } else {
            self.collect(&self.args().clone().full()).await?
        };
        Ok(StageOutcome {
            incremental: summary.incremental,
            records: summary.units,
        })
    }
}

#[async_trait]
impl<S: GraphqlSource> Stage for GraphqlCollector<S> {
    fn name(&self) -> &str {
        &self.args().table
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageOutcome> {
        let summary = if ctx.incremental {
            self.execute().await?
        } else {
            self.collect(&self.args().clone().full()).await?
        };
        Ok(StageOutcome {
            incremental: summary.incremental,
            records: summary.units,
        })
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    /// Stopped by the cancellation token; not a failure
    Cancelled,
    Failed(CollectError),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub outcome: StageOutcome,
    pub duration_secs: u64,
}

/// Result of one scope's pipeline
#[derive(Debug)]
pub struct ScopeReport {
    pub scope: String,
    pub outcome: RunOutcome,
    /// Stages that completed, in order
    pub stages: Vec<StageReport>,
}

/// Ordered stages for one scope
pub struct ScopePipeline {
    scope: String,
    stages: Vec<Box<dyn Stage>>,
}

impl ScopePipeline {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Run every stage in order, stopping at the first failure
    ///
    /// A stage that had to run in full makes every later stage run in full
    /// as well, so a full collection is always followed by a full extraction
    /// and conversion.
    pub async fn run(&self, ctx: &StageContext) -> ScopeReport {
        let mut stage_ctx = ctx.clone();
        let mut stages = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            if stage_ctx.cancel.is_cancelled() {
                return self.finish(RunOutcome::Cancelled, stages);
            }

            let started = Instant::now();
            let result = stage.run(&stage_ctx).await;
            let elapsed = started.elapsed();

            match result {
                Ok(outcome) => {
                    metrics::record_stage(stage.name(), "completed", elapsed.as_secs_f64());
                    info!(
                        scope = %self.scope,
                        stage = stage.name(),
                        records = outcome.records,
                        incremental = outcome.incremental,
                        duration_ms = elapsed.as_millis() as u64,
                        "Stage complete"
                    );
                    stage_ctx.incremental &= outcome.incremental;
                    stages.push(StageReport {
                        stage: stage.name().to_string(),
                        outcome,
                        duration_secs: elapsed.as_secs(),
                    });
                }
                Err(e) if e.is_cancelled() => {
                    metrics::record_stage(stage.name(), "cancelled", elapsed.as_secs_f64());
                    warn!(scope = %self.scope, stage = stage.name(), "Stage cancelled");
                    return self.finish(RunOutcome::Cancelled, stages);
                }
                Err(e) => {
                    metrics::record_stage(stage.name(), "failed", elapsed.as_secs_f64());
                    error!(scope = %self.scope, stage = stage.name(), "Stage failed: {}", e);
                    return self.finish(RunOutcome::Failed(e), stages);
                }
            }
        }

        self.finish(RunOutcome::Completed, stages)
    }

    fn finish(&self, outcome: RunOutcome, stages: Vec<StageReport>) -> ScopeReport {
        ScopeReport {
            scope: self.scope.clone(),
            outcome,
            stages,
        }
    }
}

/// Run independent scopes concurrently, at most `concurrency` at a time
///
/// Reports come back in the order of `pipelines`. A failure or panic in one
/// scope is confined to that scope's report.
pub async fn run_scopes(
    pipelines: Vec<ScopePipeline>,
    ctx: &StageContext,
    concurrency: usize,
) -> Vec<ScopeReport> {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(pipelines.len());

    for pipeline in pipelines {
        let scope = pipeline.scope.clone();
        let permits = permits.clone();
        let ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                _ = ctx.cancel.cancelled() => return pipeline.finish(RunOutcome::Cancelled, Vec::new()),
                permit = permits.acquire_owned() => permit,
            };
            pipeline.run(&ctx).await
        });
        handles.push((scope, handle));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (scope, handle) in handles {
        let report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                error!(scope = %scope, "Scope task aborted: {}", e);
                ScopeReport {
                    scope,
                    outcome: RunOutcome::Failed(CollectError::Other(format!(
                        "scope task aborted: {}",
                        e
                    ))),
                    stages: Vec::new(),
                }
            }
        };
        reports.push(report);
    }
    reports
}
