//! Time-budgeted multi-stage pipelines.
//!
//! A [`StageBudgetRunner`] runs an ordered list of expensive stages against one
//! deadline. Optional stages are skipped when the remaining budget is below their
//! minimum; a failing required stage aborts the run and the runner returns each
//! required stage's declared fallback instead. Either way the caller receives a
//! [`PipelineOutcome`] with the same schema.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde_json::json;
//! use workq_core::jobs::pipeline::{Stage, StageBudgetRunner, StageOutput};
//!
//! # async fn demo() {
//! let outcome = StageBudgetRunner::with_budget(Duration::from_secs(30))
//!     .stage(Stage::required("facts", json!([]), Duration::from_secs(10), |_ctx| async {
//!         Ok(StageOutput::from(json!(["fact"])))
//!     }))
//!     .stage(Stage::optional("summary", Duration::from_secs(5), Duration::from_secs(15), |ctx| async move {
//!         Ok(StageOutput::from(json!({"facts": ctx.output("facts").cloned()})))
//!     }))
//!     .run()
//!     .await;
//! # }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::guard::panic_message;
use super::job::JobError;
use crate::telemetry::StageMetrics;

/// Reason recorded for an optional stage the budget could not fit.
pub const REASON_INSUFFICIENT_TIME: &str = "insufficient_time";
/// Reason recorded for stages after a required stage failed.
pub const REASON_PIPELINE_ABORTED: &str = "pipeline_aborted";

// ═══════════════════════════════════════════════════════════════════════════════
// Stage Definition
// ═══════════════════════════════════════════════════════════════════════════════

/// What a stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    pub value: Value,
    /// Resource cost reported by the stage (e.g. tokens or currency)
    pub cost: Option<f64>,
}

impl StageOutput {
    pub fn new(value: Value) -> Self {
        Self { value, cost: None }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

impl From<Value> for StageOutput {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// Inputs handed to a stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// Outputs of the stages that completed before this one
    pub outputs: BTreeMap<String, Value>,
    /// Time this stage may take
    pub allowance: Duration,
}

impl StageContext {
    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.outputs.get(stage)
    }
}

type StageFn = Box<dyn FnOnce(StageContext) -> BoxFuture<'static, Result<StageOutput, JobError>> + Send>;

/// One step of a pipeline.
pub struct Stage {
    name: String,
    required: bool,
    fallback: Value,
    minimum_time: Duration,
    max_timeout: Duration,
    run: StageFn,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("required", &self.required)
            .field("minimum_time", &self.minimum_time)
            .field("max_timeout", &self.max_timeout)
            .finish()
    }
}

impl Stage {
    /// A stage that is always attempted. If it fails the pipeline returns
    /// `fallback` under this stage's name.
    pub fn required<F, Fut>(name: impl Into<String>, fallback: Value, max_timeout: Duration, run: F) -> Self
    where
        F: FnOnce(StageContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StageOutput, JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            required: true,
            fallback,
            minimum_time: Duration::ZERO,
            max_timeout,
            // Building the future happens on first poll, inside the runner's panic guard
            run: Box::new(move |ctx| async move { run(ctx).await }.boxed()),
        }
    }

    /// A stage skipped when less than `minimum_time` remains.
    pub fn optional<F, Fut>(
        name: impl Into<String>,
        minimum_time: Duration,
        max_timeout: Duration,
        run: F,
    ) -> Self
    where
        F: FnOnce(StageContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<StageOutput, JobError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            required: false,
            fallback: Value::Null,
            minimum_time,
            max_timeout,
            run: Box::new(move |ctx| async move { run(ctx).await }.boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Telemetry
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Skipped,
    Failed,
    TimedOut,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Per-stage outcome, recorded for every stage whether or not it ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub required: bool,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

impl StageReport {
    fn skipped(stage: &Stage, reason: &str) -> Self {
        StageMetrics::record(&stage.name, StageStatus::Skipped.as_str(), None);
        Self {
            name: stage.name.clone(),
            required: stage.required,
            status: StageStatus::Skipped,
            reason: Some(reason.to_string()),
            duration_ms: 0,
            cost: None,
        }
    }
}

/// Composite result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// `{stage_name: value}` for completed stages, or the fallback values
    pub output: Value,
    pub fallback_used: bool,
    /// Set when any stage did not complete
    pub degraded: bool,
    pub stages: Vec<StageReport>,
    pub elapsed_ms: u64,
}

impl PipelineOutcome {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Sum of the costs reported by completed stages.
    pub fn total_cost(&self) -> f64 {
        self.stages.iter().filter_map(|s| s.cost).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Runner
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs stages in order against a shared deadline.
#[derive(Debug)]
pub struct StageBudgetRunner {
    deadline: Instant,
    stages: Vec<Stage>,
}

impl StageBudgetRunner {
    pub fn until(deadline: Instant) -> Self {
        Self {
            deadline,
            stages: Vec::new(),
        }
    }

    pub fn with_budget(budget: Duration) -> Self {
        Self::until(Instant::now() + budget)
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub async fn run(self) -> PipelineOutcome {
        let started = Instant::now();
        let deadline = self.deadline;

        let fallback: serde_json::Map<String, Value> = self
            .stages
            .iter()
            .filter(|s| s.required)
            .map(|s| (s.name.clone(), s.fallback.clone()))
            .collect();

        let mut outputs: BTreeMap<String, Value> = BTreeMap::new();
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut aborted_by: Option<String> = None;

        for stage in self.stages {
            if aborted_by.is_some() {
                reports.push(StageReport::skipped(&stage, REASON_PIPELINE_ABORTED));
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !stage.required && remaining < stage.minimum_time {
                debug!(
                    stage = %stage.name,
                    remaining_ms = remaining.as_millis() as u64,
                    minimum_ms = stage.minimum_time.as_millis() as u64,
                    "Skipping optional stage, budget too small"
                );
                reports.push(StageReport::skipped(&stage, REASON_INSUFFICIENT_TIME));
                continue;
            }

            let allowance = remaining.min(stage.max_timeout);
            let ctx = StageContext {
                outputs: outputs.clone(),
                allowance,
            };
            let Stage {
                name, required, run, ..
            } = stage;

            let stage_started = Instant::now();
            let attempt = AssertUnwindSafe(run(ctx)).catch_unwind();
            let result = tokio::time::timeout(allowance, attempt).await;
            let duration = stage_started.elapsed();

            let (status, reason, cost) = match result {
                Ok(Ok(Ok(output))) => {
                    outputs.insert(name.clone(), output.value);
                    (StageStatus::Completed, None, output.cost)
                }
                Ok(Ok(Err(error))) => (StageStatus::Failed, Some(error.message), None),
                Ok(Err(panic)) => (
                    StageStatus::Failed,
                    Some(format!("stage panicked: {}", panic_message(panic))),
                    None,
                ),
                Err(_) => (
                    StageStatus::TimedOut,
                    Some(format!("exceeded {}ms allowance", allowance.as_millis())),
                    None,
                ),
            };

            StageMetrics::record(&name, status.as_str(), Some(duration));

            if status != StageStatus::Completed {
                warn!(
                    stage = %name,
                    required,
                    status = status.as_str(),
                    reason = reason.as_deref().unwrap_or(""),
                    "Pipeline stage did not complete"
                );
                if required {
                    aborted_by = Some(name.clone());
                }
            }

            reports.push(StageReport {
                name,
                required,
                status,
                reason,
                duration_ms: duration.as_millis() as u64,
                cost,
            });
        }

        let fallback_used = aborted_by.is_some();
        let output = if fallback_used {
            StageMetrics::fallback();
            Value::Object(fallback)
        } else {
            Value::Object(outputs.into_iter().collect())
        };
        let degraded = reports.iter().any(|r| r.status != StageStatus::Completed);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        info!(
            stages = reports.len(),
            fallback_used,
            degraded,
            aborted_by = aborted_by.as_deref().unwrap_or(""),
            elapsed_ms,
            "Pipeline finished"
        );

        PipelineOutcome {
            output,
            fallback_used,
            degraded,
            stages: reports,
            elapsed_ms,
        }
    }
}
