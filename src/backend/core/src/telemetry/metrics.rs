//! Prometheus metrics for queues, jobs, pipeline stages and coordination.
//!
//! The `metrics` facade is a no-op until a recorder is installed, so library code
//! records unconditionally and only the binary decides whether to export.
//!
//! # Example
//!
//! ```rust,no_run
//! use workq_core::telemetry::metrics::JobMetrics;
//!
//! JobMetrics::enqueued("analysis");
//! JobMetrics::queue_depth("analysis", 4);
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether the Prometheus recorder is installed
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Histogram buckets for job and stage durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            duration_buckets: default_duration_buckets(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
}

/// Handle to the installed recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    /// Whether a recorder is installed.
    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let mut builder = PrometheusBuilder::new();
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    builder = builder.set_buckets(&config.duration_buckets)?;

    let handle = builder.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("workq_jobs_enqueued_total", "Jobs accepted by enqueue");
    describe_counter!("workq_jobs_admitted_total", "Jobs moved from backlog into execution");
    describe_counter!("workq_jobs_finished_total", "Jobs that reached completed or failed");
    describe_counter!("workq_jobs_cancelled_total", "Jobs cancelled before admission");
    describe_histogram!(
        "workq_job_duration_seconds",
        "Wall-clock duration of admitted jobs"
    );
    describe_gauge!("workq_queue_depth", "Jobs waiting in a type backlog");
    describe_gauge!("workq_running_jobs", "Jobs currently running per type");

    describe_counter!("workq_stage_total", "Pipeline stages by outcome");
    describe_histogram!("workq_stage_duration_seconds", "Duration of attempted stages");
    describe_counter!("workq_pipeline_fallbacks_total", "Pipelines that returned their fallback");

    describe_counter!(
        "workq_auxiliary_failures_total",
        "Auxiliary actions that failed, timed out or panicked"
    );
    describe_counter!(
        "workq_coordination_failovers_total",
        "Switches from the distributed store to in-process coordination"
    );
    describe_counter!("workq_errors_total", "Errors by code and category");
}

/// Job lifecycle metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn enqueued(job_type: &str) {
        counter!("workq_jobs_enqueued_total", "type" => job_type.to_string()).increment(1);
    }

    pub fn admitted(job_type: &str) {
        counter!("workq_jobs_admitted_total", "type" => job_type.to_string()).increment(1);
    }

    pub fn cancelled(job_type: &str) {
        counter!("workq_jobs_cancelled_total", "type" => job_type.to_string()).increment(1);
    }

    /// Record a terminal outcome and its duration.
    pub fn finished(job_type: &str, state: &'static str, timed_out: bool, duration: Duration) {
        counter!(
            "workq_jobs_finished_total",
            "type" => job_type.to_string(),
            "state" => state,
            "timed_out" => timed_out.to_string(),
        )
        .increment(1);
        histogram!("workq_job_duration_seconds", "type" => job_type.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn queue_depth(job_type: &str, depth: usize) {
        gauge!("workq_queue_depth", "type" => job_type.to_string()).set(depth as f64);
    }

    pub fn running(job_type: &str, running: usize) {
        gauge!("workq_running_jobs", "type" => job_type.to_string()).set(running as f64);
    }

    pub fn auxiliary_failure(action: &str) {
        counter!("workq_auxiliary_failures_total", "action" => action.to_string()).increment(1);
    }
}

/// Pipeline stage metrics.
pub struct StageMetrics;

impl StageMetrics {
    pub fn record(stage: &str, status: &'static str, duration: Option<Duration>) {
        counter!("workq_stage_total", "stage" => stage.to_string(), "status" => status)
            .increment(1);
        if let Some(duration) = duration {
            histogram!("workq_stage_duration_seconds", "stage" => stage.to_string())
                .record(duration.as_secs_f64());
        }
    }

    pub fn fallback() {
        counter!("workq_pipeline_fallbacks_total").increment(1);
    }
}

/// Coordination store metrics.
pub struct CoordinationMetrics;

impl CoordinationMetrics {
    pub fn failover(backend: &'static str) {
        counter!("workq_coordination_failovers_total", "backend" => backend).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_registry_renders_nothing() {
        let config = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        let registry = init_metrics(&config, "test").unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        JobMetrics::enqueued("analysis");
        JobMetrics::finished("analysis", "completed", false, Duration::from_millis(5));
        StageMetrics::record("summary", "skipped", None);
        CoordinationMetrics::failover("redis");
    }
}
