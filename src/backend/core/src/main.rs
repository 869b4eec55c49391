//! workq demo - runs a synthetic batch through the scheduler and prints the result.

use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use workq_core::{
    config::{Config, TypeQueueConfig},
    coordination::Coordinator,
    jobs::{JobError, JobId, ResultSnapshotAction, Scheduler, Stage, StageOutput},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "workq-demo", version, about = "Exercise the workq scheduler with a synthetic workload")]
struct Args {
    /// Configuration file (TOML/YAML/JSON); environment variables override it
    #[arg(short, long, env = "WORKQ_CONFIG")]
    config: Option<String>,

    /// Number of analysis jobs submitted as one bulk batch
    #[arg(short, long, default_value_t = 5)]
    batch: usize,

    /// Write a JSON snapshot of every finished job into this directory
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,

    /// How long to wait for the batch before printing status
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load().unwrap_or_else(|e| {
            eprintln!("Warning: Could not load config: {}. Using defaults.", e);
            Config::default()
        }),
    };

    let metrics = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting workq demo");

    let coordinator = Arc::new(Coordinator::from_config(&config.coordination).await);

    let mut builder = Scheduler::builder()
        .config(config.scheduler.clone())
        .coordinator(coordinator);
    if let Some(dir) = &args.snapshot_dir {
        builder = builder.auxiliary(Arc::new(ResultSnapshotAction::new(dir)));
    }
    let scheduler = builder.build()?;

    for (name, limits) in [
        ("analysis", TypeQueueConfig::new(2, Duration::from_secs(2))),
        ("synthesis", TypeQueueConfig::new(1, Duration::from_secs(3))),
        ("enrichment", TypeQueueConfig::new(1, Duration::from_millis(200))),
    ] {
        if !config.scheduler.types.contains_key(name) {
            scheduler.register_type(name, limits)?;
        }
    }

    let ids = tokio::select! {
        ids = run_workload(&scheduler, &args) => ids?,
        _ = shutdown_signal() => {
            scheduler.shutdown();
            return Ok(());
        }
    };

    let queue_status = scheduler.get_queue_status().await;
    let bulk_status = scheduler.bulk_status(&ids);
    let jobs = ids.iter().map(|id| scheduler.job(*id)).collect::<Result<Vec<_>, _>>()?;

    let report = json!({
        "queue": queue_status,
        "bulk": bulk_status,
        "jobs": jobs,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    scheduler.shutdown();
    if metrics.is_enabled() {
        tracing::debug!(metrics = %metrics.render(), "Final metrics");
    }
    tracing::info!("Demo complete");

    Ok(())
}

/// Submit the demo jobs and wait for every one of them to settle.
async fn run_workload(scheduler: &Scheduler, args: &Args) -> anyhow::Result<Vec<JobId>> {
    let mut ids = Vec::new();

    // Bulk batch: priority equals batch size, so these sort behind interactive work
    for i in 0..args.batch {
        let url = format!("https://example.com/page/{}", i);
        let id = scheduler.enqueue("analysis", url, args.batch as u64, move |_ctx, url: String| async move {
            tokio::time::sleep(Duration::from_millis(100 + 50 * (i as u64 % 4))).await;
            Ok(json!({ "url": url, "score": 50 + i }))
        })?;
        ids.push(id);
    }

    // Interactive request jumps the batch
    ids.push(scheduler.enqueue("analysis", "https://example.com", 1, |_ctx, url: &'static str| async move {
        Ok(json!({ "url": url, "score": 99, "interactive": true }))
    })?);

    // Never settles; the guard fails it after the type timeout
    ids.push(scheduler.enqueue("enrichment", (), 1, |_ctx, _| async {
        futures::future::pending::<()>().await;
        Ok(json!(null))
    })?);

    // Multi-stage job spending its own deadline
    ids.push(scheduler.enqueue("synthesis", vec!["fact a", "fact b"], 1, |ctx, facts: Vec<&'static str>| async move {
        let fallback = json!(facts);
        let outcome = ctx
            .stage_runner()
            .stage(Stage::required("facts", fallback, Duration::from_secs(1), move |_| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(StageOutput::new(json!(facts)).with_cost(0.002))
            }))
            .stage(Stage::optional(
                "summary",
                Duration::from_millis(500),
                Duration::from_secs(1),
                |stage_ctx| async move {
                    let count = stage_ctx
                        .output("facts")
                        .and_then(|v| v.as_array())
                        .map(|a| a.len())
                        .unwrap_or(0);
                    Ok(StageOutput::new(json!(format!("{} facts reviewed", count))).with_cost(0.01))
                },
            ))
            .stage(Stage::optional(
                "deep_dive",
                Duration::from_secs(60),
                Duration::from_secs(60),
                |_| async { Err(JobError::new("deep dive is never reached in the demo budget")) },
            ))
            .run()
            .await;
        Ok(serde_json::to_value(outcome)?)
    })?);

    // Cancel the last batch entry before it can be admitted
    if let Some(last) = args.batch.checked_sub(1).map(|i| ids[i]) {
        let cancelled = scheduler.cancel(last);
        tracing::info!(job_id = %last, cancelled, "Cancelled one batch job");
    }

    let wait = Duration::from_secs(args.wait_secs);
    for id in &ids {
        if scheduler.wait_for(*id, wait).await.is_none() {
            tracing::warn!(job_id = %id, "Job did not settle within the wait window");
        }
    }

    Ok(ids)
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
