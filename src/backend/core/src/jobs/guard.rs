//! Result guard: bounded, failure-proof execution of arbitrary async work.
//!
//! The guard spawns the work on the runtime and races it against a timer. Whatever
//! happens (an `Err`, a panic, a future that never settles) the caller gets a
//! [`GuardOutcome`] back within the timeout.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::job::{JobError, JobRecord, WorkResult};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal outcome produced by the guard.
#[derive(Debug, Clone)]
pub enum GuardOutcome {
    Completed {
        value: serde_json::Value,
        duration: Duration,
    },
    Failed {
        error: JobError,
        duration: Duration,
    },
}

impl GuardOutcome {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Completed { duration, .. } | Self::Failed { duration, .. } => *duration,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failed { error, .. } if error.timed_out)
    }

    pub fn into_result(self) -> WorkResult {
        match self {
            Self::Completed { value, .. } => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Auxiliary Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// Best-effort side effect run after a job's outcome has been stored.
///
/// Errors, panics and timeouts are logged and counted, never propagated.
#[async_trait]
pub trait AuxiliaryAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, record: &JobRecord) -> anyhow::Result<()>;
}

/// Writes a JSON copy of every terminal record to `{dir}/{job_id}.json`.
#[derive(Debug, Clone)]
pub struct ResultSnapshotAction {
    dir: PathBuf,
}

impl ResultSnapshotAction {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, record: &JobRecord) -> PathBuf {
        self.dir.join(format!("{}.json", record.id))
    }
}

#[async_trait]
impl AuxiliaryAction for ResultSnapshotAction {
    fn name(&self) -> &str {
        "result_snapshot"
    }

    async fn run(&self, record: &JobRecord) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(record)?;
        tokio::fs::write(self.path_for(record), body).await?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Result Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// Enforces the timeout and failure containment around a job's work.
#[derive(Clone)]
pub struct ResultGuard {
    auxiliaries: Vec<Arc<dyn AuxiliaryAction>>,
    auxiliary_timeout: Duration,
}

impl std::fmt::Debug for ResultGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.auxiliaries.iter().map(|a| a.name()).collect();
        f.debug_struct("ResultGuard")
            .field("auxiliaries", &names)
            .field("auxiliary_timeout", &self.auxiliary_timeout)
            .finish()
    }
}

impl Default for ResultGuard {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ResultGuard {
    pub fn new(auxiliary_timeout: Duration) -> Self {
        Self {
            auxiliaries: Vec::new(),
            auxiliary_timeout,
        }
    }

    pub fn with_auxiliary(mut self, action: Arc<dyn AuxiliaryAction>) -> Self {
        self.auxiliaries.push(action);
        self
    }

    pub fn with_auxiliaries(mut self, actions: impl IntoIterator<Item = Arc<dyn AuxiliaryAction>>) -> Self {
        self.auxiliaries.extend(actions);
        self
    }

    /// Run `work` to a terminal outcome, giving up after `timeout`.
    ///
    /// The timer is polled first, so it wins a tie. On timeout the spawned task is
    /// detached and keeps running until it settles on its own; its result is
    /// discarded.
    pub async fn run<Fut>(&self, timeout: Duration, work: Fut) -> GuardOutcome
    where
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        let started = Instant::now();
        let mut handle = tokio::spawn(work);
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            _ = &mut sleep => {
                let duration = started.elapsed();
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Work exceeded its time limit, abandoning it"
                );
                // Dropping the handle detaches the task without aborting it
                drop(handle);
                GuardOutcome::Failed {
                    error: JobError::timeout(duration.as_millis() as u64),
                    duration,
                }
            }

            joined = &mut handle => {
                let duration = started.elapsed();
                let duration_ms = duration.as_millis() as u64;
                match joined {
                    Ok(Ok(value)) => GuardOutcome::Completed { value, duration },
                    Ok(Err(error)) => GuardOutcome::Failed {
                        error: error.with_duration(duration_ms),
                        duration,
                    },
                    Err(join_error) if join_error.is_panic() => {
                        let message = panic_message(join_error.into_panic());
                        tracing::error!(panic = %message, "Work panicked");
                        GuardOutcome::Failed {
                            error: JobError::panic(message).with_duration(duration_ms),
                            duration,
                        }
                    }
                    Err(_) => GuardOutcome::Failed {
                        error: JobError::shutdown().with_duration(duration_ms),
                        duration,
                    },
                }
            }
        }
    }

    /// Run every auxiliary action against a terminal record.
    ///
    /// Returns the number of actions that succeeded.
    pub async fn run_auxiliaries(&self, record: &JobRecord) -> usize {
        let mut succeeded = 0;
        for action in &self.auxiliaries {
            let attempt = AssertUnwindSafe(action.run(record)).catch_unwind();
            match tokio::time::timeout(self.auxiliary_timeout, attempt).await {
                Ok(Ok(Ok(()))) => {
                    succeeded += 1;
                    tracing::debug!(job_id = %record.id, action = action.name(), "Auxiliary action done");
                }
                Ok(Ok(Err(error))) => {
                    JobMetrics::auxiliary_failure(action.name());
                    tracing::warn!(
                        job_id = %record.id,
                        action = action.name(),
                        error = %error,
                        "Auxiliary action failed"
                    );
                }
                Ok(Err(panic)) => {
                    JobMetrics::auxiliary_failure(action.name());
                    tracing::warn!(
                        job_id = %record.id,
                        action = action.name(),
                        panic = %panic_message(panic),
                        "Auxiliary action panicked"
                    );
                }
                Err(_) => {
                    JobMetrics::auxiliary_failure(action.name());
                    tracing::warn!(
                        job_id = %record.id,
                        action = action.name(),
                        timeout_ms = self.auxiliary_timeout.as_millis() as u64,
                        "Auxiliary action timed out"
                    );
                }
            }
        }
        succeeded
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{FailureKind, JobState};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAction {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AuxiliaryAction for CountingAction {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _record: &JobRecord) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingAction;

    #[async_trait]
    impl AuxiliaryAction for FailingAction {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&self, _record: &JobRecord) -> anyhow::Result<()> {
            anyhow::bail!("backup store unavailable")
        }
    }

    struct PanickingAction;

    #[async_trait]
    impl AuxiliaryAction for PanickingAction {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn run(&self, _record: &JobRecord) -> anyhow::Result<()> {
            panic!("counter overflow")
        }
    }

    struct HangingAction;

    #[async_trait]
    impl AuxiliaryAction for HangingAction {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn run(&self, _record: &JobRecord) -> anyhow::Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn finished_record() -> JobRecord {
        let mut record = JobRecord::queued("analysis", 1);
        record.mark_running();
        record.finish(Ok(json!({"score": 1})));
        record
    }

    #[tokio::test]
    async fn test_success_forwarded() {
        let guard = ResultGuard::default();
        let outcome = guard
            .run(Duration::from_secs(1), async { Ok(json!({"pages": 3})) })
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.into_result().unwrap(), json!({"pages": 3}));
    }

    #[tokio::test]
    async fn test_work_error_forwarded() {
        let guard = ResultGuard::default();
        let outcome = guard
            .run(Duration::from_secs(1), async {
                Err(JobError::new("site unreachable").with_code("FETCH"))
            })
            .await;
        assert!(!outcome.is_timeout());
        let error = outcome.into_result().unwrap_err();
        assert_eq!(error.message, "site unreachable");
        assert_eq!(error.kind, FailureKind::Work);
        assert!(error.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_never_settling_work_times_out() {
        let guard = ResultGuard::default();
        let started = Instant::now();
        let outcome = guard
            .run(Duration::from_millis(50), futures::future::pending())
            .await;
        assert!(outcome.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(500));
        let error = outcome.into_result().unwrap_err();
        assert_eq!(error.kind, FailureKind::Timeout);
        assert!(error.duration_ms.unwrap() >= 50);
    }

    #[tokio::test]
    async fn test_panic_becomes_failure() {
        let guard = ResultGuard::default();
        let outcome = guard
            .run(Duration::from_secs(1), async {
                if true {
                    panic!("parser exploded");
                }
                Ok(json!(null))
            })
            .await;
        let error = outcome.into_result().unwrap_err();
        assert_eq!(error.kind, FailureKind::Panic);
        assert!(error.message.contains("parser exploded"));
    }

    #[tokio::test]
    async fn test_auxiliary_failures_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guard = ResultGuard::new(Duration::from_millis(50))
            .with_auxiliary(Arc::new(FailingAction))
            .with_auxiliary(Arc::new(PanickingAction))
            .with_auxiliary(Arc::new(HangingAction))
            .with_auxiliary(Arc::new(CountingAction { calls: calls.clone() }));

        let record = finished_record();
        let succeeded = guard.run_auxiliaries(&record).await;

        assert_eq!(succeeded, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_result_snapshot_written() {
        let dir = tempfile::tempdir().unwrap();
        let action = ResultSnapshotAction::new(dir.path().join("snapshots"));
        let record = finished_record();

        action.run(&record).await.unwrap();

        let written = std::fs::read_to_string(action.path_for(&record)).unwrap();
        let parsed: JobRecord = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.id, record.id);
        assert_eq!(parsed.result, Some(json!({"score": 1})));
    }
}
