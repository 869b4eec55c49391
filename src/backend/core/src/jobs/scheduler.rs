//! Scheduler: the single entry point collaborators use.
//!
//! A [`Scheduler`] is a cheap, cloneable handle. It owns one [`TypeQueue`] per work
//! type, the job records, the coordinator and the result guard.
//!
//! # Example
//!
//! ```rust,no_run
//! use serde_json::json;
//! use workq_core::jobs::Scheduler;
//!
//! # async fn demo() -> workq_core::Result<()> {
//! let scheduler = Scheduler::builder().build()?;
//! let id = scheduler.enqueue("analysis", "https://example.com", 1, |_ctx, url| async move {
//!     Ok(json!({ "url": url }))
//! })?;
//! let record = scheduler.wait_for(id, std::time::Duration::from_secs(30)).await;
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::guard::{AuxiliaryAction, ResultGuard};
use super::job::{JobContext, JobId, JobRecord, JobState, WorkResult};
use super::priority::{BatchSizePriority, PriorityPolicy};
use super::queue::{admission_loop, BoxedWork, TypeQueue};
use crate::config::{SchedulerConfig, TypeQueueConfig};
use crate::coordination::Coordinator;
use crate::error::{ErrorCode, Result, WorkqError};
use crate::telemetry::JobMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Read Models
// ═══════════════════════════════════════════════════════════════════════════════

/// Snapshot of one type's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStatus {
    pub max_concurrent: usize,
    pub running: usize,
    pub queued: usize,
}

/// Snapshot of every type's queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub enabled: bool,
    pub distributed: bool,
    pub types: BTreeMap<String, TypeStatus>,
}

/// Aggregated states for a set of job ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkStatus {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_found: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkCancel {
    pub cancelled: usize,
    pub total: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

pub(crate) struct SchedulerInner {
    pub(crate) config: SchedulerConfig,
    pub(crate) queues: DashMap<String, Arc<TypeQueue>>,
    pub(crate) records: DashMap<JobId, JobRecord>,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) policy: Arc<dyn PriorityPolicy>,
    pub(crate) guard: ResultGuard,
    pub(crate) shutdown: CancellationToken,
    /// Fired whenever any job reaches a terminal state
    pub(crate) completed: Notify,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("enabled", &self.inner.config.enabled)
            .field("types", &self.inner.queues.len())
            .field("jobs", &self.inner.records.len())
            .field("coordinator", &self.inner.coordinator)
            .finish()
    }
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Submit a job. Returns as soon as the job is in its type's backlog.
    ///
    /// `payload` is moved into `work` at admission and never inspected.
    ///
    /// # Errors
    ///
    /// `InvalidJobType` for a blank type, `UnknownJobType` for an unregistered type
    /// when unregistered types are not allowed.
    pub fn enqueue<P, F, Fut>(&self, job_type: &str, payload: P, priority_hint: u64, work: F) -> Result<JobId>
    where
        P: Send + 'static,
        F: FnOnce(JobContext, P) -> Fut + Send + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        let queue = self.queue_for(job_type)?;
        let priority = self.inner.policy.priority_for(priority_hint);

        let record = JobRecord::queued(job_type, priority);
        let id = record.id;
        self.inner.records.insert(id, record);

        let work: BoxedWork = Box::new(move |ctx| work(ctx, payload).boxed());
        queue.push(id, priority, work);

        JobMetrics::enqueued(job_type);
        debug!(job_id = %id, job_type = %job_type, priority, "Job enqueued");
        Ok(id)
    }

    /// Cancel a job that has not been admitted yet.
    ///
    /// Returns `false` for running, terminal and unknown jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        let Some(job_type) = self.inner.records.get(&id).map(|r| r.job_type.clone()) else {
            return false;
        };
        let Some(queue) = self.inner.queues.get(&job_type).map(|q| q.value().clone()) else {
            return false;
        };

        let cancelled = queue.cancel(id, &self.inner.records);
        if cancelled {
            JobMetrics::cancelled(&job_type);
            self.inner.completed.notify_waiters();
            info!(job_id = %id, job_type = %job_type, "Job cancelled");
        } else {
            debug!(job_id = %id, job_type = %job_type, "Cancel ignored, job already admitted or finished");
        }
        cancelled
    }

    pub fn get_status(&self, id: JobId) -> Option<JobRecord> {
        self.inner.records.get(&id).map(|r| r.value().clone())
    }

    /// Like [`get_status`](Self::get_status), but an unknown id is a `JobNotFound` error.
    pub fn job(&self, id: JobId) -> Result<JobRecord> {
        self.get_status(id).ok_or_else(|| WorkqError::job_not_found(id))
    }

    /// Per-type limits and counts.
    ///
    /// When distributed, `running` is the cluster-wide count from the shared store,
    /// or the local count if that read fails.
    pub async fn get_queue_status(&self) -> QueueStatus {
        let queues: Vec<Arc<TypeQueue>> = self.inner.queues.iter().map(|q| q.value().clone()).collect();
        let distributed = self.inner.coordinator.is_distributed();

        let mut types = BTreeMap::new();
        for queue in queues {
            let local = queue.running();
            let running = if distributed {
                self.inner
                    .coordinator
                    .read_running(queue.name())
                    .await
                    .unwrap_or(local)
            } else {
                local
            };
            types.insert(
                queue.name().to_string(),
                TypeStatus {
                    max_concurrent: queue.limits().max_concurrent,
                    running,
                    queued: queue.queued(),
                },
            );
        }

        QueueStatus {
            enabled: self.inner.config.enabled,
            distributed,
            types,
        }
    }

    pub fn bulk_status(&self, ids: &[JobId]) -> BulkStatus {
        let mut status = BulkStatus {
            total: ids.len(),
            ..Default::default()
        };
        for id in ids {
            match self.inner.records.get(id).map(|r| r.state) {
                Some(JobState::Queued) => status.queued += 1,
                Some(JobState::Running) => status.running += 1,
                Some(JobState::Completed) => status.completed += 1,
                Some(JobState::Failed) => status.failed += 1,
                Some(JobState::Cancelled) => status.cancelled += 1,
                None => status.not_found += 1,
            }
        }
        status
    }

    pub fn bulk_cancel(&self, ids: &[JobId]) -> BulkCancel {
        let cancelled = ids.iter().filter(|id| self.cancel(**id)).count();
        BulkCancel {
            cancelled,
            total: ids.len(),
        }
    }

    /// Wait until a job is terminal.
    ///
    /// Returns `None` for unknown ids or when `timeout` elapses first.
    pub async fn wait_for(&self, id: JobId, timeout: Duration) -> Option<JobRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.inner.completed.notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();

            let record = self.get_status(id)?;
            if record.state.is_terminal() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Register or update limits for a type.
    pub fn register_type(&self, name: &str, limits: TypeQueueConfig) -> Result<()> {
        validate_limits(name, &limits)?;
        if let Some(queue) = self.inner.queues.get(name) {
            queue.set_limits(limits);
            info!(job_type = %name, max_concurrent = limits.max_concurrent, "Job type limits updated");
            return Ok(());
        }
        self.spawn_queue(name, limits);
        Ok(())
    }

    /// Registered work types.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.queues.iter().map(|q| q.key().clone()).collect();
        types.sort();
        types
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coordinator
    }

    /// Stop every admission loop. Running jobs finish; queued jobs stay queued.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            self.inner.shutdown.cancel();
            info!(queued = self.inner.queues.iter().map(|q| q.queued()).sum::<usize>(), "Scheduler shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn queue_for(&self, job_type: &str) -> Result<Arc<TypeQueue>> {
        if job_type.trim().is_empty() {
            return Err(WorkqError::new(ErrorCode::InvalidJobType, "Job type must not be blank"));
        }
        if let Some(queue) = self.inner.queues.get(job_type) {
            return Ok(queue.value().clone());
        }
        if !self.inner.config.allow_unregistered_types {
            return Err(WorkqError::new(
                ErrorCode::UnknownJobType,
                format!("Unknown job type: {}", job_type),
            ));
        }
        Ok(self.spawn_queue(job_type, self.inner.config.default_type_config()))
    }

    fn spawn_queue(&self, name: &str, limits: TypeQueueConfig) -> Arc<TypeQueue> {
        let entry = self.inner.queues.entry(name.to_string()).or_insert_with(|| {
            let queue = Arc::new(TypeQueue::new(name, limits));
            tokio::spawn(admission_loop(
                queue.clone(),
                Arc::downgrade(&self.inner),
                self.inner.shutdown.clone(),
                self.inner.config.admission_poll_interval,
            ));
            info!(
                job_type = %name,
                max_concurrent = limits.max_concurrent,
                timeout_ms = limits.timeout.as_millis() as u64,
                "Job type registered"
            );
            queue
        });
        entry.value().clone()
    }
}

fn validate_limits(name: &str, limits: &TypeQueueConfig) -> Result<()> {
    if name.trim().is_empty() {
        return Err(WorkqError::new(ErrorCode::InvalidJobType, "Job type must not be blank"));
    }
    if limits.max_concurrent == 0 || limits.timeout.is_zero() {
        return Err(WorkqError::new(
            ErrorCode::InvalidInput,
            format!("Job type {} needs max_concurrent >= 1 and a non-zero timeout", name),
        ));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    policy: Option<Arc<dyn PriorityPolicy>>,
    coordinator: Option<Arc<Coordinator>>,
    auxiliaries: Vec<Arc<dyn AuxiliaryAction>>,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn priority_policy(mut self, policy: impl PriorityPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn auxiliary(mut self, action: Arc<dyn AuxiliaryAction>) -> Self {
        self.auxiliaries.push(action);
        self
    }

    /// Build the scheduler and start admission loops for configured types.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Scheduler> {
        for (name, limits) in &self.config.types {
            validate_limits(name, limits)?;
        }
        if self.config.allow_unregistered_types {
            validate_limits("default", &self.config.default_type_config())?;
        }
        if self.config.admission_poll_interval.is_zero() {
            return Err(WorkqError::invalid_config(
                "scheduler.admission_poll_interval must be greater than zero",
            ));
        }

        let guard = ResultGuard::new(self.config.auxiliary_timeout).with_auxiliaries(self.auxiliaries);
        let types = self.config.types.clone();
        let scheduler = Scheduler {
            inner: Arc::new(SchedulerInner {
                coordinator: self.coordinator.unwrap_or_default(),
                policy: self.policy.unwrap_or_else(|| Arc::new(BatchSizePriority)),
                guard,
                queues: DashMap::new(),
                records: DashMap::new(),
                shutdown: CancellationToken::new(),
                completed: Notify::new(),
                config: self.config,
            }),
        };

        for (name, limits) in types {
            scheduler.spawn_queue(&name, limits);
        }

        info!(
            enabled = scheduler.inner.config.enabled,
            distributed = scheduler.inner.coordinator.is_distributed(),
            types = scheduler.inner.queues.len(),
            "Scheduler started"
        );
        Ok(scheduler)
    }
}
