//! Per-type backlog and admission loop.
//!
//! Each work type owns one [`TypeQueue`]: a backlog ordered by `(priority, sequence)`
//! and a running count, both behind one lock. A dedicated tokio task per type is the
//! only place that admits jobs, so the running count and backlog pops stay
//! consistent without any lock spanning types.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use super::job::{JobContext, JobId, JobRecord, WorkResult};
use super::scheduler::SchedulerInner;
use crate::config::TypeQueueConfig;
use crate::coordination::SlotLease;
use crate::telemetry::JobMetrics;

/// Work closure with its payload already captured.
pub(crate) type BoxedWork = Box<dyn FnOnce(JobContext) -> BoxFuture<'static, WorkResult> + Send>;

/// Backlog ordering key: lower priority first, then enqueue order.
type BacklogKey = (i64, u64);

pub(crate) struct PendingJob {
    id: JobId,
    work: BoxedWork,
}

#[derive(Default)]
struct QueueState {
    backlog: BTreeMap<BacklogKey, PendingJob>,
    index: HashMap<JobId, BacklogKey>,
    next_seq: u64,
    running: usize,
}

/// Bounded-concurrency dispatcher for one work type.
pub struct TypeQueue {
    name: String,
    limits: Mutex<TypeQueueConfig>,
    state: Mutex<QueueState>,
    wake: Notify,
}

impl std::fmt::Debug for TypeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeQueue")
            .field("name", &self.name)
            .field("limits", &*self.limits.lock())
            .field("queued", &self.queued())
            .field("running", &self.running())
            .finish()
    }
}

impl TypeQueue {
    pub(crate) fn new(name: impl Into<String>, limits: TypeQueueConfig) -> Self {
        Self {
            name: name.into(),
            limits: Mutex::new(limits),
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> TypeQueueConfig {
        *self.limits.lock()
    }

    /// Jobs waiting for admission.
    pub fn queued(&self) -> usize {
        self.state.lock().backlog.len()
    }

    /// Jobs admitted by this process and not yet finished.
    pub fn running(&self) -> usize {
        self.state.lock().running
    }

    /// Update limits for future admissions.
    pub(crate) fn set_limits(&self, limits: TypeQueueConfig) {
        *self.limits.lock() = limits;
        self.wake.notify_one();
    }

    /// Insert a job into the backlog and wake the admission loop.
    pub(crate) fn push(&self, id: JobId, priority: i64, work: BoxedWork) {
        let depth = {
            let mut state = self.state.lock();
            let key = (priority, state.next_seq);
            state.next_seq += 1;
            state.backlog.insert(key, PendingJob { id, work });
            state.index.insert(id, key);
            state.backlog.len()
        };
        JobMetrics::queue_depth(&self.name, depth);
        self.wake.notify_one();
    }

    /// Remove a still-queued job and mark it cancelled.
    ///
    /// Runs under the backlog lock, so it cannot interleave with an admission of the
    /// same job.
    pub(crate) fn cancel(&self, id: JobId, records: &DashMap<JobId, JobRecord>) -> bool {
        let mut state = self.state.lock();
        let Some(key) = state.index.get(&id).copied() else {
            return false;
        };
        let cancelled = records
            .get_mut(&id)
            .map(|mut record| record.mark_cancelled())
            .unwrap_or(false);
        if !cancelled {
            return false;
        }
        state.index.remove(&id);
        state.backlog.remove(&key);
        let depth = state.backlog.len();
        drop(state);

        JobMetrics::queue_depth(&self.name, depth);
        true
    }

    fn has_backlog(&self) -> bool {
        !self.state.lock().backlog.is_empty()
    }

    /// Pop the best backlog entry and mark it running.
    fn pop_next(&self, records: &DashMap<JobId, JobRecord>) -> Option<PendingJob> {
        let mut state = self.state.lock();
        while let Some((_, pending)) = state.backlog.pop_first() {
            state.index.remove(&pending.id);
            let admitted = records
                .get_mut(&pending.id)
                .map(|mut record| record.mark_running())
                .unwrap_or(false);
            if admitted {
                state.running += 1;
                let (depth, running) = (state.backlog.len(), state.running);
                drop(state);
                JobMetrics::queue_depth(&self.name, depth);
                JobMetrics::running(&self.name, running);
                return Some(pending);
            }
        }
        None
    }

    fn finish_one(&self) {
        let running = {
            let mut state = self.state.lock();
            state.running = state.running.saturating_sub(1);
            state.running
        };
        JobMetrics::running(&self.name, running);
    }

    /// Admit jobs until the backlog is empty or no slot is available.
    async fn admit_ready(self: &Arc<Self>, inner: &Arc<SchedulerInner>) {
        while self.has_backlog() {
            let limits = self.limits();
            let lease = if inner.config.enabled {
                if self.running() >= limits.max_concurrent {
                    break;
                }
                match inner.coordinator.reserve(&self.name, limits.max_concurrent).await {
                    Some(lease) => lease,
                    None => break,
                }
            } else {
                SlotLease::unmetered(self.name.as_str())
            };

            let Some(pending) = self.pop_next(&inner.records) else {
                // Backlog drained by a cancel while reserving
                inner.coordinator.release(lease).await;
                break;
            };

            JobMetrics::admitted(&self.name);
            let span = tracing::info_span!("job", job_id = %pending.id, job_type = %self.name);
            tokio::spawn(
                execute(self.clone(), inner.clone(), pending, lease, limits.timeout).instrument(span),
            );
        }
    }
}

/// Run one admitted job to its terminal state.
async fn execute(
    queue: Arc<TypeQueue>,
    inner: Arc<SchedulerInner>,
    pending: PendingJob,
    lease: SlotLease,
    timeout: Duration,
) {
    let PendingJob { id, work } = pending;
    debug!(timeout_ms = timeout.as_millis() as u64, "Job admitted");

    let ctx = JobContext::new(id, queue.name.as_str(), timeout);
    // Calling the closure inside the spawned future keeps a synchronous panic contained
    let outcome = inner.guard.run(timeout, async move { work(ctx).await }).await;
    let duration = outcome.duration();
    let timed_out = outcome.is_timeout();

    let finished = inner.records.get_mut(&id).and_then(|mut record| {
        record.finish(outcome.into_result()).then(|| record.value().clone())
    });

    queue.finish_one();
    inner.coordinator.release(lease).await;
    inner.completed.notify_waiters();
    queue.wake.notify_one();

    let Some(record) = finished else {
        return;
    };
    JobMetrics::finished(&queue.name, record.state.as_str(), timed_out, duration);
    info!(
        state = %record.state,
        timed_out,
        duration_ms = duration.as_millis() as u64,
        "Job finished"
    );

    inner.guard.run_auxiliaries(&record).await;
}

/// One loop per type. Exits on shutdown or once the scheduler is dropped.
pub(crate) async fn admission_loop(
    queue: Arc<TypeQueue>,
    inner: Weak<SchedulerInner>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    debug!(job_type = %queue.name, "Admission loop started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match inner.upgrade() {
            Some(inner) => queue.admit_ready(&inner).await,
            None => break,
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = queue.wake.notified() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(job_type = %queue.name, queued = queue.queued(), "Admission loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    fn noop_work() -> BoxedWork {
        Box::new(|_ctx| async { Ok(json!(null)) }.boxed())
    }

    fn enqueue(queue: &TypeQueue, records: &DashMap<JobId, JobRecord>, priority: i64) -> JobId {
        let record = JobRecord::queued(queue.name(), priority);
        let id = record.id;
        records.insert(id, record);
        queue.push(id, priority, noop_work());
        id
    }

    #[test]
    fn test_pop_order_is_priority_then_fifo() {
        let queue = TypeQueue::new("analysis", TypeQueueConfig::new(1, Duration::from_secs(1)));
        let records = DashMap::new();
        let third = enqueue(&queue, &records, 3);
        let first = enqueue(&queue, &records, 1);
        let second_a = enqueue(&queue, &records, 2);
        let second_b = enqueue(&queue, &records, 2);

        let order: Vec<JobId> = std::iter::from_fn(|| queue.pop_next(&records).map(|p| p.id)).collect();
        assert_eq!(order, vec![first, second_a, second_b, third]);
        assert_eq!(queue.running(), 4);
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_cancel_removes_from_backlog() {
        let queue = TypeQueue::new("enrichment", TypeQueueConfig::new(1, Duration::from_secs(1)));
        let records = DashMap::new();
        let keep = enqueue(&queue, &records, 1);
        let drop_me = enqueue(&queue, &records, 1);

        assert!(queue.cancel(drop_me, &records));
        assert!(!queue.cancel(drop_me, &records));
        assert_eq!(queue.queued(), 1);

        let admitted = queue.pop_next(&records).unwrap();
        assert_eq!(admitted.id, keep);
        assert!(!queue.cancel(keep, &records));
        assert!(queue.pop_next(&records).is_none());
    }

    #[test]
    fn test_finish_one_never_underflows() {
        let queue = TypeQueue::new("synthesis", TypeQueueConfig::new(1, Duration::from_secs(1)));
        queue.finish_one();
        assert_eq!(queue.running(), 0);
    }
}
