//! Scheduler behaviour tests.
//!
//! Tests cover:
//! - Priority ordering and FIFO tie-breaks
//! - Concurrency ceilings under bursts
//! - Cancellation before and after admission
//! - Timeouts, panics and late results from abandoned work
//! - Bulk status/cancel and waiting for completion
//! - Distributed coordination and failover
//! - Auxiliary actions

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use workq_core::config::{SchedulerConfig, TypeQueueConfig};
use workq_core::coordination::{CoordinationBackend, Coordinator, InMemoryBackend, SlotCounts};
use workq_core::error::{ErrorCode, Result, WorkqError};
use workq_core::jobs::{
    AuxiliaryAction, FailureKind, JobId, JobRecord, JobState, ResultSnapshotAction, Scheduler,
};

// ============================================================================
// Helpers
// ============================================================================

fn config(job_type: &str, max_concurrent: usize, timeout: Duration) -> SchedulerConfig {
    SchedulerConfig {
        admission_poll_interval: Duration::from_millis(20),
        ..Default::default()
    }
    .with_type(job_type, TypeQueueConfig::new(max_concurrent, timeout))
}

fn scheduler(job_type: &str, max_concurrent: usize, timeout: Duration) -> Scheduler {
    Scheduler::builder()
        .config(config(job_type, max_concurrent, timeout))
        .build()
        .unwrap()
}

async fn wait_for_state(scheduler: &Scheduler, id: JobId, state: JobState) {
    for _ in 0..400 {
        if scheduler.get_status(id).map(|r| r.state) == Some(state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {} never reached {}", id, state);
}

/// Occupies one slot until the returned sender fires.
async fn enqueue_gate(scheduler: &Scheduler, job_type: &str) -> (JobId, oneshot::Sender<()>) {
    let (tx, rx) = oneshot::channel::<()>();
    let id = scheduler
        .enqueue(job_type, rx, 1, |_ctx, rx: oneshot::Receiver<()>| async move {
            let _ = rx.await;
            Ok(json!("gate"))
        })
        .unwrap();
    wait_for_state(scheduler, id, JobState::Running).await;
    (id, tx)
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_admitted_in_priority_order() {
    let scheduler = scheduler("analysis", 1, Duration::from_secs(5));
    let (gate, release) = enqueue_gate(&scheduler, "analysis").await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for priority in [3u64, 1, 2] {
        let order = order.clone();
        let id = scheduler
            .enqueue("analysis", priority, priority, move |_ctx, p: u64| async move {
                order.lock().push(p);
                Ok(json!(p))
            })
            .unwrap();
        ids.push(id);
    }

    release.send(()).unwrap();
    assert!(scheduler.wait_for(gate, Duration::from_secs(2)).await.is_some());
    for id in &ids {
        let record = scheduler.wait_for(*id, Duration::from_secs(2)).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
    }

    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_equal_priorities_are_fifo() {
    let scheduler = scheduler("enrichment", 1, Duration::from_secs(5));
    let (_gate, release) = enqueue_gate(&scheduler, "enrichment").await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for label in ["first", "second", "third"] {
        let order = order.clone();
        ids.push(
            scheduler
                .enqueue("enrichment", label, 10, move |_ctx, label: &'static str| async move {
                    order.lock().push(label);
                    Ok(json!(label))
                })
                .unwrap(),
        );
    }

    release.send(()).unwrap();
    for id in &ids {
        scheduler.wait_for(*id, Duration::from_secs(2)).await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_interactive_job_overtakes_batch() {
    let scheduler = scheduler("analysis", 1, Duration::from_secs(5));
    let (_gate, release) = enqueue_gate(&scheduler, "analysis").await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut ids = Vec::new();
    for (label, hint) in [("batch-a", 50u64), ("batch-b", 50), ("interactive", 1)] {
        let order = order.clone();
        ids.push(
            scheduler
                .enqueue("analysis", label, hint, move |_ctx, label: &'static str| async move {
                    order.lock().push(label);
                    Ok(json!(null))
                })
                .unwrap(),
        );
    }

    release.send(()).unwrap();
    for id in &ids {
        scheduler.wait_for(*id, Duration::from_secs(2)).await.unwrap();
    }
    assert_eq!(*order.lock(), vec!["interactive", "batch-a", "batch-b"]);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_running_never_exceeds_ceiling_under_burst() {
    let scheduler = scheduler("analysis", 3, Duration::from_secs(5));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    for i in 0..24u64 {
        let active = active.clone();
        let peak = peak.clone();
        ids.push(
            scheduler
                .enqueue("analysis", i, 1, move |_ctx, _i: u64| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                })
                .unwrap(),
        );
    }

    loop {
        let status = scheduler.get_queue_status().await;
        assert!(status.types["analysis"].running <= 3);
        if scheduler.bulk_status(&ids).completed == ids.len() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_five_analysis_jobs_with_two_slots() {
    let scheduler = scheduler("analysis", 2, Duration::from_secs(5));
    let ids: Vec<JobId> = (0..5u64)
        .map(|i| {
            scheduler
                .enqueue("analysis", i, 5, |_ctx, i: u64| async move {
                    tokio::time::sleep(Duration::from_millis(30 + 10 * i)).await;
                    Ok(json!(i))
                })
                .unwrap()
        })
        .collect();

    loop {
        let status = scheduler.get_queue_status().await;
        let bulk = scheduler.bulk_status(&ids);
        let analysis = status.types["analysis"];

        assert!(analysis.running <= 2);
        assert!(bulk.running <= 2);
        assert_eq!(bulk.queued, 5 - bulk.running - bulk.completed);
        assert_eq!(analysis.queued, bulk.queued);

        if bulk.completed == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_disabled_ceiling_admits_everything() {
    let config = SchedulerConfig {
        enabled: false,
        ..config("synthesis", 1, Duration::from_secs(2))
    };
    let scheduler = Scheduler::builder().config(config).build().unwrap();
    let barrier = Arc::new(tokio::sync::Barrier::new(3));

    let ids: Vec<JobId> = (0..3)
        .map(|_| {
            scheduler
                .enqueue("synthesis", barrier.clone(), 1, |_ctx, barrier: Arc<tokio::sync::Barrier>| async move {
                    barrier.wait().await;
                    Ok(json!("met"))
                })
                .unwrap()
        })
        .collect();

    for id in &ids {
        let record = scheduler.wait_for(*id, Duration::from_secs(3)).await.unwrap();
        assert_eq!(record.state, JobState::Completed);
    }
    assert!(!scheduler.get_queue_status().await.enabled);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_only_before_admission() {
    let scheduler = scheduler("analysis", 1, Duration::from_secs(5));
    let (gate, release) = enqueue_gate(&scheduler, "analysis").await;

    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    let queued = scheduler
        .enqueue("analysis", (), 1, move |_ctx, _| async move {
            flag.store(true, Ordering::SeqCst);
            Ok(json!(null))
        })
        .unwrap();

    assert!(scheduler.cancel(queued));
    assert!(!scheduler.cancel(queued));
    assert!(!scheduler.cancel(gate));

    release.send(()).unwrap();
    let finished = scheduler.wait_for(gate, Duration::from_secs(2)).await.unwrap();
    assert_eq!(finished.state, JobState::Completed);
    assert!(!scheduler.cancel(gate));

    tokio::time::sleep(Duration::from_millis(60)).await;
    let record = scheduler.get_status(queued).unwrap();
    assert_eq!(record.state, JobState::Cancelled);
    assert!(record.started_at.is_none());
    assert!(record.completed_at.is_some());
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_bulk_cancel_and_status() {
    let scheduler = scheduler("enrichment", 1, Duration::from_secs(5));
    let (gate, release) = enqueue_gate(&scheduler, "enrichment").await;

    let queued: Vec<JobId> = (0..3)
        .map(|_| {
            scheduler
                .enqueue("enrichment", (), 10, |_ctx, _| async { Ok(json!(null)) })
                .unwrap()
        })
        .collect();

    let result = scheduler.bulk_cancel(&[queued[0], queued[1], gate, JobId::new()]);
    assert_eq!(result.cancelled, 2);
    assert_eq!(result.total, 4);

    let status = scheduler.bulk_status(&[queued[0], queued[1], queued[2], gate, JobId::new()]);
    assert_eq!(status.total, 5);
    assert_eq!(status.cancelled, 2);
    assert_eq!(status.queued, 1);
    assert_eq!(status.running, 1);
    assert_eq!(status.not_found, 1);

    release.send(()).unwrap();
    scheduler.wait_for(queued[2], Duration::from_secs(2)).await.unwrap();
    let status = scheduler.bulk_status(&queued);
    assert_eq!(status.completed, 1);
    assert_eq!(status.cancelled, 2);
}

// ============================================================================
// Failure Containment
// ============================================================================

#[tokio::test]
async fn test_never_settling_job_fails_with_timeout() {
    let scheduler = scheduler("analysis", 2, Duration::from_millis(100));
    let id = scheduler
        .enqueue("analysis", (), 1, |_ctx, _| futures::future::pending())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;

    let record = scheduler.get_status(id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    let error = record.error.unwrap();
    assert!(error.timed_out);
    assert_eq!(error.kind, FailureKind::Timeout);
    assert!(record.result.is_none());

    // The slot was released, so the type keeps making progress
    let next = scheduler
        .enqueue("analysis", (), 1, |_ctx, _| async { Ok(json!("next")) })
        .unwrap();
    let record = scheduler.wait_for(next, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Completed);
}

#[tokio::test]
async fn test_late_result_of_abandoned_work_is_ignored() {
    let scheduler = scheduler("synthesis", 1, Duration::from_millis(40));
    let id = scheduler
        .enqueue("synthesis", (), 1, |_ctx, _| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(json!("too late"))
        })
        .unwrap();

    let record = scheduler.wait_for(id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Failed);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let record = scheduler.get_status(id).unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert!(record.result.is_none());
    assert!(record.error.unwrap().timed_out);
}

#[tokio::test]
async fn test_panicking_work_is_contained() {
    let scheduler = scheduler("analysis", 1, Duration::from_secs(1));
    let id = scheduler
        .enqueue("analysis", "bad input", 1, |_ctx, input: &'static str| async move {
            if input.starts_with("bad") {
                panic!("cannot parse {}", input);
            }
            Ok(json!(input))
        })
        .unwrap();

    let record = scheduler.wait_for(id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Failed);
    let error = record.error.unwrap();
    assert_eq!(error.kind, FailureKind::Panic);
    assert!(error.message.contains("cannot parse bad input"));
}

#[tokio::test]
async fn test_wait_for_gives_up_on_queued_job() {
    let scheduler = scheduler("analysis", 1, Duration::from_secs(1));
    scheduler.shutdown();
    let id = scheduler
        .enqueue("analysis", (), 1, |_ctx, _| async { Ok(json!(null)) })
        .unwrap();
    assert!(scheduler.wait_for(id, Duration::from_millis(50)).await.is_none());
    assert_eq!(scheduler.get_status(id).unwrap().state, JobState::Queued);
}

// ============================================================================
// Coordination
// ============================================================================

/// Shared store stand-in reporting slots held by other instances.
struct SharedStore {
    inner: InMemoryBackend,
    other_instances: usize,
    down: AtomicBool,
}

impl SharedStore {
    fn new(other_instances: usize) -> Self {
        Self {
            inner: InMemoryBackend::new(),
            other_instances,
            down: AtomicBool::new(false),
        }
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(WorkqError::new(
                ErrorCode::CoordinationUnavailable,
                "Unable to reach the coordination store",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationBackend for SharedStore {
    async fn reserve_slot(&self, job_type: &str, max: usize) -> Result<bool> {
        self.check()?;
        let used = self.inner.running(job_type) + self.other_instances;
        Ok(used < max && self.inner.try_reserve(job_type, max))
    }

    async fn release_slot(&self, job_type: &str) -> Result<()> {
        self.check()?;
        self.inner.release(job_type);
        Ok(())
    }

    async fn read_counts(&self, job_type: &str) -> Result<SlotCounts> {
        self.check()?;
        Ok(SlotCounts {
            running: self.inner.running(job_type) + self.other_instances,
        })
    }

    async fn health_check(&self) -> Result<()> {
        self.check()
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "shared"
    }
}

#[tokio::test]
async fn test_distributed_status_reports_cluster_counts() {
    let store = Arc::new(SharedStore::new(2));
    let scheduler = Scheduler::builder()
        .config(config("analysis", 4, Duration::from_secs(1)))
        .coordinator(Arc::new(Coordinator::with_backend(store.clone())))
        .build()
        .unwrap();

    let status = scheduler.get_queue_status().await;
    assert!(status.distributed);
    assert_eq!(status.types["analysis"].running, 2);

    let id = scheduler
        .enqueue("analysis", (), 1, |_ctx, _| async { Ok(json!("ok")) })
        .unwrap();
    let record = scheduler.wait_for(id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Completed);
}

#[tokio::test]
async fn test_store_outage_falls_back_to_local_admission() {
    let store = Arc::new(SharedStore::new(0));
    store.down.store(true, Ordering::SeqCst);
    let scheduler = Scheduler::builder()
        .config(config("analysis", 2, Duration::from_secs(1)))
        .coordinator(Arc::new(Coordinator::with_backend(store.clone())))
        .build()
        .unwrap();

    let id = scheduler
        .enqueue("analysis", (), 1, |_ctx, _| async { Ok(json!("served locally")) })
        .unwrap();
    let record = scheduler.wait_for(id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Completed);

    let status = scheduler.get_queue_status().await;
    assert!(!status.distributed);
    assert_eq!(status.types["analysis"].running, 0);

    store.down.store(false, Ordering::SeqCst);
    assert!(scheduler.coordinator().probe().await);
    assert!(scheduler.get_queue_status().await.distributed);
}

// ============================================================================
// Auxiliary Actions
// ============================================================================

struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl AuxiliaryAction for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    async fn run(&self, _record: &JobRecord) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("counter service down")
    }
}

#[tokio::test]
async fn test_auxiliary_actions_never_change_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let snapshots = Arc::new(ResultSnapshotAction::new(dir.path()));

    let scheduler = Scheduler::builder()
        .config(config("synthesis", 1, Duration::from_secs(1)))
        .auxiliary(Arc::new(AlwaysFails { calls: calls.clone() }))
        .auxiliary(snapshots.clone())
        .build()
        .unwrap();

    let id = scheduler
        .enqueue("synthesis", (), 1, |_ctx, _| async { Ok(json!({"report": "done"})) })
        .unwrap();
    let record = scheduler.wait_for(id, Duration::from_secs(1)).await.unwrap();
    assert_eq!(record.state, JobState::Completed);

    let path = snapshots.path_for(&record);
    for _ in 0..200 {
        if path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stored: JobRecord = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(stored.result, Some(json!({"report": "done"})));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.get_status(id).unwrap().state, JobState::Completed);
}
