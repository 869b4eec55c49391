//! Work queue and time-budgeted job execution.
//!
//! - **Job records**: identity and state machine of each unit of work
//! - **Priority**: explicit mapping from a caller's hint to a backlog priority
//! - **Result guard**: hard timeout and failure containment around arbitrary work
//! - **Type queues**: per-type backlog with bounded concurrency
//! - **Scheduler**: enqueue/cancel/status entry point owning every type queue
//! - **Pipeline**: multi-stage runner that spends one deadline across stages
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               Scheduler                                  │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  enqueue ──▶ ┌────────────┐   admission   ┌─────────────┐                │
//! │              │ TypeQueue  │──────────────▶│ ResultGuard │──▶ JobRecord   │
//! │              │ (per type) │◀── slots ──┐  │  (timeout)  │   (terminal)   │
//! │              └────────────┘            │  └─────────────┘                │
//! │                                        │         │                       │
//! │                                  ┌─────┴─────┐   ▼                       │
//! │                                  │Coordinator│  StageBudgetRunner        │
//! │                                  │Redis/local│  (optional, in the work)  │
//! │                                  └───────────┘                           │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod guard;
pub mod job;
pub mod pipeline;
pub mod priority;
pub mod queue;
pub mod scheduler;

pub use guard::{AuxiliaryAction, GuardOutcome, ResultGuard, ResultSnapshotAction};
pub use job::{FailureKind, JobContext, JobError, JobId, JobRecord, JobState, WorkResult};
pub use pipeline::{
    PipelineOutcome, Stage, StageBudgetRunner, StageContext, StageOutput, StageReport, StageStatus,
};
pub use priority::{BatchSizePriority, FixedPriority, PriorityPolicy};
pub use queue::TypeQueue;
pub use scheduler::{BulkCancel, BulkStatus, QueueStatus, Scheduler, SchedulerBuilder, TypeStatus};
