#![allow(clippy::result_large_err)]
//! # workq
//!
//! In-process work queue with per-type concurrency limits and a time-budgeted
//! job executor.
//!
//! ## Architecture
//!
//! - **Scheduler**: enqueue, cancel and status for heterogeneous job types
//! - **Type queues**: priority-ordered backlogs admitted under a concurrency ceiling
//! - **Result guard**: every job reaches a terminal state within its timeout
//! - **Stage budget runner**: multi-stage pipelines that degrade instead of failing
//! - **Coordination**: Redis-backed slot counters for scale-out, in-process fallback
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod config;
pub mod coordination;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, Result, WorkqError};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, CoordinationConfig, SchedulerConfig, TypeQueueConfig};
    pub use crate::coordination::{CoordinationBackend, Coordinator, InMemoryBackend, RedisBackend};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, Result, WorkqError};
    pub use crate::jobs::{
        AuxiliaryAction, BatchSizePriority, BulkCancel, BulkStatus, FixedPriority, JobContext,
        JobError, JobId, JobRecord, JobState, PipelineOutcome, PriorityPolicy, QueueStatus,
        Scheduler, Stage, StageBudgetRunner, StageOutput, StageStatus, WorkResult,
    };
}
