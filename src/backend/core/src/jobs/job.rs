//! Job records and their state machine.
//!
//! - **JobId**: identity assigned at enqueue time
//! - **JobState**: `queued → running → {completed, failed}` or `queued → cancelled`
//! - **JobError**: the uniform failure payload stored on a failed record
//! - **JobRecord**: the read model collaborators poll
//! - **JobContext**: deadline information handed to running work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::pipeline::StageBudgetRunner;
use crate::error::{ErrorCode, WorkqError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in its type's backlog
    Queued,
    /// Admitted and executing under the result guard
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error (work failure, panic or timeout)
    Failed,
    /// Removed from the backlog before admission
    Cancelled,
}

impl JobState {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// What caused a job to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The work returned an error
    Work,
    /// The work panicked
    Panic,
    /// The guard's timer fired first
    Timeout,
    /// The runtime dropped the work before it settled
    Shutdown,
}

/// Error payload stored on a failed job.
///
/// Timeouts share this shape with ordinary work failures and are told apart by
/// `timed_out` (and `kind`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Failure cause
    pub kind: FailureKind,
    /// Set only for guard timeouts
    pub timed_out: bool,
    /// Time spent before the failure was recorded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Optional error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Additional context
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// An error returned by the work itself.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::Work,
            timed_out: false,
            duration_ms: None,
            code: None,
            context: None,
        }
    }

    /// A synthesized timeout failure.
    pub fn timeout(duration_ms: u64) -> Self {
        Self {
            message: format!("timed out after {}ms", duration_ms),
            kind: FailureKind::Timeout,
            timed_out: true,
            duration_ms: Some(duration_ms),
            code: Some("TIMEOUT".to_string()),
            context: None,
        }
    }

    /// A panic captured from the work.
    pub fn panic(message: impl Into<String>) -> Self {
        Self {
            message: format!("work panicked: {}", message.into()),
            kind: FailureKind::Panic,
            timed_out: false,
            duration_ms: None,
            code: Some("PANIC".to_string()),
            context: None,
        }
    }

    /// Work dropped by the runtime before settling (e.g. during runtime shutdown).
    pub fn shutdown() -> Self {
        Self {
            message: "work was dropped by the runtime before it settled".to_string(),
            kind: FailureKind::Shutdown,
            timed_out: false,
            duration_ms: None,
            code: Some("SHUTDOWN".to_string()),
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }

    /// Record how long the work ran.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.timed_out
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<WorkqError> for JobError {
    fn from(error: WorkqError) -> Self {
        Self::new(error.user_message()).with_code(error.code().to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(format!("{:#}", error))
    }
}

impl From<serde_json::Error> for JobError {
    fn from(error: serde_json::Error) -> Self {
        Self::new(error.to_string()).with_code(ErrorCode::SerializationError.to_string())
    }
}

/// What a unit of work resolves to.
pub type WorkResult = std::result::Result<serde_json::Value, JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity and state of one unit of work.
///
/// The payload is not part of the record: it moves into the work closure at
/// enqueue time and is never inspected by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    /// Lower values are served first
    pub priority: i64,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly enqueued job.
    pub fn queued(job_type: impl Into<String>, priority: i64) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            priority,
            state: JobState::Queued,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// `queued → running`. Returns false if the job already left `queued`.
    pub fn mark_running(&mut self) -> bool {
        if self.state != JobState::Queued {
            return false;
        }
        self.state = JobState::Running;
        self.started_at = Some(Utc::now().max(self.created_at));
        true
    }

    /// `queued → cancelled`. Returns false for any other state.
    pub fn mark_cancelled(&mut self) -> bool {
        if self.state != JobState::Queued {
            return false;
        }
        self.state = JobState::Cancelled;
        self.completed_at = Some(Utc::now().max(self.created_at));
        true
    }

    /// `running → completed | failed`, storing exactly one of result or error.
    ///
    /// A second call, or a call on a job that is not running, changes nothing and
    /// returns false.
    pub fn finish(&mut self, outcome: WorkResult) -> bool {
        if self.state != JobState::Running {
            return false;
        }
        match outcome {
            Ok(value) => {
                self.state = JobState::Completed;
                self.result = Some(value);
            }
            Err(error) => {
                self.state = JobState::Failed;
                self.error = Some(error);
            }
        }
        let floor = self.started_at.unwrap_or(self.created_at);
        self.completed_at = Some(Utc::now().max(floor));
        true
    }

    /// Time spent running, once finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Execution context handed to the work closure on admission.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub started_at: Instant,
    /// When the result guard's timer fires
    pub deadline: Instant,
    pub timeout: Duration,
}

impl JobContext {
    pub fn new(job_id: JobId, job_type: impl Into<String>, timeout: Duration) -> Self {
        let started_at = Instant::now();
        Self {
            job_id,
            job_type: job_type.into(),
            started_at,
            deadline: started_at + timeout,
            timeout,
        }
    }

    /// Time left before the guard gives up on this job.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// A stage runner that finishes ahead of the guard deadline.
    ///
    /// The margin is a tenth of the job timeout, capped at one second, leaving the
    /// pipeline room to assemble its result before the timer fires.
    pub fn stage_runner(&self) -> StageBudgetRunner {
        let margin = (self.timeout / 10).min(Duration::from_secs(1));
        StageBudgetRunner::until(self.deadline - margin)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
