//! Mapping from a caller's priority hint to a queue priority.
//!
//! Collaborators submit a hint (conventionally the size of the batch the job belongs
//! to); the policy turns it into the priority the backlog is ordered by. Lower
//! priority values are admitted first.

/// Turns a priority hint into a backlog priority.
pub trait PriorityPolicy: Send + Sync {
    fn priority_for(&self, hint: u64) -> i64;
}

impl<F> PriorityPolicy for F
where
    F: Fn(u64) -> i64 + Send + Sync,
{
    fn priority_for(&self, hint: u64) -> i64 {
        self(hint)
    }
}

/// Priority equals batch size: a singleton (hint 0 or 1) gets priority 1 and bulk
/// submissions sort behind it, so large batches never starve interactive requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchSizePriority;

impl PriorityPolicy for BatchSizePriority {
    fn priority_for(&self, hint: u64) -> i64 {
        i64::try_from(hint.max(1)).unwrap_or(i64::MAX)
    }
}

/// Ignores the hint; every job gets the same priority and ordering is pure FIFO.
#[derive(Debug, Clone, Copy)]
pub struct FixedPriority(pub i64);

impl PriorityPolicy for FixedPriority {
    fn priority_for(&self, _hint: u64) -> i64 {
        self.0
    }
}
