//! In-process slot counters.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{CoordinationBackend, SlotCounts};
use crate::error::Result;

/// Per-type running counters local to this process.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    slots: DashMap<String, AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve synchronously; never fails.
    pub fn try_reserve(&self, job_type: &str, max: usize) -> bool {
        let counter = self
            .slots
            .entry(job_type.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .is_ok()
    }

    /// Release synchronously; the counter never goes below zero.
    pub fn release(&self, job_type: &str) {
        if let Some(counter) = self.slots.get(job_type) {
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    pub fn running(&self, job_type: &str) -> usize {
        self.slots
            .get(job_type)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn reserve_slot(&self, job_type: &str, max: usize) -> Result<bool> {
        Ok(self.try_reserve(job_type, max))
    }

    async fn release_slot(&self, job_type: &str) -> Result<()> {
        self.release(job_type);
        Ok(())
    }

    async fn read_counts(&self, job_type: &str) -> Result<SlotCounts> {
        Ok(SlotCounts {
            running: self.running(job_type),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
