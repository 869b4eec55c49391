//! Coordination: where per-type running counts physically live.
//!
//! - **InMemoryBackend**: local counters, no external dependency
//! - **RedisBackend**: shared counters for horizontally scaled schedulers
//! - **Coordinator**: picks a backend at startup and falls back to in-process
//!   counting when the distributed store becomes unreachable

mod in_memory;
mod redis_backend;

pub use in_memory::InMemoryBackend;
pub use redis_backend::RedisBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::CoordinationConfig;
use crate::error::Result;
use crate::telemetry::CoordinationMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Counts as seen by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotCounts {
    pub running: usize,
}

/// Slot store used to bound concurrency per work type.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Take one slot if fewer than `max` are in use. Returns whether a slot was taken.
    async fn reserve_slot(&self, job_type: &str, max: usize) -> Result<bool>;

    /// Give back one slot. Never drops the count below zero.
    async fn release_slot(&self, job_type: &str) -> Result<()>;

    async fn read_counts(&self, job_type: &str) -> Result<SlotCounts>;

    async fn health_check(&self) -> Result<()>;

    /// Whether other processes share these counters.
    fn is_distributed(&self) -> bool;

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Slot Lease
// ═══════════════════════════════════════════════════════════════════════════════

/// Which store issued a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseSource {
    Primary,
    Local,
    /// No ceiling enforced; releasing is a no-op
    Unmetered,
}

/// One reserved concurrency slot. Released exactly once through
/// [`Coordinator::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct SlotLease {
    job_type: String,
    source: LeaseSource,
}

impl SlotLease {
    pub fn unmetered(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            source: LeaseSource::Unmetered,
        }
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn source(&self) -> LeaseSource {
        self.source
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Routes slot operations to the primary backend, failing over to local counters.
pub struct Coordinator {
    primary: Option<Arc<dyn CoordinationBackend>>,
    local: InMemoryBackend,
    degraded: AtomicBool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("degraded", &self.degraded.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::in_process()
    }
}

impl Coordinator {
    /// Local counters only.
    pub fn in_process() -> Self {
        Self {
            primary: None,
            local: InMemoryBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Use `backend` as the primary store.
    pub fn with_backend(backend: Arc<dyn CoordinationBackend>) -> Self {
        Self {
            primary: Some(backend),
            local: InMemoryBackend::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// Select a backend at startup.
    ///
    /// Uses Redis when a URL is configured and the store answers a PING, in-process
    /// counters otherwise. Never fails.
    pub async fn from_config(config: &CoordinationConfig) -> Self {
        if config.redis_url.is_none() {
            info!("No coordination store configured, using in-process coordination");
            return Self::in_process();
        }

        match RedisBackend::connect(config).await {
            Ok(backend) => Self::with_backend(Arc::new(backend)),
            Err(error) => {
                error.log();
                warn!("Coordination store unreachable at startup, using in-process coordination");
                Self::in_process()
            }
        }
    }

    /// Whether reservations are currently served by a shared store.
    pub fn is_distributed(&self) -> bool {
        match &self.primary {
            Some(primary) => primary.is_distributed() && !self.degraded.load(Ordering::Acquire),
            None => false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn active_primary(&self) -> Option<&Arc<dyn CoordinationBackend>> {
        if self.degraded.load(Ordering::Acquire) {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn fail_over(&self, backend: &'static str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            CoordinationMetrics::failover(backend);
            warn!(backend, "Coordination store failed, falling back to in-process coordination");
        }
    }

    /// Reserve one slot for `job_type` under a ceiling of `max`.
    ///
    /// Store errors never surface: the reservation is retried against local counters.
    pub async fn reserve(&self, job_type: &str, max: usize) -> Option<SlotLease> {
        if let Some(primary) = self.active_primary() {
            match primary.reserve_slot(job_type, max).await {
                Ok(true) => {
                    return Some(SlotLease {
                        job_type: job_type.to_string(),
                        source: LeaseSource::Primary,
                    })
                }
                Ok(false) => return None,
                Err(error) => {
                    error.log();
                    self.fail_over(primary.name());
                }
            }
        }

        self.local.try_reserve(job_type, max).then(|| SlotLease {
            job_type: job_type.to_string(),
            source: LeaseSource::Local,
        })
    }

    /// Return a lease to the store that issued it.
    pub async fn release(&self, lease: SlotLease) {
        match lease.source {
            LeaseSource::Unmetered => {}
            LeaseSource::Local => self.local.release(&lease.job_type),
            LeaseSource::Primary => {
                let Some(primary) = &self.primary else {
                    return;
                };
                if let Err(error) = primary.release_slot(&lease.job_type).await {
                    error.log();
                    warn!(
                        job_type = %lease.job_type,
                        "Failed to release slot in coordination store, it will expire with the counter TTL"
                    );
                    self.fail_over(primary.name());
                }
            }
        }
    }

    /// Running count from the shared store, when distributed and readable.
    pub async fn read_running(&self, job_type: &str) -> Option<usize> {
        if !self.is_distributed() {
            return None;
        }
        let primary = self.primary.as_ref()?;
        match primary.read_counts(job_type).await {
            Ok(counts) => Some(counts.running),
            Err(error) => {
                error.log();
                None
            }
        }
    }

    /// Re-check the primary store, leaving degraded mode if it answers.
    ///
    /// Returns whether the coordinator is distributed afterwards.
    pub async fn probe(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };
        match primary.health_check().await {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(backend = primary.name(), "Coordination store reachable again");
                }
            }
            Err(error) => {
                error.log();
                self.fail_over(primary.name());
            }
        }
        self.is_distributed()
    }
}
