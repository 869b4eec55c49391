//! Configuration management.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, WorkqError};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Coordination store configuration
    #[serde(default)]
    pub coordination: CoordinationConfig,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Whether per-type concurrency ceilings are enforced
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Accept job types that were never registered (created with the defaults below)
    #[serde(default = "default_allow_unregistered_types")]
    pub allow_unregistered_types: bool,

    /// Concurrency ceiling for types without explicit limits
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,

    /// Job timeout for types without explicit limits
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub default_timeout: Duration,

    /// How often admission loops re-check capacity without being woken
    #[serde(default = "default_admission_poll_interval", with = "humantime_serde")]
    pub admission_poll_interval: Duration,

    /// Upper bound for each auxiliary action
    #[serde(default = "default_auxiliary_timeout", with = "humantime_serde")]
    pub auxiliary_timeout: Duration,

    /// Per-type limits
    #[serde(default)]
    pub types: HashMap<String, TypeQueueConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            allow_unregistered_types: default_allow_unregistered_types(),
            default_max_concurrent: default_max_concurrent(),
            default_timeout: default_timeout(),
            admission_poll_interval: default_admission_poll_interval(),
            auxiliary_timeout: default_auxiliary_timeout(),
            types: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Limits applied to a type that has no explicit entry.
    pub fn default_type_config(&self) -> TypeQueueConfig {
        TypeQueueConfig {
            max_concurrent: self.default_max_concurrent,
            timeout: self.default_timeout,
        }
    }

    /// Register limits for a type.
    pub fn with_type(mut self, name: impl Into<String>, config: TypeQueueConfig) -> Self {
        self.types.insert(name.into(), config);
        self
    }
}

/// Limits for one work type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TypeQueueConfig {
    /// Maximum jobs of this type running at once
    pub max_concurrent: usize,

    /// Hard wall-clock limit for a single job
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl TypeQueueConfig {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            max_concurrent,
            timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// Redis connection URL; in-process coordination when absent
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix for shared counters
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Timeout for the startup reachability check and each store command
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Expiry refreshed on every reservation so counters of dead instances fade out
    #[serde(default = "default_slot_ttl", with = "humantime_serde")]
    pub slot_ttl: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            connect_timeout: default_connect_timeout(),
            slot_ttl: default_slot_ttl(),
        }
    }
}

// Default value functions
fn default_enabled() -> bool { true }
fn default_allow_unregistered_types() -> bool { true }
fn default_max_concurrent() -> usize { 2 }
fn default_timeout() -> Duration { Duration::from_secs(300) }
fn default_admission_poll_interval() -> Duration { Duration::from_millis(250) }
fn default_auxiliary_timeout() -> Duration { Duration::from_secs(5) }
fn default_key_prefix() -> String { "workq:".to_string() }
fn default_connect_timeout() -> Duration { Duration::from_secs(2) }
fn default_slot_ttl() -> Duration { Duration::from_secs(3600) }

impl Config {
    /// Load configuration from environment.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("WORKQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("WORKQ").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject limits that would stall or instantly fail every job.
    pub fn validate(&self) -> Result<()> {
        let scheduler = &self.scheduler;
        if scheduler.default_max_concurrent == 0 {
            return Err(WorkqError::invalid_config(
                "scheduler.default_max_concurrent must be at least 1",
            ));
        }
        if scheduler.default_timeout.is_zero() {
            return Err(WorkqError::invalid_config(
                "scheduler.default_timeout must be greater than zero",
            ));
        }
        if scheduler.admission_poll_interval.is_zero() {
            return Err(WorkqError::invalid_config(
                "scheduler.admission_poll_interval must be greater than zero",
            ));
        }
        for (name, limits) in &scheduler.types {
            if name.trim().is_empty() {
                return Err(WorkqError::invalid_config("job type names must not be blank"));
            }
            if limits.max_concurrent == 0 {
                return Err(WorkqError::invalid_config(format!(
                    "scheduler.types.{}.max_concurrent must be at least 1",
                    name
                )));
            }
            if limits.timeout.is_zero() {
                return Err(WorkqError::invalid_config(format!(
                    "scheduler.types.{}.timeout must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}
