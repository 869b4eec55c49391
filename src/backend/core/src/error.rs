//! Error handling for the work queue.
//!
//! This module provides:
//! - A single error type carrying a stable, machine-readable [`ErrorCode`]
//! - User-facing vs internal messages
//! - Severity-aware logging with tracing integration
//! - Metrics integration for error tracking
//!
//! Only admission and infrastructure paths return [`WorkqError`]. Failures of the
//! scheduled work itself never surface here; they are captured into
//! [`JobError`](crate::jobs::JobError) and stored on the job record.
//!
//! # Usage
//!
//! ```rust,ignore
//! use workq_core::error::{WorkqError, Result, ErrorContext, ErrorCode};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("workq.toml").with_error_code(ErrorCode::ConfigurationError)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for work queue operations.
pub type Result<T> = std::result::Result<T, WorkqError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by collaborators for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Admission Errors (1000-1099)
    InvalidJobType,
    UnknownJobType,
    InvalidInput,

    // Job Errors (1100-1199)
    JobNotFound,
    TimeLimitExceeded,

    // Coordination Errors (2100-2199)
    CoordinationError,
    CoordinationUnavailable,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    InvalidConfiguration,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::InvalidJobType => 1000,
            Self::UnknownJobType => 1001,
            Self::InvalidInput => 1002,

            Self::JobNotFound => 1100,
            Self::TimeLimitExceeded => 1102,

            Self::CoordinationError => 2100,
            Self::CoordinationUnavailable => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,

            Self::ConfigurationError => 5000,
            Self::InvalidConfiguration => 5001,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CoordinationError | Self::CoordinationUnavailable | Self::TimeLimitExceeded
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "admission",
            1100..=1199 => "job",
            2100..=2199 => "coordination",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad job type, unknown id)
    Low,
    /// Operational issues (timeouts)
    Medium,
    /// System errors (serialization, configuration, store outage)
    High,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidJobType
            | ErrorCode::UnknownJobType
            | ErrorCode::InvalidInput
            | ErrorCode::JobNotFound => Self::Low,

            ErrorCode::TimeLimitExceeded | ErrorCode::CoordinationError => Self::Medium,

            ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::ConfigurationError
            | ErrorCode::InvalidConfiguration
            | ErrorCode::CoordinationUnavailable => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the work queue.
#[derive(Error, Debug)]
pub struct WorkqError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to collaborators)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for WorkqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl WorkqError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create a job-not-found error.
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", job_id))
    }

    /// Create an invalid-configuration error.
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidConfiguration, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "workq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for tagging foreign errors and missing values with a code.
pub trait ErrorContext<T> {
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| WorkqError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| WorkqError::new(code, "Value not present"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<redis::RedisError> for WorkqError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal()
            || error.is_connection_dropped()
            || error.is_io_error()
        {
            (
                ErrorCode::CoordinationUnavailable,
                "Unable to reach the coordination store",
            )
        } else if error.is_timeout() {
            (
                ErrorCode::CoordinationError,
                "Coordination store operation timed out",
            )
        } else {
            (
                ErrorCode::CoordinationError,
                "A coordination store error occurred",
            )
        };
        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for WorkqError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() || error.is_eof() {
            ErrorCode::DeserializationError
        } else {
            ErrorCode::SerializationError
        };
        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<config::ConfigError> for WorkqError {
    fn from(error: config::ConfigError) -> Self {
        Self::with_internal(
            ErrorCode::ConfigurationError,
            "Failed to load configuration",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for WorkqError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::TimeLimitExceeded,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_codes_are_grouped_by_category() {
        assert_eq!(ErrorCode::InvalidJobType.category(), "admission");
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::CoordinationUnavailable.category(), "coordination");
        assert_eq!(ErrorCode::InvalidConfiguration.category(), "configuration");
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::CoordinationUnavailable.is_retryable());
        assert!(ErrorCode::TimeLimitExceeded.is_retryable());
        assert!(!ErrorCode::InvalidJobType.is_retryable());
        assert!(!ErrorCode::JobNotFound.is_retryable());
    }

    #[test]
    fn test_display_includes_internal_message() {
        let err = WorkqError::with_internal(
            ErrorCode::CoordinationError,
            "store failed",
            "connection reset",
        );
        let text = err.to_string();
        assert!(text.contains("CoordinationError"));
        assert!(text.contains("store failed"));
        assert!(text.contains("connection reset"));
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(
            WorkqError::new(ErrorCode::UnknownJobType, "x").severity(),
            ErrorSeverity::Low
        );
        assert_eq!(
            WorkqError::new(ErrorCode::CoordinationUnavailable, "x").severity(),
            ErrorSeverity::High
        );
    }

    #[test]
    fn test_error_context_on_option() {
        let missing: Option<u32> = None;
        let err = missing.with_error_code(ErrorCode::JobNotFound).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);

        let parsed: std::result::Result<u32, _> = "x".parse::<u32>();
        let err = parsed.with_error_code(ErrorCode::InvalidInput).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_serde_json_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: WorkqError = parse.unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::DeserializationError);
    }
}
