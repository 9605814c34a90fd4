//! Error types for Metron.
//!
//! All errors in Metron are strongly typed using thiserror.
//! Validation errors are returned synchronously to the registering client;
//! execution errors come from the runtime (queues, workers, registries).

use thiserror::Error;

use crate::metric::MetricId;
use crate::monitor::MonitorId;

/// Validation errors that occur during client registration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Metric '{metric}' is not supported on this device")]
    UnsupportedMetric {
        metric: MetricId,
    },

    #[error("Metric '{metric}' is not known to this engine")]
    UnknownMetric {
        metric: MetricId,
    },

    #[error("Period must be positive, got {period_ms}ms")]
    InvalidPeriod {
        period_ms: i64,
    },

    #[error("Duration must not be negative, got {duration_ms}ms")]
    InvalidDuration {
        duration_ms: i64,
    },

    #[error("Invalid threshold: {reason}")]
    InvalidThreshold {
        reason: String,
    },

    #[error("Invalid condition expression: {reason}")]
    InvalidExpression {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },
}

/// Execution errors that occur while the engine is running.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Worker '{path}' is disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("A monitor node for metric '{metric}' already exists")]
    DuplicateMetric {
        metric: MetricId,
    },

    #[error("Condition {id} is being evaluated and cannot be removed now")]
    RegistryConflict {
        id: MonitorId,
    },
}

/// Top-level error type for Metron.
#[derive(Debug, Error)]
pub enum MetronError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MetronError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::QueueFull { .. }
                    | ExecutionError::Timeout { .. }
                    | ExecutionError::RegistryConflict { .. }
            ),
            Self::Internal { .. } => false,
        }
    }

    /// Returns true if this error is a broken programming contract.
    ///
    /// Callers must not continue with an engine that reported a fatal error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::DuplicateMetric { .. }))
    }
}

/// Result type alias for Metron operations.
pub type MetronResult<T> = Result<T, MetronError>;
