//! Error handling for the MedQ dispatch subsystem.
//!
//! This module provides:
//! - A machine-readable [`ErrorCode`] taxonomy for dispatch and broker errors
//! - Severity classification driving log levels
//! - Retryability classification (broker outages retry; dispatch errors do not)
//! - Structured error logging with tracing integration
//!
//! Propagation policy: dispatch-time errors are synchronous and reach the
//! caller; execution-time errors are asynchronous and surface only through
//! the event observer and the persisted terminal job state.

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

/// A specialized Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable; callers may match on them for programmatic error
/// handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Queue errors (1000-1099)
    QueueNotFound,
    DuplicateQueue,
    JobNotFound,

    // Broker errors (2000-2099)
    BrokerError,
    BrokerConnectionFailed,

    // Serialization errors (2200-2299)
    SerializationError,

    // Execution errors (3000-3099)
    HandlerFailed,
    RetriesExhausted,

    // Validation errors (4100-4199)
    ValidationError,

    // Configuration errors (5000-5099)
    ConfigurationError,

    // Internal errors (9000-9099)
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::QueueNotFound => 1000,
            Self::DuplicateQueue => 1001,
            Self::JobNotFound => 1002,
            Self::BrokerError => 2000,
            Self::BrokerConnectionFailed => 2001,
            Self::SerializationError => 2200,
            Self::HandlerFailed => 3000,
            Self::RetriesExhausted => 3001,
            Self::ValidationError => 4100,
            Self::ConfigurationError => 5000,
            Self::InternalError => 9000,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Broker trouble is transient by definition: durable jobs are delayed,
    /// never dropped. Dispatch-surface errors (unknown queue, bad payload)
    /// must reach the caller instead of being retried.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BrokerError | Self::BrokerConnectionFailed | Self::HandlerFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "queue",
            2000..=2099 => "broker",
            2200..=2299 => "serialization",
            3000..=3099 => "execution",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            _ => "internal",
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
    /// Caller errors (unknown queue, malformed payload)
    Low,
    /// Operational issues (failed attempts, exhausted retries)
    Medium,
    /// System errors (broker command failures, bad records)
    High,
    /// Errors requiring immediate attention (broker unreachable)
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::QueueNotFound
            | ErrorCode::DuplicateQueue
            | ErrorCode::JobNotFound
            | ErrorCode::ValidationError => Self::Low,

            ErrorCode::HandlerFailed => Self::Medium,

            ErrorCode::RetriesExhausted
            | ErrorCode::BrokerError
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,

            ErrorCode::BrokerConnectionFailed | ErrorCode::InternalError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for the dispatch subsystem.
#[derive(Error, Debug)]
pub struct DispatchError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Error message, safe to surface to the dispatching caller
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl DispatchError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both caller-facing and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Dispatch targeted a queue name that was never registered.
    pub fn queue_not_found(name: &str) -> Self {
        Self::new(ErrorCode::QueueNotFound, format!("Queue {} not exists", name))
    }

    /// A job definition key was registered twice.
    pub fn duplicate_queue(name: &str) -> Self {
        Self::new(
            ErrorCode::DuplicateQueue,
            format!("Queue {} is already registered", name),
        )
    }

    /// The payload failed structural validation before enqueue.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// A broker command failed.
    pub fn broker(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::BrokerError, message)
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
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

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the caller-facing message.
    pub fn message(&self) -> &str {
        &self.message
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
            ErrorSeverity::Critical | ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    source = ?self.source,
                    "Dispatch error"
                );
            }
            ErrorSeverity::Medium | ErrorSeverity::Low => {
                warn!(
                    error_code = %code,
                    category,
                    message = %self.message,
                    "Dispatch error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "medq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category()
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_internal(
            ErrorCode::SerializationError,
            "Failed to serialize job record",
            err.to_string(),
        )
        .with_source(err)
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        let code = if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            ErrorCode::BrokerConnectionFailed
        } else {
            ErrorCode::BrokerError
        };
        Self::with_internal(code, "Broker command failed", err.to_string()).with_source(err)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
