//! Job definitions and core types.
//!
//! This module provides the building blocks of the dispatch subsystem:
//!
//! - **QueueJob trait**: the interface every registered job definition implements
//! - **JobOptions**: dispatch options (delay, attempts, backoff) with shallow merging
//! - **JobInstance**: one concrete enqueued unit of work with state and attempt history
//! - **JobContext**: context handed to handlers during execution

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::observer::QueueEvents;

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

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
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

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// State of a job instance.
///
/// Transitions: `Waiting -> Active -> {Completed | Waiting (retry) | Failed}`.
/// `Removed` is reachable only from `Waiting` via the broker's removal
/// primitive. A stalled job is an `Active` job whose processing lock expired;
/// reclaiming it resolves to `Waiting` or `Failed`, so stalling never appears
/// as a stored state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue (includes jobs delayed until a later time)
    Waiting,
    /// Claimed by a worker and currently being processed
    Active,
    /// Finished successfully; result retained by the broker
    Completed,
    /// All attempts exhausted; retained for inspection
    Failed,
    /// Removed before it was ever started
    Removed,
}

impl JobState {
    /// Check if the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Removed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff
// ═══════════════════════════════════════════════════════════════════════════════

/// Delay applied between a failed attempt and its retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential increase (initial * 2^(attempt-1)), capped
    Exponential { initial_delay_ms: u64, max_delay_ms: u64 },
}

impl Backoff {
    /// Create a fixed backoff.
    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }

    /// Create an exponential backoff with a cap.
    pub fn exponential(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self::Exponential {
            initial_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before the retry following the given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
            } => {
                let exp = attempt.saturating_sub(1).min(31);
                initial_delay_ms
                    .saturating_mul(1u64 << exp)
                    .min(*max_delay_ms)
            }
        };
        Duration::from_millis(ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatch options for a job: initial delay, attempt budget, retry backoff.
///
/// All fields are optional so that option sets merge field-by-field. Merge
/// order is: definition defaults, then per-call overrides, then options
/// embedded in the payload itself — the later source wins per field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Delay before the job becomes available for processing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,

    /// Total attempts allowed (first run included)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Backoff between a failed attempt and its retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl JobOptions {
    /// Options with an initial delay.
    pub fn delayed(delay_ms: u64) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            ..Default::default()
        }
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the initial delay.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    /// Set the retry backoff.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Shallow field-by-field merge: definition defaults, then per-call
    /// overrides, then payload-embedded options. Payload-embedded fields win
    /// over per-call overrides; existing callers depend on this ordering.
    pub fn merged(defaults: &Self, overrides: &Self, embedded: Option<&Self>) -> Self {
        let mut opts = defaults.clone();
        opts.apply(overrides);
        if let Some(embedded) = embedded {
            opts.apply(embedded);
        }
        opts
    }

    fn apply(&mut self, other: &Self) {
        if other.delay_ms.is_some() {
            self.delay_ms = other.delay_ms;
        }
        if other.max_attempts.is_some() {
            self.max_attempts = other.max_attempts;
        }
        if other.backoff.is_some() {
            self.backoff = other.backoff.clone();
        }
    }

    /// Initial delay before first processing.
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms.unwrap_or(0))
    }

    /// Total attempts allowed; at least one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(1).max(1)
    }

    /// Delay before the retry following the given attempt (1-indexed).
    /// Without a configured backoff the retry is immediate.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        self.backoff
            .as_ref()
            .map(|b| b.delay_for_attempt(attempt))
            .unwrap_or(Duration::ZERO)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Outcome
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure returned by a job handler.
///
/// The runtime treats every handler failure as retryable while the attempt
/// budget lasts; a handler that knows its failure is permanent (for example a
/// downstream endpoint that does not exist) must convert it into a
/// descriptive `Ok` result instead of returning an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    /// Error message
    pub message: String,
    /// Additional structured context
    pub context: Option<Value>,
}

impl HandlerError {
    /// Create a new handler error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: None,
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Result of one handler invocation: an opaque serializable value on
/// success, a [`HandlerError`] otherwise.
pub type HandlerOutcome = std::result::Result<Value, HandlerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Instance
// ═══════════════════════════════════════════════════════════════════════════════

/// One enqueued unit of work, persisted by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    /// Unique job identifier (assigned at enqueue time)
    pub id: JobId,
    /// Name of the queue this job belongs to
    pub queue: String,
    /// The payload handed to the handler
    pub data: Value,
    /// Fully merged dispatch options
    pub opts: JobOptions,
    /// Number of processing attempts made so far
    pub attempts_made: u32,
    /// Current state
    pub state: JobState,
    /// Handler return value, present once completed
    pub result: Option<Value>,
    /// Last error message, present after a failed attempt
    pub error: Option<String>,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be processed
    pub process_at: DateTime<Utc>,
    /// When the current/last attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInstance {
    /// Create a new waiting job for the given queue.
    pub fn new(queue: impl Into<String>, data: Value, opts: JobOptions) -> Self {
        let now = Utc::now();
        let process_at = now
            + chrono::Duration::from_std(opts.delay()).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: JobId::new(),
            queue: queue.into(),
            data,
            opts,
            attempts_made: 0,
            state: JobState::Waiting,
            result: None,
            error: None,
            created_at: now,
            process_at,
            started_at: None,
            finished_at: None,
        }
    }

    /// Total attempts allowed for this job.
    pub fn max_attempts(&self) -> u32 {
        self.opts.attempts()
    }

    /// Check if another attempt may be made after a failure.
    pub fn can_retry(&self) -> bool {
        self.attempts_made < self.max_attempts()
    }

    /// Mark as claimed by a worker; counts an attempt.
    pub fn mark_active(&mut self) {
        self.state = JobState::Active;
        self.attempts_made += 1;
        self.started_at = Some(Utc::now());
    }

    /// Mark as re-queued after a failed attempt.
    pub fn mark_waiting(&mut self, error: impl Into<String>, delay: Duration) {
        self.state = JobState::Waiting;
        self.error = Some(error.into());
        self.process_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
    }

    /// Mark as completed with the handler result.
    pub fn mark_completed(&mut self, result: Value) {
        self.state = JobState::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }

    /// Mark as terminally failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = JobState::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    /// Mark as removed before processing.
    pub fn mark_removed(&mut self) {
        self.state = JobState::Removed;
        self.finished_at = Some(Utc::now());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
pub struct JobContext {
    job: JobInstance,
    events: Arc<QueueEvents>,
}

impl JobContext {
    pub(crate) fn new(job: JobInstance, events: Arc<QueueEvents>) -> Self {
        Self { job, events }
    }

    /// The job being processed (snapshot taken at claim time).
    pub fn job(&self) -> &JobInstance {
        &self.job
    }

    /// Get the job ID.
    pub fn id(&self) -> JobId {
        self.job.id
    }

    /// Get the queue name.
    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// Get the current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made
    }

    /// Emit a log line associated with this job.
    pub fn log(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            queue = %self.job.queue,
            attempt = self.job.attempts_made,
            message
        );
        self.events.emit_log(&self.job, message);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueJob Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// A named unit of work: identifying key, default dispatch options, and the
/// handler invoked for every job instance on its queue.
///
/// Implementations are registered once at startup from an explicit list and
/// are immutable afterwards; the key doubles as the queue name.
#[async_trait]
pub trait QueueJob: Send + Sync {
    /// Unique, stable key identifying this job's queue.
    fn key(&self) -> &'static str;

    /// Default dispatch options, merged under any per-call or
    /// payload-embedded options at enqueue time.
    fn options(&self) -> JobOptions {
        JobOptions::default()
    }

    /// Process one job payload.
    ///
    /// Return `Ok` with any serializable value on success. Return a
    /// [`HandlerError`] for transient failures that should be retried per
    /// the job's options; convert known-permanent failures into an `Ok`
    /// result describing the condition.
    async fn handle(&self, ctx: &JobContext, payload: Value) -> HandlerOutcome;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_id_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn job_state_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Removed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
    }

    #[test]
    fn backoff_fixed() {
        let backoff = Backoff::fixed(250);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_for_attempt(7), Duration::from_millis(250));
    }

    #[test]
    fn backoff_exponential_doubles_then_caps() {
        let backoff = Backoff::exponential(1000, 5000);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(backoff.delay_for_attempt(4), Duration::from_millis(5000));
        assert_eq!(backoff.delay_for_attempt(40), Duration::from_millis(5000));
    }

    #[test]
    fn options_merge_field_by_field() {
        let defaults = JobOptions::delayed(6000).with_max_attempts(5);
        let overrides = JobOptions::default().with_max_attempts(2);
        let merged = JobOptions::merged(&defaults, &overrides, None);
        assert_eq!(merged.delay_ms, Some(6000));
        assert_eq!(merged.max_attempts, Some(2));
    }

    #[test]
    fn options_merge_payload_wins_over_override() {
        let defaults = JobOptions::default().with_max_attempts(5);
        let overrides = JobOptions::default().with_max_attempts(2).with_delay_ms(100);
        let embedded = JobOptions::default().with_max_attempts(9);
        let merged = JobOptions::merged(&defaults, &overrides, Some(&embedded));
        assert_eq!(merged.max_attempts, Some(9));
        assert_eq!(merged.delay_ms, Some(100));
    }

    #[test]
    fn options_resolved_defaults() {
        let opts = JobOptions::default();
        assert_eq!(opts.delay(), Duration::ZERO);
        assert_eq!(opts.attempts(), 1);
        assert_eq!(opts.retry_delay(1), Duration::ZERO);
    }

    #[test]
    fn options_backoff_wire_format() {
        let opts: JobOptions =
            serde_json::from_value(json!({ "backoff": { "type": "fixed", "delay_ms": 180000 } }))
                .unwrap();
        assert_eq!(opts.backoff, Some(Backoff::fixed(180000)));
    }

    #[test]
    fn instance_attempt_bookkeeping() {
        let mut job = JobInstance::new(
            "WebhookCancel",
            json!({}),
            JobOptions::default().with_max_attempts(2),
        );
        assert_eq!(job.state, JobState::Waiting);

        job.mark_active();
        assert_eq!(job.attempts_made, 1);
        assert!(job.can_retry());

        job.mark_waiting("boom", Duration::ZERO);
        job.mark_active();
        assert_eq!(job.attempts_made, 2);
        assert!(!job.can_retry());

        job.mark_failed("boom");
        assert_eq!(job.state, JobState::Failed);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn instance_delay_sets_process_at() {
        let job = JobInstance::new("Notify", json!({}), JobOptions::delayed(6000));
        assert!(job.process_at >= job.created_at + chrono::Duration::milliseconds(5999));
    }
}
