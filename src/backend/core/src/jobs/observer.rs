//! Lifecycle event observer.
//!
//! Every queue handle carries a fixed table of named callback slots, set once
//! at registration time and invoked synchronously at the corresponding state
//! transition. Observers are for logging and metrics only: they never mutate
//! dispatch or retry decisions, and a panicking observer is caught and logged
//! rather than aborting the job lifecycle.

use metrics::counter;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, info, warn};

use crate::jobs::job::JobInstance;

/// Callback invoked with the job at a state transition.
pub type JobHook = Box<dyn Fn(&JobInstance) + Send + Sync>;

/// Callback invoked with the job and the error cause of a failed attempt.
pub type FailureHook = Box<dyn Fn(&JobInstance, &str) + Send + Sync>;

/// Callback invoked after a cleanup pass with the queue name and the number
/// of finished jobs removed.
pub type CleanHook = Box<dyn Fn(&str, usize) + Send + Sync>;

/// Callback invoked with the job and a handler-emitted log line.
pub type LogHook = Box<dyn Fn(&JobInstance, &str) + Send + Sync>;

/// Fixed set of lifecycle callbacks for one queue.
///
/// Slots left empty are simply skipped. [`QueueEvents::logging`] returns the
/// stock observer used for every queue unless the host installs its own.
#[derive(Default)]
pub struct QueueEvents {
    on_active: Option<JobHook>,
    on_waiting: Option<JobHook>,
    on_completed: Option<JobHook>,
    on_stalled: Option<JobHook>,
    on_failed: Option<FailureHook>,
    on_clean: Option<CleanHook>,
    on_removed: Option<JobHook>,
    on_log: Option<LogHook>,
}

impl QueueEvents {
    /// An observer with every slot empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock observer: structured log line plus a metrics counter per
    /// transition.
    pub fn logging() -> Self {
        Self::new()
            .on_active(|job| {
                debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "Job active");
                counter!("medq_jobs_active_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_waiting(|job| {
                debug!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "Job waiting");
                counter!("medq_jobs_waiting_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_completed(|job| {
                info!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "Job completed");
                counter!("medq_jobs_completed_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_stalled(|job| {
                warn!(job_id = %job.id, queue = %job.queue, attempt = job.attempts_made, "Job stalled, reclaimed");
                counter!("medq_jobs_stalled_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_failed(|job, cause| {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue,
                    attempt = job.attempts_made,
                    max_attempts = job.max_attempts(),
                    terminal = job.state.is_terminal(),
                    error = cause,
                    "Job attempt failed"
                );
                counter!("medq_jobs_failed_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_clean(|queue, removed| {
                info!(queue, removed, "Queue cleaned");
                counter!("medq_jobs_cleaned_total", "queue" => queue.to_string())
                    .increment(removed as u64);
            })
            .on_removed(|job| {
                info!(job_id = %job.id, queue = %job.queue, "Job removed");
                counter!("medq_jobs_removed_total", "queue" => job.queue.clone()).increment(1);
            })
            .on_log(|job, message| {
                debug!(job_id = %job.id, queue = %job.queue, message, "Job log");
            })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Slot setters (builder style, set once at registration)
    // ─────────────────────────────────────────────────────────────────────────

    /// Set the hook fired when a worker starts processing a job.
    pub fn on_active<F: Fn(&JobInstance) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_active = Some(Box::new(f));
        self
    }

    /// Set the hook fired when a job enters (or re-enters) the waiting state.
    pub fn on_waiting<F: Fn(&JobInstance) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_waiting = Some(Box::new(f));
        self
    }

    /// Set the hook fired when a job completes successfully.
    pub fn on_completed<F: Fn(&JobInstance) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_completed = Some(Box::new(f));
        self
    }

    /// Set the hook fired once per stalled-job reclaim.
    pub fn on_stalled<F: Fn(&JobInstance) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_stalled = Some(Box::new(f));
        self
    }

    /// Set the hook fired for every failed attempt, terminal or not.
    pub fn on_failed<F: Fn(&JobInstance, &str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_failed = Some(Box::new(f));
        self
    }

    /// Set the hook fired after a cleanup pass over finished jobs.
    pub fn on_clean<F: Fn(&str, usize) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_clean = Some(Box::new(f));
        self
    }

    /// Set the hook fired when a queued job is removed before running.
    pub fn on_removed<F: Fn(&JobInstance) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_removed = Some(Box::new(f));
        self
    }

    /// Set the hook fired for handler-emitted log lines.
    pub fn on_log<F: Fn(&JobInstance, &str) + Send + Sync + 'static>(mut self, f: F) -> Self {
        self.on_log = Some(Box::new(f));
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Emission (crate-internal)
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) fn emit_active(&self, job: &JobInstance) {
        if let Some(hook) = &self.on_active {
            Self::guard(&job.queue, "active", || hook(job));
        }
    }

    pub(crate) fn emit_waiting(&self, job: &JobInstance) {
        if let Some(hook) = &self.on_waiting {
            Self::guard(&job.queue, "waiting", || hook(job));
        }
    }

    pub(crate) fn emit_completed(&self, job: &JobInstance) {
        if let Some(hook) = &self.on_completed {
            Self::guard(&job.queue, "completed", || hook(job));
        }
    }

    pub(crate) fn emit_stalled(&self, job: &JobInstance) {
        if let Some(hook) = &self.on_stalled {
            Self::guard(&job.queue, "stalled", || hook(job));
        }
    }

    pub(crate) fn emit_failed(&self, job: &JobInstance, cause: &str) {
        if let Some(hook) = &self.on_failed {
            Self::guard(&job.queue, "failed", || hook(job, cause));
        }
    }

    pub(crate) fn emit_clean(&self, queue: &str, removed: usize) {
        if let Some(hook) = &self.on_clean {
            Self::guard(queue, "clean", || hook(queue, removed));
        }
    }

    pub(crate) fn emit_removed(&self, job: &JobInstance) {
        if let Some(hook) = &self.on_removed {
            Self::guard(&job.queue, "removed", || hook(job));
        }
    }

    pub(crate) fn emit_log(&self, job: &JobInstance, message: &str) {
        if let Some(hook) = &self.on_log {
            Self::guard(&job.queue, "log", || hook(job, message));
        }
    }

    /// Run one observer callback, containing panics.
    fn guard(queue: &str, event: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(queue, event, "Queue event observer panicked");
            counter!("medq_observer_panics_total", "event" => event.to_string()).increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobInstance, JobOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn sample_job() -> JobInstance {
        JobInstance::new("Notify", json!({"k": 1}), JobOptions::default())
    }

    #[test]
    fn empty_slots_are_skipped() {
        let events = QueueEvents::new();
        events.emit_active(&sample_job());
        events.emit_clean("Notify", 3);
    }

    #[test]
    fn hooks_receive_the_job() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = seen.clone();
        let events = QueueEvents::new().on_completed(move |job| {
            assert_eq!(job.queue, "Notify");
            seen_hook.fetch_add(1, Ordering::SeqCst);
        });

        events.emit_completed(&sample_job());
        events.emit_completed(&sample_job());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_hook_receives_cause() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = seen.clone();
        let events = QueueEvents::new().on_failed(move |_, cause| {
            assert_eq!(cause, "downstream unavailable");
            seen_hook.fetch_add(1, Ordering::SeqCst);
        });

        events.emit_failed(&sample_job(), "downstream unavailable");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_panic_is_contained() {
        let after = Arc::new(AtomicUsize::new(0));
        let after_hook = after.clone();
        let events = QueueEvents::new()
            .on_active(|_| panic!("observer bug"))
            .on_completed(move |_| {
                after_hook.fetch_add(1, Ordering::SeqCst);
            });

        let job = sample_job();
        events.emit_active(&job);
        events.emit_completed(&job);
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }
}
