//! Dispatch surface: single and bulk enqueue into registered queues.
//!
//! The dispatcher validates the target queue and the payload shape, merges
//! dispatch options, and hands the job to the broker, which makes it durable
//! before `add` returns. Handlers are never executed here; execution belongs
//! to the worker runtime. Safe to call concurrently from any number of
//! request-handling contexts — the broker write path is the point of
//! atomicity.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::jobs::job::{JobId, JobInstance, JobOptions};
use crate::jobs::registry::{QueueHandle, QueueRegistry};

/// Handle for an enqueued job: its broker-assigned id and queue. Represents
/// the accepted submission, not the execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    /// Assigned job id
    pub id: JobId,
    /// Queue the job was submitted to
    pub queue: String,
}

/// Public enqueue API over a built [`QueueRegistry`].
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<QueueRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over the given registry.
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self { registry }
    }

    /// Enqueue a single job with the definition's default options.
    pub async fn add(&self, name: &str, payload: Value) -> Result<DispatchResult> {
        self.add_with_options(name, payload, JobOptions::default())
            .await
    }

    /// Enqueue a single job, overriding the definition defaults field by
    /// field. Options embedded in the payload under `"options"` take
    /// precedence over the per-call overrides.
    pub async fn add_with_options(
        &self,
        name: &str,
        payload: Value,
        overrides: JobOptions,
    ) -> Result<DispatchResult> {
        let handle = self.registry.get(name)?;
        let job = Self::build_job(handle, payload, &overrides)?;
        let result = DispatchResult {
            id: job.id,
            queue: job.queue.clone(),
        };

        handle.broker.enqueue(job.clone()).await?;
        handle.events.emit_waiting(&job);
        tracing::debug!(job_id = %result.id, queue = %result.queue, "Job enqueued");
        Ok(result)
    }

    /// Enqueue many jobs as one atomic batch, preserving submission order.
    pub async fn add_bulk(&self, name: &str, payloads: Vec<Value>) -> Result<Vec<DispatchResult>> {
        self.add_bulk_with_options(name, payloads, JobOptions::default())
            .await
    }

    /// Bulk enqueue with per-call overrides applied to every payload.
    ///
    /// Every payload is validated and its options merged before anything is
    /// submitted, so a bad payload fails the call without a partial enqueue.
    pub async fn add_bulk_with_options(
        &self,
        name: &str,
        payloads: Vec<Value>,
        overrides: JobOptions,
    ) -> Result<Vec<DispatchResult>> {
        let handle = self.registry.get(name)?;

        let mut jobs = Vec::with_capacity(payloads.len());
        for payload in payloads {
            jobs.push(Self::build_job(handle, payload, &overrides)?);
        }
        let results: Vec<DispatchResult> = jobs
            .iter()
            .map(|job| DispatchResult {
                id: job.id,
                queue: job.queue.clone(),
            })
            .collect();

        handle.broker.enqueue_batch(jobs.clone()).await?;
        for job in &jobs {
            handle.events.emit_waiting(job);
        }
        tracing::debug!(queue = %name, count = results.len(), "Jobs enqueued in bulk");
        Ok(results)
    }

    /// Remove a queued-but-not-yet-started job. Returns true if a job was
    /// removed. This is the only cancellation path; active jobs cannot be
    /// interrupted.
    pub async fn remove(&self, name: &str, id: JobId) -> Result<bool> {
        let handle = self.registry.get(name)?;
        match handle.broker.remove(name, id).await? {
            Some(job) => {
                handle.events.emit_removed(&job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete finished job records older than the given age.
    pub async fn clean(&self, name: &str, older_than: Duration) -> Result<usize> {
        let handle = self.registry.get(name)?;
        let removed = handle.broker.clean(name, older_than).await?;
        handle.events.emit_clean(name, removed);
        Ok(removed)
    }

    /// Validate the payload and assemble a job instance with fully merged
    /// options. Runs before the broker is contacted; a job that fails here
    /// is never enqueued.
    fn build_job(handle: &QueueHandle, payload: Value, overrides: &JobOptions) -> Result<JobInstance> {
        if !payload.is_object() {
            return Err(DispatchError::validation(
                "Job payload must be a JSON object",
            ));
        }

        let embedded = match payload.get("options") {
            Some(raw) => Some(serde_json::from_value::<JobOptions>(raw.clone()).map_err(|e| {
                DispatchError::validation(format!("Invalid payload-embedded options: {}", e))
            })?),
            None => None,
        };

        let opts = JobOptions::merged(
            &handle.definition.options(),
            overrides,
            embedded.as_ref(),
        );
        Ok(JobInstance::new(handle.name.clone(), payload, opts))
    }
}
