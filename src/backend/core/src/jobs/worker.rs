//! Worker runtime: per-queue processing loops with bounded concurrency.
//!
//! For every registered queue the runtime spawns a claim loop and a stalled-
//! job reaper. Claimed jobs run as independent tasks under a semaphore of
//! `concurrency` permits; a heartbeat task renews the broker processing lock
//! while the handler runs, so only jobs whose worker actually died are
//! reclaimed as stalled. Handler outcomes are converted into broker signals:
//! success completes the job, failure re-queues it with backoff while
//! attempts remain and fails it terminally otherwise.
//!
//! Shutdown: [`WorkerRuntime::shutdown`] stops claiming; jobs already in
//! flight are drained before the queue loop exits. Await
//! [`WorkerRuntime::join`] to wait for that drain.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::{ReconnectPolicy, WorkerSettings};
use crate::error::{DispatchError, ErrorCode};
use crate::jobs::job::{JobContext, JobId, JobInstance, JobState};
use crate::jobs::registry::{QueueHandle, QueueRegistry};

/// Configuration for the worker runtime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrently in-flight jobs per queue
    pub concurrency: usize,
    /// Sleep between claim attempts when the queue is empty
    pub claim_interval: Duration,
    /// Processing lock TTL; renewed at half this interval while a handler runs
    pub lock_ttl: Duration,
    /// Interval between stalled-job reclaim passes
    pub stalled_check_interval: Duration,
    /// Backoff applied when the broker is unreachable
    pub reconnect: ReconnectPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default(), ReconnectPolicy::default())
    }
}

impl WorkerConfig {
    /// Build the runtime configuration from loaded settings.
    pub fn from_settings(settings: &WorkerSettings, reconnect: ReconnectPolicy) -> Self {
        Self {
            concurrency: settings.concurrency,
            claim_interval: Duration::from_millis(settings.claim_interval_ms),
            lock_ttl: Duration::from_millis(settings.lock_ttl_ms),
            stalled_check_interval: Duration::from_millis(settings.stalled_check_interval_ms),
            reconnect,
        }
    }
}

/// Per-queue processing loops over a built [`QueueRegistry`].
pub struct WorkerRuntime {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerRuntime {
    /// Start a claim loop and a stalled-job reaper for every registered
    /// queue.
    pub fn start(registry: Arc<QueueRegistry>, config: WorkerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(registry.len() * 2);

        for handle in registry.handles() {
            tracing::info!(
                queue = %handle.name,
                concurrency = config.concurrency,
                "Queue worker started"
            );
            tasks.push(tokio::spawn(Self::queue_loop(
                handle.clone(),
                config.clone(),
                shutdown_tx.subscribe(),
            )));
            tasks.push(tokio::spawn(Self::reaper_loop(
                handle.clone(),
                config.stalled_check_interval,
                shutdown_tx.subscribe(),
            )));
        }

        Self { shutdown_tx, tasks }
    }

    /// Signal every loop to stop claiming. Returns immediately; in-flight
    /// jobs keep running until they finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all queue loops to exit, including the drain of in-flight
    /// jobs.
    pub async fn join(self) {
        let _ = futures::future::join_all(self.tasks).await;
    }

    async fn queue_loop(
        handle: QueueHandle,
        config: WorkerConfig,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let mut reconnect_attempts: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            match handle.broker.claim(&handle.name, config.lock_ttl).await {
                Ok(Some(job)) => {
                    reconnect_attempts = 0;
                    let job_handle = handle.clone();
                    let lock_ttl = config.lock_ttl;
                    tokio::spawn(async move {
                        let _permit = permit;
                        Self::process_job(job_handle, job, lock_ttl).await;
                    });
                }
                Ok(None) => {
                    reconnect_attempts = 0;
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = sleep(config.claim_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    reconnect_attempts += 1;
                    let delay = config.reconnect.delay_for_attempt(reconnect_attempts);
                    tracing::warn!(
                        queue = %handle.name,
                        error = %e,
                        attempt = reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Broker unavailable, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => {}
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        // Drain: every in-flight job holds a permit until its task finishes.
        let _ = semaphore.acquire_many(config.concurrency as u32).await;
        tracing::info!(queue = %handle.name, "Queue worker stopped");
    }

    /// Run one claimed job through its handler and signal the outcome to the
    /// broker. Errors here are execution-time: they are logged and surfaced
    /// through the observer, never to the dispatching caller.
    async fn process_job(handle: QueueHandle, job: JobInstance, lock_ttl: Duration) {
        handle.events.emit_active(&job);

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            handle.clone(),
            job.id,
            lock_ttl,
        ));

        let ctx = JobContext::new(job.clone(), handle.events.clone());
        let outcome = handle.definition.handle(&ctx, job.data.clone()).await;
        heartbeat.abort();

        match outcome {
            Ok(result) => match handle.broker.complete(&job, result).await {
                Ok(updated) => {
                    tracing::debug!(job_id = %job.id, queue = %handle.name, "Job completed");
                    handle.events.emit_completed(&updated);
                }
                Err(e) => e.log(),
            },
            Err(cause) => {
                let message = cause.to_string();
                if job.can_retry() {
                    let delay = job.opts.retry_delay(job.attempts_made);
                    match handle.broker.retry(&job, delay, &message).await {
                        Ok(updated) => {
                            DispatchError::with_internal(
                                ErrorCode::HandlerFailed,
                                "Job attempt failed, retry scheduled",
                                format!(
                                    "job {} on queue {} attempt {}/{} ({}ms backoff): {}",
                                    job.id,
                                    handle.name,
                                    job.attempts_made,
                                    job.max_attempts(),
                                    delay.as_millis(),
                                    message
                                ),
                            )
                            .log();
                            handle.events.emit_failed(&updated, &message);
                            handle.events.emit_waiting(&updated);
                        }
                        Err(e) => e.log(),
                    }
                } else {
                    match handle.broker.fail(&job, &message).await {
                        Ok(updated) => {
                            DispatchError::with_internal(
                                ErrorCode::RetriesExhausted,
                                "Job failed, retries exhausted",
                                format!(
                                    "job {} on queue {} after {} attempts: {}",
                                    job.id, handle.name, job.attempts_made, message
                                ),
                            )
                            .log();
                            handle.events.emit_failed(&updated, &message);
                        }
                        Err(e) => e.log(),
                    }
                }
            }
        }
    }

    /// Renew the processing lock at half its TTL until aborted. Keeps live
    /// handlers from being reclaimed as stalled, however long they run.
    async fn heartbeat_loop(handle: QueueHandle, id: JobId, lock_ttl: Duration) {
        let interval = lock_ttl / 2;
        loop {
            sleep(interval).await;
            match handle.broker.renew_lock(&handle.name, id, lock_ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(job_id = %id, queue = %handle.name, "Processing lock lost");
                    break;
                }
                Err(e) => {
                    tracing::warn!(job_id = %id, queue = %handle.name, error = %e, "Lock renewal failed");
                }
            }
        }
    }

    async fn reaper_loop(
        handle: QueueHandle,
        check_interval: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match handle.broker.reclaim_stalled(&handle.name).await {
                        Ok(reclaimed) => {
                            for job in &reclaimed {
                                handle.events.emit_stalled(job);
                                match job.state {
                                    JobState::Waiting => handle.events.emit_waiting(job),
                                    JobState::Failed => {
                                        let cause = job.error.as_deref().unwrap_or("stalled");
                                        handle.events.emit_failed(job, cause);
                                    }
                                    _ => {}
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!(queue = %handle.name, error = %e, "Stalled job reclaim failed");
                        }
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::broker::{Broker, InMemoryBroker};
    use crate::jobs::dispatcher::Dispatcher;
    use crate::jobs::handlers::CancellationPayload;
    use crate::jobs::job::{Backoff, HandlerError, HandlerOutcome, JobOptions, QueueJob};
    use crate::jobs::observer::QueueEvents;
    use crate::jobs::registry::QueueRegistry;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Fails the first `fail_times` attempts, then succeeds.
    struct FlakyJob {
        key: &'static str,
        opts: JobOptions,
        fail_times: u32,
        invocations: Arc<AtomicU32>,
    }

    #[async_trait]
    impl QueueJob for FlakyJob {
        fn key(&self) -> &'static str {
            self.key
        }

        fn options(&self) -> JobOptions {
            self.opts.clone()
        }

        async fn handle(&self, ctx: &JobContext, _payload: Value) -> HandlerOutcome {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if ctx.attempt() <= self.fail_times {
                Err(HandlerError::new("simulated downstream failure"))
            } else {
                Ok(json!({ "attempt": ctx.attempt() }))
            }
        }
    }

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 100,
            claim_interval: Duration::from_millis(10),
            lock_ttl: Duration::from_millis(500),
            stalled_check_interval: Duration::from_millis(50),
            reconnect: ReconnectPolicy::default(),
        }
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..10_000 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn wait_until_state(broker: &InMemoryBroker, queue: &str, id: crate::jobs::job::JobId, state: JobState) {
        for _ in 0..10_000 {
            if let Some(job) = broker.fetch(queue, id).await.unwrap() {
                if job.state == state {
                    return;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("job never reached state {}", state);
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_job_completes_on_third_attempt() {
        let broker = Arc::new(InMemoryBroker::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let definition: Arc<dyn QueueJob> = Arc::new(FlakyJob {
            key: "Flaky",
            opts: JobOptions::default()
                .with_max_attempts(3)
                .with_backoff(Backoff::fixed(100)),
            fail_times: 2,
            invocations: invocations.clone(),
        });
        let registry =
            Arc::new(QueueRegistry::register(broker.clone(), vec![definition]).unwrap());
        let dispatcher = Dispatcher::new(registry.clone());

        let result = dispatcher.add("Flaky", json!({})).await.unwrap();
        let runtime = WorkerRuntime::start(registry, test_config());

        wait_until_state(&broker, "Flaky", result.id, JobState::Completed).await;

        let stored = broker.fetch("Flaky", result.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 3);
        assert_eq!(invocations.load(Ordering::SeqCst), 3);

        runtime.shutdown();
        runtime.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_job_fails_after_exactly_max_attempts() {
        let broker = Arc::new(InMemoryBroker::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let definition: Arc<dyn QueueJob> = Arc::new(FlakyJob {
            key: "AlwaysFails",
            opts: JobOptions::default().with_max_attempts(2),
            fail_times: u32::MAX,
            invocations: invocations.clone(),
        });
        let registry =
            Arc::new(QueueRegistry::register(broker.clone(), vec![definition]).unwrap());
        let dispatcher = Dispatcher::new(registry.clone());

        let result = dispatcher.add("AlwaysFails", json!({})).await.unwrap();
        let runtime = WorkerRuntime::start(registry, test_config());

        wait_until_state(&broker, "AlwaysFails", result.id, JobState::Failed).await;

        let stored = broker.fetch("AlwaysFails", result.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts_made, 2);

        // No third attempt happens after the terminal failure.
        sleep(Duration::from_millis(500)).await;
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        runtime.shutdown();
        runtime.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn thousand_jobs_complete_exactly_once_at_bounded_concurrency() {
        let broker = Arc::new(InMemoryBroker::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let definition: Arc<dyn QueueJob> = Arc::new(FlakyJob {
            key: "Bulk",
            opts: JobOptions::default().with_max_attempts(1),
            fail_times: 0,
            invocations: invocations.clone(),
        });
        let registry =
            Arc::new(QueueRegistry::register(broker.clone(), vec![definition]).unwrap());
        let dispatcher = Dispatcher::new(registry.clone());

        let payloads: Vec<Value> = (0..1000).map(|n| json!({ "n": n })).collect();
        let results = dispatcher.add_bulk("Bulk", payloads).await.unwrap();
        assert_eq!(results.len(), 1000);

        let runtime = WorkerRuntime::start(registry, test_config());

        {
            let invocations = invocations.clone();
            wait_until(move || invocations.load(Ordering::SeqCst) == 1000).await;
        }
        for result in &results {
            wait_until_state(&broker, "Bulk", result.id, JobState::Completed).await;
        }

        let counts = broker.counts("Bulk").await.unwrap();
        assert_eq!(counts.completed, 1000);
        assert_eq!(counts.failed, 0);
        assert_eq!(counts.waiting, 0);
        // Each job ran exactly once: no duplicate completion, no lost job.
        assert_eq!(invocations.load(Ordering::SeqCst), 1000);

        runtime.shutdown();
        runtime.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_is_reclaimed_once_and_reprocessed() {
        let broker = Arc::new(InMemoryBroker::new());
        let invocations = Arc::new(AtomicU32::new(0));
        let definition: Arc<dyn QueueJob> = Arc::new(FlakyJob {
            key: "Stalls",
            opts: JobOptions::default().with_max_attempts(2),
            fail_times: 0,
            invocations: invocations.clone(),
        });

        let stalled_seen = Arc::new(AtomicUsize::new(0));
        let stalled_hook = stalled_seen.clone();
        let registry = Arc::new(
            QueueRegistry::register_with(broker.clone(), vec![definition], move |_| {
                let stalled_hook = stalled_hook.clone();
                QueueEvents::new().on_stalled(move |_| {
                    stalled_hook.fetch_add(1, Ordering::SeqCst);
                })
            })
            .unwrap(),
        );
        let dispatcher = Dispatcher::new(registry.clone());
        let result = dispatcher.add("Stalls", json!({})).await.unwrap();

        // Simulate a worker that claimed the job and died without renewing
        // its lock.
        let dead_claim = broker
            .claim("Stalls", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead_claim.attempts_made, 1);
        sleep(Duration::from_millis(150)).await;

        let runtime = WorkerRuntime::start(registry, test_config());

        wait_until_state(&broker, "Stalls", result.id, JobState::Completed).await;

        assert_eq!(stalled_seen.load(Ordering::SeqCst), 1);
        let stored = broker.fetch("Stalls", result.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts_made, 2);

        runtime.shutdown();
        runtime.join().await;
    }

    /// End-to-end: a delayed notification queue processed through dispatch,
    /// delay promotion, handler execution, and the completion hook.
    struct NotifyJob {
        seen: Arc<Mutex<Vec<CancellationPayload>>>,
    }

    #[async_trait]
    impl QueueJob for NotifyJob {
        fn key(&self) -> &'static str {
            "Notify"
        }

        fn options(&self) -> JobOptions {
            JobOptions::delayed(6000).with_max_attempts(5)
        }

        async fn handle(&self, ctx: &JobContext, payload: Value) -> HandlerOutcome {
            let parsed: CancellationPayload = serde_json::from_value(payload)
                .map_err(|e| HandlerError::new(format!("malformed payload: {}", e)))?;
            ctx.log(&format!(
                "external_ids={:?} procedures={:?} tenant={}",
                parsed.external_ids, parsed.procedures, parsed.tenant_id
            ));
            self.seen.lock().unwrap().push(parsed);
            Ok(json!(true))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn notify_queue_end_to_end() {
        let broker = Arc::new(InMemoryBroker::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let definition: Arc<dyn QueueJob> = Arc::new(NotifyJob { seen: seen.clone() });

        let completed = Arc::new(Mutex::new(Vec::<Value>::new()));
        let completed_hook = completed.clone();
        let registry = Arc::new(
            QueueRegistry::register_with(broker.clone(), vec![definition], move |_| {
                let completed_hook = completed_hook.clone();
                QueueEvents::new().on_completed(move |job| {
                    completed_hook.lock().unwrap().push(job.data.clone());
                })
            })
            .unwrap(),
        );
        let dispatcher = Dispatcher::new(registry.clone());

        let payload = json!({
            "idexterno": [1, 2],
            "procedimentos": [10],
            "tenantId": "7"
        });
        let result = dispatcher.add("Notify", payload.clone()).await.unwrap();

        let runtime = WorkerRuntime::start(registry, test_config());

        // Not processed before the 6s dispatch delay has elapsed.
        sleep(Duration::from_millis(1000)).await;
        assert!(seen.lock().unwrap().is_empty());

        wait_until_state(&broker, "Notify", result.id, JobState::Completed).await;

        let stored = broker.fetch("Notify", result.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts_made, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].external_ids, vec![1, 2]);
        assert_eq!(seen[0].procedures, vec![10]);
        assert_eq!(seen[0].tenant_id, "7");

        let completed = completed.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0], payload);

        runtime.shutdown();
        runtime.join().await;
    }
}
