//! Broker abstraction: durable queue storage, claiming, and retry scheduling.
//!
//! The broker is the single source of truth for job ownership. Workers claim
//! jobs under a processing lock with a TTL; a worker that dies without
//! renewing its lock leaves the job to be reclaimed as stalled. Two
//! implementations are provided:
//!
//! - [`InMemoryBroker`]: mutex-protected state for tests and development
//! - [`RedisBroker`]: Redis-backed storage for production use

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::BrokerConfig;
use crate::error::Result;
use crate::jobs::job::{JobId, JobInstance, JobState};

/// Per-queue job counts, by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Jobs ready to be claimed
    pub waiting: usize,
    /// Jobs delayed until a later time
    pub delayed: usize,
    /// Jobs currently held under a processing lock
    pub active: usize,
    /// Jobs finished successfully
    pub completed: usize,
    /// Jobs that exhausted their attempts
    pub failed: usize,
}

/// Trait for broker backends.
///
/// All submission methods make the job durable before returning. Claiming
/// takes the processing lock and counts an attempt; `complete`, `retry` and
/// `fail` release it and return the updated job record.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a single job.
    async fn enqueue(&self, job: JobInstance) -> Result<()>;

    /// Enqueue a batch of jobs as one atomic submission, preserving order.
    async fn enqueue_batch(&self, jobs: Vec<JobInstance>) -> Result<()>;

    /// Claim the next due job of the queue, taking a processing lock with
    /// the given TTL. Promotes delayed jobs whose time has come.
    async fn claim(&self, queue: &str, lock_ttl: Duration) -> Result<Option<JobInstance>>;

    /// Extend the processing lock of a claimed job. Returns false if the
    /// lock no longer exists (the job was reclaimed).
    async fn renew_lock(&self, queue: &str, id: JobId, lock_ttl: Duration) -> Result<bool>;

    /// Mark a claimed job completed, storing the handler result.
    async fn complete(&self, job: &JobInstance, result: Value) -> Result<JobInstance>;

    /// Re-queue a claimed job after a failed attempt, delayed by `delay`.
    async fn retry(&self, job: &JobInstance, delay: Duration, error: &str) -> Result<JobInstance>;

    /// Mark a claimed job terminally failed; the record is retained.
    async fn fail(&self, job: &JobInstance, error: &str) -> Result<JobInstance>;

    /// Remove a job that has not started processing. Returns the removed
    /// record, if one was found in the waiting or delayed sets.
    async fn remove(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>>;

    /// Delete finished (completed or failed) job records older than the
    /// given age. Returns the number of records removed.
    async fn clean(&self, queue: &str, older_than: Duration) -> Result<usize>;

    /// Reclaim jobs whose processing lock expired. Each reclaimed job is
    /// returned exactly once, re-queued if attempts remain and terminally
    /// failed otherwise.
    async fn reclaim_stalled(&self, queue: &str) -> Result<Vec<JobInstance>>;

    /// Fetch a job record by id, wherever it currently lives.
    async fn fetch(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>>;

    /// Current per-state counts for the queue.
    async fn counts(&self, queue: &str) -> Result<QueueCounts>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Broker
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<JobInstance>,
    delayed: Vec<(Instant, JobInstance)>,
    active: HashMap<JobId, (Instant, JobInstance)>,
    finished: HashMap<JobId, (Instant, JobInstance)>,
}

/// In-memory broker backend for tests and development.
///
/// Implements the full claim/lock/stall protocol against process-local
/// state, so the worker runtime behaves identically against it and against
/// Redis. Also counts mutating broker calls, which lets tests assert that a
/// failed dispatch never reached the broker.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<HashMap<String, QueueState>>,
    ops: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutating broker operations performed.
    pub fn op_count(&self) -> u64 {
        self.ops.load(Ordering::Relaxed)
    }

    fn push_ready(qs: &mut QueueState, job: JobInstance, delay: Duration) {
        if delay > Duration::ZERO {
            qs.delayed.push((Instant::now() + delay, job));
        } else {
            qs.waiting.push_back(job);
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job: JobInstance) -> Result<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = state.entry(job.queue.clone()).or_default();
        let delay = job.opts.delay();
        Self::push_ready(qs, job, delay);
        Ok(())
    }

    async fn enqueue_batch(&self, jobs: Vec<JobInstance>) -> Result<()> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        for job in jobs {
            let qs = state.entry(job.queue.clone()).or_default();
            let delay = job.opts.delay();
            Self::push_ready(qs, job, delay);
        }
        Ok(())
    }

    async fn claim(&self, queue: &str, lock_ttl: Duration) -> Result<Option<JobInstance>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = match state.get_mut(queue) {
            Some(qs) => qs,
            None => return Ok(None),
        };

        let now = Instant::now();
        qs.delayed.sort_by_key(|(ready_at, _)| *ready_at);
        while qs
            .delayed
            .first()
            .map_or(false, |(ready_at, _)| *ready_at <= now)
        {
            let (_, job) = qs.delayed.remove(0);
            qs.waiting.push_back(job);
        }

        let mut job = match qs.waiting.pop_front() {
            Some(job) => job,
            None => return Ok(None),
        };
        job.mark_active();
        qs.active.insert(job.id, (now + lock_ttl, job.clone()));
        Ok(Some(job))
    }

    async fn renew_lock(&self, queue: &str, id: JobId, lock_ttl: Duration) -> Result<bool> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = match state.get_mut(queue) {
            Some(qs) => qs,
            None => return Ok(false),
        };
        match qs.active.get_mut(&id) {
            Some((deadline, _)) => {
                *deadline = Instant::now() + lock_ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(&self, job: &JobInstance, result: Value) -> Result<JobInstance> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = state.entry(job.queue.clone()).or_default();
        let mut updated = match qs.active.remove(&job.id) {
            Some((_, stored)) => stored,
            None => job.clone(),
        };
        updated.mark_completed(result);
        qs.finished.insert(updated.id, (Instant::now(), updated.clone()));
        Ok(updated)
    }

    async fn retry(&self, job: &JobInstance, delay: Duration, error: &str) -> Result<JobInstance> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = state.entry(job.queue.clone()).or_default();
        let mut updated = match qs.active.remove(&job.id) {
            Some((_, stored)) => stored,
            None => job.clone(),
        };
        updated.mark_waiting(error, delay);
        Self::push_ready(qs, updated.clone(), delay);
        Ok(updated)
    }

    async fn fail(&self, job: &JobInstance, error: &str) -> Result<JobInstance> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = state.entry(job.queue.clone()).or_default();
        let mut updated = match qs.active.remove(&job.id) {
            Some((_, stored)) => stored,
            None => job.clone(),
        };
        updated.mark_failed(error);
        qs.finished.insert(updated.id, (Instant::now(), updated.clone()));
        Ok(updated)
    }

    async fn remove(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = match state.get_mut(queue) {
            Some(qs) => qs,
            None => return Ok(None),
        };

        if let Some(pos) = qs.waiting.iter().position(|job| job.id == id) {
            if let Some(mut job) = qs.waiting.remove(pos) {
                job.mark_removed();
                return Ok(Some(job));
            }
        }
        if let Some(pos) = qs.delayed.iter().position(|(_, job)| job.id == id) {
            let (_, mut job) = qs.delayed.remove(pos);
            job.mark_removed();
            return Ok(Some(job));
        }
        Ok(None)
    }

    async fn clean(&self, queue: &str, older_than: Duration) -> Result<usize> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = match state.get_mut(queue) {
            Some(qs) => qs,
            None => return Ok(0),
        };
        let now = Instant::now();
        let before = qs.finished.len();
        qs.finished
            .retain(|_, (finished_at, _)| now.duration_since(*finished_at) < older_than);
        Ok(before - qs.finished.len())
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<Vec<JobInstance>> {
        self.ops.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        let qs = match state.get_mut(queue) {
            Some(qs) => qs,
            None => return Ok(Vec::new()),
        };

        let now = Instant::now();
        let expired: Vec<JobId> = qs
            .active
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for id in expired {
            let (_, mut job) = match qs.active.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };
            if job.can_retry() {
                job.mark_waiting("processing lock expired", Duration::ZERO);
                qs.waiting.push_back(job.clone());
            } else {
                job.mark_failed("processing lock expired");
                qs.finished.insert(job.id, (now, job.clone()));
            }
            reclaimed.push(job);
        }
        Ok(reclaimed)
    }

    async fn fetch(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>> {
        let state = self.state.lock().await;
        let qs = match state.get(queue) {
            Some(qs) => qs,
            None => return Ok(None),
        };
        if let Some(job) = qs.waiting.iter().find(|job| job.id == id) {
            return Ok(Some(job.clone()));
        }
        if let Some((_, job)) = qs.delayed.iter().find(|(_, job)| job.id == id) {
            return Ok(Some(job.clone()));
        }
        if let Some((_, job)) = qs.active.get(&id) {
            return Ok(Some(job.clone()));
        }
        Ok(qs.finished.get(&id).map(|(_, job)| job.clone()))
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let qs = match state.get(queue) {
            Some(qs) => qs,
            None => return Ok(QueueCounts::default()),
        };
        Ok(QueueCounts {
            waiting: qs.waiting.len(),
            delayed: qs.delayed.len(),
            active: qs.active.len(),
            completed: qs
                .finished
                .values()
                .filter(|(_, job)| job.state == JobState::Completed)
                .count(),
            failed: qs
                .finished
                .values()
                .filter(|(_, job)| job.state == JobState::Failed)
                .count(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Broker
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed broker for production use.
///
/// Layout per queue (under the configured key prefix):
/// - `q:{queue}:waiting` — list of job ids in submission order
/// - `q:{queue}:delayed` — sorted set of job ids scored by ready time (ms)
/// - `q:{queue}:active`  — set of claimed job ids
/// - `q:{queue}:lock:{id}` — processing lock with TTL
/// - `q:{queue}:jobs`    — hash of id -> serialized job record
/// - `q:{queue}:completed`, `q:{queue}:failed` — sorted sets by finish time
pub struct RedisBroker {
    client: redis::Client,
    prefix: String,
}

impl RedisBroker {
    /// Create a Redis broker from configuration without testing the
    /// connection.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let client = redis::Client::open(config.url().as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
        })
    }

    /// Create a Redis broker and verify connectivity with a PING.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let broker = Self::new(config)?;
        let mut conn = broker.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        tracing::info!(host = %config.host, port = config.port, db = config.db, "Broker connected");
        Ok(broker)
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    fn key(&self, queue: &str, part: &str) -> String {
        format!("{}q:{}:{}", self.prefix, queue, part)
    }

    fn lock_key(&self, queue: &str, id: JobId) -> String {
        format!("{}q:{}:lock:{}", self.prefix, queue, id)
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn queue_job(pipe: &mut redis::Pipeline, jobs_key: &str, target: QueueTarget<'_>, job: &JobInstance) -> Result<()> {
        let record = serde_json::to_string(job)?;
        pipe.cmd("HSET")
            .arg(jobs_key)
            .arg(job.id.to_string())
            .arg(record)
            .ignore();
        match target {
            QueueTarget::Waiting(waiting_key) => {
                pipe.cmd("RPUSH").arg(waiting_key).arg(job.id.to_string()).ignore();
            }
            QueueTarget::Delayed(delayed_key, ready_ms) => {
                pipe.cmd("ZADD")
                    .arg(delayed_key)
                    .arg(ready_ms)
                    .arg(job.id.to_string())
                    .ignore();
            }
        }
        Ok(())
    }

    /// Move delayed jobs whose ready time has passed onto the waiting list.
    async fn promote_due(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        queue: &str,
    ) -> Result<()> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key(queue, "delayed"))
            .arg("-inf")
            .arg(Self::now_ms())
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(conn)
            .await?;
        if due.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &due {
            pipe.cmd("ZREM").arg(self.key(queue, "delayed")).arg(id).ignore();
            pipe.cmd("RPUSH").arg(self.key(queue, "waiting")).arg(id).ignore();
        }
        pipe.query_async::<_, ()>(conn).await?;
        Ok(())
    }

    /// Persist an updated record and release the claim, placing the id in
    /// the given finished set.
    async fn finish(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job: &JobInstance,
        finished_set: &str,
    ) -> Result<()> {
        let record = serde_json::to_string(job)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.key(&job.queue, "jobs"))
            .arg(job.id.to_string())
            .arg(record)
            .ignore();
        pipe.cmd("SREM")
            .arg(self.key(&job.queue, "active"))
            .arg(job.id.to_string())
            .ignore();
        pipe.cmd("DEL").arg(self.lock_key(&job.queue, job.id)).ignore();
        pipe.cmd("ZADD")
            .arg(self.key(&job.queue, finished_set))
            .arg(Self::now_ms())
            .arg(job.id.to_string())
            .ignore();
        pipe.query_async::<_, ()>(conn).await?;
        Ok(())
    }
}

enum QueueTarget<'a> {
    Waiting(&'a str),
    Delayed(&'a str, i64),
}

#[async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, job: JobInstance) -> Result<()> {
        self.enqueue_batch(vec![job]).await
    }

    async fn enqueue_batch(&self, jobs: Vec<JobInstance>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for job in &jobs {
            let jobs_key = self.key(&job.queue, "jobs");
            let waiting_key = self.key(&job.queue, "waiting");
            let delayed_key = self.key(&job.queue, "delayed");
            let target = if job.opts.delay() > Duration::ZERO {
                QueueTarget::Delayed(&delayed_key, job.process_at.timestamp_millis())
            } else {
                QueueTarget::Waiting(&waiting_key)
            };
            Self::queue_job(&mut pipe, &jobs_key, target, job)?;
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn claim(&self, queue: &str, lock_ttl: Duration) -> Result<Option<JobInstance>> {
        let mut conn = self.conn().await?;
        self.promote_due(&mut conn, queue).await?;

        let id: Option<String> = redis::cmd("LPOP")
            .arg(self.key(queue, "waiting"))
            .query_async(&mut conn)
            .await?;
        let id = match id {
            Some(id) => id,
            None => return Ok(None),
        };

        let record: Option<String> = redis::cmd("HGET")
            .arg(self.key(queue, "jobs"))
            .arg(&id)
            .query_async(&mut conn)
            .await?;
        let record = match record {
            Some(record) => record,
            // Record vanished (cleaned or removed out of band); skip the id.
            None => return Ok(None),
        };

        let mut job: JobInstance = serde_json::from_str(&record)?;
        job.mark_active();

        let updated = serde_json::to_string(&job)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.key(queue, "jobs"))
            .arg(&id)
            .arg(updated)
            .ignore();
        pipe.cmd("SADD").arg(self.key(queue, "active")).arg(&id).ignore();
        pipe.cmd("SET")
            .arg(self.lock_key(queue, job.id))
            .arg("1")
            .arg("PX")
            .arg(lock_ttl.as_millis() as u64)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(Some(job))
    }

    async fn renew_lock(&self, queue: &str, id: JobId, lock_ttl: Duration) -> Result<bool> {
        let mut conn = self.conn().await?;
        let renewed: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(queue, id))
            .arg("1")
            .arg("PX")
            .arg(lock_ttl.as_millis() as u64)
            .arg("XX")
            .query_async(&mut conn)
            .await?;
        Ok(renewed.is_some())
    }

    async fn complete(&self, job: &JobInstance, result: Value) -> Result<JobInstance> {
        let mut conn = self.conn().await?;
        let mut updated = job.clone();
        updated.mark_completed(result);
        self.finish(&mut conn, &updated, "completed").await?;
        Ok(updated)
    }

    async fn retry(&self, job: &JobInstance, delay: Duration, error: &str) -> Result<JobInstance> {
        let mut conn = self.conn().await?;
        let mut updated = job.clone();
        updated.mark_waiting(error, delay);

        let record = serde_json::to_string(&updated)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(self.key(&updated.queue, "jobs"))
            .arg(updated.id.to_string())
            .arg(record)
            .ignore();
        pipe.cmd("SREM")
            .arg(self.key(&updated.queue, "active"))
            .arg(updated.id.to_string())
            .ignore();
        pipe.cmd("DEL")
            .arg(self.lock_key(&updated.queue, updated.id))
            .ignore();
        if delay > Duration::ZERO {
            pipe.cmd("ZADD")
                .arg(self.key(&updated.queue, "delayed"))
                .arg(updated.process_at.timestamp_millis())
                .arg(updated.id.to_string())
                .ignore();
        } else {
            pipe.cmd("RPUSH")
                .arg(self.key(&updated.queue, "waiting"))
                .arg(updated.id.to_string())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(updated)
    }

    async fn fail(&self, job: &JobInstance, error: &str) -> Result<JobInstance> {
        let mut conn = self.conn().await?;
        let mut updated = job.clone();
        updated.mark_failed(error);
        self.finish(&mut conn, &updated, "failed").await?;
        Ok(updated)
    }

    async fn remove(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>> {
        let mut conn = self.conn().await?;
        let from_waiting: i64 = redis::cmd("LREM")
            .arg(self.key(queue, "waiting"))
            .arg(1)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        let found = if from_waiting > 0 {
            true
        } else {
            let from_delayed: i64 = redis::cmd("ZREM")
                .arg(self.key(queue, "delayed"))
                .arg(id.to_string())
                .query_async(&mut conn)
                .await?;
            from_delayed > 0
        };
        if !found {
            return Ok(None);
        }

        let record: Option<String> = redis::cmd("HGET")
            .arg(self.key(queue, "jobs"))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("HDEL")
            .arg(self.key(queue, "jobs"))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;

        match record {
            Some(record) => {
                let mut job: JobInstance = serde_json::from_str(&record)?;
                job.mark_removed();
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn clean(&self, queue: &str, older_than: Duration) -> Result<usize> {
        let mut conn = self.conn().await?;
        let cutoff = Self::now_ms() - older_than.as_millis() as i64;
        let mut removed = 0usize;

        for finished_set in ["completed", "failed"] {
            let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(self.key(queue, finished_set))
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut conn)
                .await?;
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &ids {
                pipe.cmd("ZREM").arg(self.key(queue, finished_set)).arg(id).ignore();
                pipe.cmd("HDEL").arg(self.key(queue, "jobs")).arg(id).ignore();
            }
            pipe.query_async::<_, ()>(&mut conn).await?;
            removed += ids.len();
        }
        Ok(removed)
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<Vec<JobInstance>> {
        let mut conn = self.conn().await?;
        let active_ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.key(queue, "active"))
            .query_async(&mut conn)
            .await?;

        let mut reclaimed = Vec::new();
        for id in active_ids {
            let lock_held: bool = redis::cmd("EXISTS")
                .arg(format!("{}q:{}:lock:{}", self.prefix, queue, id))
                .query_async(&mut conn)
                .await?;
            if lock_held {
                continue;
            }

            // SREM is the claim on the reclaim itself: whichever process
            // removes the id from the active set owns the transition.
            let owned: i64 = redis::cmd("SREM")
                .arg(self.key(queue, "active"))
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            if owned == 0 {
                continue;
            }

            let record: Option<String> = redis::cmd("HGET")
                .arg(self.key(queue, "jobs"))
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            let record = match record {
                Some(record) => record,
                None => continue,
            };
            let mut job: JobInstance = serde_json::from_str(&record)?;

            if job.can_retry() {
                job.mark_waiting("processing lock expired", Duration::ZERO);
                let updated = serde_json::to_string(&job)?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("HSET").arg(self.key(queue, "jobs")).arg(&id).arg(updated).ignore();
                pipe.cmd("RPUSH").arg(self.key(queue, "waiting")).arg(&id).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
            } else {
                job.mark_failed("processing lock expired");
                let updated = serde_json::to_string(&job)?;
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.cmd("HSET").arg(self.key(queue, "jobs")).arg(&id).arg(updated).ignore();
                pipe.cmd("ZADD")
                    .arg(self.key(queue, "failed"))
                    .arg(Self::now_ms())
                    .arg(&id)
                    .ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;
            }
            reclaimed.push(job);
        }
        Ok(reclaimed)
    }

    async fn fetch(&self, queue: &str, id: JobId) -> Result<Option<JobInstance>> {
        let mut conn = self.conn().await?;
        let record: Option<String> = redis::cmd("HGET")
            .arg(self.key(queue, "jobs"))
            .arg(id.to_string())
            .query_async(&mut conn)
            .await?;
        match record {
            Some(record) => Ok(Some(serde_json::from_str(&record)?)),
            None => Ok(None),
        }
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let mut conn = self.conn().await?;
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .cmd("LLEN")
                .arg(self.key(queue, "waiting"))
                .cmd("ZCARD")
                .arg(self.key(queue, "delayed"))
                .cmd("SCARD")
                .arg(self.key(queue, "active"))
                .cmd("ZCARD")
                .arg(self.key(queue, "completed"))
                .cmd("ZCARD")
                .arg(self.key(queue, "failed"))
                .query_async(&mut conn)
                .await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobOptions;
    use serde_json::json;

    fn job(queue: &str, n: u64, opts: JobOptions) -> JobInstance {
        JobInstance::new(queue, json!({ "n": n }), opts)
    }

    #[tokio::test]
    async fn claim_preserves_submission_order() {
        let broker = InMemoryBroker::new();
        let jobs: Vec<JobInstance> = (0..5)
            .map(|n| job("Notify", n, JobOptions::default()))
            .collect();
        broker.enqueue_batch(jobs).await.unwrap();

        for expected in 0..5u64 {
            let claimed = broker
                .claim("Notify", Duration::from_secs(30))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(claimed.data["n"], expected);
            assert_eq!(claimed.state, JobState::Active);
            assert_eq!(claimed.attempts_made, 1);
        }
        assert!(broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_not_claimable_until_due() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::delayed(6000)))
            .await
            .unwrap();

        assert!(broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());

        tokio::time::advance(Duration::from_millis(6001)).await;
        let claimed = broker.claim("Notify", Duration::from_secs(30)).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_with_delay_goes_through_delayed_set() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::default().with_max_attempts(3)))
            .await
            .unwrap();

        let claimed = broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let requeued = broker
            .retry(&claimed, Duration::from_millis(500), "boom")
            .await
            .unwrap();
        assert_eq!(requeued.state, JobState::Waiting);
        assert_eq!(requeued.error.as_deref(), Some("boom"));

        assert!(broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
        tokio::time::advance(Duration::from_millis(501)).await;
        let again = broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.attempts_made, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_reclaimed_exactly_once_and_requeued() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::default().with_max_attempts(2)))
            .await
            .unwrap();
        let claimed = broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        // Lock still held: nothing to reclaim.
        assert!(broker.reclaim_stalled("Notify").await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let reclaimed = broker.reclaim_stalled("Notify").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, claimed.id);
        assert_eq!(reclaimed[0].state, JobState::Waiting);

        // A second pass finds nothing.
        assert!(broker.reclaim_stalled("Notify").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_job_without_attempts_left_fails() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::default().with_max_attempts(1)))
            .await
            .unwrap();
        broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        let reclaimed = broker.reclaim_stalled("Notify").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].state, JobState::Failed);

        let counts = broker.counts("Notify").await.unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn renew_lock_keeps_job_active() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::default()))
            .await
            .unwrap();
        let claimed = broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(broker
            .renew_lock("Notify", claimed.id, Duration::from_secs(30))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        // Renewal pushed the deadline out; the job is not stalled yet.
        assert!(broker.reclaim_stalled("Notify").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_only_touches_unstarted_jobs() {
        let broker = InMemoryBroker::new();
        let queued = job("Notify", 1, JobOptions::default());
        let id = queued.id;
        broker.enqueue(queued).await.unwrap();

        let removed = broker.remove("Notify", id).await.unwrap().unwrap();
        assert_eq!(removed.state, JobState::Removed);
        assert!(broker.remove("Notify", id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn complete_stores_result_and_clean_discards_it() {
        let broker = InMemoryBroker::new();
        broker
            .enqueue(job("Notify", 1, JobOptions::default()))
            .await
            .unwrap();
        let claimed = broker
            .claim("Notify", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let done = broker
            .complete(&claimed, json!({ "ok": true }))
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Completed);

        let stored = broker.fetch("Notify", done.id).await.unwrap().unwrap();
        assert_eq!(stored.result, Some(json!({ "ok": true })));

        let removed = broker.clean("Notify", Duration::ZERO).await.unwrap();
        assert_eq!(removed, 1);
        assert!(broker.fetch("Notify", done.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn op_count_tracks_mutations() {
        let broker = InMemoryBroker::new();
        assert_eq!(broker.op_count(), 0);
        broker
            .enqueue(job("Notify", 1, JobOptions::default()))
            .await
            .unwrap();
        assert_eq!(broker.op_count(), 1);
        broker.counts("Notify").await.unwrap();
        assert_eq!(broker.op_count(), 1);
    }
}
