//! Background revalidation: pending-job queue and the scheduler loop.
//!
//! Stale reads enqueue a refresh job instead of refetching inline. One
//! scheduler task drains the queue a small batch at a time so a burst of
//! stale traffic never turns into a burst of upstream fetches. At most
//! one job per key is pending; re-enqueueing a pending key is a no-op.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RevalidationSettings;
use crate::error::BoxError;
use crate::lock::mutex_lock;
use crate::metrics::MetricsCollector;
use crate::store::CacheEntryStore;

const SOURCE: &str = "revalidate";

/// Relative urgency of a refresh, ordered within a tick when the queue
/// cannot be drained whole. Stale hits queue at `Medium`; callers
/// enqueueing directly can raise or lower it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// A value producer for one cache key.
///
/// The returned future is `'static` so the scheduler can run it long
/// after the originating request has completed.
pub trait Fetch: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<Value, BoxError>>;
}

struct FnFetch<F>(F);

impl<F, Fut> Fetch for FnFetch<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'static, Result<Value, BoxError>> {
        Box::pin((self.0)())
    }
}

/// Wrap a closure as a [`Fetch`].
pub fn fetch_fn<F, Fut>(f: F) -> Arc<dyn Fetch>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
{
    Arc::new(FnFetch(f))
}

/// One pending refresh.
struct RevalidationJob {
    key: String,
    fetch: Arc<dyn Fetch>,
    priority: Priority,
    /// Generation of the entry that triggered the refresh; the write is
    /// fenced against it.
    generation: u64,
    ttl: Option<Duration>,
    enqueued_at: Instant,
    seq: u64,
    attempts_left: u32,
}

/// Pending refresh jobs, at most one per key.
pub struct RevalidationQueue {
    jobs: Mutex<HashMap<String, RevalidationJob>>,
    seq: AtomicU64,
    max_attempts: u32,
}

impl RevalidationQueue {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Queue a refresh for a key. Returns `false` (and changes nothing)
    /// when a job for the key is already pending.
    pub fn enqueue(
        &self,
        key: impl Into<String>,
        fetch: Arc<dyn Fetch>,
        priority: Priority,
        generation: u64,
        ttl: Option<Duration>,
    ) -> bool {
        let key = key.into();
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "enqueue");
        if jobs.contains_key(&key) {
            debug!(%key, "refresh already pending, skipping");
            return false;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        debug!(%key, ?priority, "refresh queued");
        jobs.insert(
            key.clone(),
            RevalidationJob {
                key,
                fetch,
                priority,
                generation,
                ttl,
                enqueued_at: Instant::now(),
                seq,
                attempts_left: self.max_attempts,
            },
        );
        true
    }

    pub fn pending(&self, key: &str) -> bool {
        mutex_lock(&self.jobs, SOURCE, "pending").contains_key(key)
    }

    /// Priority of the pending job for a key, if one is queued.
    pub fn priority_of(&self, key: &str) -> Option<Priority> {
        mutex_lock(&self.jobs, SOURCE, "priority_of")
            .get(key)
            .map(|job| job.priority)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.jobs, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return up to `limit` jobs: highest priority first,
    /// enqueue order within a priority.
    fn take_batch(&self, limit: usize) -> Vec<RevalidationJob> {
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "take_batch");
        let mut order: Vec<(Priority, u64, String)> = jobs
            .values()
            .map(|job| (job.priority, job.seq, job.key.clone()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        order
            .into_iter()
            .take(limit)
            .filter_map(|(_, _, key)| jobs.remove(&key))
            .collect()
    }

    /// Put a failed job back, keeping its original position in the
    /// enqueue order. Dropped if the key picked up a newer job meanwhile.
    fn requeue(&self, job: RevalidationJob) {
        let mut jobs = mutex_lock(&self.jobs, SOURCE, "requeue");
        jobs.entry(job.key.clone()).or_insert(job);
    }
}

/// Single background task draining the revalidation queue.
///
/// Ticks every `busy_interval` while jobs are pending and every
/// `idle_interval` otherwise, processing at most `jobs_per_tick` jobs per
/// tick. Jobs older than `max_job_age` are dropped unprocessed.
pub struct RevalidationScheduler {
    store: Arc<CacheEntryStore>,
    queue: Arc<RevalidationQueue>,
    metrics: Arc<MetricsCollector>,
    settings: RevalidationSettings,
    ticking: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RevalidationScheduler {
    pub fn new(
        store: Arc<CacheEntryStore>,
        queue: Arc<RevalidationQueue>,
        metrics: Arc<MetricsCollector>,
        settings: RevalidationSettings,
    ) -> Self {
        Self {
            store,
            queue,
            metrics,
            settings,
            ticking: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the scheduler loop. Idempotent while running.
    pub fn start(self: &Arc<Self>) {
        let mut shutdown = mutex_lock(&self.shutdown, SOURCE, "start");
        if shutdown.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        *shutdown = Some(tx);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(scheduler.run(rx));
        *mutex_lock(&self.handle, SOURCE, "start") = Some(handle);
        info!(
            busy_ms = self.settings.busy_interval_ms,
            idle_ms = self.settings.idle_interval_ms,
            jobs_per_tick = self.settings.jobs_per_tick,
            "revalidation scheduler started"
        );
    }

    /// Signal shutdown and wait for the loop to exit. Pending jobs are
    /// abandoned.
    pub async fn close(&self) {
        let sender = mutex_lock(&self.shutdown, SOURCE, "close").take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let handle = mutex_lock(&self.handle, SOURCE, "close").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("revalidation scheduler stopped");
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let interval = if self.queue.is_empty() {
                self.settings.idle_interval()
            } else {
                self.settings.busy_interval()
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {
                    self.tick().await;
                }
            }
        }
    }

    /// Process one batch. Returns the number of jobs run. A tick that
    /// overlaps a still-running one is skipped.
    pub async fn tick(&self) -> usize {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("previous tick still running, skipping");
            return 0;
        }

        let batch = self.queue.take_batch(self.settings.jobs_per_tick);
        let mut processed = 0;
        for job in batch {
            processed += 1;
            self.run_job(job).await;
        }

        self.ticking.store(false, Ordering::SeqCst);
        processed
    }

    async fn run_job(&self, mut job: RevalidationJob) {
        let age = job.enqueued_at.elapsed();
        if age > self.settings.max_job_age() {
            warn!(key = %job.key, age_secs = age.as_secs(), "refresh job too old, dropping");
            return;
        }

        match job.fetch.fetch().await {
            Ok(value) => {
                let applied = self
                    .store
                    .set_if_current(&job.key, value, job.ttl, job.generation)
                    .await;
                if applied {
                    debug!(key = %job.key, "background refresh applied");
                } else {
                    debug!(key = %job.key, "background refresh superseded");
                }
            }
            Err(err) => {
                self.metrics.record_error("revalidate");
                job.attempts_left = job.attempts_left.saturating_sub(1);
                if job.attempts_left > 0 && age <= self.settings.max_job_age() {
                    warn!(
                        key = %job.key,
                        attempts_left = job.attempts_left,
                        error = %err,
                        "background refresh failed, will retry"
                    );
                    self.queue.requeue(job);
                } else {
                    warn!(key = %job.key, error = %err, "background refresh failed, giving up");
                }
            }
        }
    }
}
