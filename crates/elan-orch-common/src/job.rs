//! Keyed job coordinator.
//!
//! Every mutation in the control plane is submitted as a job carrying a
//! string key. The coordinator guarantees:
//!
//! - at most one job per key is executing at any instant;
//! - jobs sharing a key run in submission order, including their retries;
//! - jobs with different keys run in parallel, bounded by a worker limit;
//! - a job failing with a retryable error is re-run up to `max_retries`
//!   times before it is logged as a permanent failure.
//!
//! A key that has queued work owns exactly one drainer task. The drainer
//! pops jobs one by one, acquires a worker permit for each, and removes the
//! key from the queue map (under the same lock) once its queue is empty.

use crate::task::{JobError, JobResult, JobResultExt, TaskStatus};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, error, warn};

/// Default number of jobs allowed to execute concurrently.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default number of resubmissions after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for a [`JobCoordinator`].
#[derive(Debug, Clone)]
pub struct JobConfig {
    /// Upper bound on concurrently executing jobs (across all keys)
    pub max_workers: usize,
    /// Resubmissions allowed after the first failure
    pub max_retries: u32,
    /// Pause between a failed attempt and its resubmission
    pub retry_backoff: Duration,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

type JobFn = Box<dyn Fn() -> BoxFuture<'static, JobResult<()>> + Send + Sync>;

struct QueuedJob {
    name: String,
    run: JobFn,
}

/// Counters describing coordinator activity.
#[derive(Debug, Default)]
pub struct JobStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`JobStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn snapshot(&self) -> JobStatsSnapshot {
        JobStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    config: JobConfig,
    queues: Mutex<HashMap<String, VecDeque<QueuedJob>>>,
    permits: Arc<Semaphore>,
    outstanding: AtomicUsize,
    idle: Notify,
    stats: JobStats,
}

/// Per-key serialized, retrying job executor.
///
/// Cloning is cheap; all clones share the same queues and worker pool.
/// Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl JobCoordinator {
    pub fn new(config: JobConfig) -> Self {
        let workers = config.max_workers.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers)),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                stats: JobStats::default(),
            }),
        }
    }

    /// Submits a job under `key`.
    ///
    /// `job` is a factory: it is invoked once per attempt, so a retried job
    /// starts from a fresh future that re-reads current state.
    pub fn enqueue<F, Fut>(&self, key: impl Into<String>, name: impl Into<String>, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<()>> + Send + 'static,
    {
        let key = key.into();
        let queued = QueuedJob {
            name: name.into(),
            run: Box::new(move || Box::pin(job())),
        };

        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);
        self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let spawn_drainer = {
            let mut queues = self.inner.queues.lock();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.push_back(queued);
                    false
                }
                None => {
                    queues.insert(key.clone(), VecDeque::from([queued]));
                    true
                }
            }
        };

        if spawn_drainer {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain_key(inner, key));
        }
    }

    /// Number of jobs queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Returns true if `key` has queued or running work.
    pub fn is_key_busy(&self, key: &str) -> bool {
        self.inner.queues.lock().contains_key(key)
    }

    pub fn stats(&self) -> JobStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Resolves once no job is queued or running.
    ///
    /// Jobs enqueued by running jobs are counted before their parent
    /// completes, so cascades are waited for as a whole.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("config", &self.inner.config)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

async fn drain_key(inner: Arc<Inner>, key: String) {
    loop {
        let next = {
            let mut queues = inner.queues.lock();
            let popped = queues.get_mut(&key).and_then(VecDeque::pop_front);
            if popped.is_none() {
                queues.remove(&key);
            }
            popped
        };

        let Some(job) = next else {
            return;
        };

        let status = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(_permit) => run_with_retries(&inner, &key, &job).await,
            Err(_) => {
                error!(key = %key, job = %job.name, "Worker pool closed, dropping job");
                TaskStatus::Failed
            }
        };

        match status {
            TaskStatus::Success | TaskStatus::Ignore => {
                inner.stats.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            TaskStatus::NeedRetry | TaskStatus::Failed => {
                inner.stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        if inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            inner.idle.notify_waiters();
        }
    }
}

async fn run_with_retries(inner: &Inner, key: &str, job: &QueuedJob) -> TaskStatus {
    let max_retries = inner.config.max_retries;
    let mut attempt = 0u32;

    loop {
        let result = match tokio::spawn((job.run)()).await {
            Ok(result) => result,
            Err(join_error) => Err(JobError::aborted(join_error.to_string())),
        };

        let status = result.to_status();
        match result {
            Ok(()) => {
                debug!(key = %key, job = %job.name, attempt, "Job completed");
                return status;
            }
            Err(e) if e.is_retryable() && attempt < max_retries => {
                attempt += 1;
                inner.stats.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %key,
                    job = %job.name,
                    attempt,
                    max_retries,
                    error = %e,
                    "Job failed, resubmitting"
                );
                if !inner.config.retry_backoff.is_zero() {
                    tokio::time::sleep(inner.config.retry_backoff).await;
                }
            }
            Err(e) => {
                error!(
                    key = %key,
                    job = %job.name,
                    attempts = attempt + 1,
                    error = %e,
                    "Job failed permanently"
                );
                return TaskStatus::Failed;
            }
        }
    }
}
