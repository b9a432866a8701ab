//! Bounded worker pool executing submitted jobs
//!
//! # Design
//!
//! A fixed number of tokio tasks pull jobs from one bounded queue and push
//! one [`JobResult`] per executed job onto one bounded result stream. Workers
//! share the queue receiver behind an async mutex, so every job is claimed by
//! at most one worker.
//!
//! # Architecture
//!
//! ```text
//! submit ──► [job queue (mpsc, bounded)] ──► worker 0..N ──► [result stream] ──► results()
//!                                               │
//!                        cancel token ──────────┘
//! ```
//!
//! # Lifecycle
//!
//! - `run(cancel)` starts the workers and returns once all of them exited.
//! - Cancellation makes idle workers exit at once; each emits a result
//!   carrying [`LoyaltyError::Cancelled`] and no job id. Jobs still queued
//!   are never executed; they are discarded and logged when `run` returns.
//! - `close_queue()` stops accepting jobs. Workers drain the buffer and exit
//!   without emitting cancellation results.
//! - `shutdown_signal()` flips to `true` once every worker has exited.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobResult};
use crate::types::LoyaltyError;

/// Default capacity of the job queue and of the result stream
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Sizing of the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker tasks
    pub worker_count: usize,
    /// Capacity of the job queue and of the result stream
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Stream of job results handed out by [`WorkerPool::results`]
pub type ResultStream<T> = mpsc::Receiver<JobResult<T>>;

type SharedQueue<A, T> = Arc<AsyncMutex<mpsc::Receiver<Job<A, T>>>>;

/// Fixed-size pool of workers executing [`Job`]s
pub struct WorkerPool<A, T> {
    config: PoolConfig,
    jobs_tx: mpsc::Sender<Job<A, T>>,
    jobs_rx: SharedQueue<A, T>,
    results_tx: Mutex<Option<mpsc::Sender<JobResult<T>>>>,
    results_rx: Mutex<Option<ResultStream<T>>>,
    queue_closed: CancellationToken,
    done_tx: watch::Sender<bool>,
}

impl<A, T> WorkerPool<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Create a pool; no worker runs until [`WorkerPool::run`] is called
    ///
    /// Zero values in `config` are raised to one.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            worker_count: config.worker_count.max(1),
            queue_capacity: config.queue_capacity.max(1),
        };
        let (jobs_tx, jobs_rx) = mpsc::channel(config.queue_capacity);
        let (results_tx, results_rx) = mpsc::channel(config.queue_capacity);
        let (done_tx, _) = watch::channel(false);

        Self {
            config,
            jobs_tx,
            jobs_rx: Arc::new(AsyncMutex::new(jobs_rx)),
            results_tx: Mutex::new(Some(results_tx)),
            results_rx: Mutex::new(Some(results_rx)),
            queue_closed: CancellationToken::new(),
            done_tx,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Enqueue a job, waiting while the queue is full
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the job is queued
    /// * `Err(LoyaltyError::EngineClosed)` if the pool no longer accepts work
    pub async fn submit(&self, job: Job<A, T>) -> Result<(), LoyaltyError> {
        if self.queue_closed.is_cancelled() {
            return Err(LoyaltyError::EngineClosed);
        }
        self.jobs_tx
            .send(job)
            .await
            .map_err(|_| LoyaltyError::EngineClosed)
    }

    /// Enqueue a job without waiting
    ///
    /// # Returns
    ///
    /// * `Err(LoyaltyError::QueueFull)` if the queue is at capacity
    /// * `Err(LoyaltyError::EngineClosed)` if the pool no longer accepts work
    pub fn try_submit(&self, job: Job<A, T>) -> Result<(), LoyaltyError> {
        if self.queue_closed.is_cancelled() {
            return Err(LoyaltyError::EngineClosed);
        }
        self.jobs_tx.try_send(job).map_err(|error| match error {
            TrySendError::Full(_) => LoyaltyError::QueueFull,
            TrySendError::Closed(_) => LoyaltyError::EngineClosed,
        })
    }

    /// Hand out the result stream
    ///
    /// The stream can be taken once; later calls fail with `AlreadyRunning`.
    pub fn results(&self) -> Result<ResultStream<T>, LoyaltyError> {
        lock(&self.results_rx)
            .take()
            .ok_or_else(|| LoyaltyError::already_running("result stream"))
    }

    /// Stop accepting jobs and let workers drain what is buffered
    pub fn close_queue(&self) {
        if !self.queue_closed.is_cancelled() {
            tracing::info!("job queue closed");
            self.queue_closed.cancel();
        }
    }

    /// Receiver that turns `true` once every worker has exited
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.done_tx.subscribe()
    }

    /// Wait until every worker has exited
    pub async fn wait_stopped(&self) {
        let mut done = self.done_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = done.wait_for(|stopped| *stopped).await;
    }

    /// Start the workers and wait for all of them to exit
    ///
    /// Workers exit when `cancel` fires or when the queue was closed and
    /// drained. The result stream is closed before this returns.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once every worker exited
    /// * `Err(LoyaltyError::AlreadyRunning)` if the pool was already started
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), LoyaltyError> {
        let results_tx = lock(&self.results_tx)
            .take()
            .ok_or_else(|| LoyaltyError::already_running("worker pool"))?;

        tracing::info!(
            workers = self.config.worker_count,
            queue_capacity = self.config.queue_capacity,
            "worker pool started"
        );

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.worker_count {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&self.jobs_rx),
                results_tx.clone(),
                cancel.clone(),
                self.queue_closed.clone(),
            ));
        }
        // Workers hold the only remaining senders; the stream ends with them.
        drop(results_tx);

        while let Some(joined) = workers.join_next().await {
            if let Err(error) = joined {
                tracing::error!(error = %error, "worker task aborted");
            }
        }

        self.queue_closed.cancel();
        let discarded = self.discard_unclaimed().await;
        if discarded > 0 {
            tracing::warn!(discarded, "discarded jobs no worker claimed");
        }

        self.done_tx.send_replace(true);
        tracing::info!("worker pool stopped");
        Ok(())
    }

    async fn discard_unclaimed(&self) -> usize {
        let mut queue = self.jobs_rx.lock().await;
        queue.close();

        let mut discarded = 0;
        while let Ok(job) = queue.try_recv() {
            tracing::warn!(job_id = %job.id(), "discarding unclaimed job");
            discarded += 1;
        }
        discarded
    }
}

async fn worker_loop<A, T>(
    worker_id: usize,
    queue: SharedQueue<A, T>,
    results: mpsc::Sender<JobResult<T>>,
    cancel: CancellationToken,
    queue_closed: CancellationToken,
) where
    A: Send + 'static,
    T: Send + 'static,
{
    tracing::debug!(worker_id, "worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if !queue_closed.is_cancelled() {
                    let _ = results.send(JobResult::cancelled()).await;
                }
                break;
            }
            job = next_job(&queue, &queue_closed) => job,
        };

        let Some(job) = next else {
            break;
        };

        let result = job.execute(cancel.clone()).await;
        if results.send(result).await.is_err() {
            tracing::debug!(worker_id, "result stream dropped");
        }
    }

    tracing::debug!(worker_id, "worker stopped");
}

/// Claim the next job, or `None` once the queue is closed and drained
async fn next_job<A, T>(
    queue: &SharedQueue<A, T>,
    queue_closed: &CancellationToken,
) -> Option<Job<A, T>> {
    let mut queue = queue.lock().await;
    if queue_closed.is_cancelled() {
        return queue.try_recv().ok();
    }

    tokio::select! {
        biased;
        job = queue.recv() => job,
        _ = queue_closed.cancelled() => queue.try_recv().ok(),
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
