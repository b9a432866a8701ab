//! Routing of job results back to the submitter waiting for them
//!
//! The worker pool produces one shared result stream. Many pollers submit
//! jobs concurrently, so reading "the next result" would hand a poller some
//! other order's result. The dispatcher owns the consumer side of the
//! stream and delivers each result to a per-submission oneshot channel keyed
//! by job id.
//!
//! # Architecture
//!
//! ```text
//! execute(job) ── register id ──► pending: DashMap<JobId, oneshot::Sender>
//!      │                                    ▲
//!      └── submit ──► WorkerPool ──► results ──► router task
//! ```

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;

use super::job::{Job, JobId, JobResult};
use super::worker_pool::{ResultStream, WorkerPool};
use crate::types::LoyaltyError;

type Pending<T> = Arc<DashMap<JobId, oneshot::Sender<JobResult<T>>>>;

/// Correlates submitted jobs with their results
pub struct JobDispatcher<A, T> {
    pool: Arc<WorkerPool<A, T>>,
    pending: Pending<T>,
}

impl<A, T> JobDispatcher<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Take the pool's result stream and start routing it
    ///
    /// # Returns
    ///
    /// * `Err(LoyaltyError::AlreadyRunning)` if the stream was already taken
    pub fn spawn(pool: Arc<WorkerPool<A, T>>) -> Result<Arc<Self>, LoyaltyError> {
        let results = pool.results()?;
        let pending: Pending<T> = Arc::new(DashMap::new());

        tokio::spawn(route_results(results, Arc::clone(&pending)));

        Ok(Arc::new(Self { pool, pending }))
    }

    pub fn pool(&self) -> &Arc<WorkerPool<A, T>> {
        &self.pool
    }

    /// Number of submissions still waiting for their result
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Submit a job and wait for its own result
    ///
    /// # Returns
    ///
    /// * The job's outcome
    /// * `Err(LoyaltyError::DuplicateJob)` if a job with the same id is in flight
    /// * `Err(LoyaltyError::EngineClosed)` if the pool stopped before the job ran
    pub async fn execute(&self, job: Job<A, T>) -> Result<T, LoyaltyError> {
        let job_id = job.id().clone();
        let (waiter, result) = oneshot::channel();

        match self.pending.entry(job_id.clone()) {
            Entry::Occupied(_) => return Err(LoyaltyError::duplicate_job(&job_id)),
            Entry::Vacant(slot) => {
                slot.insert(waiter);
            }
        }

        if let Err(error) = self.pool.submit(job).await {
            self.pending.remove(&job_id);
            return Err(error);
        }

        match result.await {
            Ok(result) => result.outcome,
            Err(_) => Err(LoyaltyError::EngineClosed),
        }
    }
}

async fn route_results<T>(mut results: ResultStream<T>, pending: Pending<T>) {
    while let Some(result) = results.recv().await {
        let Some(job_id) = result.job_id.clone() else {
            tracing::debug!("worker stopped on cancellation");
            continue;
        };

        match pending.remove(&job_id) {
            Some((_, waiter)) => {
                if waiter.send(result).is_err() {
                    tracing::debug!(job_id = %job_id, "submitter stopped waiting");
                }
            }
            None => tracing::warn!(job_id = %job_id, "result without a waiting submitter"),
        }
    }

    // Stream closed: dropping the senders wakes every waiter with EngineClosed.
    let stranded = pending.len();
    pending.clear();
    if stranded > 0 {
        tracing::warn!(stranded, "job engine stopped with submissions in flight");
    }
    tracing::debug!("result router stopped");
}
