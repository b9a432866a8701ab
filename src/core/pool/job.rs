//! Jobs and results exchanged with the worker pool
//!
//! A [`Job`] bundles an identifier, a type tag, a typed argument payload and
//! the async function that consumes it. Executing a job always produces a
//! [`JobResult`]: errors and panics inside the job function are captured into
//! the result instead of unwinding into the worker.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::types::LoyaltyError;

/// Identifier correlating a job with its result
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Type tag of a job, used for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobType(pub &'static str);

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Descriptive part of a job
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescriptor {
    /// Unique id among in-flight jobs
    pub id: JobId,
    /// Type tag
    pub job_type: JobType,
    /// Free-form key/value context carried into logs
    pub metadata: HashMap<String, String>,
}

impl JobDescriptor {
    pub fn new(id: impl Into<JobId>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Async function executed by a worker
///
/// The token is the pool's cancellation token; long-running job bodies race
/// it so shutdown does not wait on them.
pub type JobFn<A, T> = Arc<
    dyn Fn(CancellationToken, A) -> BoxFuture<'static, Result<T, LoyaltyError>> + Send + Sync,
>;

/// A unit of work submitted to the worker pool
pub struct Job<A, T> {
    descriptor: JobDescriptor,
    args: A,
    exec: JobFn<A, T>,
}

impl<A, T> Job<A, T>
where
    A: Send + 'static,
    T: Send + 'static,
{
    /// Create a job
    ///
    /// # Arguments
    ///
    /// * `descriptor` - Id, type tag and metadata of the job
    /// * `args` - Payload handed to `exec` when the job runs
    /// * `exec` - Function executed by the worker
    pub fn new(descriptor: JobDescriptor, args: A, exec: JobFn<A, T>) -> Self {
        Self {
            descriptor,
            args,
            exec,
        }
    }

    /// Create a job from a closure
    pub fn from_fn<F>(descriptor: JobDescriptor, args: A, exec: F) -> Self
    where
        F: Fn(CancellationToken, A) -> BoxFuture<'static, Result<T, LoyaltyError>>
            + Send
            + Sync
            + 'static,
    {
        Self::new(descriptor, args, Arc::new(exec))
    }

    pub fn id(&self) -> &JobId {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    /// Run the job function and capture its outcome
    ///
    /// Never panics: a panic inside the job function becomes
    /// [`LoyaltyError::JobPanicked`].
    pub async fn execute(self, cancel: CancellationToken) -> JobResult<T> {
        let Job {
            descriptor,
            args,
            exec,
        } = self;

        let outcome = match AssertUnwindSafe(exec(cancel, args)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(LoyaltyError::job_panicked(
                &descriptor.id,
                panic_message(payload.as_ref()),
            )),
        };

        match &outcome {
            Ok(_) => tracing::debug!(
                job_id = %descriptor.id,
                job_type = %descriptor.job_type,
                "job completed"
            ),
            Err(error) => tracing::warn!(
                job_id = %descriptor.id,
                job_type = %descriptor.job_type,
                metadata = ?descriptor.metadata,
                error = %error,
                "job failed"
            ),
        }

        JobResult {
            job_id: Some(descriptor.id),
            outcome,
        }
    }
}

impl<A, T> fmt::Debug for Job<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome of one executed job
///
/// `job_id` is `None` only for the marker a worker emits when it stops
/// because of cancellation.
#[derive(Debug)]
pub struct JobResult<T> {
    pub job_id: Option<JobId>,
    pub outcome: Result<T, LoyaltyError>,
}

impl<T> JobResult<T> {
    pub(crate) fn cancelled() -> Self {
        Self {
            job_id: None,
            outcome: Err(LoyaltyError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubling_job(id: &str, value: u32) -> Job<u32, u32> {
        Job::from_fn(
            JobDescriptor::new(id, JobType("double")),
            value,
            |_cancel, value| async move { Ok(value * 2) }.boxed(),
        )
    }

    fn explode() -> Result<(), LoyaltyError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_execute_success() {
        let result = doubling_job("job-1", 21)
            .execute(CancellationToken::new())
            .await;

        assert_eq!(result.job_id, Some(JobId::new("job-1")));
        assert_eq!(result.outcome, Ok(42));
    }

    #[tokio::test]
    async fn test_execute_error_is_captured() {
        let job: Job<(), ()> = Job::from_fn(
            JobDescriptor::new("job-err", JobType("failing")),
            (),
            |_cancel, _| async { Err(LoyaltyError::transient("HTTP 500")) }.boxed(),
        );

        let result = job.execute(CancellationToken::new()).await;
        assert_eq!(result.outcome, Err(LoyaltyError::transient("HTTP 500")));
    }

    #[tokio::test]
    async fn test_execute_panic_is_captured() {
        let job: Job<(), ()> = Job::from_fn(
            JobDescriptor::new("job-panic", JobType("panicking")),
            (),
            |_cancel, _| async { explode() }.boxed(),
        );

        let result = job.execute(CancellationToken::new()).await;
        assert_eq!(
            result.outcome,
            Err(LoyaltyError::job_panicked("job-panic", "boom"))
        );
    }

    #[test]
    fn test_descriptor_metadata() {
        let descriptor = JobDescriptor::new("42", JobType("t")).with_metadata("order", "18");
        assert_eq!(descriptor.metadata.get("order").map(String::as_str), Some("18"));
    }
}
