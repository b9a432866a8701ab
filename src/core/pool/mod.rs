//! Job engine
//!
//! - `job` - Jobs, descriptors and results
//! - `worker_pool` - Bounded pool of workers executing jobs
//! - `dispatcher` - Routes each result to the submitter waiting for it

pub mod dispatcher;
pub mod job;
pub mod worker_pool;

pub use dispatcher::JobDispatcher;
pub use job::{Job, JobDescriptor, JobFn, JobId, JobResult, JobType};
pub use worker_pool::{PoolConfig, ResultStream, WorkerPool, DEFAULT_QUEUE_CAPACITY};
