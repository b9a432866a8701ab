//! Benchmark suite for the job engine
//!
//! Measures end-to-end throughput of the worker pool and the result
//! dispatcher using the divan benchmarking framework.
//!
//! # Running Benchmarks
//!
//! ```bash
//! # Run all benchmarks
//! cargo bench
//! ```
//!
//! Each benchmark submits a batch of trivial jobs, so the numbers reflect
//! queueing, worker hand-off and result routing rather than job work.

use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use loyalty_engine::core::pool::{
    Job, JobDescriptor, JobDispatcher, JobType, PoolConfig, WorkerPool,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const BENCH_JOB: JobType = JobType("bench");

fn main() {
    divan::main();
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn doubling_job(id: usize) -> Job<u64, u64> {
    Job::from_fn(
        JobDescriptor::new(id.to_string(), BENCH_JOB),
        id as u64,
        |_cancel, n| async move { Ok(n * 2) }.boxed(),
    )
}

/// Submit `jobs` jobs to a pool of `workers` and drain the result stream
#[divan::bench(args = [1, 4, 8])]
fn pool_results_1000_jobs(workers: usize) {
    let runtime = runtime();
    runtime.block_on(async {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            worker_count: workers,
            queue_capacity: 256,
        }));
        let mut results = pool.results().expect("Failed to take results");
        let cancel = CancellationToken::new();
        let runner = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(cancel).await })
        };

        for id in 0..1000 {
            pool.submit(doubling_job(id)).await.expect("Submit failed");
        }
        for _ in 0..1000 {
            results.recv().await.expect("Result stream closed");
        }

        pool.close_queue();
        runner.await.expect("Runner panicked").expect("Pool failed");
    });
}

/// Concurrent submitters awaiting their own results through the dispatcher
#[divan::bench(args = [1, 4, 8])]
fn dispatcher_1000_jobs(workers: usize) {
    let runtime = runtime();
    runtime.block_on(async {
        let pool = Arc::new(WorkerPool::new(PoolConfig {
            worker_count: workers,
            queue_capacity: 256,
        }));
        let dispatcher = JobDispatcher::spawn(Arc::clone(&pool)).expect("Dispatcher failed");
        let cancel = CancellationToken::new();
        let runner = {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.run(cancel).await })
        };

        let submissions = (0..1000).map(|id| {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.execute(doubling_job(id)).await }
        });
        for result in join_all(submissions).await {
            result.expect("Job failed");
        }

        pool.close_queue();
        runner.await.expect("Runner panicked").expect("Pool failed");
    });
}
