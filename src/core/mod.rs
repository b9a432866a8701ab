//! Core business logic module
//!
//! This module contains the accrual processing components:
//! - `traits` - Trait abstractions for the ledger and the accrual service
//! - `pool` - Generic worker pool and job dispatcher
//! - `accrual` - HTTP client of the external accrual service
//! - `ledger` - Transactional ledger stores (in-memory and PostgreSQL)
//! - `poller` - Per-order polling state machine
//! - `service` - Order submission and poller orchestration

pub mod accrual;
pub mod ledger;
pub mod poller;
pub mod pool;
pub mod service;
pub mod traits;

pub use accrual::{AccrualClient, AccrualClientConfig};
pub use ledger::{MemoryLedger, PostgresLedger};
pub use poller::{OrderPoller, PollOutcome, PollerConfig, PollerContext};
pub use pool::{JobDispatcher, PoolConfig, WorkerPool};
pub use service::{AccrualService, PollerHandle, Submission};
pub use traits::{AccrualChecker, AppliedOutcome, LedgerStore, OrderRegistration};
