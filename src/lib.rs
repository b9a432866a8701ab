//! Loyalty Points Accrual Library
//! # Overview
//!
//! This library accepts order numbers from users, asks an external accrual
//! service how many points each order earns, and credits them to the user's
//! balance exactly once. Points can later be withdrawn against new order
//! numbers.
//!
//! # Architecture
//!
//! The system is organized into several key components:
//!
//! - [`types`] - Core data types (OrderNumber, Order, Balance, LoyaltyError, etc.)
//! - [`cli`] - CLI and environment configuration
//! - [`core`] - Business logic components:
//!   - [`core::pool`] - Generic worker pool and result dispatcher
//!   - [`core::accrual`] - Accrual service client
//!   - [`core::ledger`] - Transactional ledger stores
//!   - [`core::poller`] - Per-order polling state machine
//!   - [`core::service`] - Order submission and poller orchestration
//! - [`http`] - axum user API with cookie authentication
//!
//! # Order Lifecycle
//!
//! - **NEW**: Accepted, not yet seen by the accrual service
//! - **PROCESSING**: The accrual service is computing the reward
//! - **INVALID**: Rejected by the accrual service (terminal)
//! - **PROCESSED**: Reward credited to the balance (terminal)
//!
//! # Balances
//!
//! Each user maintains:
//! - `current`: Points available for withdrawal
//! - `withdrawn`: Points withdrawn so far

pub mod cli;
pub mod core;
pub mod http;
pub mod logging;
pub mod types;

pub use core::{AccrualClient, AccrualService, LedgerStore, MemoryLedger, PostgresLedger};
pub use types::{
    AccrualOutcome, Balance, LoyaltyError, Order, OrderNumber, OrderStatus, UserToken, Withdrawal,
};
