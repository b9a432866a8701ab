//! Types module
//!
//! Contains core data structures used throughout the application.
//! This module organizes types into logical submodules:
//! - `order`: order numbers, user tokens, statuses and order records
//! - `balance`: balances and withdrawals
//! - `accrual`: outcomes reported by the accrual service
//! - `user`: registered users
//! - `error`: error types for the loyalty engine

pub mod accrual;
pub mod balance;
pub mod error;
pub mod order;
pub mod user;

pub use accrual::{AccrualOutcome, AccrualStatus};
pub use balance::{Balance, Withdrawal};
pub use error::{ExternalServiceKind, LoyaltyError};
pub use order::{luhn_valid, Order, OrderNumber, OrderStatus, UserToken};
pub use user::User;
