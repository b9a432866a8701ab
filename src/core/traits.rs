//! Core traits for the ledger and the accrual service
//!
//! These abstractions let the PostgreSQL and in-memory ledgers be used
//! interchangeably, and let the order poller run against a fake accrual
//! service in tests.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::types::{
    AccrualOutcome, Balance, LoyaltyError, Order, OrderNumber, OrderStatus, User, UserToken,
    Withdrawal,
};

/// Result of submitting an order number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderRegistration {
    /// A new order was recorded in status `New`
    Created,
    /// The same user had already submitted this order
    AlreadyRegistered,
}

/// Effect of applying an accrual outcome to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedOutcome {
    /// The order moved into the given status
    Transitioned(OrderStatus),
    /// The outcome required no change
    Unchanged,
    /// The order was already terminal; nothing was applied
    AlreadyFinal(OrderStatus),
}

/// Durable store of users, orders, balances and withdrawals
///
/// Every method is one atomic unit: it either applies fully or not at all.
/// The store is the only writer of order and balance state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a user with a zero balance
    ///
    /// Fails with `Conflict` if the login is taken.
    async fn register_user(&self, user: User) -> Result<(), LoyaltyError>;

    /// Look a user up by login
    async fn find_user(&self, login: &str) -> Result<Option<User>, LoyaltyError>;

    /// Record a submitted order in status `New`
    ///
    /// Fails with `Conflict` if another user owns the order number.
    async fn create_order(
        &self,
        order: &OrderNumber,
        user: &UserToken,
    ) -> Result<OrderRegistration, LoyaltyError>;

    /// Persist an accrual outcome
    ///
    /// A `Processed` outcome credits the owner's balance in the same unit of
    /// work. Outcomes for orders that are already terminal are ignored, so the
    /// credit happens exactly once.
    async fn apply_outcome(
        &self,
        order: &OrderNumber,
        outcome: &AccrualOutcome,
        user: &UserToken,
    ) -> Result<AppliedOutcome, LoyaltyError>;

    /// Spend points against an order number
    ///
    /// Fails with `InsufficientPoints` if `points` exceeds the current balance
    /// and with `Conflict` if the order number was already used for a
    /// withdrawal.
    async fn withdraw(
        &self,
        order: &OrderNumber,
        points: Decimal,
        user: &UserToken,
    ) -> Result<Withdrawal, LoyaltyError>;

    async fn get_order(&self, order: &OrderNumber) -> Result<Option<Order>, LoyaltyError>;

    /// Orders of a user, oldest first
    async fn list_orders(&self, user: &UserToken) -> Result<Vec<Order>, LoyaltyError>;

    async fn balance(&self, user: &UserToken) -> Result<Balance, LoyaltyError>;

    /// Withdrawals of a user, oldest first
    async fn list_withdrawals(&self, user: &UserToken) -> Result<Vec<Withdrawal>, LoyaltyError>;

    /// Orders still in `New` or `Processing`, oldest first
    async fn unfinished_orders(&self) -> Result<Vec<Order>, LoyaltyError>;
}

/// Source of accrual outcomes for an order
///
/// Performs exactly one check per call; retries are the caller's business.
#[async_trait]
pub trait AccrualChecker: Send + Sync {
    async fn check(&self, order: &OrderNumber) -> AccrualOutcome;
}
