//! Ledger store implementations
//!
//! - `memory` - DashMap-backed ledger for tests and database-less runs
//! - `postgres` - PostgreSQL ledger with embedded migrations
//!
//! Both implementations share the transition rules in this module, so an
//! accrual outcome moves an order the same way whatever the backend.

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;

use rust_decimal::Decimal;

use super::traits::AppliedOutcome;
use crate::types::{AccrualOutcome, AccrualStatus, LoyaltyError, OrderStatus};

/// What applying an outcome does to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Move to `status`, crediting `credit` to the owner if present
    To {
        status: OrderStatus,
        credit: Option<Decimal>,
    },
    Unchanged,
    AlreadyFinal(OrderStatus),
}

impl Transition {
    pub(crate) fn applied(self) -> AppliedOutcome {
        match self {
            Transition::To { status, .. } => AppliedOutcome::Transitioned(status),
            Transition::Unchanged => AppliedOutcome::Unchanged,
            Transition::AlreadyFinal(status) => AppliedOutcome::AlreadyFinal(status),
        }
    }
}

/// Reject outcomes that can never be persisted
///
/// Checked before any row is touched.
pub(crate) fn validate_outcome(outcome: &AccrualOutcome) -> Result<(), LoyaltyError> {
    if !outcome.is_persistable() {
        return Err(LoyaltyError::argument(
            "only service answers can be applied to an order",
        ));
    }
    match outcome {
        AccrualOutcome::Processed { amount } if amount.is_sign_negative() => Err(
            LoyaltyError::argument(format!("accrual amount {} is negative", amount)),
        ),
        _ => Ok(()),
    }
}

/// Decide the transition of an order currently in `current`
///
/// Terminal orders never move again, which keeps the credit of a processed
/// order to exactly once.
pub(crate) fn plan_transition(current: OrderStatus, outcome: &AccrualOutcome) -> Transition {
    if current.is_terminal() {
        return Transition::AlreadyFinal(current);
    }

    match outcome {
        AccrualOutcome::Processed { amount } => Transition::To {
            status: OrderStatus::Processed,
            credit: Some(*amount),
        },
        AccrualOutcome::Invalid => Transition::To {
            status: OrderStatus::Invalid,
            credit: None,
        },
        AccrualOutcome::Pending {
            status: AccrualStatus::Processing,
        } if current == OrderStatus::New => Transition::To {
            status: OrderStatus::Processing,
            credit: None,
        },
        _ => Transition::Unchanged,
    }
}

/// Validate a withdrawal amount
pub(crate) fn validate_points(points: Decimal) -> Result<(), LoyaltyError> {
    if points <= Decimal::ZERO {
        return Err(LoyaltyError::argument(format!(
            "withdrawal of {} points must be positive",
            points
        )));
    }
    Ok(())
}
