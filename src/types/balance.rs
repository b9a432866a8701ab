//! Balance and withdrawal types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::error::LoyaltyError;
use super::order::{OrderNumber, UserToken};

/// Point balance of a single user
///
/// Both fields are non-negative. `current` grows only when an order becomes
/// `Processed` and shrinks only when a withdrawal is recorded; `withdrawn` is
/// the lifetime total of withdrawn points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// Spendable points
    pub current: Decimal,
    /// Points withdrawn so far
    pub withdrawn: Decimal,
}

impl Balance {
    /// Create a zero balance
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the accrual of a processed order
    ///
    /// Leaves the balance unchanged if the sum does not fit a `Decimal`.
    pub fn credit(&mut self, amount: Decimal) -> Result<(), LoyaltyError> {
        self.current = self.current.checked_add(amount).ok_or_else(|| {
            LoyaltyError::argument(format!(
                "crediting {} to {} overflows the balance",
                amount, self.current
            ))
        })?;
        Ok(())
    }

    /// Whether `points` can be withdrawn right now
    pub fn can_withdraw(&self, points: Decimal) -> bool {
        points <= self.current
    }

    /// Move `points` from `current` into `withdrawn`
    ///
    /// Callers check [`Balance::can_withdraw`] first, under the same lock.
    /// Leaves the balance unchanged if either field would overflow.
    pub fn debit(&mut self, points: Decimal) -> Result<(), LoyaltyError> {
        let overflow = || {
            LoyaltyError::argument(format!("withdrawing {} overflows the balance", points))
        };
        let current = self.current.checked_sub(points).ok_or_else(overflow)?;
        let withdrawn = self.withdrawn.checked_add(points).ok_or_else(overflow)?;
        self.current = current;
        self.withdrawn = withdrawn;
        Ok(())
    }
}

/// Recorded withdrawal of points against an order number
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    /// Order number the points were spent on (unique across withdrawals)
    pub order: OrderNumber,
    /// User who withdrew
    pub user: UserToken,
    /// Withdrawn points, always positive
    pub points: Decimal,
    /// When the withdrawal was recorded
    pub processed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_balance_is_zero() {
        let balance = Balance::new();
        assert_eq!(balance.current, Decimal::ZERO);
        assert_eq!(balance.withdrawn, Decimal::ZERO);
    }

    #[test]
    fn test_credit_then_debit() {
        let mut balance = Balance::new();
        balance.credit(Decimal::new(50050, 2)).unwrap();

        assert!(balance.can_withdraw(Decimal::from(500)));
        balance.debit(Decimal::from(500)).unwrap();

        assert_eq!(balance.current, Decimal::new(50, 2));
        assert_eq!(balance.withdrawn, Decimal::from(500));
        assert!(!balance.can_withdraw(Decimal::ONE));
    }

    #[test]
    fn test_credit_overflow_is_rejected() {
        let mut balance = Balance {
            current: Decimal::MAX,
            withdrawn: Decimal::ZERO,
        };

        let err = balance.credit(Decimal::ONE).unwrap_err();

        assert!(matches!(err, LoyaltyError::Argument { .. }));
        assert_eq!(balance.current, Decimal::MAX);
    }

    #[test]
    fn test_debit_overflow_leaves_balance_unchanged() {
        let mut balance = Balance {
            current: Decimal::MAX,
            withdrawn: Decimal::MAX,
        };

        let err = balance.debit(Decimal::ONE).unwrap_err();

        assert!(matches!(err, LoyaltyError::Argument { .. }));
        assert_eq!(balance.current, Decimal::MAX);
        assert_eq!(balance.withdrawn, Decimal::MAX);
    }
}
