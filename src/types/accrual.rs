//! Outcomes reported by the accrual service

use rust_decimal::Decimal;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Upstream status values of the accrual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccrualStatus {
    /// The order is known but not yet being processed
    Registered,
    /// The reward is being computed
    Processing,
    /// The order will never earn a reward
    Invalid,
    /// The reward is final
    Processed,
}

impl fmt::Display for AccrualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AccrualStatus::Registered => "REGISTERED",
            AccrualStatus::Processing => "PROCESSING",
            AccrualStatus::Invalid => "INVALID",
            AccrualStatus::Processed => "PROCESSED",
        };
        f.write_str(text)
    }
}

/// Result of a single accrual check
///
/// `Processed`, `Invalid` and `Pending` are answers from the service.
/// `RateLimited` and `TransientFailure` mean no answer was obtained and are
/// never persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualOutcome {
    /// The reward is final
    Processed { amount: Decimal },
    /// The order earns nothing
    Invalid,
    /// Ask again later
    Pending { status: AccrualStatus },
    /// The service asked us to slow down
    RateLimited { retry_after: Option<Duration> },
    /// Network error, timeout, 5xx or unreadable body
    TransientFailure { reason: String },
}

impl AccrualOutcome {
    /// Whether the ledger may record this outcome
    pub fn is_persistable(&self) -> bool {
        matches!(
            self,
            AccrualOutcome::Processed { .. }
                | AccrualOutcome::Invalid
                | AccrualOutcome::Pending { .. }
        )
    }
}
