//! Error types for the loyalty engine
//!
//! This module defines every error that can occur while accepting orders,
//! talking to the accrual service, running jobs or touching the ledger.
//! The enum is closed: callers match on variants, never on messages.
//!
//! # Error Categories
//!
//! - **Input Errors**: malformed arguments, order numbers failing the checksum,
//!   bad credentials
//! - **External Service Errors**: the accrual service rate-limited us or failed
//!   transiently
//! - **Ledger Errors**: storage failures, ownership conflicts, missing rows,
//!   insufficient points
//! - **Engine Errors**: full or closed job queue, duplicate job ids, panicking
//!   jobs, cancellation

use rust_decimal::Decimal;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported while talking to the accrual service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalServiceKind {
    /// The service answered 429
    ///
    /// `retry_after` carries the `Retry-After` header when the service sent one.
    RateLimited { retry_after: Option<Duration> },

    /// Network error, timeout, 5xx or an unreadable response body
    TransientFailure { reason: String },
}

impl fmt::Display for ExternalServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalServiceKind::RateLimited {
                retry_after: Some(delay),
            } => write!(f, "rate limited, retry after {}s", delay.as_secs()),
            ExternalServiceKind::RateLimited { retry_after: None } => f.write_str("rate limited"),
            ExternalServiceKind::TransientFailure { reason } => {
                write!(f, "transient failure: {}", reason)
            }
        }
    }
}

/// Main error type for the loyalty engine
///
/// Each variant includes enough context to log the failure or map it to an
/// HTTP status without inspecting the message text.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoyaltyError {
    /// A caller passed a value the operation cannot accept
    ///
    /// Examples: a negative accrual amount, a non-positive withdrawal, a
    /// non-persistable outcome handed to the ledger.
    #[error("Invalid argument: {message}")]
    Argument {
        /// Description of the rejected argument
        message: String,
    },

    /// The accrual service could not give an answer
    ///
    /// Recoverable: the poller backs off or retries depending on the kind.
    #[error("Accrual service error: {kind}")]
    ExternalService {
        /// What went wrong upstream
        kind: ExternalServiceKind,
    },

    /// The ledger backend failed
    ///
    /// The failed operation was rolled back in full.
    #[error("Storage error in {operation}: {message}")]
    Storage {
        /// Ledger operation that failed
        operation: String,
        /// Backend error text
        message: String,
    },

    /// The operation collides with state owned by someone else
    ///
    /// Raised for orders uploaded by another user, reused withdrawal numbers
    /// and taken logins.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting state
        message: String,
    },

    /// The withdrawal exceeds the current balance
    ///
    /// The balance is left unchanged.
    #[error("Insufficient points: available {available}, requested {requested}")]
    InsufficientPoints {
        /// Spendable balance at the time of the check
        available: Decimal,
        /// Points requested by the withdrawal
        requested: Decimal,
    },

    /// A referenced row does not exist
    #[error("{entity} '{key}' not found")]
    NotFound {
        /// Kind of entity that was looked up
        entity: String,
        /// Key used for the lookup
        key: String,
    },

    /// The order number is not a digit string with a valid Luhn check digit
    #[error("Invalid order number '{number}'")]
    InvalidOrderNumber {
        /// The rejected input
        number: String,
    },

    /// Login and password do not match a registered user
    #[error("Invalid login or password")]
    InvalidCredentials,

    /// The job queue is at capacity and the caller asked not to wait
    #[error("Job queue is full")]
    QueueFull,

    /// The job engine no longer accepts or delivers work
    #[error("Job engine is closed")]
    EngineClosed,

    /// A one-time engine resource was requested twice
    #[error("{resource} already in use")]
    AlreadyRunning {
        /// The resource that was already handed out
        resource: String,
    },

    /// A job with the same id is still awaiting its result
    #[error("Job '{job_id}' is already in flight")]
    DuplicateJob {
        /// The duplicated job id
        job_id: String,
    },

    /// The job function panicked
    ///
    /// The worker survives; the panic is reported as this result.
    #[error("Job '{job_id}' panicked: {message}")]
    JobPanicked {
        /// Id of the panicking job
        job_id: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// Work stopped because shutdown was requested
    #[error("Cancelled")]
    Cancelled,

    /// Start-up configuration is unusable
    #[error("Configuration error: {message}")]
    Config {
        /// What is wrong with the configuration
        message: String,
    },
}

// Helper functions for creating common errors

impl LoyaltyError {
    /// Create an Argument error
    pub fn argument(message: impl Into<String>) -> Self {
        LoyaltyError::Argument {
            message: message.into(),
        }
    }

    /// Create a rate-limited ExternalService error
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        LoyaltyError::ExternalService {
            kind: ExternalServiceKind::RateLimited { retry_after },
        }
    }

    /// Create a transient ExternalService error
    pub fn transient(reason: impl Into<String>) -> Self {
        LoyaltyError::ExternalService {
            kind: ExternalServiceKind::TransientFailure {
                reason: reason.into(),
            },
        }
    }

    /// Create a Storage error
    pub fn storage(operation: &str, message: impl Into<String>) -> Self {
        LoyaltyError::Storage {
            operation: operation.to_string(),
            message: message.into(),
        }
    }

    /// Create a Conflict error
    pub fn conflict(message: impl Into<String>) -> Self {
        LoyaltyError::Conflict {
            message: message.into(),
        }
    }

    /// Create an InsufficientPoints error
    pub fn insufficient_points(available: Decimal, requested: Decimal) -> Self {
        LoyaltyError::InsufficientPoints {
            available,
            requested,
        }
    }

    /// Create a NotFound error
    pub fn not_found(entity: &str, key: impl fmt::Display) -> Self {
        LoyaltyError::NotFound {
            entity: entity.to_string(),
            key: key.to_string(),
        }
    }

    /// Create an InvalidOrderNumber error
    pub fn invalid_order_number(number: &str) -> Self {
        LoyaltyError::InvalidOrderNumber {
            number: number.to_string(),
        }
    }

    /// Create an AlreadyRunning error
    pub fn already_running(resource: &str) -> Self {
        LoyaltyError::AlreadyRunning {
            resource: resource.to_string(),
        }
    }

    /// Create a DuplicateJob error
    pub fn duplicate_job(job_id: impl fmt::Display) -> Self {
        LoyaltyError::DuplicateJob {
            job_id: job_id.to_string(),
        }
    }

    /// Create a JobPanicked error
    pub fn job_panicked(job_id: impl fmt::Display, message: impl Into<String>) -> Self {
        LoyaltyError::JobPanicked {
            job_id: job_id.to_string(),
            message: message.into(),
        }
    }

    /// Create a Config error
    pub fn config(message: impl Into<String>) -> Self {
        LoyaltyError::Config {
            message: message.into(),
        }
    }

    /// Whether a bounded retry may succeed
    ///
    /// Transient upstream failures and storage failures qualify. Rate limiting
    /// is handled separately by backing off, so it is not counted here.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LoyaltyError::ExternalService {
                kind: ExternalServiceKind::TransientFailure { .. }
            } | LoyaltyError::Storage { .. }
        )
    }

    /// The delay requested by the accrual service, if this is a rate-limit error
    ///
    /// # Returns
    ///
    /// * `None` if the error is not a rate-limit error
    /// * `Some(None)` if it is, but no `Retry-After` was given
    /// * `Some(Some(delay))` otherwise
    pub fn rate_limit_delay(&self) -> Option<Option<Duration>> {
        match self {
            LoyaltyError::ExternalService {
                kind: ExternalServiceKind::RateLimited { retry_after },
            } => Some(*retry_after),
            _ => None,
        }
    }
}
