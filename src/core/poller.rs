//! Per-order polling state machine
//!
//! # Design
//!
//! One `OrderPoller` drives one submitted order to a terminal status. Each
//! attempt is a job on the shared worker pool: the job asks the accrual
//! service once and records the answer in the ledger. The poller awaits
//! that job's own result through the [`JobDispatcher`] and decides what to
//! do next.
//!
//! # States
//!
//! ```text
//!            ┌──────── Pending (pending_interval) ────────┐
//!            ▼                                            │
//!  ──► Polling ── RateLimited (Retry-After | backoff) ──► Polling
//!            │ ── Transient / Storage ──► Retrying ──► Polling | Abandoned
//!            │ ── Processed ──► done        ── Invalid ──► done
//!            └── shutdown ──► Cancelled
//! ```
//!
//! Every sleep races the shutdown token. A poller ending never touches the
//! engine's own shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::FutureExt;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use super::pool::{Job, JobDescriptor, JobDispatcher, JobType};
use super::traits::{AccrualChecker, LedgerStore};
use crate::types::{AccrualOutcome, AccrualStatus, LoyaltyError, OrderNumber, UserToken};

/// Type tag of accrual check jobs
pub const ACCRUAL_CHECK: JobType = JobType("accrual_check");

/// Default pause after a 429 without `Retry-After`
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

/// Default pause between checks of a pending order
pub const DEFAULT_PENDING_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of consecutive transient failures tolerated per order
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Payload of an accrual check job
#[derive(Debug, Clone, PartialEq)]
pub struct AccrualJobArgs {
    pub order: OrderNumber,
    pub user: UserToken,
}

/// Job carrying one accrual check
pub type AccrualJob = Job<AccrualJobArgs, AccrualOutcome>;

/// Dispatcher of accrual check jobs
pub type AccrualDispatcher = JobDispatcher<AccrualJobArgs, AccrualOutcome>;

/// Timing of the polling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerConfig {
    /// Pause after a 429 that carried no `Retry-After`
    pub rate_limit_backoff: Duration,
    /// Pause before asking again about a pending order
    pub pending_interval: Duration,
    /// First delay of the transient-failure backoff
    pub retry_min_delay: Duration,
    /// Cap of the transient-failure backoff
    pub retry_max_delay: Duration,
    /// Consecutive transient failures tolerated before giving up
    pub max_retries: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
            pending_interval: DEFAULT_PENDING_INTERVAL,
            retry_min_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl PollerConfig {
    fn retry_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.retry_min_delay)
            .with_max_delay(self.retry_max_delay)
            .with_max_times(self.max_retries)
    }
}

/// How a poller ended
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// The order was processed and its accrual credited
    Processed { accrual: Decimal },
    /// The accrual service refused the order
    Invalid,
    /// Polling stopped on an unrecoverable or persistent failure
    ///
    /// The order keeps its non-terminal status and is resumed at the next
    /// start-up.
    Abandoned { reason: String },
    /// Shutdown was requested
    Cancelled,
}

/// Everything a poller needs besides its order
#[derive(Clone)]
pub struct PollerContext {
    pub dispatcher: Arc<AccrualDispatcher>,
    pub checker: Arc<dyn AccrualChecker>,
    pub store: Arc<dyn LedgerStore>,
    pub config: PollerConfig,
    pub shutdown: CancellationToken,
}

/// Drives one order to a terminal status
pub struct OrderPoller {
    ctx: PollerContext,
    order: OrderNumber,
    user: UserToken,
    attempt: u64,
}

impl OrderPoller {
    /// Create a poller for an order already persisted as `New`
    pub fn new(ctx: PollerContext, order: OrderNumber, user: UserToken) -> Self {
        Self {
            ctx,
            order,
            user,
            attempt: 0,
        }
    }

    /// Poll until the order is terminal, polling is abandoned or shutdown
    pub async fn run(mut self) -> PollOutcome {
        let mut retries = self.ctx.config.retry_backoff().build();

        loop {
            if self.ctx.shutdown.is_cancelled() {
                return PollOutcome::Cancelled;
            }

            self.attempt += 1;
            let job = self.next_job();
            let result = self
                .ctx
                .dispatcher
                .execute(job)
                .await
                .and_then(into_answer);

            let delay = match result {
                Ok(AccrualOutcome::Processed { amount }) => {
                    tracing::info!(order = %self.order, accrual = %amount, "order processed");
                    return PollOutcome::Processed { accrual: amount };
                }
                Ok(AccrualOutcome::Invalid) => {
                    tracing::info!(order = %self.order, "order rejected by accrual service");
                    return PollOutcome::Invalid;
                }
                Ok(AccrualOutcome::Pending { status }) => {
                    retries = self.ctx.config.retry_backoff().build();
                    tracing::debug!(order = %self.order, status = %status, "order pending");
                    self.ctx.config.pending_interval
                }
                Ok(other) => {
                    // into_answer never lets these through
                    return self.abandon(format!("unexpected outcome {:?}", other));
                }
                Err(LoyaltyError::Cancelled) | Err(LoyaltyError::EngineClosed) => {
                    tracing::info!(order = %self.order, "polling stopped by shutdown");
                    return PollOutcome::Cancelled;
                }
                Err(error) => match error.rate_limit_delay() {
                    Some(retry_after) => {
                        retries = self.ctx.config.retry_backoff().build();
                        let delay = retry_after.unwrap_or(self.ctx.config.rate_limit_backoff);
                        tracing::info!(
                            order = %self.order,
                            attempt = self.attempt,
                            delay_secs = delay.as_secs(),
                            "accrual service rate limited, backing off"
                        );
                        delay
                    }
                    None if error.is_retryable() => match retries.next() {
                        Some(delay) => {
                            tracing::warn!(
                                order = %self.order,
                                attempt = self.attempt,
                                error = %error,
                                retry_in_ms = delay.as_millis() as u64,
                                "accrual check failed, retrying"
                            );
                            delay
                        }
                        None => return self.abandon(format!("retries exhausted: {}", error)),
                    },
                    None => return self.abandon(error.to_string()),
                },
            };

            if !self.pause(delay).await {
                return PollOutcome::Cancelled;
            }
        }
    }

    fn next_job(&self) -> AccrualJob {
        let job_id = format!("{}#{}", self.order, self.attempt);
        let descriptor = JobDescriptor::new(job_id, ACCRUAL_CHECK)
            .with_metadata("attempt", self.attempt.to_string());
        let args = AccrualJobArgs {
            order: self.order.clone(),
            user: self.user.clone(),
        };
        let checker = Arc::clone(&self.ctx.checker);
        let store = Arc::clone(&self.ctx.store);

        Job::from_fn(descriptor, args, move |cancel, args| {
            let checker = Arc::clone(&checker);
            let store = Arc::clone(&store);
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(LoyaltyError::Cancelled),
                    result = check_and_record(checker.as_ref(), store.as_ref(), &args) => result,
                }
            }
            .boxed()
        })
    }

    fn abandon(&self, reason: String) -> PollOutcome {
        tracing::error!(
            order = %self.order,
            attempt = self.attempt,
            reason = %reason,
            "abandoning order until next start-up"
        );
        PollOutcome::Abandoned { reason }
    }

    /// Sleep unless shutdown comes first; false on shutdown
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Body of an accrual check job
///
/// Answers from the service are recorded before the job completes; a
/// registered-but-untouched order needs no write.
async fn check_and_record(
    checker: &dyn AccrualChecker,
    store: &dyn LedgerStore,
    args: &AccrualJobArgs,
) -> Result<AccrualOutcome, LoyaltyError> {
    let outcome = into_answer(checker.check(&args.order).await)?;

    if !matches!(
        outcome,
        AccrualOutcome::Pending {
            status: AccrualStatus::Registered
        }
    ) {
        store.apply_outcome(&args.order, &outcome, &args.user).await?;
    }

    Ok(outcome)
}

/// Turn "no answer" outcomes into errors
fn into_answer(outcome: AccrualOutcome) -> Result<AccrualOutcome, LoyaltyError> {
    match outcome {
        AccrualOutcome::RateLimited { retry_after } => Err(LoyaltyError::rate_limited(retry_after)),
        AccrualOutcome::TransientFailure { reason } => Err(LoyaltyError::transient(reason)),
        answer => Ok(answer),
    }
}
