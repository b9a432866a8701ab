//! Accrual service orchestration
//!
//! # Architecture
//!
//! ```text
//! AccrualService
//!     ├── Arc<WorkerPool>        (shared job engine, run on its own task)
//!     ├── PollerContext          (dispatcher, checker, store, timing, shutdown)
//!     └── DashSet<OrderNumber>   (orders with a live poller)
//! ```
//!
//! Submitting a new order persists it and spawns one poller task for it. At
//! most one poller exists per order; start-up resumes every order left in
//! `New` or `Processing`.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::poller::{AccrualJobArgs, OrderPoller, PollOutcome, PollerConfig, PollerContext};
use super::pool::{JobDispatcher, PoolConfig, WorkerPool};
use super::traits::{AccrualChecker, LedgerStore, OrderRegistration};
use crate::types::{AccrualOutcome, LoyaltyError, OrderNumber, UserToken};

/// Outcome of submitting an order number
#[derive(Debug)]
pub enum Submission {
    /// A new order was recorded and is being polled
    ///
    /// `poller` is `None` only if another task started tracking the order first.
    Accepted { poller: Option<PollerHandle> },
    /// The same user had already submitted this order
    AlreadyAccepted,
}

/// Completion handle of one order's poller
#[derive(Debug)]
pub struct PollerHandle {
    order: OrderNumber,
    handle: JoinHandle<PollOutcome>,
}

impl PollerHandle {
    pub fn order(&self) -> &OrderNumber {
        &self.order
    }

    /// Wait for the poller to end
    pub async fn finished(self) -> PollOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(order = %self.order, error = %error, "poller task failed");
                PollOutcome::Abandoned {
                    reason: error.to_string(),
                }
            }
        }
    }
}

/// Removes an order from the tracked set when its poller ends, even on panic
struct Tracked {
    active: Arc<DashSet<OrderNumber>>,
    order: OrderNumber,
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.active.remove(&self.order);
    }
}

/// Accepts orders and keeps one poller running per unfinished order
pub struct AccrualService {
    pool: Arc<WorkerPool<AccrualJobArgs, AccrualOutcome>>,
    ctx: PollerContext,
    active: Arc<DashSet<OrderNumber>>,
}

impl AccrualService {
    /// Build the job engine and start its workers
    ///
    /// The workers stop when `shutdown` fires.
    ///
    /// # Arguments
    ///
    /// * `store` - Ledger the pollers record outcomes into
    /// * `checker` - Accrual service client
    /// * `pool_config` - Sizing of the worker pool
    /// * `poller_config` - Timing of the per-order polling loop
    /// * `shutdown` - Process-wide shutdown token
    pub fn start(
        store: Arc<dyn LedgerStore>,
        checker: Arc<dyn AccrualChecker>,
        pool_config: PoolConfig,
        poller_config: PollerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, LoyaltyError> {
        let pool = Arc::new(WorkerPool::new(pool_config));
        let dispatcher = JobDispatcher::spawn(Arc::clone(&pool))?;

        {
            let pool = Arc::clone(&pool);
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(error) = pool.run(token).await {
                    tracing::error!(error = %error, "job engine failed to start");
                }
            });
        }

        Ok(Self {
            pool,
            ctx: PollerContext {
                dispatcher,
                checker,
                store,
                config: poller_config,
                shutdown,
            },
            active: Arc::new(DashSet::new()),
        })
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.ctx.store
    }

    /// Number of orders with a live poller
    pub fn tracked(&self) -> usize {
        self.active.len()
    }

    /// Record a submitted order and start polling it
    ///
    /// # Returns
    ///
    /// * `Submission::Accepted` for a new order
    /// * `Submission::AlreadyAccepted` if the same user submitted it before
    /// * `Err(LoyaltyError::Conflict)` if another user owns the order
    pub async fn submit_order(
        &self,
        order: &OrderNumber,
        user: &UserToken,
    ) -> Result<Submission, LoyaltyError> {
        match self.ctx.store.create_order(order, user).await? {
            OrderRegistration::Created => {
                tracing::info!(order = %order, "order accepted");
                Ok(Submission::Accepted {
                    poller: self.track(order.clone(), user.clone()),
                })
            }
            OrderRegistration::AlreadyRegistered => Ok(Submission::AlreadyAccepted),
        }
    }

    /// Spawn a poller for `order` unless one is already running
    pub fn track(&self, order: OrderNumber, user: UserToken) -> Option<PollerHandle> {
        if self.ctx.shutdown.is_cancelled() {
            tracing::debug!(order = %order, "not tracking order during shutdown");
            return None;
        }
        if !self.active.insert(order.clone()) {
            tracing::debug!(order = %order, "order already tracked");
            return None;
        }

        let tracked = Tracked {
            active: Arc::clone(&self.active),
            order: order.clone(),
        };
        let poller = OrderPoller::new(self.ctx.clone(), order.clone(), user);
        let handle = tokio::spawn(async move {
            let _tracked = tracked;
            poller.run().await
        });

        Some(PollerHandle { order, handle })
    }

    /// Start pollers for every order left unfinished by a previous run
    ///
    /// # Returns
    ///
    /// Handles of the pollers started by this call
    pub async fn resume_unfinished(&self) -> Result<Vec<PollerHandle>, LoyaltyError> {
        let orders = self.ctx.store.unfinished_orders().await?;
        let handles: Vec<_> = orders
            .into_iter()
            .filter_map(|order| self.track(order.number, order.user))
            .collect();

        if !handles.is_empty() {
            tracing::info!(resumed = handles.len(), "resumed unfinished orders");
        }
        Ok(handles)
    }

    /// Request shutdown and wait for the job engine to stop
    pub async fn shutdown(&self) {
        self.ctx.shutdown.cancel();
        self.pool.wait_stopped().await;
        tracing::info!(still_tracked = self.tracked(), "accrual service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::MemoryLedger;
    use crate::types::{OrderStatus, User};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::time::Duration;

    /// Accrual service that processes every order for a fixed reward
    struct FlatReward(Decimal);

    #[async_trait]
    impl AccrualChecker for FlatReward {
        async fn check(&self, _order: &OrderNumber) -> AccrualOutcome {
            AccrualOutcome::Processed { amount: self.0 }
        }
    }

    /// Accrual service that always rate limits
    struct AlwaysLimited;

    #[async_trait]
    impl AccrualChecker for AlwaysLimited {
        async fn check(&self, _order: &OrderNumber) -> AccrualOutcome {
            AccrualOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(3600)),
            }
        }
    }

    async fn store_with_users() -> Arc<MemoryLedger> {
        let store = Arc::new(MemoryLedger::new());
        for login in ["alice", "bob"] {
            store
                .register_user(User {
                    login: login.to_string(),
                    password_hash: "hash".to_string(),
                    token: UserToken::new(login),
                })
                .await
                .unwrap();
        }
        store
    }

    fn service(store: Arc<MemoryLedger>, checker: Arc<dyn AccrualChecker>) -> AccrualService {
        AccrualService::start(
            store,
            checker,
            PoolConfig {
                worker_count: 2,
                queue_capacity: 8,
            },
            PollerConfig::default(),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_processes_and_credits() {
        let store = store_with_users().await;
        let service = service(store.clone(), Arc::new(FlatReward(Decimal::from(500))));
        let order = OrderNumber::parse("12345678903").unwrap();
        let alice = UserToken::new("alice");

        let Submission::Accepted { poller: Some(poller) } =
            service.submit_order(&order, &alice).await.unwrap()
        else {
            panic!("new order should be accepted with a poller");
        };
        assert_eq!(
            poller.finished().await,
            PollOutcome::Processed {
                accrual: Decimal::from(500)
            }
        );

        assert!(matches!(
            service.submit_order(&order, &alice).await,
            Ok(Submission::AlreadyAccepted)
        ));
        assert!(matches!(
            service.submit_order(&order, &UserToken::new("bob")).await,
            Err(LoyaltyError::Conflict { .. })
        ));

        let stored = store.get_order(&order).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Processed);
        assert_eq!(store.balance(&alice).await.unwrap().current, Decimal::from(500));
        assert_eq!(store.list_orders(&alice).await.unwrap().len(), 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_poller_per_order_and_shutdown_cancels() {
        let store = store_with_users().await;
        let service = service(store.clone(), Arc::new(AlwaysLimited));
        let order = OrderNumber::parse("12345678903").unwrap();
        let alice = UserToken::new("alice");

        let Submission::Accepted { poller: Some(poller) } =
            service.submit_order(&order, &alice).await.unwrap()
        else {
            panic!("new order should be accepted with a poller");
        };
        assert!(service.track(order.clone(), alice.clone()).is_none());
        assert_eq!(service.tracked(), 1);

        service.shutdown().await;
        assert_eq!(poller.finished().await, PollOutcome::Cancelled);
        assert_eq!(service.tracked(), 0);

        let stored = store.get_order(&order).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::New);
    }

    #[tokio::test]
    async fn test_resume_unfinished_orders() {
        let store = store_with_users().await;
        let alice = UserToken::new("alice");
        let pending = OrderNumber::parse("12345678903").unwrap();
        let done = OrderNumber::parse("18").unwrap();
        store.create_order(&pending, &alice).await.unwrap();
        store.create_order(&done, &alice).await.unwrap();
        store
            .apply_outcome(&done, &AccrualOutcome::Invalid, &alice)
            .await
            .unwrap();

        let service = service(store.clone(), Arc::new(FlatReward(Decimal::from(7))));
        let handles = service.resume_unfinished().await.unwrap();

        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].order(), &pending);
        for handle in handles {
            assert!(matches!(
                handle.finished().await,
                PollOutcome::Processed { .. }
            ));
        }
        assert_eq!(store.balance(&alice).await.unwrap().current, Decimal::from(7));

        service.shutdown().await;
    }
}
