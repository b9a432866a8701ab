//! Thread-safe in-memory ledger
//!
//! # Design
//!
//! `MemoryLedger` keeps users, balances, orders and withdrawals in separate
//! `DashMap`s. Each operation that touches more than one map holds the
//! entry guards together for its whole duration, which makes a terminal
//! transition and its credit one atomic step for every concurrent reader.
//!
//! # Lock Order
//!
//! Guards are always taken in the order `users → orders → balances →
//! withdrawals`, so two operations can never wait on each other.
//!
//! # Thread Safety
//!
//! All methods take `&self` and may be called from any number of tasks.
//! No guard is held across an `.await`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::{plan_transition, validate_outcome, validate_points, Transition};
use crate::core::traits::{AppliedOutcome, LedgerStore, OrderRegistration};
use crate::types::{
    AccrualOutcome, Balance, LoyaltyError, Order, OrderNumber, OrderStatus, User, UserToken,
    Withdrawal,
};

/// Value tagged with its insertion sequence, for oldest-first listings
#[derive(Debug, Clone)]
struct Sequenced<V> {
    seq: u64,
    item: V,
}

/// In-memory ledger backed by `DashMap`
#[derive(Debug, Default)]
pub struct MemoryLedger {
    /// Users by login
    users: DashMap<String, User>,

    /// Balances by user token; present for every registered user
    balances: DashMap<UserToken, Balance>,

    orders: DashMap<OrderNumber, Sequenced<Order>>,

    withdrawals: DashMap<OrderNumber, Sequenced<Withdrawal>>,

    next_seq: AtomicU64,
}

impl MemoryLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn ensure_user(&self, user: &UserToken) -> Result<(), LoyaltyError> {
        if self.balances.contains_key(user) {
            Ok(())
        } else {
            Err(LoyaltyError::not_found("user", user))
        }
    }
}

fn oldest_first<V: Clone>(mut rows: Vec<Sequenced<V>>) -> Vec<V> {
    rows.sort_by_key(|row| row.seq);
    rows.into_iter().map(|row| row.item).collect()
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn register_user(&self, user: User) -> Result<(), LoyaltyError> {
        match self.users.entry(user.login.clone()) {
            Entry::Occupied(_) => Err(LoyaltyError::conflict(format!(
                "login '{}' is already taken",
                user.login
            ))),
            Entry::Vacant(slot) => {
                self.balances.insert(user.token.clone(), Balance::new());
                tracing::debug!(login = %user.login, "user registered");
                slot.insert(user);
                Ok(())
            }
        }
    }

    async fn find_user(&self, login: &str) -> Result<Option<User>, LoyaltyError> {
        Ok(self.users.get(login).map(|user| user.value().clone()))
    }

    async fn create_order(
        &self,
        order: &OrderNumber,
        user: &UserToken,
    ) -> Result<OrderRegistration, LoyaltyError> {
        self.ensure_user(user)?;

        match self.orders.entry(order.clone()) {
            Entry::Occupied(existing) if &existing.get().item.user == user => {
                Ok(OrderRegistration::AlreadyRegistered)
            }
            Entry::Occupied(_) => Err(LoyaltyError::conflict(format!(
                "order {} was uploaded by another user",
                order
            ))),
            Entry::Vacant(slot) => {
                slot.insert(Sequenced {
                    seq: self.next_seq(),
                    item: Order::new(order.clone(), user.clone()),
                });
                tracing::debug!(order = %order, "order created");
                Ok(OrderRegistration::Created)
            }
        }
    }

    async fn apply_outcome(
        &self,
        order: &OrderNumber,
        outcome: &AccrualOutcome,
        user: &UserToken,
    ) -> Result<AppliedOutcome, LoyaltyError> {
        validate_outcome(outcome)?;

        let mut stored = self
            .orders
            .get_mut(order)
            .ok_or_else(|| LoyaltyError::not_found("order", order))?;
        let current = &mut stored.item;

        if &current.user != user {
            return Err(LoyaltyError::conflict(format!(
                "order {} belongs to another user",
                order
            )));
        }

        let transition = plan_transition(current.status, outcome);
        if let Transition::To { status, credit } = transition {
            if let Some(amount) = credit {
                // Credit first: a missing balance must leave the order untouched.
                let mut balance = self
                    .balances
                    .get_mut(user)
                    .ok_or_else(|| LoyaltyError::not_found("user", user))?;
                balance.credit(amount)?;
                current.accrual = Some(amount);
            }
            current.status = status;
            if status == OrderStatus::Processed {
                current.processed_at = Some(Utc::now());
            }
            tracing::info!(order = %order, status = %status, accrual = ?credit, "order updated");
        }

        Ok(transition.applied())
    }

    async fn withdraw(
        &self,
        order: &OrderNumber,
        points: Decimal,
        user: &UserToken,
    ) -> Result<Withdrawal, LoyaltyError> {
        validate_points(points)?;

        let mut balance = self
            .balances
            .get_mut(user)
            .ok_or_else(|| LoyaltyError::not_found("user", user))?;

        match self.withdrawals.entry(order.clone()) {
            Entry::Occupied(_) => Err(LoyaltyError::conflict(format!(
                "order {} was already used for a withdrawal",
                order
            ))),
            Entry::Vacant(slot) => {
                if !balance.can_withdraw(points) {
                    return Err(LoyaltyError::insufficient_points(balance.current, points));
                }
                balance.debit(points)?;

                let withdrawal = Withdrawal {
                    order: order.clone(),
                    user: user.clone(),
                    points,
                    processed_at: Utc::now(),
                };
                slot.insert(Sequenced {
                    seq: self.next_seq(),
                    item: withdrawal.clone(),
                });
                tracing::info!(order = %order, points = %points, "points withdrawn");
                Ok(withdrawal)
            }
        }
    }

    async fn get_order(&self, order: &OrderNumber) -> Result<Option<Order>, LoyaltyError> {
        Ok(self.orders.get(order).map(|stored| stored.item.clone()))
    }

    async fn list_orders(&self, user: &UserToken) -> Result<Vec<Order>, LoyaltyError> {
        let rows = self
            .orders
            .iter()
            .filter(|stored| &stored.item.user == user)
            .map(|stored| stored.value().clone())
            .collect();
        Ok(oldest_first(rows))
    }

    async fn balance(&self, user: &UserToken) -> Result<Balance, LoyaltyError> {
        self.balances
            .get(user)
            .map(|balance| *balance)
            .ok_or_else(|| LoyaltyError::not_found("user", user))
    }

    async fn list_withdrawals(&self, user: &UserToken) -> Result<Vec<Withdrawal>, LoyaltyError> {
        let rows = self
            .withdrawals
            .iter()
            .filter(|stored| &stored.item.user == user)
            .map(|stored| stored.value().clone())
            .collect();
        Ok(oldest_first(rows))
    }

    async fn unfinished_orders(&self) -> Result<Vec<Order>, LoyaltyError> {
        let rows = self
            .orders
            .iter()
            .filter(|stored| !stored.item.status.is_terminal())
            .map(|stored| stored.value().clone())
            .collect();
        Ok(oldest_first(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::order::order_number_with_check_digit;
    use crate::types::AccrualStatus;
    use std::sync::Arc;

    fn token(name: &str) -> UserToken {
        UserToken::new(format!("token-{}", name))
    }

    async fn ledger_with_users(names: &[&str]) -> MemoryLedger {
        let ledger = MemoryLedger::new();
        for name in names {
            ledger
                .register_user(User {
                    login: name.to_string(),
                    password_hash: "hash".to_string(),
                    token: token(name),
                })
                .await
                .unwrap();
        }
        ledger
    }

    fn reference_order() -> OrderNumber {
        OrderNumber::parse("12345678903").unwrap()
    }

    fn processed(amount: i64) -> AccrualOutcome {
        AccrualOutcome::Processed {
            amount: Decimal::from(amount),
        }
    }

    #[tokio::test]
    async fn test_create_order_starts_new() {
        let ledger = ledger_with_users(&["alice"]).await;
        let order = reference_order();

        let registration = ledger.create_order(&order, &token("alice")).await.unwrap();
        assert_eq!(registration, OrderRegistration::Created);

        let stored = ledger.get_order(&order).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::New);
        assert_eq!(stored.user, token("alice"));
    }

    #[tokio::test]
    async fn test_resubmission_by_owner_and_by_other_user() {
        let ledger = ledger_with_users(&["alice", "bob"]).await;
        let order = reference_order();
        ledger.create_order(&order, &token("alice")).await.unwrap();

        assert_eq!(
            ledger.create_order(&order, &token("alice")).await.unwrap(),
            OrderRegistration::AlreadyRegistered
        );
        assert!(matches!(
            ledger.create_order(&order, &token("bob")).await,
            Err(LoyaltyError::Conflict { .. })
        ));
        assert_eq!(ledger.list_orders(&token("alice")).await.unwrap().len(), 1);
        assert!(ledger.list_orders(&token("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_user_cannot_create_orders() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.create_order(&reference_order(), &token("ghost")).await,
            Err(LoyaltyError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_processed_twice_credits_once() {
        let ledger = ledger_with_users(&["alice"]).await;
        let order = reference_order();
        let alice = token("alice");
        ledger.create_order(&order, &alice).await.unwrap();

        let first = ledger.apply_outcome(&order, &processed(500), &alice).await;
        assert_eq!(
            first,
            Ok(AppliedOutcome::Transitioned(OrderStatus::Processed))
        );
        let second = ledger.apply_outcome(&order, &processed(500), &alice).await;
        assert_eq!(
            second,
            Ok(AppliedOutcome::AlreadyFinal(OrderStatus::Processed))
        );

        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Decimal::from(500));

        let stored = ledger.get_order(&order).await.unwrap().unwrap();
        assert_eq!(stored.accrual, Some(Decimal::from(500)));
        assert!(stored.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_credit_overflow_leaves_order_unprocessed() {
        let ledger = ledger_with_users(&["alice"]).await;
        let alice = token("alice");
        let huge = order_number_with_check_digit(100);
        let small = order_number_with_check_digit(200);
        ledger.create_order(&huge, &alice).await.unwrap();
        ledger.create_order(&small, &alice).await.unwrap();
        let max = AccrualOutcome::Processed {
            amount: Decimal::MAX,
        };
        ledger.apply_outcome(&huge, &max, &alice).await.unwrap();

        let result = ledger.apply_outcome(&small, &processed(1), &alice).await;

        assert!(matches!(result, Err(LoyaltyError::Argument { .. })));
        let stored = ledger.get_order(&small).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::New);
        assert_eq!(stored.accrual, None);
        assert_eq!(ledger.balance(&alice).await.unwrap().current, Decimal::MAX);
    }

    #[tokio::test]
    async fn test_concurrent_processed_outcomes_credit_once() {
        let ledger = Arc::new(ledger_with_users(&["alice"]).await);
        let order = reference_order();
        ledger.create_order(&order, &token("alice")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = Arc::clone(&ledger);
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .apply_outcome(&order, &processed(250), &token("alice"))
                    .await
            }));
        }

        let mut transitioned = 0;
        for handle in handles {
            if let Ok(AppliedOutcome::Transitioned(_)) = handle.await.unwrap() {
                transitioned += 1;
            }
        }

        assert_eq!(transitioned, 1);
        assert_eq!(
            ledger.balance(&token("alice")).await.unwrap().current,
            Decimal::from(250)
        );
    }

    #[tokio::test]
    async fn test_apply_outcome_rejections() {
        let ledger = ledger_with_users(&["alice", "bob"]).await;
        let order = reference_order();
        ledger.create_order(&order, &token("alice")).await.unwrap();

        assert!(matches!(
            ledger
                .apply_outcome(&order, &AccrualOutcome::RateLimited { retry_after: None }, &token("alice"))
                .await,
            Err(LoyaltyError::Argument { .. })
        ));
        assert!(matches!(
            ledger.apply_outcome(&order, &processed(-1), &token("alice")).await,
            Err(LoyaltyError::Argument { .. })
        ));
        assert!(matches!(
            ledger.apply_outcome(&order, &processed(1), &token("bob")).await,
            Err(LoyaltyError::Conflict { .. })
        ));
        assert!(matches!(
            ledger
                .apply_outcome(&order_number_with_check_digit(777), &processed(1), &token("alice"))
                .await,
            Err(LoyaltyError::NotFound { .. })
        ));

        assert_eq!(
            ledger.balance(&token("alice")).await.unwrap(),
            Balance::new()
        );
    }

    #[tokio::test]
    async fn test_pending_processing_moves_new_order_once() {
        let ledger = ledger_with_users(&["alice"]).await;
        let order = reference_order();
        let alice = token("alice");
        ledger.create_order(&order, &alice).await.unwrap();

        let processing = AccrualOutcome::Pending {
            status: AccrualStatus::Processing,
        };
        assert_eq!(
            ledger.apply_outcome(&order, &processing, &alice).await,
            Ok(AppliedOutcome::Transitioned(OrderStatus::Processing))
        );
        assert_eq!(
            ledger.apply_outcome(&order, &processing, &alice).await,
            Ok(AppliedOutcome::Unchanged)
        );
        assert_eq!(
            ledger.apply_outcome(&order, &AccrualOutcome::Invalid, &alice).await,
            Ok(AppliedOutcome::Transitioned(OrderStatus::Invalid))
        );
        assert_eq!(ledger.balance(&alice).await.unwrap().current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_withdraw_checks_balance() {
        let ledger = ledger_with_users(&["alice"]).await;
        let alice = token("alice");
        let order = reference_order();
        ledger.create_order(&order, &alice).await.unwrap();
        ledger.apply_outcome(&order, &processed(100), &alice).await.unwrap();

        let spend = order_number_with_check_digit(2377225624);
        assert!(matches!(
            ledger.withdraw(&spend, Decimal::from(150), &alice).await,
            Err(LoyaltyError::InsufficientPoints { .. })
        ));

        let withdrawal = ledger.withdraw(&spend, Decimal::from(60), &alice).await.unwrap();
        assert_eq!(withdrawal.points, Decimal::from(60));
        assert!(matches!(
            ledger.withdraw(&spend, Decimal::from(1), &alice).await,
            Err(LoyaltyError::Conflict { .. })
        ));
        assert!(matches!(
            ledger
                .withdraw(&order_number_with_check_digit(5), Decimal::ZERO, &alice)
                .await,
            Err(LoyaltyError::Argument { .. })
        ));

        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Decimal::from(40));
        assert_eq!(balance.withdrawn, Decimal::from(60));
        assert_eq!(ledger.list_withdrawals(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let ledger = Arc::new(ledger_with_users(&["alice"]).await);
        let alice = token("alice");
        let order = reference_order();
        ledger.create_order(&order, &alice).await.unwrap();
        ledger.apply_outcome(&order, &processed(100), &alice).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let ledger = Arc::clone(&ledger);
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .withdraw(&order_number_with_check_digit(9000 + i), Decimal::from(15), &alice)
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(LoyaltyError::InsufficientPoints { .. }) => {}
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(succeeded, 6);
        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Decimal::from(10));
        assert_eq!(balance.withdrawn, Decimal::from(90));
    }

    #[tokio::test]
    async fn test_listings_are_oldest_first_and_unfinished_filtered() {
        let ledger = ledger_with_users(&["alice"]).await;
        let alice = token("alice");
        let numbers: Vec<_> = (100..105).map(order_number_with_check_digit).collect();
        for number in &numbers {
            ledger.create_order(number, &alice).await.unwrap();
        }
        ledger
            .apply_outcome(&numbers[1], &AccrualOutcome::Invalid, &alice)
            .await
            .unwrap();

        let listed: Vec<_> = ledger
            .list_orders(&alice)
            .await
            .unwrap()
            .into_iter()
            .map(|order| order.number)
            .collect();
        assert_eq!(listed, numbers);

        let unfinished: Vec<_> = ledger
            .unfinished_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|order| order.number)
            .collect();
        assert_eq!(unfinished.len(), 4);
        assert!(!unfinished.contains(&numbers[1]));
    }

    #[tokio::test]
    async fn test_duplicate_login_conflicts() {
        let ledger = ledger_with_users(&["alice"]).await;
        let duplicate = User {
            login: "alice".to_string(),
            password_hash: "other".to_string(),
            token: token("alice-2"),
        };
        assert!(matches!(
            ledger.register_user(duplicate).await,
            Err(LoyaltyError::Conflict { .. })
        ));
        assert!(ledger.find_user("alice").await.unwrap().is_some());
        assert!(ledger.find_user("nobody").await.unwrap().is_none());
    }
}
