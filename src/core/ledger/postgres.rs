//! PostgreSQL-backed ledger
//!
//! Every ledger operation runs in one transaction. Rows that decide the
//! outcome of an operation are locked with `SELECT ... FOR UPDATE` before
//! they are changed, so a terminal order transition and its balance credit
//! commit together, and concurrent withdrawals see each other's debits.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | LoyaltyError |
//! |------------|-----------------|--------------|
//! | Database (unique violation) | `23505` | `Conflict` (where a duplicate is meaningful) |
//! | Database (foreign key violation) | `23503` | `NotFound` (unknown user) |
//! | Anything else | N/A | `Storage` |
//!
//! The schema lives in `migrations/` and is embedded with `sqlx::migrate!`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::instrument;

use super::{plan_transition, validate_outcome, validate_points, Transition};
use crate::core::traits::{AppliedOutcome, LedgerStore, OrderRegistration};
use crate::types::{
    AccrualOutcome, Balance, LoyaltyError, Order, OrderNumber, OrderStatus, User, UserToken,
    Withdrawal,
};

/// Default size of the connection pool
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Ledger stored in PostgreSQL
///
/// The store owns its connection pool; cloning shares the pool.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_uri`
    pub async fn connect(database_uri: &str, max_connections: u32) -> Result<Self, LoyaltyError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_uri)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), LoyaltyError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LoyaltyError::storage("migrate", e.to_string()))?;
        tracing::info!("ledger schema up to date");
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, LoyaltyError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), LoyaltyError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

/// Roll back and hand `error` back to the caller
async fn abort<V>(
    tx: Transaction<'static, Postgres>,
    error: LoyaltyError,
) -> Result<V, LoyaltyError> {
    tx.rollback()
        .await
        .map_err(|e| map_sqlx_error("rollback", e))?;
    Err(error)
}

#[async_trait]
impl LedgerStore for PostgresLedger {
    #[instrument(skip(self, user), fields(login = %user.login), err)]
    async fn register_user(&self, user: User) -> Result<(), LoyaltyError> {
        sqlx::query(
            r#"
            INSERT INTO users (user_token, login, password_hash)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(user.token.as_str())
        .bind(&user.login)
        .bind(&user.password_hash)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                LoyaltyError::conflict(format!("login '{}' is already taken", user.login))
            } else {
                map_sqlx_error("register_user", e)
            }
        })?;
        Ok(())
    }

    async fn find_user(&self, login: &str) -> Result<Option<User>, LoyaltyError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT user_token, login, password_hash
            FROM users
            WHERE login = $1
            "#,
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_user", e))?;

        Ok(row.map(User::from))
    }

    #[instrument(skip(self, user), fields(order = %order), err)]
    async fn create_order(
        &self,
        order: &OrderNumber,
        user: &UserToken,
    ) -> Result<OrderRegistration, LoyaltyError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (order_number, user_token)
            VALUES ($1, $2)
            ON CONFLICT (order_number) DO NOTHING
            "#,
        )
        .bind(order.as_str())
        .bind(user.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                LoyaltyError::not_found("user", user)
            } else {
                map_sqlx_error("create_order", e)
            }
        })?;

        if inserted.rows_affected() == 1 {
            return Ok(OrderRegistration::Created);
        }

        let owner: Option<String> =
            sqlx::query_scalar("SELECT user_token FROM orders WHERE order_number = $1")
                .bind(order.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_order", e))?;

        match owner {
            Some(owner) if owner == user.as_str() => Ok(OrderRegistration::AlreadyRegistered),
            Some(_) => Err(LoyaltyError::conflict(format!(
                "order {} was uploaded by another user",
                order
            ))),
            // Only a concurrent delete could get here, and orders are never deleted.
            None => Err(LoyaltyError::storage(
                "create_order",
                format!("order {} vanished after conflicting insert", order),
            )),
        }
    }

    #[instrument(skip(self, user), fields(order = %order), err)]
    async fn apply_outcome(
        &self,
        order: &OrderNumber,
        outcome: &AccrualOutcome,
        user: &UserToken,
    ) -> Result<AppliedOutcome, LoyaltyError> {
        validate_outcome(outcome)?;

        let mut tx = self.begin().await?;

        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT user_token, status
            FROM orders
            WHERE order_number = $1
            FOR UPDATE
            "#,
        )
        .bind(order.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("apply_outcome", e))?;

        let Some((owner, status)) = row else {
            return abort(tx, LoyaltyError::not_found("order", order)).await;
        };
        if owner != user.as_str() {
            return abort(
                tx,
                LoyaltyError::conflict(format!("order {} belongs to another user", order)),
            )
            .await;
        }
        let current: OrderStatus = status.parse()?;

        let transition = plan_transition(current, outcome);
        let Transition::To { status, credit } = transition else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(transition.applied());
        };

        if let Some(amount) = credit {
            let credited = sqlx::query(
                r#"
                UPDATE users
                SET balance_current = balance_current + $1
                WHERE user_token = $2
                "#,
            )
            .bind(amount)
            .bind(user.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("apply_outcome", e))?;

            if credited.rows_affected() != 1 {
                return abort(tx, LoyaltyError::not_found("user", user)).await;
            }
        }

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $1,
                accrual = COALESCE($2, accrual),
                processed_at = CASE WHEN $1 = 'PROCESSED' THEN now() ELSE processed_at END
            WHERE order_number = $3
            "#,
        )
        .bind(status.as_str())
        .bind(credit)
        .bind(order.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("apply_outcome", e))?;

        commit(tx).await?;
        tracing::info!(order = %order, status = %status, accrual = ?credit, "order updated");
        Ok(transition.applied())
    }

    #[instrument(skip(self, user), fields(order = %order, points = %points), err)]
    async fn withdraw(
        &self,
        order: &OrderNumber,
        points: Decimal,
        user: &UserToken,
    ) -> Result<Withdrawal, LoyaltyError> {
        validate_points(points)?;

        let mut tx = self.begin().await?;

        let current: Option<Decimal> = sqlx::query_scalar(
            "SELECT balance_current FROM users WHERE user_token = $1 FOR UPDATE",
        )
        .bind(user.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("withdraw", e))?;

        let Some(current) = current else {
            return abort(tx, LoyaltyError::not_found("user", user)).await;
        };

        let inserted: Result<DateTime<Utc>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO withdrawals (order_number, user_token, points)
            VALUES ($1, $2, $3)
            RETURNING processed_at
            "#,
        )
        .bind(order.as_str())
        .bind(user.as_str())
        .bind(points)
        .fetch_one(&mut *tx)
        .await;

        let processed_at = match inserted {
            Ok(processed_at) => processed_at,
            Err(e) if is_unique_violation(&e) => {
                return abort(
                    tx,
                    LoyaltyError::conflict(format!(
                        "order {} was already used for a withdrawal",
                        order
                    )),
                )
                .await;
            }
            Err(e) => return Err(map_sqlx_error("withdraw", e)),
        };

        if points > current {
            return abort(tx, LoyaltyError::insufficient_points(current, points)).await;
        }

        sqlx::query(
            r#"
            UPDATE users
            SET balance_current = balance_current - $1,
                balance_withdrawn = balance_withdrawn + $1
            WHERE user_token = $2
            "#,
        )
        .bind(points)
        .bind(user.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("withdraw", e))?;

        commit(tx).await?;
        tracing::info!(order = %order, points = %points, "points withdrawn");

        Ok(Withdrawal {
            order: order.clone(),
            user: user.clone(),
            points,
            processed_at,
        })
    }

    async fn get_order(&self, order: &OrderNumber) -> Result<Option<Order>, LoyaltyError> {
        let row = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_number, user_token, status, accrual, uploaded_at, processed_at
            FROM orders
            WHERE order_number = $1
            "#,
        )
        .bind(order.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_order", e))?;

        row.map(Order::try_from).transpose()
    }

    async fn list_orders(&self, user: &UserToken) -> Result<Vec<Order>, LoyaltyError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_number, user_token, status, accrual, uploaded_at, processed_at
            FROM orders
            WHERE user_token = $1
            ORDER BY uploaded_at ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_orders", e))?;

        rows.into_iter().map(Order::try_from).collect()
    }

    async fn balance(&self, user: &UserToken) -> Result<Balance, LoyaltyError> {
        let row: Option<(Decimal, Decimal)> = sqlx::query_as(
            "SELECT balance_current, balance_withdrawn FROM users WHERE user_token = $1",
        )
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("balance", e))?;

        row.map(|(current, withdrawn)| Balance { current, withdrawn })
            .ok_or_else(|| LoyaltyError::not_found("user", user))
    }

    async fn list_withdrawals(&self, user: &UserToken) -> Result<Vec<Withdrawal>, LoyaltyError> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            r#"
            SELECT order_number, user_token, points, processed_at
            FROM withdrawals
            WHERE user_token = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_withdrawals", e))?;

        Ok(rows.into_iter().map(Withdrawal::from).collect())
    }

    async fn unfinished_orders(&self) -> Result<Vec<Order>, LoyaltyError> {
        let rows = sqlx::query_as::<_, OrderRow>(
            r#"
            SELECT order_number, user_token, status, accrual, uploaded_at, processed_at
            FROM orders
            WHERE status IN ('NEW', 'PROCESSING')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("unfinished_orders", e))?;

        rows.into_iter().map(Order::try_from).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LoyaltyError {
    match err {
        sqlx::Error::Database(db_err) => LoyaltyError::storage(
            operation,
            format!(
                "database error{}: {}",
                db_err
                    .code()
                    .map(|code| format!(" {}", code))
                    .unwrap_or_default(),
                db_err.message()
            ),
        ),
        sqlx::Error::PoolClosed => LoyaltyError::storage(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            LoyaltyError::storage(operation, "timed out waiting for a connection")
        }
        other => LoyaltyError::storage(operation, other.to_string()),
    }
}

fn has_code(err: &sqlx::Error, expected: &str) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == expected;
        }
    }
    false
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23505")
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    has_code(err, "23503")
}

// SQLx row types

#[derive(Debug, FromRow)]
struct UserRow {
    user_token: String,
    login: String,
    password_hash: String,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            login: row.login,
            password_hash: row.password_hash,
            token: UserToken::new(row.user_token),
        }
    }
}

#[derive(Debug, FromRow)]
struct OrderRow {
    order_number: String,
    user_token: String,
    status: String,
    accrual: Option<Decimal>,
    uploaded_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<OrderRow> for Order {
    type Error = LoyaltyError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            number: OrderNumber::from_stored(row.order_number),
            user: UserToken::new(row.user_token),
            status: row.status.parse()?,
            accrual: row.accrual,
            uploaded_at: row.uploaded_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct WithdrawalRow {
    order_number: String,
    user_token: String,
    points: Decimal,
    processed_at: DateTime<Utc>,
}

impl From<WithdrawalRow> for Withdrawal {
    fn from(row: WithdrawalRow) -> Self {
        Withdrawal {
            order: OrderNumber::from_stored(row.order_number),
            user: UserToken::new(row.user_token),
            points: row.points,
            processed_at: row.processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_row_conversion() {
        let now = Utc::now();
        let order = Order::try_from(OrderRow {
            order_number: "12345678903".to_string(),
            user_token: "token-a".to_string(),
            status: "PROCESSED".to_string(),
            accrual: Some(Decimal::from(500)),
            uploaded_at: now,
            processed_at: Some(now),
        })
        .unwrap();

        assert_eq!(order.number.as_str(), "12345678903");
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, Some(Decimal::from(500)));
    }

    #[test]
    fn test_order_row_with_unknown_status_is_storage_error() {
        let result = Order::try_from(OrderRow {
            order_number: "18".to_string(),
            user_token: "token-a".to_string(),
            status: "LOST".to_string(),
            accrual: None,
            uploaded_at: Utc::now(),
            processed_at: None,
        });
        assert!(matches!(result, Err(LoyaltyError::Storage { .. })));
    }

    #[test]
    fn test_non_database_errors_map_to_storage() {
        let error = map_sqlx_error("balance", sqlx::Error::PoolClosed);
        assert_eq!(
            error,
            LoyaltyError::storage("balance", "connection pool closed")
        );
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_foreign_key_violation(&sqlx::Error::RowNotFound));
    }
}
