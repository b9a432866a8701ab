//! HTTP user API
//!
//! Thin axum layer over the [`AccrualService`] and its ledger store. Requests
//! other than register and login must carry the `user_token` cookie.

pub mod auth;
pub mod dto;
pub mod errors;
pub mod handlers;
pub mod password;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub use auth::{AuthenticatedUser, TokenSigner, TOKEN_COOKIE};
pub use errors::ApiError;
pub use password::PasswordHasher;

use crate::core::AccrualService;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<AccrualService>,
    pub signer: Arc<TokenSigner>,
    pub passwords: PasswordHasher,
}

impl AppState {
    pub fn new(service: Arc<AccrualService>, signer: TokenSigner) -> Self {
        Self {
            service,
            signer: Arc::new(signer),
            passwords: PasswordHasher::default(),
        }
    }

    pub fn with_password_hasher(mut self, passwords: PasswordHasher) -> Self {
        self.passwords = passwords;
        self
    }
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/user/register", post(handlers::register))
        .route("/api/user/login", post(handlers::login))
        .route(
            "/api/user/orders",
            post(handlers::upload_order).get(handlers::list_orders),
        )
        .route("/api/user/balance", get(handlers::balance))
        .route("/api/user/balance/withdraw", post(handlers::withdraw))
        .route("/api/user/withdrawals", get(handlers::list_withdrawals))
        .with_state(state)
}

/// Serve `app` until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "HTTP API listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
