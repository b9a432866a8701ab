//! Route handlers of the user API

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::auth::{token_cookie, AuthenticatedUser};
use super::dto::{
    BalanceResponse, CredentialsRequest, OrderResponse, WithdrawRequest, WithdrawalResponse,
};
use super::errors::ApiError;
use super::AppState;
use crate::core::Submission;
use crate::types::{LoyaltyError, OrderNumber, User};

fn credentials(
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<CredentialsRequest, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if request.login.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::bad_request("login and password are required"));
    }
    Ok(request)
}

/// Run CPU-bound work off the async workers
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::internal(format!("blocking task failed: {}", e)))
}

fn is_plain_text(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/plain"))
}

/// `POST /api/user/register`
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = credentials(payload)?;
    let login = request.login.trim().to_string();

    let passwords = state.passwords;
    let password = request.password;
    let password_hash = blocking(move || passwords.hash(&password)).await??;

    let token = state.signer.issue();
    let user = User {
        password_hash,
        login,
        token: token.clone(),
    };
    let user_login = user.login.clone();
    state.service.store().register_user(user).await?;

    tracing::info!(login = %user_login, "user registered");
    Ok((StatusCode::OK, token_cookie(&token)?).into_response())
}

/// `POST /api/user/login`
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let request = credentials(payload)?;
    let login = request.login.trim();

    let user = state
        .service
        .store()
        .find_user(login)
        .await?
        .ok_or(LoyaltyError::InvalidCredentials)?;

    let passwords = state.passwords;
    let password = request.password;
    let stored = user.password_hash.clone();
    if !blocking(move || passwords.verify(&password, &stored)).await? {
        return Err(LoyaltyError::InvalidCredentials.into());
    }

    Ok((StatusCode::OK, token_cookie(&user.token)?).into_response())
}

/// `POST /api/user/orders` with the order number as a plain-text body
///
/// 202 for a new order, 200 if the caller already uploaded it.
pub async fn upload_order(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    if !is_plain_text(&headers) {
        return Err(ApiError::bad_request("order number must be sent as text/plain"));
    }
    if body.trim().is_empty() {
        return Err(ApiError::bad_request("order number is required"));
    }
    let order = OrderNumber::parse(&body)?;

    match state.service.submit_order(&order, &user).await? {
        Submission::Accepted { .. } => Ok(StatusCode::ACCEPTED),
        Submission::AlreadyAccepted => Ok(StatusCode::OK),
    }
}

/// `GET /api/user/orders`, oldest first
pub async fn list_orders(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Response, ApiError> {
    let orders = state.service.store().list_orders(&user).await?;
    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(body).into_response())
}

/// `GET /api/user/balance`
pub async fn balance(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.service.store().balance(&user).await?;
    Ok(Json(balance.into()))
}

/// `POST /api/user/balance/withdraw`
pub async fn withdraw(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let order = OrderNumber::parse(&request.order)?;

    state
        .service
        .store()
        .withdraw(&order, request.sum, &user)
        .await?;
    Ok(StatusCode::OK)
}

/// `GET /api/user/withdrawals`, oldest first
pub async fn list_withdrawals(
    State(state): State<AppState>,
    AuthenticatedUser(user): AuthenticatedUser,
) -> Result<Response, ApiError> {
    let withdrawals = state.service.store().list_withdrawals(&user).await?;
    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let body: Vec<WithdrawalResponse> = withdrawals
        .into_iter()
        .map(WithdrawalResponse::from)
        .collect();
    Ok(Json(body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case::plain("text/plain", true)]
    #[case::with_charset("text/plain; charset=utf-8", true)]
    #[case::upper_case("Text/Plain", true)]
    #[case::json("application/json", false)]
    #[case::html("text/html", false)]
    #[case::prefix_only("text/plainish", false)]
    fn test_is_plain_text(#[case] content_type: &str, #[case] expected: bool) {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        assert_eq!(is_plain_text(&headers), expected);
    }

    #[test]
    fn test_missing_content_type_is_not_plain_text() {
        assert!(!is_plain_text(&HeaderMap::new()));
    }
}
