//! Mapping of failures to HTTP responses
//!
//! Every error body is `{ "error": code, "message": text }`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::types::LoyaltyError;

/// Error returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or invalid token cookie
    #[error("authentication required")]
    Unauthorized,

    /// The request body could not be understood
    #[error("{0}")]
    BadRequest(String),

    /// Unexpected server-side failure outside the core
    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Loyalty(#[from] LoyaltyError),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ApiError::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    /// Status code and stable error code of this failure
    pub fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            ApiError::Loyalty(error) => match error {
                LoyaltyError::Argument { .. } => (StatusCode::BAD_REQUEST, "bad_request"),
                LoyaltyError::InvalidOrderNumber { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "invalid_order_number")
                }
                LoyaltyError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
                LoyaltyError::InsufficientPoints { .. } => {
                    (StatusCode::PAYMENT_REQUIRED, "insufficient_points")
                }
                LoyaltyError::InvalidCredentials => {
                    (StatusCode::UNAUTHORIZED, "invalid_credentials")
                }
                // A signed token whose user is gone
                LoyaltyError::NotFound { entity, .. } if entity == "user" => {
                    (StatusCode::UNAUTHORIZED, "unauthorized")
                }
                LoyaltyError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
                LoyaltyError::QueueFull | LoyaltyError::EngineClosed | LoyaltyError::Cancelled => {
                    (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
                }
                LoyaltyError::ExternalService { .. }
                | LoyaltyError::Storage { .. }
                | LoyaltyError::AlreadyRunning { .. }
                | LoyaltyError::DuplicateJob { .. }
                | LoyaltyError::JobPanicked { .. }
                | LoyaltyError::Config { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = %status, "request rejected");
        }

        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal::Decimal;

    #[rstest]
    #[case::unauthorized(ApiError::Unauthorized, StatusCode::UNAUTHORIZED)]
    #[case::bad_request(ApiError::bad_request("empty body"), StatusCode::BAD_REQUEST)]
    #[case::argument(LoyaltyError::argument("sum").into(), StatusCode::BAD_REQUEST)]
    #[case::invalid_order(
        LoyaltyError::invalid_order_number("123").into(),
        StatusCode::UNPROCESSABLE_ENTITY
    )]
    #[case::conflict(LoyaltyError::conflict("taken").into(), StatusCode::CONFLICT)]
    #[case::insufficient(
        LoyaltyError::insufficient_points(Decimal::ONE, Decimal::TEN).into(),
        StatusCode::PAYMENT_REQUIRED
    )]
    #[case::credentials(LoyaltyError::InvalidCredentials.into(), StatusCode::UNAUTHORIZED)]
    #[case::unknown_user(LoyaltyError::not_found("user", "t").into(), StatusCode::UNAUTHORIZED)]
    #[case::unknown_order(LoyaltyError::not_found("order", "18").into(), StatusCode::NOT_FOUND)]
    #[case::queue_full(LoyaltyError::QueueFull.into(), StatusCode::SERVICE_UNAVAILABLE)]
    #[case::storage(
        LoyaltyError::storage("withdraw", "connection reset").into(),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    fn test_status_mapping(#[case] error: ApiError, #[case] expected: StatusCode) {
        assert_eq!(error.status().0, expected);
        assert_eq!(error.into_response().status(), expected);
    }
}
