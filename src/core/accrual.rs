//! Client for the external accrual service
//!
//! Performs exactly one `GET {endpoint}/api/orders/{order}` per check and
//! classifies the response into an [`AccrualOutcome`]. No retry happens here;
//! the order poller decides whether and when to ask again.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::traits::AccrualChecker;
use crate::types::{AccrualOutcome, AccrualStatus, LoyaltyError, OrderNumber};

/// Default timeout of a single accrual request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accrual client configuration
#[derive(Debug, Clone)]
pub struct AccrualClientConfig {
    /// Base address of the accrual service
    ///
    /// `http://` is assumed when no scheme is given.
    pub endpoint: String,

    /// Request timeout
    pub timeout: Duration,
}

impl AccrualClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Response body of the accrual service
#[derive(Debug, Deserialize)]
struct AccrualResponse {
    order: String,
    status: AccrualStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    accrual: Option<Decimal>,
}

/// HTTP client of the accrual service
#[derive(Debug, Clone)]
pub struct AccrualClient {
    client: Client,
    base_url: String,
}

impl AccrualClient {
    /// Create a client
    ///
    /// # Returns
    ///
    /// * `Err(LoyaltyError::Config)` if the endpoint is empty or the HTTP
    ///   client cannot be built
    pub fn new(config: AccrualClientConfig) -> Result<Self, LoyaltyError> {
        let endpoint = config.endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(LoyaltyError::config("accrual service address not configured"));
        }

        let base_url = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LoyaltyError::config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn order_url(&self, order: &OrderNumber) -> String {
        format!("{}/api/orders/{}", self.base_url, order)
    }

    /// Ask the accrual service about one order
    pub async fn check(&self, order: &OrderNumber) -> AccrualOutcome {
        let url = self.order_url(order);

        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(order = %order, error = %error, "accrual request failed");
                return AccrualOutcome::TransientFailure {
                    reason: error.to_string(),
                };
            }
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = retry_after(response.headers());
            tracing::info!(order = %order, ?retry_after, "accrual service rate limited");
            return AccrualOutcome::RateLimited { retry_after };
        }

        if status.is_server_error() {
            tracing::warn!(order = %order, status = %status, "accrual service error");
            return AccrualOutcome::TransientFailure {
                reason: format!("HTTP {}", status),
            };
        }

        if status != StatusCode::OK {
            tracing::warn!(order = %order, status = %status, "unexpected accrual response");
            return AccrualOutcome::TransientFailure {
                reason: format!("unexpected HTTP {}", status),
            };
        }

        let body = match response.json::<AccrualResponse>().await {
            Ok(body) => body,
            Err(error) => {
                tracing::warn!(order = %order, error = %error, "unreadable accrual response");
                return AccrualOutcome::TransientFailure {
                    reason: format!("unreadable response: {}", error),
                };
            }
        };

        if body.order != order.as_str() {
            tracing::warn!(order = %order, reported = %body.order, "accrual response for another order");
            return AccrualOutcome::TransientFailure {
                reason: format!("response names order '{}'", body.order),
            };
        }

        tracing::debug!(order = %order, status = %body.status, accrual = ?body.accrual, "accrual response");
        classify(body)
    }
}

fn classify(body: AccrualResponse) -> AccrualOutcome {
    match body.status {
        AccrualStatus::Registered | AccrualStatus::Processing => AccrualOutcome::Pending {
            status: body.status,
        },
        AccrualStatus::Invalid => AccrualOutcome::Invalid,
        AccrualStatus::Processed => AccrualOutcome::Processed {
            amount: body.accrual.unwrap_or(Decimal::ZERO),
        },
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl AccrualChecker for AccrualClient {
    async fn check(&self, order: &OrderNumber) -> AccrualOutcome {
        AccrualClient::check(self, order).await
    }
}
