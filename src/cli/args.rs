use crate::core::accrual::{AccrualClientConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::core::poller::{
    PollerConfig, DEFAULT_MAX_RETRIES, DEFAULT_PENDING_INTERVAL, DEFAULT_RATE_LIMIT_BACKOFF,
};
use crate::core::pool::PoolConfig;
use crate::http::password::{PasswordHasher, DEFAULT_ITERATIONS};
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Loyalty points accrual service
#[derive(Parser, Debug)]
#[command(name = "loyalty-engine")]
#[command(about = "Accrue loyalty points for uploaded orders", long_about = None)]
pub struct CliArgs {
    /// Address the HTTP API listens on
    #[arg(
        short = 'a',
        long = "run-address",
        env = "RUN_ADDRESS",
        value_name = "HOST:PORT",
        default_value = "localhost:8080"
    )]
    pub run_address: String,

    /// PostgreSQL connection URI
    #[arg(
        short = 'd',
        long = "database-uri",
        env = "DATABASE_URI",
        value_name = "URI",
        help = "PostgreSQL connection URI (in-memory ledger when absent)"
    )]
    pub database_uri: Option<String>,

    /// Address of the accrual service
    #[arg(
        short = 'r',
        long = "accrual-address",
        env = "ACCRUAL_SYSTEM_ADDRESS",
        value_name = "ADDRESS"
    )]
    pub accrual_address: String,

    /// Number of job engine workers
    #[arg(
        long = "workers",
        env = "WORKERS",
        value_name = "COUNT",
        help = "Number of job engine workers (default: CPU cores)"
    )]
    pub workers: Option<usize>,

    /// Capacity of the job queue
    #[arg(
        long = "queue-capacity",
        env = "QUEUE_CAPACITY",
        value_name = "SIZE",
        help = "Capacity of the job queue (default: 1024)"
    )]
    pub queue_capacity: Option<usize>,

    /// Pause after a 429 without Retry-After
    #[arg(
        long = "rate-limit-backoff-secs",
        env = "RATE_LIMIT_BACKOFF_SECS",
        value_name = "SECS",
        default_value_t = DEFAULT_RATE_LIMIT_BACKOFF.as_secs()
    )]
    pub rate_limit_backoff_secs: u64,

    /// Pause between checks of a pending order
    #[arg(
        long = "pending-interval-ms",
        env = "PENDING_INTERVAL_MS",
        value_name = "MILLIS",
        default_value_t = DEFAULT_PENDING_INTERVAL.as_millis() as u64
    )]
    pub pending_interval_ms: u64,

    /// Consecutive transient failures tolerated per order
    #[arg(
        long = "max-retries",
        env = "MAX_RETRIES",
        value_name = "COUNT",
        default_value_t = DEFAULT_MAX_RETRIES
    )]
    pub max_retries: usize,

    /// Timeout of one accrual request
    #[arg(
        long = "request-timeout-secs",
        env = "REQUEST_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs()
    )]
    pub request_timeout_secs: u64,

    /// Secret signing user tokens
    #[arg(
        long = "token-secret",
        env = "TOKEN_SECRET",
        value_name = "SECRET",
        hide_env_values = true,
        help = "Secret signing user tokens (random per run when absent)"
    )]
    pub token_secret: Option<String>,

    /// PBKDF2 iterations for new password hashes
    #[arg(
        long = "password-iterations",
        env = "PASSWORD_ITERATIONS",
        value_name = "N",
        default_value_t = DEFAULT_ITERATIONS
    )]
    pub password_iterations: u32,

    /// Default log level, overridden by RUST_LOG
    #[arg(long = "log-level", env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format
    #[arg(long = "log-format", env = "LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,
}

/// Available log output formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl CliArgs {
    /// Create a PoolConfig from CLI arguments
    ///
    /// Zero values fall back to the defaults with a warning.
    pub fn to_pool_config(&self) -> PoolConfig {
        let default = PoolConfig::default();
        PoolConfig {
            worker_count: positive_or_default("workers", self.workers, default.worker_count),
            queue_capacity: positive_or_default(
                "queue-capacity",
                self.queue_capacity,
                default.queue_capacity,
            ),
        }
    }

    /// Create a PollerConfig from CLI arguments
    pub fn to_poller_config(&self) -> PollerConfig {
        let default = PollerConfig::default();
        let rate_limit_backoff = if self.rate_limit_backoff_secs == 0 {
            tracing::warn!("rate-limit-backoff-secs must be positive, using default");
            default.rate_limit_backoff
        } else {
            Duration::from_secs(self.rate_limit_backoff_secs)
        };

        PollerConfig {
            rate_limit_backoff,
            pending_interval: Duration::from_millis(self.pending_interval_ms),
            max_retries: self.max_retries,
            ..default
        }
    }

    /// Create an AccrualClientConfig from CLI arguments
    pub fn to_accrual_config(&self) -> AccrualClientConfig {
        let timeout = if self.request_timeout_secs == 0 {
            tracing::warn!("request-timeout-secs must be positive, using default");
            DEFAULT_REQUEST_TIMEOUT
        } else {
            Duration::from_secs(self.request_timeout_secs)
        };
        AccrualClientConfig::new(self.accrual_address.clone()).with_timeout(timeout)
    }

    /// Create a PasswordHasher from CLI arguments
    ///
    /// Zero iterations fall back to the default with a warning.
    pub fn to_password_hasher(&self) -> PasswordHasher {
        PasswordHasher::new(self.password_iterations).unwrap_or_else(|_| {
            tracing::warn!("password-iterations must be positive, using default");
            PasswordHasher::default()
        })
    }
}

fn positive_or_default(name: &str, value: Option<usize>, default: usize) -> usize {
    match value {
        Some(0) => {
            tracing::warn!(option = name, default, "zero is not allowed, using default");
            default
        }
        Some(value) => value,
        None => default,
    }
}
