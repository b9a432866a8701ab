//! Loyalty Engine server
//!
//! Serves the user API and polls the accrual service for every uploaded order.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- -r localhost:8081
//! cargo run -- -a 0.0.0.0:8080 -d postgres://loyalty@localhost/loyalty -r localhost:8081
//! RUN_ADDRESS=:8080 ACCRUAL_SYSTEM_ADDRESS=http://accrual:8080 cargo run
//! ```
//!
//! Without a database URI the ledger lives in memory and is lost on exit.
//!
//! # Exit Codes
//!
//! - 0: Clean shutdown after Ctrl-C
//! - 1: Start-up error (unreachable database, bad configuration, busy port, etc.)

use std::sync::Arc;

use anyhow::Context;
use loyalty_engine::cli;
use loyalty_engine::core::ledger::postgres::DEFAULT_MAX_CONNECTIONS;
use loyalty_engine::core::{AccrualClient, AccrualService, LedgerStore, MemoryLedger, PostgresLedger};
use loyalty_engine::http::{self, AppState, TokenSigner};
use loyalty_engine::logging;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::parse_args();
    logging::init_tracing(&args.log_level, args.log_format);

    let store: Arc<dyn LedgerStore> = match &args.database_uri {
        Some(uri) => {
            let ledger = PostgresLedger::connect(uri, DEFAULT_MAX_CONNECTIONS)
                .await
                .context("connecting to the database")?;
            ledger.migrate().await.context("running migrations")?;
            Arc::new(ledger)
        }
        None => {
            tracing::warn!("no database configured, using the in-memory ledger");
            Arc::new(MemoryLedger::new())
        }
    };

    let checker = Arc::new(
        AccrualClient::new(args.to_accrual_config()).context("configuring the accrual client")?,
    );
    let signer = match &args.token_secret {
        Some(secret) => TokenSigner::new(secret)?,
        None => {
            tracing::warn!("no token secret configured, sessions end on restart");
            TokenSigner::ephemeral()?
        }
    };

    let shutdown = CancellationToken::new();
    let service = Arc::new(AccrualService::start(
        store,
        checker,
        args.to_pool_config(),
        args.to_poller_config(),
        shutdown.clone(),
    )?);
    service
        .resume_unfinished()
        .await
        .context("resuming unfinished orders")?;

    let address = listen_address(&args.run_address);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("binding {}", address))?;

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %error, "cannot listen for Ctrl-C");
                return;
            }
            tracing::info!("shutdown requested");
            shutdown.cancel();
        });
    }

    let state = AppState::new(Arc::clone(&service), signer)
        .with_password_hasher(args.to_password_hasher());
    let app = http::router(state);
    http::serve(listener, app, shutdown.clone())
        .await
        .context("serving the HTTP API")?;

    service.shutdown().await;
    Ok(())
}

/// Accept `:port` as shorthand for all interfaces
fn listen_address(run_address: &str) -> String {
    if run_address.starts_with(':') {
        format!("0.0.0.0{}", run_address)
    } else {
        run_address.to_string()
    }
}
