// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tally Reconciler - billing reconciliation service
//!
//! Runs the leader-elected reconciliation loops:
//! - Bill sync (sync records driven through delegated flows)
//! - Exchange rates (diff-and-create from the rate source)
//! - Sub-ticket approvals (when a ticket service is configured)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{info, warn};

use tally_core::{PostgresStore, SqliteStore, Store, migrations};
use tally_reconciler::clients::http::{
    HttpBillingNotifier, HttpFlowDelegate, HttpRateSource, HttpTicketService, build_client,
};
use tally_reconciler::config::Config;
use tally_reconciler::runtime::ReconcilerRuntime;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_reconciler=info,tally_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        instance_id = %config.instance_id,
        leader_mode = ?config.leader_mode,
        ticket_service = config.ticket_service_url.is_some(),
        "Starting Tally Reconciler"
    );

    let store = connect_store(&config.database_url).await?;
    info!("Connected to database");

    let http = build_client(config.http_timeout)?;

    let mut builder = ReconcilerRuntime::builder()
        .with_config(&config)
        .store(store)
        .flow_delegate(Arc::new(HttpFlowDelegate::new(
            http.clone(),
            &config.flow_service_url,
        )))
        .rate_source(Arc::new(HttpRateSource::new(
            http.clone(),
            &config.rate_source_url,
        )))
        .notifier(Arc::new(HttpBillingNotifier::new(
            http.clone(),
            &config.notify_url,
        )));
    if let Some(url) = &config.ticket_service_url {
        builder = builder.ticket_service(Arc::new(HttpTicketService::new(http.clone(), url)));
    }

    let runtime = builder.build()?.start().await?;

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Tally Reconciler shut down");

    Ok(())
}

/// Open a pool for the configured backend and bring its schema up to date.
async fn connect_store(database_url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if database_url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqliteStore::new(pool)))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresStore::new(pool)))
    }
}
