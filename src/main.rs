use std::sync::Arc;

use anyhow::Context;
use credit_ledger::config::{self, LedgerConfig};
use credit_ledger::ledger::{spawn_expiry_reaper, LedgerService, PgLedgerStore};
use credit_ledger::telemetry;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to the ledger database")?;

    if let Err(error) = sqlx::migrate!("./migrations").run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error).context("ledger migrations failed");
        }
    }

    let ledger_config = LedgerConfig::from_env();
    let interval = ledger_config.expiry_scan_interval;
    let service = LedgerService::new(Arc::new(PgLedgerStore::new(pool.clone())), ledger_config);
    let reaper = spawn_expiry_reaper(service, interval);
    tracing::info!(
        interval_secs = interval.as_secs(),
        "credit ledger running; expiry reaper scheduled"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    reaper.shutdown().await;
    pool.close().await;
    Ok(())
}
