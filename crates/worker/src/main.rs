use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::runtime::Handle;

use stockbook_infra::catalog::{Catalog, PostgresCatalog};
use stockbook_infra::config::InfraConfig;
use stockbook_infra::outbox::OutboxRelay;
use stockbook_infra::store::{PostgresStockStore, apply_schema};
use stockbook_infra::workflow::{
    AccountingPublisher, InventoryJournalPublisher, NoopAccountingPublisher, StockPostingEngine,
    WorkflowDispatcher,
};
use stockbook_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockbook_observability::init_with(LogFormat::from_env());

    let config = InfraConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the stock database")?;

    if config.apply_schema {
        apply_schema(&pool).await?;
    }

    let handle = Handle::current();
    let store = Arc::new(
        PostgresStockStore::new(pool.clone(), handle.clone()).with_lock_timeout(config.lock_timeout),
    );
    let catalog: Arc<dyn Catalog> = Arc::new(PostgresCatalog::new(pool, handle));

    let accounting: Arc<dyn AccountingPublisher> = match config.counter_accounts {
        Some(accounts) => Arc::new(InventoryJournalPublisher::new(catalog.clone(), accounts)),
        None => {
            tracing::warn!("counter accounts not configured; inventory journals are not posted");
            Arc::new(NoopAccountingPublisher)
        }
    };
    let engine = Arc::new(StockPostingEngine::new(catalog, accounting));
    let dispatcher = Arc::new(WorkflowDispatcher::standard(engine));

    let mut relays = Vec::with_capacity(config.relay_workers);
    for index in 0..config.relay_workers {
        let relay = OutboxRelay::new(store.clone(), dispatcher.clone(), config.relay_config(index));
        relays.push(relay.spawn().context("failed to start outbox relay")?);
    }
    tracing::info!(workers = config.relay_workers, "stock worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down outbox relays");

    // Relays block on the runtime while finishing their last message.
    tokio::task::spawn_blocking(move || {
        for relay in relays {
            let stats = relay.stats();
            relay.shutdown();
            tracing::info!(
                applied = stats.messages_applied,
                retried = stats.messages_retried,
                dead_lettered = stats.messages_dead_lettered,
                "relay stopped"
            );
        }
    })
    .await?;

    Ok(())
}
