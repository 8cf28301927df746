mod db;
mod events;
mod rpc;
mod sprint;
#[cfg(test)]
mod testutil;
mod types;

use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use db::{DbPool, PgStore};
use events::erc20::TransferEvent;
use events::factory::PairCreatedEvent;
use events::EventRegistry;
use rpc::{ChainRpc, RateLimitConfig, RpcClient};
use sprint::store::SprintStore;
use sprint::Sprint;
use types::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load(Path::new("config/config.json"))?;
    tracing::info!(
        "Loaded config for chain {} (id {})",
        config.chain_name,
        config.chain_id
    );

    let rpc_url = required_env_var(&config.rpc_url_env_var)?;
    let database_url = required_env_var(&config.database_url_env_var)?;

    let pool = DbPool::new(&database_url)
        .await
        .context("failed to create database pool")?;
    pool.run_migrations()
        .await
        .context("failed to run database migrations")?;
    tracing::info!("Database pool initialized and migrations complete");

    let store: Arc<dyn SprintStore> =
        Arc::new(PgStore::new(Arc::new(pool), &config.progress_table));

    let rpc: Arc<dyn ChainRpc> = Arc::new(
        RpcClient::from_url(&rpc_url)?.with_rate_limit(RateLimitConfig::default()),
    );

    let mut registry = EventRegistry::new();
    registry.register_group(
        "tokens",
        config.tracked_addresses.clone(),
        vec![Arc::new(TransferEvent::new())],
    )?;
    if !config.factory_addresses.is_empty() {
        registry.register_group(
            "factories",
            config.factory_addresses.clone(),
            vec![Arc::new(PairCreatedEvent::new())],
        )?;
        registry.allow_addresses(config.factory_addresses.iter().copied());
    }

    let sprint = Sprint::new(
        &config.chain_name,
        config.sprint.clone(),
        store,
        rpc,
        Arc::new(registry),
    )?;

    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received, stopping sprint");
                cancel.cancel();
            }
        })
    };

    sprint.run(cancel).await.context("sprint failed")?;
    shutdown.abort();

    tracing::info!("Sprint stopped cleanly");
    Ok(())
}

/// Resolves an env var, loading `.env` once if it is not already set.
fn required_env_var(name: &str) -> anyhow::Result<String> {
    if let Ok(value) = env::var(name) {
        return Ok(value);
    }
    dotenvy::dotenv()
        .with_context(|| format!("env var {name} not set and failed to load .env file"))?;
    env::var(name).with_context(|| format!("env var {name} not set after loading .env"))
}
