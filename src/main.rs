//! Application entry point.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use anyhow::{Context, Result};
use dotenvy::dotenv;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use meta_tx_relayer::api::{RateLimitConfig, create_router, create_router_with_rate_limit};
use meta_tx_relayer::app::{
    AppState, DispatchConfig, DispatchQueue, GracePrunerConfig, RelayConfig, spawn_grace_pruner,
};
use meta_tx_relayer::domain::{GracePeriodStore, LedgerClient, TransactionSigner};
use meta_tx_relayer::infra::{
    EvmLedgerClient, InMemoryGraceStore, LocalSigner, PostgresConfig, PostgresGraceStore,
    RpcClientConfig,
};

/// Application configuration
struct Config {
    rpc_url: String,
    relayer_private_key: SecretString,
    contract_address: Address,
    /// Enables the shared Postgres grace store; in-memory otherwise
    database_url: Option<String>,
    /// Minimum interval between accepted requests per sender (0 disables)
    grace_period: Option<Duration>,
    block_max_age: Duration,
    grace_prune_interval: Duration,
    host: String,
    port: u16,
    enable_rate_limiting: bool,
    rate_limit_config: RateLimitConfig,
    dispatch_config: DispatchConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let rpc_url = env::var("RPC_URL").context("RPC_URL not set")?;
        let relayer_private_key = env::var("RELAYER_PRIVATE_KEY")
            .map(SecretString::from)
            .context("RELAYER_PRIVATE_KEY not set")?;
        let contract_address = env::var("CONTRACT_ADDRESS").context("CONTRACT_ADDRESS not set")?;
        let contract_address = Address::from_str(contract_address.trim())
            .with_context(|| format!("CONTRACT_ADDRESS is not an address: {}", contract_address))?;

        let database_url = env::var("DATABASE_URL").ok().filter(|u| !u.is_empty());
        let grace_period = env::var("GRACE_PERIOD_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);
        let block_max_age = env::var("BLOCK_MAX_AGE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        let grace_prune_interval = env::var("GRACE_PRUNE_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);
        let enable_rate_limiting = env::var("ENABLE_RATE_LIMITING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            rpc_url,
            relayer_private_key,
            contract_address,
            database_url,
            grace_period,
            block_max_age,
            grace_prune_interval,
            host,
            port,
            enable_rate_limiting,
            rate_limit_config: RateLimitConfig::from_env(),
            dispatch_config: DispatchConfig::from_env(),
        })
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🏗️  Meta-Transaction Relayer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    let ledger: Arc<dyn LedgerClient> = Arc::new(
        EvmLedgerClient::new(&config.rpc_url, RpcClientConfig::default())
            .context("Failed to create ledger client")?,
    );
    info!("   ✓ Ledger client connected to {}", config.rpc_url);

    let signer = LocalSigner::from_secret(&config.relayer_private_key)?;
    info!("   ✓ Relayer address {}", signer.address());
    let signer: Arc<dyn TransactionSigner> = Arc::new(signer);

    let grace_store: Arc<dyn GracePeriodStore> = match &config.database_url {
        Some(url) => {
            let store = PostgresGraceStore::new(url, PostgresConfig::default()).await?;
            store.run_migrations().await?;
            info!("   ✓ Grace-period store: PostgreSQL");
            Arc::new(store)
        }
        None => {
            info!("   ○ Grace-period store: in-memory (DATABASE_URL not set)");
            Arc::new(InMemoryGraceStore::new())
        }
    };

    let queue = Arc::new(DispatchQueue::new(
        Arc::clone(&ledger),
        signer,
        config.dispatch_config.clone(),
    ));
    queue.start().await.context("Failed to start dispatch queue")?;
    info!(
        "   ✓ Dispatch queue running (max attempts: {}, gas limit: {})",
        config.dispatch_config.max_attempts, config.dispatch_config.gas_limit
    );

    let pruner_shutdown_tx = match config.grace_period {
        Some(grace_period) => {
            let (_pruner_handle, shutdown_tx) = spawn_grace_pruner(
                Arc::clone(&grace_store),
                GracePrunerConfig {
                    interval: config.grace_prune_interval,
                    grace_period,
                },
            );
            info!(
                "   ✓ Grace period {}ms (pruned every {}s)",
                grace_period.as_millis(),
                config.grace_prune_interval.as_secs()
            );
            Some(shutdown_tx)
        }
        None => {
            info!("   ○ Grace period disabled");
            None
        }
    };

    let relay_config = RelayConfig::new(config.contract_address)
        .with_grace_period(config.grace_period)
        .with_block_max_age(config.block_max_age);
    let app_state = Arc::new(AppState::new(
        Arc::clone(&ledger),
        Arc::clone(&grace_store),
        Arc::clone(&queue),
        relay_config,
    ));

    let router = if config.enable_rate_limiting {
        info!("   ✓ Rate limiting enabled");
        create_router_with_rate_limit(app_state, config.rate_limit_config)
    } else {
        info!("   ○ Rate limiting disabled");
        create_router(app_state)
    };

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    queue.stop().await;

    if let Some(tx) = pruner_shutdown_tx {
        let _ = tx.send(true);
    }

    info!("Server shutdown complete");
    Ok(())
}
