use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use differential_server::{
    build_router, AppState, ProviderRegistry, SelfHealer, ServerConfig, WakeupNotifier,
};
use differential_store::{SqliteEventSink, SqliteJobStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,differential_server=info")),
        )
        .init();

    let store_config = StoreConfig::from_env("differential.db");
    store_config
        .startup_health_check()
        .map_err(anyhow::Error::msg)?;
    let store = SqliteJobStore::new(&store_config.sqlite_db_path)
        .map_err(|e| anyhow::anyhow!("open job store: {}", e))?;

    let config = ServerConfig::from_env();
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(
        store.clone(),
        Arc::new(SqliteEventSink::new(store)),
        config,
    );

    // Providers are wired here as deployments come online; the registry
    // starts empty and the notifier skips unservable deployments.
    tokio::spawn(SelfHealer::new(state.clone()).run());
    tokio::spawn(WakeupNotifier::new(state.clone(), ProviderRegistry::new()).run());

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!("control plane listening on http://{}", listen_addr);
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
