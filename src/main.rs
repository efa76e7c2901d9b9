use std::sync::Arc;

use nrql_mcp::{
    build_app,
    cache::CacheManager,
    config::{Config, TransportKind},
    logging,
    nerdgraph::NerdGraphClient,
    router::RequestRouter,
    transport::serve_stdio,
    AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;

    let executor = Arc::new(NerdGraphClient::from_config(&config)?);
    let cache = Arc::new(CacheManager::new(config.cache_max_entries));
    let sweeper = cache.spawn_sweeper(config.cache_sweep_interval);
    let state = AppState::new(executor, Arc::clone(&cache), config.account_id.clone());
    let router = Arc::new(RequestRouter::from_config(state, &config));

    match config.transport {
        TransportKind::Stdio => {
            info!(
                default_account = config.account_id.is_some(),
                rate_limit_per_minute = config.rate_limit_per_minute,
                "server starting"
            );
            serve_stdio(&router).await?;
        }
        TransportKind::Http => {
            let bind_socket = config.bind_socket()?;
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                token_required = config.mcp_api_token.is_some(),
                "server starting"
            );

            axum::serve(listener, build_app(router).into_make_service()).await?;
        }
    }

    sweeper.abort();
    info!(entries = cache.len(), "server stopped");
    Ok(())
}
