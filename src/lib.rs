use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod cache;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod nerdgraph;
pub mod query;
pub mod rate_limit;
pub mod router;
pub mod transport;

use cache::CacheManager;
use nerdgraph::NrqlExecutor;
use query::QueryService;
use router::RequestRouter;

/// Shared services behind every transport.
#[derive(Clone)]
pub struct AppState {
    pub query_service: Arc<QueryService>,
    pub cache: Arc<CacheManager>,
    pub executor: Arc<dyn NrqlExecutor>,
}

impl AppState {
    pub fn new(
        executor: Arc<dyn NrqlExecutor>,
        cache: Arc<CacheManager>,
        default_account_id: Option<String>,
    ) -> Self {
        let query_service = Arc::new(QueryService::new(
            Arc::clone(&executor),
            Arc::clone(&cache),
            default_account_id,
        ));
        Self {
            query_service,
            cache,
            executor,
        }
    }
}

pub fn build_app(router: Arc<RequestRouter>) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route("/mcp", post(http::handlers::mcp_endpoint))
        .layer(DefaultBodyLimit::max(transport::MAX_FRAME_BYTES))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(router)
}
