//! Axum HTTP handlers for the web transport
//!
//! Provides the Model Context Protocol endpoint plus health and discovery
//! metadata endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use serde::Serialize;

use crate::{
    auth::{bearer_token, is_rejected_credential},
    cache::metrics::CacheMetricsSnapshot,
    errors::AppError,
    mcp::{rpc::ProtocolResponse, server::SUPPORTED_PROTOCOL_VERSION},
    nerdgraph::ClientHealth,
    router::{RequestContext, RequestRouter},
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub client: ClientHealth,
    pub cache: CacheMetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct DiscoveryResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub protocol_version: &'static str,
    pub mcp_endpoint: &'static str,
}

pub async fn health(State(router): State<Arc<RequestRouter>>) -> Json<HealthResponse> {
    let state = router.handler().state();
    Json(HealthResponse {
        status: "ok",
        client: state.executor.health(),
        cache: state.cache.metrics(),
    })
}

pub async fn discovery() -> Json<DiscoveryResponse> {
    Json(DiscoveryResponse {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        protocol_version: SUPPORTED_PROTOCOL_VERSION,
        mcp_endpoint: "/mcp",
    })
}

/// A rejected bearer token keeps its JSON-RPC body but answers 401; upstream
/// credential failures stay 200 like any other tool error.
pub async fn mcp_endpoint(
    State(router): State<Arc<RequestRouter>>,
    auth_header: Option<TypedHeader<Authorization<Bearer>>>,
    body: Bytes,
) -> Response {
    let context = RequestContext::http(bearer_token(
        auth_header.as_ref().map(|TypedHeader(auth)| auth),
    ));
    let Ok(frame) = std::str::from_utf8(&body) else {
        let response = ProtocolResponse::failure(
            None,
            &AppError::Parse {
                message: "request body is not valid UTF-8".to_string(),
            },
        );
        return (StatusCode::OK, Json(response)).into_response();
    };

    match router.handle_frame(&context, frame).await {
        Some(response) => {
            let status = if is_rejected_credential(&response) {
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::OK
            };
            (status, Json(response)).into_response()
        }
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
