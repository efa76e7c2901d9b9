use async_trait::async_trait;
use axum_extra::headers::{authorization::Bearer, Authorization};
use tracing::warn;

use crate::{
    errors::AppError,
    mcp::rpc::{ProtocolResponse, UNAUTHORIZED},
    router::{Middleware, Next, RoutedRequest},
};

pub const MISSING_TOKEN: &str = "missing_token";
pub const INVALID_TOKEN: &str = "invalid_token";

/// Bearer-token check for remote transports. Without a configured token, or
/// for the local stdio peer, every request passes.
#[derive(Debug, Clone, Default)]
pub struct AuthMiddleware {
    api_token: Option<String>,
}

impl AuthMiddleware {
    pub fn new(api_token: Option<String>) -> Self {
        Self {
            api_token: api_token.filter(|token| !token.is_empty()),
        }
    }

    pub fn check(&self, request: &RoutedRequest) -> Result<(), AppError> {
        let Some(expected) = self.api_token.as_deref() else {
            return Ok(());
        };
        if request.context.is_local() {
            return Ok(());
        }

        match request.context.bearer_token.as_deref() {
            None => Err(AppError::unauthorized(
                MISSING_TOKEN,
                "missing authorization header",
            )),
            Some(token) if token != expected => {
                Err(AppError::unauthorized(INVALID_TOKEN, "invalid bearer token"))
            }
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    async fn handle(&self, request: RoutedRequest, next: Next<'_>) -> Option<ProtocolResponse> {
        if let Err(err) = self.check(&request) {
            warn!(method = request.method(), error = %err, "authentication failure");
            return request
                .id()
                .map(|id| ProtocolResponse::failure(Some(id.clone()), &err));
        }
        next.run(request).await
    }
}

/// True only when this middleware turned the caller away. Upstream
/// authentication failures share the code but carry a different reason.
pub fn is_rejected_credential(response: &ProtocolResponse) -> bool {
    response.error().is_some_and(|error| {
        error.code == UNAUTHORIZED
            && error
                .data
                .as_ref()
                .and_then(|data| data.reason.as_deref())
                .is_some_and(|reason| reason == MISSING_TOKEN || reason == INVALID_TOKEN)
    })
}

/// Pulls the token out of a typed `Authorization: Bearer` header.
pub fn bearer_token(header: Option<&Authorization<Bearer>>) -> Option<String> {
    header.map(|auth| auth.token().to_string())
}
