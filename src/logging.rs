use std::time::Instant;

use async_trait::async_trait;
use axum::{extract::Request, middleware::Next as HttpNext, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{
    mcp::{rpc::ProtocolResponse, server::redact_audit_params},
    router::{Middleware, Next, RoutedRequest},
};

/// Logs go to stderr; stdout is reserved for protocol frames.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

pub async fn request_logging_middleware(request: Request, next: HttpNext) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    if status.as_u16() == 401 {
        warn!(method = %method, path = %path, "authentication failure");
    }

    response
}

/// Outermost router middleware: one audited summary per protocol message.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLogMiddleware;

pub fn outcome(response: Option<&ProtocolResponse>) -> &'static str {
    match response {
        None => "notification",
        Some(response) if response.is_error() => "failure",
        Some(_) => "success",
    }
}

#[async_trait]
impl Middleware for AuditLogMiddleware {
    async fn handle(&self, request: RoutedRequest, next: Next<'_>) -> Option<ProtocolResponse> {
        let method = request.method().to_string();
        let tool = request.tool_name().map(str::to_string);
        let transport = request.context.transport.as_str();
        let audit_params = redact_audit_params(request.params());
        let started_at = Instant::now();

        let response = next.run(request).await;

        info!(
            transport,
            method = %method,
            tool = tool.as_deref().unwrap_or("-"),
            params = %audit_params,
            outcome = outcome(response.as_ref()),
            error_code = response
                .as_ref()
                .and_then(ProtocolResponse::error)
                .map(|error| error.code)
                .unwrap_or_default(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "mcp action audited"
        );

        response
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{errors::AppError, mcp::rpc::RequestId};

    #[test]
    fn outcome_classifies_responses() {
        assert_eq!(outcome(None), "notification");
        let success = ProtocolResponse::success(RequestId::Number(1), json!({}));
        assert_eq!(outcome(Some(&success)), "success");
        let failure = ProtocolResponse::failure(None, &AppError::NotInitialized);
        assert_eq!(outcome(Some(&failure)), "failure");
    }
}
