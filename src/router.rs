//! Request router: a fixed middleware chain in front of the protocol handler
//!
//! Order is logging, then auth, then rate limiting, then dispatch. Each
//! middleware receives the routed request and a [`Next`] continuation.

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::{
    auth::AuthMiddleware,
    config::Config,
    logging::AuditLogMiddleware,
    mcp::{
        rpc::{encode_response, parse_message, IncomingMessage, ProtocolResponse, RequestId},
        server::ProtocolHandler,
    },
    rate_limit::RateLimitMiddleware,
    AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stdio,
    Http,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Http => "http",
        }
    }
}

/// Where a frame came from and what credentials it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub transport: Transport,
    pub bearer_token: Option<String>,
}

impl RequestContext {
    pub fn stdio() -> Self {
        Self {
            transport: Transport::Stdio,
            bearer_token: None,
        }
    }

    pub fn http(bearer_token: Option<String>) -> Self {
        Self {
            transport: Transport::Http,
            bearer_token,
        }
    }

    /// The stdio peer is the process that spawned us.
    pub fn is_local(&self) -> bool {
        self.transport == Transport::Stdio
    }
}

#[derive(Debug, Clone)]
pub struct RoutedRequest {
    pub context: RequestContext,
    pub message: IncomingMessage,
}

impl RoutedRequest {
    pub fn method(&self) -> &str {
        self.message.method()
    }

    pub fn id(&self) -> Option<&RequestId> {
        self.message.id()
    }

    pub fn params(&self) -> Option<&Value> {
        self.message.params()
    }

    pub fn tool_name(&self) -> Option<&str> {
        if self.method() != "tools/call" {
            return None;
        }
        self.params()?.get("name")?.as_str()
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Returns `None` only for notifications.
    async fn handle(&self, request: RoutedRequest, next: Next<'_>) -> Option<ProtocolResponse>;
}

pub struct Next<'a> {
    handler: &'a ProtocolHandler,
    remaining: &'a [Box<dyn Middleware>],
}

impl<'a> Next<'a> {
    pub async fn run(self, request: RoutedRequest) -> Option<ProtocolResponse> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        request,
                        Next {
                            handler: self.handler,
                            remaining: rest,
                        },
                    )
                    .await
            }
            None => self.handler.dispatch(request.message).await,
        }
    }
}

pub struct RequestRouter {
    handler: ProtocolHandler,
    middleware: Vec<Box<dyn Middleware>>,
}

impl RequestRouter {
    pub fn new(handler: ProtocolHandler, auth: AuthMiddleware, rate_limit: RateLimitMiddleware) -> Self {
        Self {
            handler,
            middleware: vec![
                Box::new(AuditLogMiddleware),
                Box::new(auth),
                Box::new(rate_limit),
            ],
        }
    }

    pub fn from_config(state: AppState, config: &Config) -> Self {
        Self::new(
            ProtocolHandler::new(state),
            AuthMiddleware::new(config.mcp_api_token.clone()),
            RateLimitMiddleware::per_minute(config.rate_limit_per_minute),
        )
    }

    pub fn handler(&self) -> &ProtocolHandler {
        &self.handler
    }

    pub async fn route(&self, request: RoutedRequest) -> Option<ProtocolResponse> {
        Next {
            handler: &self.handler,
            remaining: &self.middleware,
        }
        .run(request)
        .await
    }

    /// One frame in, at most one response out. Blank lines are ignored.
    pub async fn handle_frame(
        &self,
        context: &RequestContext,
        line: &str,
    ) -> Option<ProtocolResponse> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match parse_message(line) {
            Ok(message) => {
                self.route(RoutedRequest {
                    context: context.clone(),
                    message,
                })
                .await
            }
            Err(response) => {
                warn!(
                    transport = context.transport.as_str(),
                    code = response.error().map(|error| error.code).unwrap_or_default(),
                    "rejected malformed frame"
                );
                Some(response)
            }
        }
    }

    pub async fn handle_line(&self, context: &RequestContext, line: &str) -> Option<String> {
        self.handle_frame(context, line)
            .await
            .map(|response| encode_response(&response))
    }
}
