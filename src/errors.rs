use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry hint attached to rate-limit errors when upstream gave none.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthenticationError,
    AuthorizationError,
    RateLimitError,
    NetworkError,
    ValidationError,
    QuerySyntaxError,
    ResourceNotFound,
    InternalServerError,
}

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("parse error: {message}")]
    Parse { message: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid version: {found}")]
    InvalidVersion { found: String },
    #[error("method not found: {method}")]
    MethodNotFound { method: String },
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },
    #[error("server not initialized")]
    NotInitialized,
    #[error("bad request: {message}")]
    Validation {
        code: &'static str,
        message: String,
    },
    #[error("query syntax error: {message}")]
    QuerySyntax { message: String },
    #[error("resource not found: {uri}")]
    ResourceNotFound { uri: String },
    #[error("unauthorized: {message}")]
    Unauthorized {
        code: &'static str,
        message: String,
    },
    #[error("forbidden: {message}")]
    Forbidden { message: String },
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<u64>,
    },
    #[error("network error: {message}")]
    Network { message: String },
    #[error("internal error")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn query_syntax(message: impl Into<String>) -> Self {
        Self::QuerySyntax {
            message: message.into(),
        }
    }

    pub fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::Unauthorized {
            code,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. }
            | Self::InvalidRequest { .. }
            | Self::InvalidVersion { .. }
            | Self::MethodNotFound { .. }
            | Self::ToolNotFound { .. }
            | Self::NotInitialized
            | Self::Validation { .. } => ErrorKind::ValidationError,
            Self::QuerySyntax { .. } => ErrorKind::QuerySyntaxError,
            Self::ResourceNotFound { .. } => ErrorKind::ResourceNotFound,
            Self::Unauthorized { .. } => ErrorKind::AuthenticationError,
            Self::Forbidden { .. } => ErrorKind::AuthorizationError,
            Self::RateLimited { .. } => ErrorKind::RateLimitError,
            Self::Network { .. } => ErrorKind::NetworkError,
            Self::Internal { .. } => ErrorKind::InternalServerError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimitError | ErrorKind::NetworkError
        )
    }

    /// Seconds a caller should wait before retrying; only rate limits carry one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after, .. } => {
                Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS))
            }
            _ => None,
        }
    }

    /// Human-readable detail safe to hand back to protocol callers.
    pub fn detail(&self) -> String {
        match self {
            Self::Internal { .. } => "internal server error".to_string(),
            Self::Parse { message }
            | Self::InvalidRequest { message }
            | Self::Validation { message, .. }
            | Self::QuerySyntax { message }
            | Self::Unauthorized { message, .. }
            | Self::Forbidden { message }
            | Self::RateLimited { message, .. }
            | Self::Network { message } => message.clone(),
            other => other.to_string(),
        }
    }
}
