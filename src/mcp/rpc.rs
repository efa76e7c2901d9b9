//! JSON-RPC 2.0 wire types and error mapping
//!
//! Incoming lines are classified into requests and notifications here; every
//! outgoing frame is a [`ProtocolResponse`] carrying either a result or a
//! typed [`ProtocolError`].

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{AppError, ErrorKind};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const SERVER_ERROR: i64 = -32000;
pub const UNAUTHORIZED: i64 = -32001;
pub const RESOURCE_NOT_FOUND: i64 = -32002;
pub const SERVER_NOT_INITIALIZED: i64 = -32003;

const FALLBACK_RESPONSE: &str =
    r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"Internal error"}}"#;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::String(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl ProtocolRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    pub kind: ErrorKind,
    pub retryable: bool,
    #[serde(rename = "retryAfter", default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Machine-readable reason for validation and authentication failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponsePayload {
    Result(Value),
    Error(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(flatten)]
    pub payload: ResponsePayload,
}

impl ProtocolResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            payload: ResponsePayload::Result(result),
        }
    }

    pub fn failure(id: Option<RequestId>, error: &AppError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            payload: ResponsePayload::Error(app_error_to_json_rpc(error)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.payload, ResponsePayload::Error(_))
    }

    pub fn error(&self) -> Option<&ProtocolError> {
        match &self.payload {
            ResponsePayload::Error(error) => Some(error),
            ResponsePayload::Result(_) => None,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.payload {
            ResponsePayload::Result(result) => Some(result),
            ResponsePayload::Error(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Request(ProtocolRequest),
    Notification(ProtocolNotification),
}

impl IncomingMessage {
    pub fn method(&self) -> &str {
        match self {
            Self::Request(request) => &request.method,
            Self::Notification(notification) => &notification.method,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            Self::Request(request) => request.params.as_ref(),
            Self::Notification(notification) => notification.params.as_ref(),
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(request) => Some(&request.id),
            Self::Notification(_) => None,
        }
    }
}

pub fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Classifies one frame. Failures come back as the response to send.
pub fn parse_message(line: &str) -> Result<IncomingMessage, ProtocolResponse> {
    let value: Value = serde_json::from_str(line).map_err(|err| {
        ProtocolResponse::failure(
            None,
            &AppError::Parse {
                message: err.to_string(),
            },
        )
    })?;

    let object = match value {
        Value::Object(object) => object,
        Value::Array(_) => return Err(invalid_request(None, "batch requests are not supported")),
        _ => return Err(invalid_request(None, "request must be a JSON object")),
    };

    let id = match object.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            value_to_request_id(raw)
                .ok_or_else(|| invalid_request(None, "id must be a string or an integer"))?,
        ),
    };

    match object.get("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        other => {
            let found = match other {
                Some(Value::String(version)) => version.clone(),
                Some(value) => value.to_string(),
                None => "missing".to_string(),
            };
            return Err(ProtocolResponse::failure(
                id,
                &AppError::InvalidVersion { found },
            ));
        }
    }

    let method = match object.get("method") {
        Some(Value::String(method)) if !method.trim().is_empty() => method.clone(),
        _ => return Err(invalid_request(id, "method must be a non-empty string")),
    };

    let params = params_of(&object).map_err(|message| invalid_request(id.clone(), message))?;

    match id {
        Some(id) => Ok(IncomingMessage::Request(ProtocolRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method,
            params,
        })),
        None if is_notification_method(&method) => {
            Ok(IncomingMessage::Notification(ProtocolNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params,
            }))
        }
        None => Err(invalid_request(None, "requests must carry an id")),
    }
}

fn params_of(object: &Map<String, Value>) -> Result<Option<Value>, &'static str> {
    match object.get("params") {
        None | Some(Value::Null) => Ok(None),
        Some(params @ (Value::Object(_) | Value::Array(_))) => Ok(Some(params.clone())),
        Some(_) => Err("params must be an object or an array"),
    }
}

fn invalid_request(id: Option<RequestId>, message: &str) -> ProtocolResponse {
    ProtocolResponse::failure(
        id,
        &AppError::InvalidRequest {
            message: message.to_string(),
        },
    )
}

pub fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(string_id) = value.as_str() {
        return Some(RequestId::String(string_id.to_string()));
    }

    value.as_i64().map(RequestId::Number)
}

pub fn app_error_to_json_rpc(err: &AppError) -> ProtocolError {
    let (code, message) = match err {
        AppError::Parse { .. } => (PARSE_ERROR, "Parse error"),
        AppError::InvalidRequest { .. } => (INVALID_REQUEST, "Invalid Request"),
        AppError::InvalidVersion { .. } => (INVALID_REQUEST, "Invalid version"),
        AppError::MethodNotFound { .. } | AppError::ToolNotFound { .. } => {
            (METHOD_NOT_FOUND, "Method not found")
        }
        AppError::Validation { .. } | AppError::QuerySyntax { .. } => {
            (INVALID_PARAMS, "Invalid params")
        }
        AppError::NotInitialized => (SERVER_NOT_INITIALIZED, "Server not initialized"),
        AppError::ResourceNotFound { .. } => (RESOURCE_NOT_FOUND, "Resource not found"),
        AppError::Unauthorized { .. } => (UNAUTHORIZED, "Unauthorized"),
        AppError::Forbidden { .. } => (UNAUTHORIZED, "Forbidden"),
        AppError::RateLimited { .. } => (SERVER_ERROR, "Rate limit exceeded"),
        AppError::Network { .. } => (SERVER_ERROR, "Upstream request failed"),
        AppError::Internal { .. } => (INTERNAL_ERROR, "Internal error"),
    };

    let reason = match err {
        AppError::Validation { code, .. } | AppError::Unauthorized { code, .. } => {
            Some((*code).to_string())
        }
        _ => None,
    };

    ProtocolError {
        code,
        message: message.to_string(),
        data: Some(ErrorData {
            kind: err.kind(),
            retryable: err.is_retryable(),
            retry_after: err.retry_after(),
            detail: Some(err.detail()),
            reason,
        }),
    }
}

pub fn to_line<T: Serialize>(message: &T) -> Result<String, AppError> {
    serde_json::to_string(message)
        .map_err(|err| AppError::internal(format!("failed to serialize frame: {err}")))
}

pub fn from_line<T: DeserializeOwned>(line: &str) -> Result<T, AppError> {
    serde_json::from_str(line).map_err(|err| AppError::Parse {
        message: err.to_string(),
    })
}

/// Always yields a valid frame, falling back to a static internal error.
pub fn encode_response(response: &ProtocolResponse) -> String {
    to_line(response).unwrap_or_else(|_| FALLBACK_RESPONSE.to_string())
}
