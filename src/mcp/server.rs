//! The central Model Context Protocol engine
//!
//! Owns the lifecycle state machine (`Uninitialized -> Initialized -> ShutDown`),
//! capability negotiation and method dispatch into tools and resources.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, ProtocolVersion, Resource, ServerCapabilities,
    ServerCapabilitiesResources, ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{
    resources::{self, build_resources_list, handle_resources_read},
    tools::{handle_tools_call, ToolRegistry},
};
use crate::mcp::rpc::{
    IncomingMessage, ProtocolNotification, ProtocolRequest, ProtocolResponse,
};
use crate::{errors::AppError, AppState};

pub const SUPPORTED_PROTOCOL_VERSION: &str = "2024-11-05";

const INSTRUCTIONS: &str = "Query New Relic with NRQL. Use validate_nrql before running \
unfamiliar queries; nrql_query caches identical queries for five minutes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Initialize,
    Ping,
    Shutdown,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
}

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialize" => Some(Self::Initialize),
            "ping" => Some(Self::Ping),
            "shutdown" => Some(Self::Shutdown),
            "tools/list" => Some(Self::ToolsList),
            "tools/call" => Some(Self::ToolsCall),
            "resources/list" => Some(Self::ResourcesList),
            "resources/read" => Some(Self::ResourcesRead),
            _ => None,
        }
    }
}

pub struct ProtocolHandler {
    state: AppState,
    lifecycle: Mutex<Lifecycle>,
    tools: ToolRegistry,
    resources: Vec<Resource>,
}

impl ProtocolHandler {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
            tools: ToolRegistry::new(),
            resources: build_resources_list(),
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lock_lifecycle()
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests always produce a response; notifications never do.
    pub async fn dispatch(&self, message: IncomingMessage) -> Option<ProtocolResponse> {
        match message {
            IncomingMessage::Request(request) => Some(self.handle_request(request).await),
            IncomingMessage::Notification(notification) => {
                self.handle_notification(&notification);
                None
            }
        }
    }

    pub async fn handle_request(&self, request: ProtocolRequest) -> ProtocolResponse {
        let id = request.id.clone();
        match self.route(request).await {
            Ok(result) => ProtocolResponse::success(id, result),
            Err(err) => ProtocolResponse::failure(Some(id), &err),
        }
    }

    async fn route(&self, request: ProtocolRequest) -> Result<Value, AppError> {
        let method = Method::from_name(&request.method).ok_or_else(|| AppError::MethodNotFound {
            method: request.method.clone(),
        })?;

        if !matches!(method, Method::Initialize | Method::Shutdown) {
            self.ensure_initialized()?;
        }

        match method {
            Method::Initialize => self.initialize(request.params.as_ref()),
            Method::Shutdown => self.shutdown(),
            Method::Ping => Ok(json!({})),
            Method::ToolsList => self.tools.list_result(),
            Method::ToolsCall => handle_tools_call(&self.state, request.params).await,
            Method::ResourcesList => resources::list_result(&self.resources),
            Method::ResourcesRead => handle_resources_read(&self.state, request.params),
        }
    }

    fn ensure_initialized(&self) -> Result<(), AppError> {
        match self.lifecycle() {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Uninitialized | Lifecycle::ShutDown => Err(AppError::NotInitialized),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Result<Value, AppError> {
        let mut lifecycle = self.lock_lifecycle();
        match *lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => {
                return Err(AppError::InvalidRequest {
                    message: "server already initialized".to_string(),
                })
            }
            Lifecycle::ShutDown => return Err(AppError::NotInitialized),
        }

        let protocol_version = negotiate_protocol_version(params)?;

        let initialize_result = InitializeResult {
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: None,
                description: None,
                icons: vec![],
                website_url: None,
            },
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
                resources: Some(ServerCapabilitiesResources {
                    subscribe: Some(false),
                    list_changed: Some(false),
                }),
                prompts: None,
                ..Default::default()
            },
            protocol_version: protocol_version.into(),
            instructions: Some(INSTRUCTIONS.to_string()),
            meta: None,
        };

        let result = serde_json::to_value(initialize_result).map_err(|err| {
            AppError::internal(format!("failed to serialize initialize result: {err}"))
        })?;
        *lifecycle = Lifecycle::Initialized;
        info!(protocol_version = SUPPORTED_PROTOCOL_VERSION, "mcp session initialized");
        Ok(result)
    }

    fn shutdown(&self) -> Result<Value, AppError> {
        let mut lifecycle = self.lock_lifecycle();
        match *lifecycle {
            Lifecycle::Uninitialized => Err(AppError::NotInitialized),
            Lifecycle::Initialized => {
                *lifecycle = Lifecycle::ShutDown;
                info!("mcp session shut down");
                Ok(json!({}))
            }
            Lifecycle::ShutDown => Ok(json!({})),
        }
    }

    fn handle_notification(&self, notification: &ProtocolNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => debug!("client reported initialized"),
            "notifications/cancelled" => {
                let params = notification.params.as_ref();
                let request_id = params
                    .and_then(|params| params.get("requestId"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let reason = params
                    .and_then(|params| params.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                info!(
                    request_id = %request_id,
                    reason,
                    "cancellation requested; in-flight work runs to completion"
                );
            }
            other => debug!(method = other, "ignoring unknown notification"),
        }
    }
}

pub fn negotiate_protocol_version(params: Option<&Value>) -> Result<ProtocolVersion, AppError> {
    let offered_version = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .ok_or_else(|| {
            AppError::bad_request(
                "invalid_protocol_version",
                "initialize params.protocolVersion is required",
            )
        })?;

    if offered_version != SUPPORTED_PROTOCOL_VERSION {
        return Err(AppError::bad_request(
            "unsupported_protocol_version",
            format!(
                "unsupported protocolVersion {offered_version}; this server speaks {SUPPORTED_PROTOCOL_VERSION}"
            ),
        ));
    }

    Ok(ProtocolVersion::V2024_11_05)
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "bearer" | "api_key" | "apikey" | "api-key" | "x-api-key"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}
