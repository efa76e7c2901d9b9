//! Tools exposed via Model Context Protocol
//!
//! `nrql_query`, `build_nrql_query`, `validate_nrql` and `invalidate_cache`
//! delegate to the query service and the shared cache.

use rust_mcp_sdk::schema::{CallToolRequestParams, ListToolsResult, Tool, ToolInputSchema};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::utils::{account_id_value, input_schema_of, parse_arguments, tool_result};
use crate::{
    errors::AppError,
    query::{syntax, Query, QueryParams},
    AppState,
};

pub const NRQL_QUERY_TOOL: &str = "nrql_query";
pub const BUILD_NRQL_QUERY_TOOL: &str = "build_nrql_query";
pub const VALIDATE_NRQL_TOOL: &str = "validate_nrql";
pub const INVALIDATE_CACHE_TOOL: &str = "invalidate_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    NrqlQuery,
    BuildNrqlQuery,
    ValidateNrql,
    InvalidateCache,
}

impl ToolKind {
    pub const ALL: [ToolKind; 4] = [
        ToolKind::NrqlQuery,
        ToolKind::BuildNrqlQuery,
        ToolKind::ValidateNrql,
        ToolKind::InvalidateCache,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NrqlQuery => NRQL_QUERY_TOOL,
            Self::BuildNrqlQuery => BUILD_NRQL_QUERY_TOOL,
            Self::ValidateNrql => VALIDATE_NRQL_TOOL,
            Self::InvalidateCache => INVALIDATE_CACHE_TOOL,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::NrqlQuery => {
                "Run an NRQL query against a New Relic account. Results are cached for five \
                 minutes; a default LIMIT and time window are added unless optimize is false."
            }
            Self::BuildNrqlQuery => {
                "Assemble an NRQL query from structured select/from/where/facet parameters, \
                 optionally executing it."
            }
            Self::ValidateNrql => {
                "Check NRQL syntax locally, then dry-run it upstream with a one-row limit."
            }
            Self::InvalidateCache => {
                "Drop cached query results by key pattern (regex) and/or tags such as \
                 account:<id> or event_type:<name>."
            }
        }
    }

    fn input_schema(self) -> ToolInputSchema {
        match self {
            Self::NrqlQuery => input_schema_of::<NrqlQueryArgs>(),
            Self::BuildNrqlQuery => input_schema_of::<BuildNrqlQueryArgs>(),
            Self::ValidateNrql => input_schema_of::<ValidateNrqlArgs>(),
            Self::InvalidateCache => input_schema_of::<InvalidateCacheArgs>(),
        }
    }

    pub fn tool(self) -> Tool {
        Tool {
            name: self.name().to_string(),
            description: Some(self.description().to_string()),
            input_schema: self.input_schema(),
            output_schema: None,
            title: None,
            meta: None,
            annotations: None,
            execution: None,
            icons: vec![],
        }
    }
}

/// Tools are built once and never change afterwards.
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: ToolKind::ALL.into_iter().map(ToolKind::tool).collect(),
        }
    }

    pub fn tools(&self) -> &[Tool] {
        &self.tools
    }

    pub fn list_result(&self) -> Result<Value, AppError> {
        serde_json::to_value(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: self.tools.clone(),
        })
        .map_err(|err| AppError::internal(format!("failed to serialize tool list: {err}")))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct NrqlQueryArgs {
    /// NRQL text, e.g. `SELECT count(*) FROM Transaction SINCE 1 hour ago`.
    pub query: String,
    /// Account to query; defaults to NEW_RELIC_ACCOUNT_ID.
    #[serde(default, deserialize_with = "account_id_value")]
    #[schemars(with = "Option<String>")]
    pub account_id: Option<String>,
    /// Upstream timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u32>,
    /// Row limit appended when the query has no LIMIT clause.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Add a default LIMIT and time window when missing (default true).
    #[serde(default)]
    pub optimize: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct BuildNrqlQueryArgs {
    #[serde(flatten)]
    pub params: QueryParams,
    /// Run the built query and include its results.
    #[serde(default)]
    pub execute: Option<bool>,
    #[serde(default, deserialize_with = "account_id_value")]
    #[schemars(with = "Option<String>")]
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ValidateNrqlArgs {
    pub query: String,
    #[serde(default, deserialize_with = "account_id_value")]
    #[schemars(with = "Option<String>")]
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct InvalidateCacheArgs {
    /// Regular expression matched against cache keys.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Entries carrying any of these tags are removed.
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn handle_tools_call(state: &AppState, params: Option<Value>) -> Result<Value, AppError> {
    let raw_params = params
        .ok_or_else(|| AppError::bad_request("missing_params", "tools/call requires params"))?;
    let tool_call: CallToolRequestParams = serde_json::from_value(raw_params)
        .map_err(|err| AppError::bad_request("invalid_params", err.to_string()))?;

    let kind = ToolKind::from_name(&tool_call.name).ok_or_else(|| AppError::ToolNotFound {
        name: tool_call.name.clone(),
    })?;
    let arguments = tool_call.arguments.unwrap_or_default();
    debug!(tool = kind.name(), "dispatching tool call");

    match kind {
        ToolKind::NrqlQuery => nrql_query(state, parse_arguments(arguments)?).await,
        ToolKind::BuildNrqlQuery => build_nrql_query(state, parse_arguments(arguments)?).await,
        ToolKind::ValidateNrql => validate_nrql(state, parse_arguments(arguments)?).await,
        ToolKind::InvalidateCache => invalidate_cache(state, parse_arguments(arguments)?),
    }
}

async fn nrql_query(state: &AppState, args: NrqlQueryArgs) -> Result<Value, AppError> {
    let service = &state.query_service;
    let account_id = service.resolve_account(args.account_id.as_deref())?;

    let mut text = args.query.trim().trim_end_matches(';').trim_end().to_string();
    if let Some(limit) = args.limit {
        if !syntax::has_clause(&text, "LIMIT") {
            text = format!("{text} LIMIT {limit}");
        }
    }
    let optimize = args.optimize.unwrap_or(true);
    if optimize {
        text = service.optimize_query(&text);
    }

    let execution = service
        .execute_query(&Query {
            query: text,
            account_id,
            timeout: args.timeout,
            limit: args.limit,
        })
        .await?;

    let mut payload = to_payload(&execution)?;
    if let Value::Object(object) = &mut payload {
        object.insert("originalQuery".to_string(), json!(args.query));
        object.insert("optimized".to_string(), json!(optimize));
    }
    tool_result(payload, false)
}

async fn build_nrql_query(state: &AppState, args: BuildNrqlQueryArgs) -> Result<Value, AppError> {
    let service = &state.query_service;
    let query = service.build_query(&args.params)?;
    let mut payload = json!({ "query": query });

    if args.execute.unwrap_or(false) {
        let account_id = service.resolve_account(args.account_id.as_deref())?;
        let execution = service
            .execute_query(&Query::new(query, account_id))
            .await?;
        if let Value::Object(object) = &mut payload {
            object.insert("execution".to_string(), to_payload(&execution)?);
        }
    }

    tool_result(payload, false)
}

async fn validate_nrql(state: &AppState, args: ValidateNrqlArgs) -> Result<Value, AppError> {
    let service = &state.query_service;
    let account_id = service.resolve_account(args.account_id.as_deref())?;
    let validation = service.validate_query(&args.query, &account_id).await?;
    let is_error = !validation.valid;
    tool_result(to_payload(&validation)?, is_error)
}

fn invalidate_cache(state: &AppState, args: InvalidateCacheArgs) -> Result<Value, AppError> {
    let pattern = args
        .pattern
        .as_deref()
        .map(str::trim)
        .filter(|pattern| !pattern.is_empty());
    if pattern.is_none() && args.tags.is_empty() {
        return Err(AppError::bad_request(
            "missing_selector",
            "pattern or tags is required",
        ));
    }

    let by_pattern = match pattern {
        Some(pattern) => state.cache.invalidate_by_pattern(pattern)?,
        None => 0,
    };
    let by_tags = if args.tags.is_empty() {
        0
    } else {
        state.cache.invalidate_by_tags(&args.tags)
    };

    tool_result(
        json!({
            "removed": by_pattern + by_tags,
            "byPattern": by_pattern,
            "byTags": by_tags,
            "remaining": state.cache.len(),
        }),
        false,
    )
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::internal(format!("failed to serialize tool payload: {err}")))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{cache::CacheManager, query::tests::MockExecutor};

    fn state(rows: usize) -> (AppState, Arc<MockExecutor>) {
        let executor = Arc::new(MockExecutor::with_rows(rows));
        let state = AppState::new(
            executor.clone(),
            Arc::new(CacheManager::default()),
            Some("12345".to_string()),
        );
        (state, executor)
    }

    fn text_payload(result: &Value) -> Value {
        let text = result["content"][0]["text"].as_str().expect("text content");
        serde_json::from_str(text).expect("payload json")
    }

    #[test]
    fn nrql_query_schema_requires_query() {
        let registry = ToolRegistry::new();
        let tool = registry
            .tools()
            .iter()
            .find(|tool| tool.name == NRQL_QUERY_TOOL)
            .expect("nrql_query registered");

        assert_eq!(tool.input_schema.required, vec!["query".to_string()]);
        let properties = tool.input_schema.properties.as_ref().expect("properties");
        assert!(properties.contains_key("query"));
        assert!(properties.contains_key("account_id"));
    }

    #[test]
    fn list_result_serializes_sdk_tools() {
        let listed = ToolRegistry::new().list_result().expect("tool list");
        let nrql = &listed["tools"][0];
        assert_eq!(nrql["name"], json!(NRQL_QUERY_TOOL));
        assert_eq!(nrql["inputSchema"]["type"], json!("object"));
        assert_eq!(nrql["inputSchema"]["required"], json!(["query"]));
        assert!(nrql["inputSchema"]["properties"]["query"].is_object());
        assert!(nrql["description"].as_str().is_some_and(|text| text.contains("NRQL")));

        let build = &listed["tools"][1];
        assert_eq!(build["inputSchema"]["required"], json!(["from"]));
        assert!(build["inputSchema"]["properties"]["where"].is_object());
    }

    #[test]
    fn registry_lists_every_tool_in_order() {
        let names: Vec<String> = ToolRegistry::new()
            .tools()
            .iter()
            .map(|tool| tool.name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                NRQL_QUERY_TOOL,
                BUILD_NRQL_QUERY_TOOL,
                VALIDATE_NRQL_TOOL,
                INVALIDATE_CACHE_TOOL
            ]
        );
        assert_eq!(ToolKind::from_name("validate_nrql"), Some(ToolKind::ValidateNrql));
        assert_eq!(ToolKind::from_name("list_logs"), None);
    }

    #[tokio::test]
    async fn nrql_query_optimizes_and_reports_original() {
        let (state, executor) = state(2);
        let result = handle_tools_call(
            &state,
            Some(json!({
                "name": NRQL_QUERY_TOOL,
                "arguments": {"query": "SELECT * FROM Transaction"}
            })),
        )
        .await
        .expect("tool call");

        assert_eq!(result["isError"], json!(false));
        let payload = text_payload(&result);
        assert_eq!(payload["originalQuery"], json!("SELECT * FROM Transaction"));
        assert_eq!(
            payload["query"],
            json!("SELECT * FROM Transaction LIMIT 100 SINCE 1 hour ago")
        );
        assert_eq!(payload["summary"]["totalRows"], json!(2));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn explicit_limit_wins_over_default() {
        let (state, executor) = state(10);
        let result = handle_tools_call(
            &state,
            Some(json!({
                "name": NRQL_QUERY_TOOL,
                "arguments": {"query": "SELECT * FROM Log", "limit": 10, "account_id": 999}
            })),
        )
        .await
        .expect("tool call");

        let payload = text_payload(&result);
        assert_eq!(payload["query"], json!("SELECT * FROM Log LIMIT 10 SINCE 1 hour ago"));
        assert_eq!(payload["summary"]["moreResultsLikely"], json!(true));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_by_name() {
        let (state, _) = state(0);
        let error = handle_tools_call(&state, Some(json!({"name": "drop_tables"})))
            .await
            .expect_err("unknown tool");
        assert!(matches!(error, AppError::ToolNotFound { ref name } if name == "drop_tables"));
    }

    #[tokio::test]
    async fn missing_query_argument_is_invalid_params() {
        let (state, executor) = state(0);
        let error = handle_tools_call(
            &state,
            Some(json!({"name": NRQL_QUERY_TOOL, "arguments": {}})),
        )
        .await
        .expect_err("missing query");
        assert!(matches!(error, AppError::Validation { code: "invalid_arguments", .. }));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn build_tool_can_execute() {
        let (state, executor) = state(1);
        let result = handle_tools_call(
            &state,
            Some(json!({
                "name": BUILD_NRQL_QUERY_TOOL,
                "arguments": {
                    "select": ["count(*)"],
                    "from": "Transaction",
                    "where": {"appName": "web"},
                    "since": "1 hour ago",
                    "execute": true
                }
            })),
        )
        .await
        .expect("build");

        let payload = text_payload(&result);
        assert_eq!(
            payload["query"],
            json!("SELECT count(*) FROM Transaction WHERE appName = 'web' SINCE 1 hour ago")
        );
        assert_eq!(payload["execution"]["summary"]["cached"], json!(false));
        assert_eq!(executor.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_query_sets_is_error() {
        let (state, executor) = state(0);
        let result = handle_tools_call(
            &state,
            Some(json!({
                "name": VALIDATE_NRQL_TOOL,
                "arguments": {"query": "SELECT count(*"}
            })),
        )
        .await
        .expect("validation result");

        assert_eq!(result["isError"], json!(true));
        assert_eq!(text_payload(&result)["valid"], json!(false));
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn invalidate_cache_by_tag() {
        let (state, _) = state(1);
        handle_tools_call(
            &state,
            Some(json!({
                "name": NRQL_QUERY_TOOL,
                "arguments": {"query": "SELECT count(*) FROM PageView"}
            })),
        )
        .await
        .expect("query");
        assert_eq!(state.cache.len(), 1);

        let result = handle_tools_call(
            &state,
            Some(json!({
                "name": INVALIDATE_CACHE_TOOL,
                "arguments": {"tags": ["event_type:PageView"]}
            })),
        )
        .await
        .expect("invalidate");
        assert_eq!(text_payload(&result)["removed"], json!(1));
        assert!(state.cache.is_empty());

        let error = handle_tools_call(
            &state,
            Some(json!({"name": INVALIDATE_CACHE_TOOL, "arguments": {}})),
        )
        .await
        .expect_err("selector required");
        assert!(matches!(error, AppError::Validation { code: "missing_selector", .. }));
    }
}
