//! Read-only resources under `newrelic://` URIs
//!
//! Exposes cache metrics, NerdGraph client health and a static NRQL reference.

use rust_mcp_sdk::schema::{
    ListResourcesResult, ReadResourceContent, ReadResourceRequestParams, ReadResourceResult,
    Resource, TextResourceContents,
};
use serde_json::{json, Value};

use crate::domain::utils::generated_at_utc;
use crate::query::syntax::{DEFAULT_LIMIT, DEFAULT_TIME_WINDOW, MAX_LIMIT};
use crate::{errors::AppError, AppState};

pub const CACHE_METRICS_URI: &str = "newrelic://cache/metrics";
pub const CLIENT_HEALTH_URI: &str = "newrelic://client/health";
pub const NRQL_REFERENCE_URI: &str = "newrelic://nrql/reference";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    CacheMetrics,
    ClientHealth,
    NrqlReference,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::CacheMetrics,
        ResourceKind::ClientHealth,
        ResourceKind::NrqlReference,
    ];

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uri() == uri)
    }

    pub fn uri(self) -> &'static str {
        match self {
            Self::CacheMetrics => CACHE_METRICS_URI,
            Self::ClientHealth => CLIENT_HEALTH_URI,
            Self::NrqlReference => NRQL_REFERENCE_URI,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::CacheMetrics => "Cache Metrics",
            Self::ClientHealth => "NerdGraph Client Health",
            Self::NrqlReference => "NRQL Reference",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::CacheMetrics => "Hit/miss counters, eviction totals and current size of the query cache",
            Self::ClientHealth => "Last successful call and rate-limit headroom reported by NerdGraph",
            Self::NrqlReference => "Clauses, aggregate functions and defaults applied by the query optimizer",
        }
    }

    fn resource(self) -> Resource {
        Resource {
            annotations: None,
            description: Some(self.description().to_string()),
            icons: vec![],
            meta: None,
            mime_type: Some("application/json".to_string()),
            name: self.name().to_string(),
            size: None,
            title: None,
            uri: self.uri().to_string(),
        }
    }

    fn contents(self, state: &AppState) -> Value {
        match self {
            Self::CacheMetrics => json!({
                "metrics": state.cache.metrics(),
                "generatedAtUtc": generated_at_utc(),
            }),
            Self::ClientHealth => json!({
                "health": state.executor.health(),
                "generatedAtUtc": generated_at_utc(),
            }),
            Self::NrqlReference => nrql_reference(),
        }
    }
}

pub fn build_resources_list() -> Vec<Resource> {
    ResourceKind::ALL
        .into_iter()
        .map(ResourceKind::resource)
        .collect()
}

pub fn list_result(resources: &[Resource]) -> Result<Value, AppError> {
    serde_json::to_value(ListResourcesResult {
        meta: None,
        next_cursor: None,
        resources: resources.to_vec(),
    })
    .map_err(|err| AppError::internal(format!("failed to serialize resource list: {err}")))
}

pub fn handle_resources_read(state: &AppState, params: Option<Value>) -> Result<Value, AppError> {
    let raw_params = params
        .ok_or_else(|| AppError::bad_request("missing_params", "resources/read requires params"))?;
    let resource_read: ReadResourceRequestParams = serde_json::from_value(raw_params)
        .map_err(|err| AppError::bad_request("invalid_params", err.to_string()))?;

    let kind =
        ResourceKind::from_uri(&resource_read.uri).ok_or_else(|| AppError::ResourceNotFound {
            uri: resource_read.uri.clone(),
        })?;

    serde_json::to_value(ReadResourceResult {
        contents: vec![ReadResourceContent::from(TextResourceContents {
            meta: None,
            mime_type: Some("application/json".to_string()),
            text: kind.contents(state).to_string(),
            uri: kind.uri().to_string(),
        })],
        meta: None,
    })
    .map_err(|err| AppError::internal(format!("failed to serialize resource: {err}")))
}

fn nrql_reference() -> Value {
    json!({
        "clauses": [
            "SELECT", "FROM", "WHERE", "FACET", "ORDER BY", "LIMIT",
            "SINCE", "UNTIL", "TIMESERIES", "COMPARE WITH"
        ],
        "aggregates": [
            "count", "sum", "average", "min", "max", "percentage", "percentile",
            "apdex", "rate", "stddev", "uniqueCount", "median", "latest"
        ],
        "whereOperators": {
            "eq": "=", "ne": "!=", "gt": ">", "gte": ">=", "lt": "<", "lte": "<=",
            "like": "LIKE", "not_like": "NOT LIKE", "in": "IN", "not_in": "NOT IN"
        },
        "defaults": {
            "limit": DEFAULT_LIMIT,
            "maxLimit": MAX_LIMIT,
            "timeWindow": DEFAULT_TIME_WINDOW,
        },
        "examples": [
            "SELECT count(*) FROM Transaction FACET appName SINCE 1 day ago",
            "SELECT average(duration) FROM Transaction WHERE appName = 'checkout' TIMESERIES",
            "SELECT * FROM Log WHERE level = 'error' LIMIT 50 SINCE 30 minutes ago"
        ]
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{cache::CacheManager, query::tests::MockExecutor};

    fn state() -> AppState {
        AppState::new(
            Arc::new(MockExecutor::with_rows(0)),
            Arc::new(CacheManager::default()),
            None,
        )
    }

    fn read_text(result: &Value) -> Value {
        let text = result["contents"][0]["text"].as_str().expect("text");
        serde_json::from_str(text).expect("json")
    }

    #[test]
    fn lists_all_resources() {
        let uris: Vec<String> = build_resources_list()
            .into_iter()
            .map(|resource| resource.uri)
            .collect();
        assert_eq!(uris, vec![CACHE_METRICS_URI, CLIENT_HEALTH_URI, NRQL_REFERENCE_URI]);
    }

    #[test]
    fn reads_cache_metrics() {
        let state = state();
        state
            .cache
            .set("k", json!(1), std::time::Duration::from_secs(60));
        state.cache.get("k");

        let result =
            handle_resources_read(&state, Some(json!({"uri": CACHE_METRICS_URI}))).expect("read");
        assert_eq!(result["contents"][0]["uri"], json!(CACHE_METRICS_URI));
        assert_eq!(result["contents"][0]["mimeType"], json!("application/json"));
        let body = read_text(&result);
        assert_eq!(body["metrics"]["hits"], json!(1));
        assert_eq!(body["metrics"]["entries"], json!(1));
    }

    #[test]
    fn reads_reference() {
        let result = handle_resources_read(&state(), Some(json!({"uri": NRQL_REFERENCE_URI})))
            .expect("read");
        assert_eq!(read_text(&result)["defaults"]["limit"], json!(100));
    }

    #[test]
    fn unknown_uri_is_resource_not_found() {
        let error = handle_resources_read(&state(), Some(json!({"uri": "newrelic://nope"})))
            .expect_err("unknown");
        assert!(matches!(error, AppError::ResourceNotFound { ref uri } if uri == "newrelic://nope"));
    }
}
