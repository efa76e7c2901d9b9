use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// GraphQL document for the account-scoped NRQL field.
pub const NRQL_QUERY_DOCUMENT: &str = r#"query NrqlQuery($accountId: Int!, $nrql: Nrql!, $timeout: Seconds) {
  actor {
    account(id: $accountId) {
      nrql(query: $nrql, timeout: $timeout) {
        results
        metadata {
          eventTypes
          facets
          messages
        }
        performanceStats {
          inspectedCount
          omittedCount
          matchCount
          wallClockTime
        }
      }
    }
  }
}"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    #[serde(default)]
    pub results: Vec<Map<String, Value>>,
    #[serde(default)]
    pub metadata: QueryMetadata,
    #[serde(default)]
    pub performance_stats: PerformanceStats,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryMetadata {
    #[serde(default)]
    pub event_types: Vec<String>,
    #[serde(default)]
    pub facets: Vec<Value>,
    #[serde(default)]
    pub messages: Vec<DiagnosticMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DiagnosticMessage {
    Detailed { level: String, description: String },
    Text(String),
}

impl DiagnosticMessage {
    pub fn is_error(&self) -> bool {
        match self {
            Self::Detailed { level, .. } => level.eq_ignore_ascii_case("error"),
            Self::Text(text) => text.trim_start().to_ascii_lowercase().starts_with("error"),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Detailed { description, .. } => description,
            Self::Text(text) => text,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    #[serde(default)]
    pub inspected_count: u64,
    #[serde(default)]
    pub omitted_count: u64,
    #[serde(default, rename = "matchCount")]
    pub matched_count: u64,
    /// Milliseconds.
    #[serde(default)]
    pub wall_clock_time: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlResponse {
    pub data: Option<GraphQlData>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlData {
    pub actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Actor {
    pub account: Option<Account>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Account {
    pub nrql: Option<QueryResult>,
}

impl GraphQlResponse {
    pub(crate) fn into_query_result(self) -> Option<QueryResult> {
        self.data?.actor?.account?.nrql
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn diagnostic_messages_accept_both_shapes() {
        let metadata: QueryMetadata = serde_json::from_value(json!({
            "eventTypes": ["Transaction"],
            "messages": [
                {"level": "ERROR", "description": "Unknown function foo"},
                "Results may be incomplete",
                "Error: attribute missing"
            ]
        }))
        .expect("metadata should parse");

        let errors: Vec<&str> = metadata
            .messages
            .iter()
            .filter(|message| message.is_error())
            .map(DiagnosticMessage::text)
            .collect();
        assert_eq!(errors, vec!["Unknown function foo", "Error: attribute missing"]);
        assert!(metadata.facets.is_empty());
    }

    #[test]
    fn nested_graphql_payload_unwraps() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": {"actor": {"account": {"nrql": {
                "results": [{"count": 3}],
                "performanceStats": {"inspectedCount": 10, "matchCount": 3, "wallClockTime": 12}
            }}}}
        }))
        .expect("response should parse");

        let result = response.into_query_result().expect("nrql result");
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.performance_stats.matched_count, 3);
        assert_eq!(result.performance_stats.omitted_count, 0);
    }
}
