//! Argument decoding and result formatting shared by tools and resources

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use rust_mcp_sdk::schema::{CallToolResult, ContentBlock, TextContent, ToolInputSchema};
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::errors::AppError;

pub fn parse_arguments<T: DeserializeOwned>(arguments: Map<String, Value>) -> Result<T, AppError> {
    serde_json::from_value(Value::Object(arguments))
        .map_err(|err| AppError::bad_request("invalid_arguments", err.to_string()))
}

/// Accepts account ids sent either as JSON strings or integers.
pub fn account_id_value<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}

/// Tool input schema generated from an argument struct. Only `required` and
/// object-valued `properties` carry over.
pub fn input_schema_of<T: JsonSchema>() -> ToolInputSchema {
    let schema = serde_json::to_value(schemars::schema_for!(T)).unwrap_or(Value::Null);

    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(|name| name.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    let properties: Option<HashMap<String, Map<String, Value>>> = schema
        .get("properties")
        .and_then(Value::as_object)
        .map(|properties| {
            properties
                .iter()
                .filter_map(|(name, property)| {
                    property
                        .as_object()
                        .map(|property| (name.clone(), property.clone()))
                })
                .collect()
        });

    ToolInputSchema::new(required, properties, None)
}

pub fn generated_at_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Wraps a JSON payload as one text content block.
pub fn tool_result(payload: Value, is_error: bool) -> Result<Value, AppError> {
    serde_json::to_value(CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(
            payload.to_string(),
            None,
            None,
        ))],
        is_error: Some(is_error),
        meta: None,
        structured_content: payload.as_object().cloned(),
    })
    .map_err(|err| AppError::internal(format!("failed to serialize tool result: {err}")))
}
