use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use super::syntax::{self, MAX_LIMIT};
use crate::errors::AppError;

/// Structured description of a query, compiled by [`build_query`].
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct QueryParams {
    /// Attributes or aggregate expressions; defaults to `*`.
    #[serde(default)]
    pub select: Vec<String>,
    /// Event type(s), comma separated.
    pub from: String,
    /// Attribute conditions. A scalar means equality, an array means IN, null
    /// means IS NULL and an object maps operators (eq, ne, gt, gte, lt, lte,
    /// like, not_like, in, not_in) to operands.
    #[serde(default, rename = "where")]
    pub where_conditions: Map<String, Value>,
    #[serde(default)]
    pub facet: Vec<String>,
    /// Expression with optional ASC/DESC.
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Time expression such as `1 day ago`.
    #[serde(default)]
    pub since: Option<String>,
    #[serde(default)]
    pub until: Option<String>,
    /// Bucket size such as `5 minutes`, or `auto`; empty for the NRQL default.
    #[serde(default)]
    pub timeseries: Option<String>,
}

pub fn build_query(params: &QueryParams) -> Result<String, AppError> {
    let from = params.from.trim();
    if from.is_empty() {
        return Err(AppError::bad_request("invalid_from", "from must not be empty"));
    }
    let event_types = from
        .split(',')
        .map(str::trim)
        .map(|name| {
            if is_identifier(name) {
                Ok(name)
            } else {
                Err(AppError::bad_request(
                    "invalid_from",
                    format!("invalid event type '{name}'"),
                ))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    let select = if params.select.is_empty() {
        "*".to_string()
    } else {
        for expression in &params.select {
            check_expression("select", expression)?;
        }
        params.select.join(", ")
    };

    let mut query = format!("SELECT {select} FROM {}", event_types.join(", "));

    let mut fields: Vec<(&String, &Value)> = params.where_conditions.iter().collect();
    fields.sort_by(|left, right| left.0.cmp(right.0));
    let conditions = fields
        .into_iter()
        .map(|(field, value)| compile_condition(field, value))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    if !conditions.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&conditions.join(" AND "));
    }

    if !params.facet.is_empty() {
        let fields = params
            .facet
            .iter()
            .map(|field| quote_field(field))
            .collect::<Result<Vec<_>, _>>()?;
        query.push_str(" FACET ");
        query.push_str(&fields.join(", "));
    }

    if let Some(order_by) = &params.order_by {
        check_expression("order_by", order_by)?;
        query.push_str(" ORDER BY ");
        query.push_str(order_by.trim());
    }

    if let Some(limit) = params.limit {
        if limit == 0 || limit > MAX_LIMIT {
            return Err(AppError::bad_request(
                "invalid_limit",
                format!("limit must be between 1 and {MAX_LIMIT}"),
            ));
        }
        query.push_str(&format!(" LIMIT {limit}"));
    }

    if let Some(since) = &params.since {
        query.push_str(" SINCE ");
        query.push_str(&time_expression("since", since)?);
    }
    if let Some(until) = &params.until {
        query.push_str(" UNTIL ");
        query.push_str(&time_expression("until", until)?);
    }

    if let Some(bucket) = &params.timeseries {
        let bucket = bucket.trim();
        query.push_str(" TIMESERIES");
        if !bucket.is_empty() {
            query.push(' ');
            query.push_str(&time_expression("timeseries", bucket)?);
        }
    }

    let errors = syntax::check_syntax(&query);
    if !errors.is_empty() {
        return Err(AppError::query_syntax(errors.join("; ")));
    }
    Ok(query)
}

fn is_identifier(name: &str) -> bool {
    let mut characters = name.chars();
    matches!(characters.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
        && characters.all(|character| character.is_ascii_alphanumeric() || character == '_')
}

/// Attribute names outside `[A-Za-z0-9_.]` are backtick quoted.
fn quote_field(field: &str) -> Result<String, AppError> {
    let field = field.trim();
    if field.is_empty() || field.contains('`') {
        return Err(AppError::bad_request(
            "invalid_field",
            format!("invalid attribute name '{field}'"),
        ));
    }
    if field
        .chars()
        .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '.'))
    {
        Ok(field.to_string())
    } else {
        Ok(format!("`{field}`"))
    }
}

/// Free-form expressions may not smuggle in literals, statement separators
/// or clauses of their own.
fn check_expression(name: &'static str, expression: &str) -> Result<(), AppError> {
    let trimmed = expression.trim();
    let rejected = trimmed.is_empty()
        || trimmed
            .chars()
            .any(|character| matches!(character, '\'' | '"' | ';' | '\n' | '\r'))
        || syntax::has_top_level_clause(trimmed);
    if rejected || !syntax::check_syntax(&format!("SELECT {trimmed} FROM T")).is_empty() {
        return Err(AppError::bad_request(
            "invalid_expression",
            format!("{name} contains an invalid expression: {trimmed}"),
        ));
    }
    Ok(())
}

fn time_expression(name: &'static str, raw: &str) -> Result<String, AppError> {
    let trimmed = raw.trim();
    let allowed = !trimmed.is_empty()
        && trimmed.chars().all(|character| {
            character.is_ascii_alphanumeric() || matches!(character, ' ' | ':' | '-' | '+' | '.')
        });
    if !allowed {
        return Err(AppError::bad_request(
            "invalid_time",
            format!("{name} must be a plain time expression"),
        ));
    }
    Ok(trimmed.to_string())
}

fn literal(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(format!("'{}'", text.replace('\'', "''"))),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}

fn membership(field: &str, operator: &str, operand: &Value) -> Option<String> {
    let Value::Array(items) = operand else {
        return literal(operand).map(|single| format!("{field} {operator} ({single})"));
    };
    let literals: Vec<String> = items.iter().filter_map(literal).collect();
    if literals.is_empty() {
        warn!(field, operator, "skipping membership condition without scalar operands");
        return None;
    }
    Some(format!("{field} {operator} ({})", literals.join(", ")))
}

fn compile_condition(field: &str, value: &Value) -> Result<Vec<String>, AppError> {
    let quoted = quote_field(field)?;
    let fragments = match value {
        Value::Null => vec![format!("{quoted} IS NULL")],
        Value::Array(_) => membership(&quoted, "IN", value).into_iter().collect(),
        Value::Object(operators) => {
            let mut operators: Vec<(&String, &Value)> = operators.iter().collect();
            operators.sort_by(|left, right| left.0.cmp(right.0));
            operators
                .into_iter()
                .filter_map(|(operator, operand)| compile_operator(&quoted, operator, operand))
                .collect()
        }
        scalar => literal(scalar)
            .map(|operand| format!("{quoted} = {operand}"))
            .into_iter()
            .collect(),
    };
    Ok(fragments)
}

fn compile_operator(field: &str, operator: &str, operand: &Value) -> Option<String> {
    let symbol = match operator {
        "in" => return membership(field, "IN", operand),
        "not_in" => return membership(field, "NOT IN", operand),
        "eq" if operand.is_null() => return Some(format!("{field} IS NULL")),
        "ne" if operand.is_null() => return Some(format!("{field} IS NOT NULL")),
        "eq" => "=",
        "ne" => "!=",
        "gt" => ">",
        "gte" => ">=",
        "lt" => "<",
        "lte" => "<=",
        "like" => "LIKE",
        "not_like" => "NOT LIKE",
        unknown => {
            warn!(field, operator = unknown, "ignoring unknown where operator");
            return None;
        }
    };

    match literal(operand) {
        Some(operand) => Some(format!("{field} {symbol} {operand}")),
        None => {
            warn!(field, operator, "skipping condition with non-scalar operand");
            None
        }
    }
}
