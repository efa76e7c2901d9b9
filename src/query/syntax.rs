//! Local, network-free NRQL analysis
//!
//! Keyword detection ignores string literals and anything nested inside
//! parentheses, so `filter(count(*), WHERE ...)` or `FROM (SELECT ...)` do not
//! confuse clause ordering.

use std::sync::OnceLock;

use regex::Regex;

pub const DEFAULT_LIMIT: u32 = 100;
pub const MAX_LIMIT: u32 = 5_000;
pub const DEFAULT_TIME_WINDOW: &str = "SINCE 1 hour ago";

const TRAILING_CLAUSES: [&str; 7] = [
    "FACET",
    "LIMIT",
    "SINCE",
    "UNTIL",
    "TIMESERIES",
    "ORDER BY",
    "COMPARE WITH",
];

const COMMENT_MARKERS: [&str; 3] = ["--", "//", "/*"];

const STOP_WORDS: [&str; 13] = [
    "SELECT",
    "WHERE",
    "FACET",
    "LIMIT",
    "SINCE",
    "UNTIL",
    "TIMESERIES",
    "ORDER",
    "COMPARE",
    "WITH",
    "AS",
    "EXTRAPOLATE",
    "OFFSET",
];

fn aggregate_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)\b(count|sum|average|avg|min|max|percentage|percentile|apdex|rate|stddev|uniquecount|median|latest)\s*\(",
        )
        .expect("aggregate pattern is valid")
    })
}

fn limit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\bLIMIT\s+(\d+|MAX)\b").expect("limit pattern is valid")
    })
}

/// Blanks the contents of quoted literals; reports whether a quote was left open.
fn strip_literals(text: &str) -> (String, bool) {
    let mut stripped = String::with_capacity(text.len());
    let mut open_quote: Option<char> = None;

    for character in text.chars() {
        match open_quote {
            Some(quote) if character == quote => {
                open_quote = None;
                stripped.push(character);
            }
            Some(_) => stripped.push(' '),
            None if matches!(character, '\'' | '"' | '`') => {
                open_quote = Some(character);
                stripped.push(character);
            }
            None => stripped.push(character),
        }
    }

    (stripped, open_quote.is_some())
}

fn blank_nested(text: &str) -> String {
    let mut depth = 0usize;
    text.chars()
        .map(|character| match character {
            '(' => {
                depth += 1;
                character
            }
            ')' => {
                depth = depth.saturating_sub(1);
                character
            }
            _ if depth > 0 => ' ',
            _ => character,
        })
        .collect()
}

fn top_level(text: &str) -> String {
    blank_nested(&strip_literals(text).0)
}

fn find_clause(top_level: &str, keyword: &str) -> Option<(usize, usize)> {
    let pattern = format!(r"(?i)\b{}\b", keyword.replace(' ', r"\s+"));
    Regex::new(&pattern)
        .ok()?
        .find(top_level)
        .map(|found| (found.start(), found.end()))
}

pub fn has_clause(text: &str, keyword: &str) -> bool {
    find_clause(&top_level(text), keyword).is_some()
}

/// True when a clause keyword appears outside literals and parentheses.
pub fn has_top_level_clause(text: &str) -> bool {
    let top = top_level(text);
    ["SELECT", "FROM", "WHERE"]
        .iter()
        .chain(TRAILING_CLAUSES.iter())
        .chain(["OFFSET", "EXTRAPOLATE", "WITH TIMEZONE"].iter())
        .any(|keyword| find_clause(&top, keyword).is_some())
}

pub fn has_aggregate(text: &str) -> bool {
    aggregate_pattern().is_match(&strip_literals(text).0)
}

/// The numeric LIMIT of the outer query; `LIMIT MAX` reads as [`MAX_LIMIT`].
pub fn limit_value(text: &str) -> Option<u32> {
    let top = top_level(text);
    let captures = limit_pattern().captures(&top)?;
    let raw = captures.get(1)?.as_str();
    if raw.eq_ignore_ascii_case("max") {
        Some(MAX_LIMIT)
    } else {
        raw.parse().ok()
    }
}

pub fn event_types(text: &str) -> Vec<String> {
    let top = top_level(text);
    let Some((_, from_end)) = find_clause(&top, "FROM") else {
        return Vec::new();
    };

    let mut names = Vec::new();
    for token in top[from_end..].split_whitespace() {
        if STOP_WORDS
            .iter()
            .any(|stop| token.eq_ignore_ascii_case(stop))
        {
            break;
        }
        names.extend(
            token
                .split(',')
                .filter(|name| {
                    !name.is_empty()
                        && name
                            .chars()
                            .all(|character| character.is_ascii_alphanumeric() || character == '_')
                })
                .map(str::to_string),
        );
    }
    names
}

/// Structural errors; an empty list means the query may be sent upstream.
pub fn check_syntax(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return vec!["query must not be empty".to_string()];
    }

    let mut errors = Vec::new();
    let (stripped, unterminated) = strip_literals(trimmed);
    if unterminated {
        errors.push("unterminated string literal".to_string());
    }

    let mut depth: i64 = 0;
    for character in stripped.chars() {
        match character {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    break;
                }
            }
            _ => {}
        }
    }
    if depth < 0 {
        errors.push("unexpected closing parenthesis".to_string());
    } else if depth > 0 {
        errors.push("unbalanced parentheses: missing ')'".to_string());
    }

    let top = blank_nested(&stripped);
    let select = find_clause(&top, "SELECT");
    let from = find_clause(&top, "FROM");

    if select.is_none() {
        errors.push("missing SELECT clause".to_string());
    }
    if from.is_none() {
        errors.push("missing FROM clause".to_string());
    }

    let leading = top.trim_start().to_ascii_uppercase();
    if !leading.starts_with("SELECT") && !leading.starts_with("FROM") {
        errors.push("query must start with SELECT or FROM".to_string());
    }

    if let (Some((where_start, _)), Some((from_start, _))) = (find_clause(&top, "WHERE"), from) {
        if where_start < from_start {
            errors.push("WHERE must follow the FROM clause".to_string());
        }
    }

    if let (Some((select_start, _)), Some((from_start, _))) = (select, from) {
        let body_start = select_start.max(from_start);
        for keyword in TRAILING_CLAUSES {
            if let Some((start, _)) = find_clause(&top, keyword) {
                if start < body_start {
                    errors.push(format!("{keyword} must follow the SELECT and FROM clauses"));
                }
            }
        }
    }

    if find_clause(&top, "LIMIT").is_some() && limit_pattern().find(&top).is_none() {
        errors.push("LIMIT must be followed by a number or MAX".to_string());
    }

    errors
}

/// Non-fatal observations reported alongside a successful validation.
pub fn lint(text: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if !has_clause(text, "SINCE") && !has_clause(text, "UNTIL") {
        warnings.push("no SINCE/UNTIL clause; NRQL defaults to the last hour".to_string());
    }

    match limit_value(text) {
        Some(limit) if limit > MAX_LIMIT => {
            warnings.push(format!("LIMIT above {MAX_LIMIT} is capped by NRQL"));
        }
        None if !has_aggregate(text) => {
            warnings.push(format!(
                "no LIMIT clause; NRQL returns at most {DEFAULT_LIMIT} rows"
            ));
        }
        _ => {}
    }

    warnings
}

/// Appends a default row limit (unless aggregated) and a default time window.
/// Running it on its own output changes nothing.
pub fn optimize_query(text: &str) -> String {
    if !accepts_suffix(text) {
        return text.trim().to_string();
    }
    let mut optimized = text.trim().trim_end_matches(';').trim_end().to_string();

    if !has_clause(&optimized, "LIMIT") && !has_aggregate(&optimized) {
        optimized.push_str(&format!(" LIMIT {DEFAULT_LIMIT}"));
    }
    if !has_clause(&optimized, "SINCE") && !has_clause(&optimized, "UNTIL") {
        optimized.push(' ');
        optimized.push_str(DEFAULT_TIME_WINDOW);
    }

    optimized
}

/// False when appended text would land inside an open literal or a comment.
fn accepts_suffix(text: &str) -> bool {
    let (stripped, open_quote) = strip_literals(text);
    !open_quote && !COMMENT_MARKERS.iter().any(|marker| stripped.contains(marker))
}

/// Caps the row count for a validation dry run.
pub fn with_row_cap(text: &str) -> String {
    if !accepts_suffix(text) {
        return text.trim().to_string();
    }
    let trimmed = text.trim().trim_end_matches(';').trim_end();
    if has_clause(trimmed, "LIMIT") {
        trimmed.to_string()
    } else {
        format!("{trimmed} LIMIT 1")
    }
}
