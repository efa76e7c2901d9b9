//! NRQL query service: validation, optimization, building and cached execution
//!
//! Local syntax checks run before any network I/O. A successful execution is
//! cached under a key derived from the full [`Query`], so repeating the same
//! query inside the cache TTL never reaches NerdGraph.

pub mod builder;
pub mod syntax;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub use builder::{build_query, QueryParams};
pub use syntax::optimize_query;

use crate::{
    cache::{strategy::STANDARD_STRATEGY, CacheManager},
    errors::AppError,
    nerdgraph::{client::parse_account_id, NrqlExecutor, QueryResult},
};

pub const QUERY_CACHE_STRATEGY: &str = STANDARD_STRATEGY;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    pub query: String,
    pub account_id: String,
    pub timeout: Option<u32>,
    pub limit: Option<u32>,
}

impl Query {
    pub fn new(query: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            account_id: account_id.into(),
            timeout: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub total_rows: usize,
    /// Row count reached the requested limit.
    pub more_results_likely: bool,
    /// Milliseconds, as reported upstream.
    pub wall_clock_time: u64,
    pub rows_scanned: u64,
    pub cached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryExecution {
    /// NRQL text that was sent upstream.
    pub query: String,
    #[serde(flatten)]
    pub result: QueryResult,
    pub summary: QuerySummary,
}

pub struct QueryService {
    executor: Arc<dyn NrqlExecutor>,
    cache: Arc<CacheManager>,
    default_account_id: Option<String>,
}

impl QueryService {
    pub fn new(
        executor: Arc<dyn NrqlExecutor>,
        cache: Arc<CacheManager>,
        default_account_id: Option<String>,
    ) -> Self {
        Self {
            executor,
            cache,
            default_account_id,
        }
    }

    pub fn resolve_account(&self, requested: Option<&str>) -> Result<String, AppError> {
        let account_id = requested
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_account_id.clone())
            .ok_or_else(|| {
                AppError::bad_request(
                    "missing_account_id",
                    "account_id is required when NEW_RELIC_ACCOUNT_ID is not set",
                )
            })?;
        parse_account_id(&account_id)?;
        Ok(account_id)
    }

    /// Local checks first; only a locally valid query is dry-run upstream.
    pub async fn validate_query(
        &self,
        text: &str,
        account_id: &str,
    ) -> Result<ValidationResult, AppError> {
        let errors = syntax::check_syntax(text);
        let mut warnings = syntax::lint(text);
        if !errors.is_empty() {
            return Ok(ValidationResult {
                valid: false,
                errors,
                warnings,
            });
        }

        let dry_run = syntax::with_row_cap(text);
        match self.executor.execute_nrql(account_id, &dry_run, None).await {
            Ok(result) => {
                let (remote_errors, remote_warnings): (Vec<_>, Vec<_>) = result
                    .metadata
                    .messages
                    .iter()
                    .partition(|message| message.is_error());
                warnings.extend(remote_warnings.iter().map(|message| message.text().to_string()));
                let errors: Vec<String> = remote_errors
                    .iter()
                    .map(|message| message.text().to_string())
                    .collect();
                Ok(ValidationResult {
                    valid: errors.is_empty(),
                    errors,
                    warnings,
                })
            }
            Err(AppError::QuerySyntax { message }) => Ok(ValidationResult {
                valid: false,
                errors: vec![message],
                warnings,
            }),
            Err(error) => Err(error),
        }
    }

    pub async fn execute_query(&self, query: &Query) -> Result<QueryExecution, AppError> {
        let errors = syntax::check_syntax(&query.query);
        if !errors.is_empty() {
            return Err(AppError::query_syntax(errors.join("; ")));
        }
        parse_account_id(&query.account_id)?;

        let key = cache_key(query)?;
        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_value::<QueryExecution>(cached) {
                Ok(mut execution) => {
                    debug!(cache_key = %key, "query served from cache");
                    execution.summary.cached = true;
                    return Ok(execution);
                }
                Err(err) => {
                    warn!(cache_key = %key, error = %err, "dropping unreadable cached result");
                    self.cache.delete(&key);
                }
            }
        }

        let nrql = match query.limit {
            Some(limit) if !syntax::has_clause(&query.query, "LIMIT") => {
                format!("{} LIMIT {limit}", query.query.trim().trim_end_matches(';'))
            }
            _ => query.query.trim().to_string(),
        };
        let requested_limit = query.limit.or_else(|| syntax::limit_value(&nrql));

        let result = self
            .executor
            .execute_nrql(&query.account_id, &nrql, query.timeout)
            .await?;

        let total_rows = result.results.len();
        let summary = QuerySummary {
            total_rows,
            more_results_likely: requested_limit
                .is_some_and(|limit| total_rows as u64 == u64::from(limit)),
            wall_clock_time: result.performance_stats.wall_clock_time,
            rows_scanned: result.performance_stats.inspected_count,
            cached: false,
        };
        info!(
            account_id = %query.account_id,
            rows = total_rows,
            wall_clock_ms = summary.wall_clock_time,
            "nrql query executed"
        );

        let execution = QueryExecution {
            query: nrql,
            result,
            summary,
        };
        self.store(&key, query, &execution);
        Ok(execution)
    }

    pub fn build_query(&self, params: &QueryParams) -> Result<String, AppError> {
        builder::build_query(params)
    }

    pub fn optimize_query(&self, text: &str) -> String {
        syntax::optimize_query(text)
    }

    /// Cache write failures are logged, never surfaced.
    fn store(&self, key: &str, query: &Query, execution: &QueryExecution) {
        let value = match serde_json::to_value(execution) {
            Ok(value) => value,
            Err(err) => {
                warn!(cache_key = %key, error = %err, "failed to serialize query result for cache");
                return;
            }
        };

        let mut tags = vec![format!("account:{}", query.account_id), "nrql".to_string()];
        tags.extend(
            syntax::event_types(&query.query)
                .into_iter()
                .map(|event_type| format!("event_type:{event_type}")),
        );

        if let Err(err) = self
            .cache
            .set_with_strategy(key, value, QUERY_CACHE_STRATEGY, tags)
        {
            warn!(cache_key = %key, error = %err, "failed to cache query result");
        }
    }
}

pub fn cache_key(query: &Query) -> Result<String, AppError> {
    let canonical = serde_json::to_vec(query)
        .map_err(|err| AppError::internal(format!("failed to encode query: {err}")))?;
    Ok(format!(
        "nrql:{}:{:x}",
        query.account_id,
        Sha256::digest(&canonical)
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use serde_json::{json, Map};

    use super::*;
    use crate::nerdgraph::{ClientHealth, DiagnosticMessage, PerformanceStats, QueryMetadata};

    /// Scripted executor counting upstream calls.
    pub(crate) struct MockExecutor {
        pub calls: AtomicUsize,
        pub last_nrql: Mutex<Option<String>>,
        pub rows: usize,
        pub messages: Vec<DiagnosticMessage>,
        pub failure: Option<AppError>,
    }

    impl MockExecutor {
        pub(crate) fn with_rows(rows: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                last_nrql: Mutex::new(None),
                rows,
                messages: Vec::new(),
                failure: None,
            }
        }

        pub(crate) fn failing(error: AppError) -> Self {
            Self {
                failure: Some(error),
                ..Self::with_rows(0)
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl NrqlExecutor for MockExecutor {
        async fn execute_nrql(
            &self,
            _account_id: &str,
            nrql: &str,
            _timeout_secs: Option<u32>,
        ) -> Result<QueryResult, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_nrql.lock().expect("mock lock") = Some(nrql.to_string());
            if let Some(error) = &self.failure {
                return Err(error.clone());
            }
            let results = (0..self.rows)
                .map(|index| {
                    let mut row = Map::new();
                    row.insert("count".to_string(), json!(index));
                    row
                })
                .collect();
            Ok(QueryResult {
                results,
                metadata: QueryMetadata {
                    event_types: vec!["Transaction".to_string()],
                    facets: Vec::new(),
                    messages: self.messages.clone(),
                },
                performance_stats: PerformanceStats {
                    inspected_count: 1_000,
                    omitted_count: 0,
                    matched_count: self.rows as u64,
                    wall_clock_time: 42,
                },
            })
        }

        fn health(&self) -> ClientHealth {
            ClientHealth {
                total_requests: self.calls() as u64,
                ..ClientHealth::default()
            }
        }
    }

    fn service(executor: Arc<MockExecutor>) -> (QueryService, Arc<CacheManager>) {
        let cache = Arc::new(CacheManager::default());
        (
            QueryService::new(executor, Arc::clone(&cache), Some("12345".to_string())),
            cache,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_query_hits_cache_within_ttl() {
        let executor = Arc::new(MockExecutor::with_rows(3));
        let (service, cache) = service(Arc::clone(&executor));
        let query = Query::new("SELECT count(*) FROM Transaction", "12345");

        let first = service.execute_query(&query).await.expect("first run");
        let second = service.execute_query(&query).await.expect("second run");

        assert_eq!(executor.calls(), 1);
        assert!(!first.summary.cached);
        assert!(second.summary.cached);
        assert_eq!(first.result, second.result);
        assert_eq!(cache.metrics().hits, 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        service.execute_query(&query).await.expect("after expiry");
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn different_parameters_use_different_keys() {
        let executor = Arc::new(MockExecutor::with_rows(1));
        let (service, _) = service(Arc::clone(&executor));
        let mut query = Query::new("SELECT count(*) FROM Transaction", "12345");
        service.execute_query(&query).await.expect("first");
        query.timeout = Some(30);
        service.execute_query(&query).await.expect("second");
        assert_eq!(executor.calls(), 2);
    }

    #[tokio::test]
    async fn syntax_errors_never_reach_network() {
        let executor = Arc::new(MockExecutor::with_rows(1));
        let (service, _) = service(Arc::clone(&executor));

        let error = service
            .execute_query(&Query::new("SELECT count(* FROM Transaction", "12345"))
            .await
            .expect_err("unbalanced parentheses");
        assert!(matches!(error, AppError::QuerySyntax { .. }));

        let validation = service
            .validate_query("SELECT count(*)", "12345")
            .await
            .expect("validation runs");
        assert!(!validation.valid);
        assert_eq!(validation.errors, vec!["missing FROM clause".to_string()]);
        assert_eq!(executor.calls(), 0);
    }

    #[tokio::test]
    async fn summary_reports_limit_saturation() {
        let executor = Arc::new(MockExecutor::with_rows(5));
        let (service, cache) = service(Arc::clone(&executor));
        let mut query = Query::new("SELECT * FROM Transaction", "12345");
        query.limit = Some(5);

        let execution = service.execute_query(&query).await.expect("query");
        assert_eq!(execution.query, "SELECT * FROM Transaction LIMIT 5");
        assert_eq!(
            execution.summary,
            QuerySummary {
                total_rows: 5,
                more_results_likely: true,
                wall_clock_time: 42,
                rows_scanned: 1_000,
                cached: false,
            }
        );

        assert_eq!(cache.invalidate_by_tags(&["event_type:Transaction"]), 1);
    }

    #[tokio::test]
    async fn upstream_errors_are_not_cached() {
        let executor = Arc::new(MockExecutor::failing(AppError::network("upstream down")));
        let (service, cache) = service(Arc::clone(&executor));
        let query = Query::new("SELECT count(*) FROM Transaction", "12345");

        let error = service.execute_query(&query).await.expect_err("network");
        assert!(matches!(error, AppError::Network { .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn validation_dry_run_caps_rows_and_reports_messages() {
        let executor = Arc::new(MockExecutor {
            messages: vec![
                DiagnosticMessage::Detailed {
                    level: "ERROR".to_string(),
                    description: "Unknown attribute foo".to_string(),
                },
                DiagnosticMessage::Text("Results may be sampled".to_string()),
            ],
            ..MockExecutor::with_rows(0)
        });
        let (service, _) = service(Arc::clone(&executor));

        let validation = service
            .validate_query("SELECT foo FROM Transaction SINCE 1 day ago", "12345")
            .await
            .expect("validation");

        assert!(!validation.valid);
        assert_eq!(validation.errors, vec!["Unknown attribute foo".to_string()]);
        assert!(validation
            .warnings
            .contains(&"Results may be sampled".to_string()));
        assert_eq!(
            executor.last_nrql.lock().expect("lock").as_deref(),
            Some("SELECT foo FROM Transaction SINCE 1 day ago LIMIT 1")
        );
    }

    #[tokio::test]
    async fn remote_syntax_errors_mark_query_invalid() {
        let executor = Arc::new(MockExecutor::failing(AppError::query_syntax(
            "NRQL Syntax Error: unknown function",
        )));
        let (service, _) = service(executor);
        let validation = service
            .validate_query("SELECT bogus(x) FROM Transaction", "12345")
            .await
            .expect("validation");
        assert!(!validation.valid);
        assert_eq!(validation.errors.len(), 1);
    }

    #[test]
    fn account_resolution_prefers_argument() {
        let (service, _) = service(Arc::new(MockExecutor::with_rows(0)));
        assert_eq!(service.resolve_account(Some("777")).expect("explicit"), "777");
        assert_eq!(service.resolve_account(None).expect("default"), "12345");
        assert!(service.resolve_account(Some("abc")).is_err());

        let cache = Arc::new(CacheManager::default());
        let bare = QueryService::new(Arc::new(MockExecutor::with_rows(0)), cache, None);
        let error = bare.resolve_account(None).expect_err("no account");
        assert!(matches!(error, AppError::Validation { code: "missing_account_id", .. }));
    }

    #[test]
    fn cache_key_is_account_scoped_and_stable() {
        let query = Query::new("SELECT 1 FROM T", "42");
        let key = cache_key(&query).expect("key");
        assert!(key.starts_with("nrql:42:"));
        assert_eq!(key.len(), "nrql:42:".len() + 64);
        assert_eq!(key, cache_key(&query.clone()).expect("key"));
    }
}
