use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    retry::{with_retry, RetryPolicy},
    types::{GraphQlResponse, QueryResult, NRQL_QUERY_DOCUMENT},
};
use crate::{config::Config, errors::AppError};

const API_KEY_HEADER: &str = "API-Key";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHealth {
    pub last_success_at: Option<String>,
    pub rate_limit_remaining: Option<u64>,
    pub rate_limit_reset: Option<u64>,
    pub total_requests: u64,
    pub failed_requests: u64,
}

#[async_trait]
pub trait NrqlExecutor: Send + Sync {
    async fn execute_nrql(
        &self,
        account_id: &str,
        nrql: &str,
        timeout_secs: Option<u32>,
    ) -> Result<QueryResult, AppError>;

    fn health(&self) -> ClientHealth;
}

pub struct NerdGraphClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry: RetryPolicy,
    health: Mutex<ClientHealth>,
}

impl NerdGraphClient {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        request_timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            retry,
            health: Mutex::new(ClientHealth::default()),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(
            config.nerdgraph_url.clone(),
            config.api_key.clone(),
            config.request_timeout,
            RetryPolicy::new(config.retry_attempts, config.retry_base_delay),
        )
    }

    fn update_health(&self, update: impl FnOnce(&mut ClientHealth)) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut health);
    }

    async fn send_once(&self, body: &Value, attempt: u32) -> Result<QueryResult, AppError> {
        intercept_request(&self.endpoint, attempt);
        let started = Instant::now();

        let response = self
            .http
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        self.intercept_response(status, response.headers(), started.elapsed());

        if !(200..300).contains(&status) {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_status(status, retry_after, &body));
        }

        let payload: GraphQlResponse = response.json().await.map_err(|err| {
            AppError::internal(format!("failed to decode nerdgraph response: {err}"))
        })?;

        if let Some(first) = payload.errors.first() {
            return Err(map_graphql_error(&first.message));
        }

        payload
            .into_query_result()
            .ok_or_else(|| AppError::internal("nerdgraph response did not contain nrql results"))
    }

    fn intercept_response(&self, status: u16, headers: &HeaderMap, elapsed: Duration) {
        let remaining = header_u64(headers, RATE_LIMIT_REMAINING_HEADER);
        let reset = header_u64(headers, RATE_LIMIT_RESET_HEADER);
        if remaining.is_some() || reset.is_some() {
            self.update_health(|health| {
                health.rate_limit_remaining = remaining.or(health.rate_limit_remaining);
                health.rate_limit_reset = reset.or(health.rate_limit_reset);
            });
        }

        info!(
            status,
            duration_ms = elapsed.as_millis() as u64,
            rate_limit_remaining = remaining,
            "nerdgraph response"
        );
    }
}

fn intercept_request(endpoint: &str, attempt: u32) {
    debug!(endpoint, attempt, "nerdgraph request");
}

#[async_trait]
impl NrqlExecutor for NerdGraphClient {
    async fn execute_nrql(
        &self,
        account_id: &str,
        nrql: &str,
        timeout_secs: Option<u32>,
    ) -> Result<QueryResult, AppError> {
        let account_id = parse_account_id(account_id)?;
        let body = json!({
            "query": NRQL_QUERY_DOCUMENT,
            "variables": {
                "accountId": account_id,
                "nrql": nrql,
                "timeout": timeout_secs,
            },
        });

        let body = &body;
        let result = with_retry(&self.retry, |attempt| async move {
            self.send_once(body, attempt).await
        })
        .await;

        match &result {
            Ok(_) => {
                let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
                self.update_health(|health| {
                    health.total_requests += 1;
                    health.last_success_at = Some(now);
                });
            }
            Err(error) => {
                warn!(account_id, error = %error, "nerdgraph query failed");
                self.update_health(|health| {
                    health.total_requests += 1;
                    health.failed_requests += 1;
                });
            }
        }

        result
    }

    fn health(&self) -> ClientHealth {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub fn parse_account_id(account_id: &str) -> Result<i64, AppError> {
    account_id
        .trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            AppError::bad_request("invalid_account_id", "account_id must be a positive integer")
        })
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, reqwest::header::RETRY_AFTER.as_str())
}

fn map_transport_error(err: reqwest::Error) -> AppError {
    if err.is_timeout() {
        AppError::network("nerdgraph request timed out")
    } else if err.is_connect() {
        AppError::network(format!("failed to connect to nerdgraph: {err}"))
    } else {
        AppError::network(format!("nerdgraph request failed: {err}"))
    }
}

fn map_http_status(status: u16, retry_after: Option<u64>, body: &str) -> AppError {
    match status {
        401 => AppError::unauthorized("invalid_api_key", "nerdgraph rejected the api key"),
        403 => AppError::Forbidden {
            message: "api key is not permitted to query this account".to_string(),
        },
        429 => AppError::rate_limited("nerdgraph rate limit exceeded", retry_after),
        500 | 502 | 503 | 504 => AppError::network(format!("nerdgraph returned HTTP {status}")),
        _ => {
            let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
            AppError::internal(format!("nerdgraph returned HTTP {status}: {body}"))
        }
    }
}

fn map_graphql_error(message: &str) -> AppError {
    if message.to_ascii_lowercase().contains("syntax") {
        AppError::query_syntax(message)
    } else {
        AppError::internal(message)
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::errors::ErrorKind;

    fn success_body() -> Value {
        json!({
            "data": {"actor": {"account": {"nrql": {
                "results": [{"count": 42}],
                "metadata": {"eventTypes": ["Transaction"], "facets": [], "messages": []},
                "performanceStats": {
                    "inspectedCount": 1200,
                    "omittedCount": 0,
                    "matchCount": 42,
                    "wallClockTime": 18
                }
            }}}}
        })
    }

    fn client(server: &MockServer, retries: u32) -> NerdGraphClient {
        NerdGraphClient::new(
            format!("{}/graphql", server.uri()),
            "NRAK-test",
            Duration::from_secs(5),
            RetryPolicy::new(retries, Duration::from_millis(10)),
        )
        .expect("client should build")
    }

    #[tokio::test]
    async fn executes_query_and_tracks_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(header("API-Key", "NRAK-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-ratelimit-remaining", "99")
                    .insert_header("x-ratelimit-reset", "1700000000")
                    .set_body_json(success_body()),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 3);
        let result = client
            .execute_nrql("12345", "SELECT count(*) FROM Transaction", Some(10))
            .await
            .expect("query should succeed");

        assert_eq!(result.results[0]["count"], 42);
        assert_eq!(result.metadata.event_types, vec!["Transaction".to_string()]);
        assert_eq!(result.performance_stats.inspected_count, 1200);

        let health = client.health();
        assert_eq!(health.rate_limit_remaining, Some(99));
        assert_eq!(health.rate_limit_reset, Some(1_700_000_000));
        assert!(health.last_success_at.is_some());
        assert_eq!(health.total_requests, 1);
    }

    #[tokio::test]
    async fn honors_retry_after_on_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "2"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(success_body()))
            .mount(&server)
            .await;

        let client = client(&server, 3);
        let started = Instant::now();
        let result = client
            .execute_nrql("12345", "SELECT count(*) FROM Transaction", None)
            .await;

        assert!(result.is_ok(), "expected Ok, got: {:?}", result.err());
        assert!(started.elapsed() >= Duration::from_secs(2));
        let requests = server.received_requests().await.expect("recording enabled");
        assert_eq!(requests.len(), 2);
    }

    #[tokio::test]
    async fn exhausted_server_errors_surface_as_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let error = client(&server, 2)
            .execute_nrql("12345", "SELECT count(*) FROM Transaction", None)
            .await
            .expect_err("503 should exhaust retries");

        assert_eq!(error.kind(), ErrorKind::NetworkError);
        assert!(error.is_retryable());
    }

    #[tokio::test]
    async fn authentication_failures_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, 3);
        let error = client
            .execute_nrql("12345", "SELECT count(*) FROM Transaction", None)
            .await
            .expect_err("401 should fail");

        assert_eq!(error.kind(), ErrorKind::AuthenticationError);
        assert_eq!(client.health().failed_requests, 1);
    }

    #[tokio::test]
    async fn graphql_errors_surface_first_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": null,
                "errors": [
                    {"message": "NRQL Syntax Error: Error at line 1 position 8"},
                    {"message": "second error"}
                ]
            })))
            .mount(&server)
            .await;

        let error = client(&server, 0)
            .execute_nrql("12345", "SELECT FROM", None)
            .await
            .expect_err("graphql errors fail the call");

        assert_eq!(error.kind(), ErrorKind::QuerySyntaxError);
        assert!(error.detail().starts_with("NRQL Syntax Error"));
    }

    #[test]
    fn account_id_must_be_positive_integer() {
        assert_eq!(parse_account_id(" 42 ").expect("valid"), 42);
        assert!(parse_account_id("abc").is_err());
        assert!(parse_account_id("0").is_err());
    }

    #[test]
    fn status_mapping_covers_taxonomy() {
        assert_eq!(map_http_status(403, None, "").kind(), ErrorKind::AuthorizationError);
        assert_eq!(map_http_status(429, Some(7), "").retry_after(), Some(7));
        assert_eq!(map_http_status(502, None, "").kind(), ErrorKind::NetworkError);
        assert_eq!(
            map_http_status(400, None, "bad").kind(),
            ErrorKind::InternalServerError
        );
    }
}
