use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

pub const US_NERDGRAPH_URL: &str = "https://api.newrelic.com/graphql";
pub const EU_NERDGRAPH_URL: &str = "https://api.eu.newrelic.com/graphql";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub account_id: Option<String>,
    pub nerdgraph_url: String,
    pub request_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub transport: TransportKind,
    pub bind_addr: String,
    pub bind_port: u16,
    pub mcp_api_token: Option<String>,
    pub rate_limit_per_minute: u32,
    pub cache_max_entries: usize,
    pub cache_sweep_interval: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("NEW_RELIC_API_KEY is required and must not be empty")]
    MissingApiKey,
    #[error("NEW_RELIC_ACCOUNT_ID must be numeric")]
    InvalidAccountId,
    #[error("NEW_RELIC_REGION must be one of: US, EU")]
    InvalidRegion,
    #[error("MCP_TRANSPORT must be one of: stdio, http")]
    InvalidTransport,
    #[error("{0} must be a valid non-negative integer")]
    InvalidNumber(&'static str),
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let api_key = value("NEW_RELIC_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let account_id = value("NEW_RELIC_ACCOUNT_ID")
            .map(|id| {
                if id.chars().all(|character| character.is_ascii_digit()) {
                    Ok(id)
                } else {
                    Err(ConfigError::InvalidAccountId)
                }
            })
            .transpose()?;

        let region_url = match value("NEW_RELIC_REGION")
            .map(|region| region.to_ascii_uppercase())
            .as_deref()
        {
            None | Some("US") => US_NERDGRAPH_URL,
            Some("EU") => EU_NERDGRAPH_URL,
            _ => return Err(ConfigError::InvalidRegion),
        };
        let nerdgraph_url =
            value("NEW_RELIC_NERDGRAPH_URL").unwrap_or_else(|| region_url.to_string());

        let transport = match value("MCP_TRANSPORT")
            .map(|transport| transport.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("stdio") => TransportKind::Stdio,
            Some("http") => TransportKind::Http,
            _ => return Err(ConfigError::InvalidTransport),
        };

        let number = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            value(name)
                .map(|raw| {
                    raw.parse::<u64>()
                        .map_err(|_| ConfigError::InvalidNumber(name))
                })
                .transpose()
                .map(|parsed| parsed.unwrap_or(default))
        };

        let bind_port = value("BIND_PORT")
            .map(|port| port.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let retry_attempts = u32::try_from(number("NEW_RELIC_RETRY_ATTEMPTS", 3)?)
            .map_err(|_| ConfigError::InvalidNumber("NEW_RELIC_RETRY_ATTEMPTS"))?;
        let rate_limit_per_minute = u32::try_from(number("MCP_RATE_LIMIT_PER_MINUTE", 60)?)
            .map_err(|_| ConfigError::InvalidNumber("MCP_RATE_LIMIT_PER_MINUTE"))?;
        let cache_max_entries = usize::try_from(number("CACHE_MAX_ENTRIES", 1_000)?)
            .map_err(|_| ConfigError::InvalidNumber("CACHE_MAX_ENTRIES"))?;

        let config = Self {
            api_key,
            account_id,
            nerdgraph_url,
            request_timeout: Duration::from_secs(number("NEW_RELIC_TIMEOUT_SECS", 30)?),
            retry_attempts,
            retry_base_delay: Duration::from_millis(number(
                "NEW_RELIC_RETRY_BASE_DELAY_MS",
                1_000,
            )?),
            transport,
            bind_addr: value("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port,
            mcp_api_token: value("MCP_API_TOKEN"),
            rate_limit_per_minute,
            cache_max_entries,
            cache_sweep_interval: Duration::from_secs(number("CACHE_SWEEP_INTERVAL_SECS", 60)?),
        };

        if config.transport == TransportKind::Http {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}
