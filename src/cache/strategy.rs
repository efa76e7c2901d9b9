//! Named cache strategies and trigger-driven invalidation rules

use std::{collections::BTreeSet, time::Duration};

use regex::Regex;
use serde::Serialize;

use crate::errors::AppError;

pub const FAST_STRATEGY: &str = "fast";
pub const STANDARD_STRATEGY: &str = "standard";
pub const LONG_TERM_STRATEGY: &str = "long_term";
pub const LARGE_DATA_STRATEGY: &str = "large_data";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionPolicy {
    Lru,
    Lfu,
    Fifo,
    Ttl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStrategy {
    pub ttl: Duration,
    pub eviction: EvictionPolicy,
    /// Byte budget shared by every entry written under this strategy.
    pub max_size: Option<usize>,
    pub compress: bool,
}

impl CacheStrategy {
    pub fn new(ttl: Duration, eviction: EvictionPolicy) -> Self {
        Self {
            ttl,
            eviction,
            max_size: None,
            compress: false,
        }
    }

    pub fn with_max_size(mut self, bytes: usize) -> Self {
        self.max_size = Some(bytes);
        self
    }

    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }
}

pub fn default_strategies() -> Vec<(&'static str, CacheStrategy)> {
    vec![
        (
            FAST_STRATEGY,
            CacheStrategy::new(Duration::from_secs(60), EvictionPolicy::Lru),
        ),
        (
            STANDARD_STRATEGY,
            CacheStrategy::new(Duration::from_secs(300), EvictionPolicy::Lru),
        ),
        (
            LONG_TERM_STRATEGY,
            CacheStrategy::new(Duration::from_secs(3_600), EvictionPolicy::Lfu).compressed(),
        ),
        (
            LARGE_DATA_STRATEGY,
            CacheStrategy::new(Duration::from_secs(1_800), EvictionPolicy::Lru)
                .with_max_size(1024 * 1024)
                .compressed(),
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct InvalidationRule {
    pub pattern: Regex,
    pub triggers: BTreeSet<String>,
    /// Also drop entries sharing a tag with any directly matched entry.
    pub cascade: bool,
}

impl InvalidationRule {
    pub fn new<I, S>(pattern: &str, triggers: I, cascade: bool) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pattern = Regex::new(pattern).map_err(|_| {
            AppError::bad_request("invalid_pattern", "invalidation pattern is not a valid regex")
        })?;

        Ok(Self {
            pattern,
            triggers: triggers.into_iter().map(Into::into).collect(),
            cascade,
        })
    }

    pub fn applies_to(&self, trigger: &str) -> bool {
        self.triggers.contains(trigger)
    }
}
