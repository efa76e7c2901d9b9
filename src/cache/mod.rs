//! In-memory cache for NRQL query results
//!
//! A single [`CacheManager`] owns every entry, the named strategies, the
//! invalidation rules and the running metrics. All of it sits behind one mutex,
//! so a metrics reset can never interleave with a read or a write.
//!
//! Entries expire lazily: a read of an entry older than its TTL removes it and
//! reports a miss. [`CacheManager::spawn_sweeper`] additionally purges expired
//! entries on a fixed period.

pub mod compression;
pub mod metrics;
pub mod strategy;

use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use regex::Regex;
use serde_json::Value;
use tokio::{task::JoinHandle, time::Instant};
use tracing::debug;

use crate::errors::AppError;
use metrics::{CacheCounters, CacheMetricsSnapshot, KeyMetrics, PerKeyMetrics};
use strategy::{default_strategies, CacheStrategy, EvictionPolicy, InvalidationRule};

pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

#[derive(Debug, Clone)]
enum StoredValue {
    Plain(Value),
    Compressed(String),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    key: String,
    value: StoredValue,
    ttl: Duration,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    size: usize,
    compressed: bool,
    tags: BTreeSet<String>,
    strategy: Option<String>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }

    fn expires_at(&self) -> Instant {
        self.created_at + self.ttl
    }

    fn value(&self) -> Value {
        match &self.value {
            StoredValue::Plain(value) => value.clone(),
            StoredValue::Compressed(blob) => compression::decompress(blob),
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    strategies: HashMap<String, CacheStrategy>,
    rules: Vec<InvalidationRule>,
    counters: CacheCounters,
    key_metrics: PerKeyMetrics,
}

pub struct CacheManager {
    state: Mutex<CacheState>,
    max_entries: usize,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl CacheManager {
    pub fn new(max_entries: usize) -> Self {
        let mut state = CacheState::default();
        for (name, strategy) in default_strategies() {
            state.strategies.insert(name.to_string(), strategy);
        }

        Self {
            state: Mutex::new(state),
            max_entries: max_entries.max(1),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let started = std::time::Instant::now();
        let now = Instant::now();
        let mut guard = self.state();
        let state = &mut *guard;

        let expired = state.entries.get(key).map(|entry| entry.is_expired(now));
        let value = match expired {
            Some(false) => state.entries.get_mut(key).map(|entry| {
                entry.last_accessed = now;
                entry.access_count += 1;
                entry.value()
            }),
            Some(true) => {
                Self::drop_entry(state, key);
                state.counters.expirations += 1;
                None
            }
            None => None,
        };

        state
            .counters
            .record_lookup(value.is_some(), started.elapsed());
        if value.is_some() {
            if let Some(key_metrics) = state.key_metrics.get_mut(key) {
                key_metrics.hits += 1;
            }
        }

        value
    }

    pub fn set(&self, key: &str, value: Value, ttl: Duration) {
        let size = value.to_string().len();
        let now = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            value: StoredValue::Plain(value),
            ttl,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size,
            compressed: false,
            tags: BTreeSet::new(),
            strategy: None,
        };

        let mut state = self.state();
        Self::insert(&mut state, entry, EvictionPolicy::Lru, None, self.max_entries);
    }

    /// Writes `value` under a registered strategy. An unknown strategy, or a
    /// value larger than the strategy's byte budget, writes nothing.
    pub fn set_with_strategy<I, S>(
        &self,
        key: &str,
        value: Value,
        strategy_name: &str,
        tags: I,
    ) -> Result<(), AppError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state();
        let strategy = state.strategies.get(strategy_name).cloned().ok_or_else(|| {
            AppError::bad_request(
                "unknown_cache_strategy",
                format!("cache strategy '{strategy_name}' is not registered"),
            )
        })?;

        let (stored, size) = if strategy.compress {
            let blob = compression::compress(&value)?;
            let size = blob.len();
            (StoredValue::Compressed(blob), size)
        } else {
            let size = value.to_string().len();
            (StoredValue::Plain(value), size)
        };

        if let Some(max_size) = strategy.max_size {
            if size > max_size {
                return Err(AppError::bad_request(
                    "cache_entry_too_large",
                    format!("entry of {size} bytes exceeds the {max_size} byte budget of '{strategy_name}'"),
                ));
            }
        }

        let now = Instant::now();
        let entry = CacheEntry {
            key: key.to_string(),
            compressed: matches!(stored, StoredValue::Compressed(_)),
            value: stored,
            ttl: strategy.ttl,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size,
            tags: tags.into_iter().map(Into::into).collect(),
            strategy: Some(strategy_name.to_string()),
        };

        Self::insert(
            &mut state,
            entry,
            strategy.eviction,
            strategy.max_size,
            self.max_entries,
        );
        Ok(())
    }

    fn insert(
        state: &mut CacheState,
        entry: CacheEntry,
        policy: EvictionPolicy,
        max_size: Option<usize>,
        max_entries: usize,
    ) {
        let key = entry.key.clone();
        let strategy = entry.strategy.clone();
        let now = entry.created_at;

        state.entries.insert(key.clone(), entry);
        state.counters.sets += 1;
        state.key_metrics.entry(key.clone()).or_default().writes += 1;

        if let (Some(strategy), Some(max_size)) = (strategy.as_deref(), max_size) {
            loop {
                let used: usize = state
                    .entries
                    .values()
                    .filter(|entry| entry.strategy.as_deref() == Some(strategy))
                    .map(|entry| entry.size)
                    .sum();
                if used <= max_size {
                    break;
                }

                let victim = pick_victim(
                    policy,
                    state.entries.values().filter(|entry| {
                        entry.strategy.as_deref() == Some(strategy) && entry.key != key
                    }),
                );
                let Some(victim) = victim else { break };
                Self::evict(state, &victim, "strategy_size_limit");
            }
        }

        if state.entries.len() > max_entries {
            Self::purge_expired(state, now);
        }
        while state.entries.len() > max_entries {
            let victim = pick_victim(
                policy,
                state.entries.values().filter(|entry| entry.key != key),
            );
            let Some(victim) = victim else { break };
            Self::evict(state, &victim, "capacity");
        }
    }

    /// Removes an entry together with its per-key metrics.
    fn drop_entry(state: &mut CacheState, key: &str) -> bool {
        state.key_metrics.remove(key);
        state.entries.remove(key).is_some()
    }

    fn evict(state: &mut CacheState, key: &str, reason: &'static str) {
        if Self::drop_entry(state, key) {
            state.counters.evictions += 1;
            debug!(key, reason, "cache entry evicted");
        }
    }

    fn purge_expired(state: &mut CacheState, now: Instant) -> usize {
        let expired: Vec<String> = state
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key.clone())
            .collect();
        for key in &expired {
            Self::drop_entry(state, key);
        }
        state.counters.expirations += expired.len() as u64;
        expired.len()
    }

    fn remove_keys(state: &mut CacheState, keys: impl IntoIterator<Item = String>) -> usize {
        let mut removed = 0;
        for key in keys {
            if Self::drop_entry(state, &key) {
                state.counters.deletes += 1;
                removed += 1;
            }
        }
        removed
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state();
        Self::remove_keys(&mut state, [key.to_string()]) == 1
    }

    pub fn invalidate_by_pattern(&self, pattern: &str) -> Result<usize, AppError> {
        let pattern = Regex::new(pattern).map_err(|_| {
            AppError::bad_request("invalid_pattern", "invalidation pattern is not a valid regex")
        })?;

        let mut state = self.state();
        let doomed: Vec<String> = state
            .entries
            .keys()
            .filter(|key| pattern.is_match(key))
            .cloned()
            .collect();
        Ok(Self::remove_keys(&mut state, doomed))
    }

    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let mut state = self.state();
        let doomed: Vec<String> = state
            .entries
            .values()
            .filter(|entry| tags.iter().any(|tag| entry.tags.contains(tag.as_ref())))
            .map(|entry| entry.key.clone())
            .collect();
        Self::remove_keys(&mut state, doomed)
    }

    pub fn register_strategy(&self, name: &str, strategy: CacheStrategy) {
        self.state().strategies.insert(name.to_string(), strategy);
    }

    pub fn strategy(&self, name: &str) -> Option<CacheStrategy> {
        self.state().strategies.get(name).cloned()
    }

    pub fn add_invalidation_rule(&self, rule: InvalidationRule) {
        self.state().rules.push(rule);
    }

    /// Applies every rule listening for `event` and returns how many entries went away.
    pub fn trigger(&self, event: &str) -> usize {
        let mut guard = self.state();
        let state = &mut *guard;

        let mut doomed = BTreeSet::new();
        for rule in state.rules.iter().filter(|rule| rule.applies_to(event)) {
            let matched: Vec<&CacheEntry> = state
                .entries
                .values()
                .filter(|entry| rule.pattern.is_match(&entry.key))
                .collect();

            if rule.cascade {
                let tags: BTreeSet<&String> =
                    matched.iter().flat_map(|entry| entry.tags.iter()).collect();
                doomed.extend(
                    state
                        .entries
                        .values()
                        .filter(|entry| entry.tags.iter().any(|tag| tags.contains(tag)))
                        .map(|entry| entry.key.clone()),
                );
            }
            doomed.extend(matched.into_iter().map(|entry| entry.key.clone()));
        }

        let removed = Self::remove_keys(state, doomed);
        if removed > 0 {
            debug!(event, removed, "cache invalidation rule fired");
        }
        removed
    }

    pub fn sweep_expired(&self) -> usize {
        let mut state = self.state();
        Self::purge_expired(&mut state, Instant::now())
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.entries.clear();
        state.key_metrics.clear();
    }

    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        let state = self.state();
        let total_size = state.entries.values().map(|entry| entry.size).sum();
        state.counters.snapshot(state.entries.len(), total_size)
    }

    pub fn key_metrics(&self, key: &str) -> Option<KeyMetrics> {
        self.state().key_metrics.get(key).cloned()
    }

    pub fn reset_metrics(&self) {
        let mut state = self.state();
        state.counters = CacheCounters::default();
        state.key_metrics.clear();
    }

    /// Periodically drops expired entries until the cache itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let period = period.max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "expired cache entries swept");
                }
            }
            debug!("cache sweeper stopped");
        })
    }
}

fn pick_victim<'a>(
    policy: EvictionPolicy,
    candidates: impl Iterator<Item = &'a CacheEntry>,
) -> Option<String> {
    let victim = match policy {
        EvictionPolicy::Lru => candidates.min_by_key(|entry| entry.last_accessed),
        EvictionPolicy::Lfu => {
            candidates.min_by_key(|entry| (entry.access_count, entry.last_accessed))
        }
        EvictionPolicy::Fifo => candidates.min_by_key(|entry| entry.created_at),
        EvictionPolicy::Ttl => candidates.min_by_key(|entry| entry.expires_at()),
    };
    victim.map(|entry| entry.key.clone())
}
