//! Running cache counters and their serializable snapshot.

use std::{collections::HashMap, time::Duration};

use serde::Serialize;

#[derive(Debug, Default, Clone)]
pub(crate) struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub total_get_time: Duration,
}

/// Counters for one live entry; dropped together with the entry.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetrics {
    pub hits: u64,
    pub writes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub average_response_time_us: f64,
    pub entries: usize,
    pub total_size_bytes: usize,
}

impl CacheCounters {
    pub(crate) fn record_lookup(&mut self, hit: bool, elapsed: Duration) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        self.total_get_time += elapsed;
    }

    pub(crate) fn snapshot(&self, entries: usize, total_size_bytes: usize) -> CacheMetricsSnapshot {
        let lookups = self.hits + self.misses;
        let (hit_rate, miss_rate, average_response_time_us) = if lookups == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let lookups = lookups as f64;
            (
                self.hits as f64 / lookups,
                self.misses as f64 / lookups,
                self.total_get_time.as_micros() as f64 / lookups,
            )
        };

        CacheMetricsSnapshot {
            hits: self.hits,
            misses: self.misses,
            sets: self.sets,
            deletes: self.deletes,
            evictions: self.evictions,
            expirations: self.expirations,
            hit_rate,
            miss_rate,
            average_response_time_us,
            entries,
            total_size_bytes,
        }
    }
}

pub(crate) type PerKeyMetrics = HashMap<String, KeyMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_counters_report_zero_rates() {
        let snapshot = CacheCounters::default().snapshot(0, 0);
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.miss_rate, 0.0);
    }

    #[test]
    fn rates_follow_lookups() {
        let mut counters = CacheCounters::default();
        counters.record_lookup(true, Duration::from_micros(10));
        counters.record_lookup(true, Duration::from_micros(10));
        counters.record_lookup(false, Duration::from_micros(40));
        counters.record_lookup(true, Duration::ZERO);

        let snapshot = counters.snapshot(3, 120);
        assert_eq!(snapshot.hit_rate, 0.75);
        assert_eq!(snapshot.miss_rate, 0.25);
        assert_eq!(snapshot.average_response_time_us, 15.0);
        assert_eq!(snapshot.entries, 3);
    }
}
