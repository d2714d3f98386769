use crate::backend::PoolStatus;
use crate::health::HealthState;
use crate::ShardIndex;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Routing counters. All counters only ever increase.
#[derive(Debug, Default)]
pub struct Statistics {
    total_queries: AtomicU64,
    failovers: AtomicU64,
    failed_queries: AtomicU64,
    fanout_queries: AtomicU64,
    rebalances: AtomicU64,
    key_prefixes: DashMap<String, AtomicU64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a routed query and its key prefix.
    pub fn inc_query(&self, shard_key: &str) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let prefix = key_prefix(shard_key);
        if let Some(counter) = self.key_prefixes.get(prefix) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.key_prefixes
            .entry(prefix.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// A query that exhausted every candidate.
    pub fn inc_failed_query(&self) {
        self.failed_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_fanout(&self) {
        self.fanout_queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_queries(&self) -> u64 {
        self.total_queries.load(Ordering::Relaxed)
    }

    pub fn failovers(&self) -> u64 {
        self.failovers.load(Ordering::Relaxed)
    }

    pub fn failed_queries(&self) -> u64 {
        self.failed_queries.load(Ordering::Relaxed)
    }

    pub fn fanout_queries(&self) -> u64 {
        self.fanout_queries.load(Ordering::Relaxed)
    }

    pub fn rebalances(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }

    pub fn key_prefixes(&self) -> BTreeMap<String, u64> {
        self.key_prefixes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Text before the first `:`, or the whole key when there is none.
/// `"user:42"` and `"user:7:profile"` both count under `"user"`.
pub fn key_prefix(shard_key: &str) -> &str {
    shard_key
        .split_once(':')
        .map_or(shard_key, |(prefix, _)| prefix)
}

/// Serializable snapshot returned by
/// [`ShardManager::get_stats`](crate::ShardManager::get_stats).
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_queries: u64,
    pub failovers: u64,
    pub failed_queries: u64,
    pub fanout_queries: u64,
    pub rebalances: u64,
    pub key_prefixes: BTreeMap<String, u64>,
    pub shard_count: usize,
    pub healthy_shards: usize,
    pub ring_size: usize,
    pub virtual_nodes_per_shard: usize,
    pub replication_factor: u32,
    pub shards: Vec<ShardStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub index: ShardIndex,
    pub name: String,
    pub host: String,
    pub weight: u32,
    pub health: HealthState,
    pub pool: PoolStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefix() {
        assert_eq!(key_prefix("user:42"), "user");
        assert_eq!(key_prefix("user:7:profile"), "user");
        assert_eq!(key_prefix("session"), "session");
        assert_eq!(key_prefix(":odd"), "");
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = Statistics::new();
        stats.inc_query("user:1");
        stats.inc_query("user:2");
        stats.inc_query("order:9");
        stats.inc_failover();
        stats.inc_rebalance();
        stats.inc_rebalance();

        assert_eq!(stats.total_queries(), 3);
        assert_eq!(stats.failovers(), 1);
        assert_eq!(stats.rebalances(), 2);
        assert_eq!(stats.failed_queries(), 0);

        let prefixes = stats.key_prefixes();
        assert_eq!(prefixes.get("user"), Some(&2));
        assert_eq!(prefixes.get("order"), Some(&1));
    }

    #[test]
    fn test_concurrent_prefix_counts() {
        let stats = std::sync::Arc::new(Statistics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = stats.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        stats.inc_query(&format!("tenant:{}", i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.total_queries(), 8000);
        assert_eq!(stats.key_prefixes().get("tenant"), Some(&8000));
    }
}
