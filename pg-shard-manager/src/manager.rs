use crate::backend::{PgConnector, Row, ShardConnector};
use crate::health::{record_outcome, HealthMonitor, ProbeReport};
use crate::shard::Shard;
use crate::stats::{ManagerStats, ShardStats, Statistics};
use crate::{Error, HashRing, ManagerConfig, ShardConfig, ShardIndex};
use arc_swap::ArcSwap;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Immutable routing snapshot: the ring plus the shards it points at.
///
/// Topology changes build a new snapshot and swap it in, so routing never
/// waits on a writer.
#[derive(Clone)]
pub(crate) struct Topology {
    ring: HashRing,
    shards: BTreeMap<ShardIndex, Arc<Shard>>,
}

impl Topology {
    fn new(virtual_nodes: usize) -> Self {
        Self {
            ring: HashRing::new(virtual_nodes),
            shards: BTreeMap::new(),
        }
    }

    /// Shards in ascending index order.
    pub(crate) fn shards(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.values()
    }

    /// First shard in index order that is not excluded and can take traffic.
    fn next_fallback(&self, excluded: &[ShardIndex]) -> Option<Arc<Shard>> {
        self.shards
            .values()
            .find(|shard| !excluded.contains(&shard.index()) && shard.is_available())
            .cloned()
    }
}

/// Where a key routes, without touching the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardLocation {
    pub shard_index: ShardIndex,
    pub shard_name: String,
    pub healthy: bool,
    pub host: String,
}

/// One shard's answer to [`ShardManager::query_all`].
#[derive(Debug)]
pub struct ShardQueryResult {
    pub shard_index: ShardIndex,
    pub shard_name: String,
    pub result: Result<Vec<Row>, Error>,
}

impl ShardQueryResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn rows(&self) -> Option<&[Row]> {
        self.result.as_deref().ok()
    }

    pub fn error(&self) -> Option<&Error> {
        self.result.as_ref().err()
    }
}

/// Keys that landed on one shard in [`ShardManager::get_distribution`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyDistribution {
    pub count: usize,
    pub keys: Vec<String>,
}

/// Consistent-hashing router over independent shard pools.
///
/// Keys resolve to a shard through the hash ring; if that shard is unhealthy
/// or fails, the query moves to the next available shard in index order.
/// A background task probes every shard on a fixed interval.
///
/// # Thread Safety
///
/// `ShardManager` is `Send + Sync`; share it with `Arc`. Routing loads the
/// current topology snapshot lock-free. `add_shard`/`remove_shard` are
/// serialized against each other by a mutex that routing never takes.
pub struct ShardManager {
    config: ManagerConfig,
    topology: Arc<ArcSwap<Topology>>,
    connector: Arc<dyn ShardConnector>,
    stats: Statistics,
    monitor: HealthMonitor,
    /// Indices are handed out once and never reused, even after removal.
    next_index: AtomicUsize,
    topology_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    cancel_token: CancellationToken,
    monitor_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ShardManager {
    /// Start a manager that connects shards to PostgreSQL.
    ///
    /// Must be called from within a Tokio runtime; the health monitor is
    /// spawned immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `config` fails validation.
    pub fn start(config: ManagerConfig) -> Result<Self, Error> {
        Self::with_connector(config, Arc::new(PgConnector))
    }

    /// Start a manager with a custom connector.
    pub fn with_connector(
        config: ManagerConfig,
        connector: Arc<dyn ShardConnector>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let topology = Arc::new(ArcSwap::from_pointee(Topology::new(
            config.virtual_nodes_per_shard,
        )));
        let monitor = HealthMonitor::new(
            topology.clone(),
            config.health_check_interval,
            config.health_check_timeout,
            config.consecutive_failure_threshold,
        );
        let cancel_token = CancellationToken::new();
        let monitor_handle = monitor.clone().spawn(cancel_token.clone());

        tracing::info!(
            virtual_nodes = config.virtual_nodes_per_shard,
            health_check_interval_ms = config.health_check_interval.as_millis() as u64,
            failure_threshold = config.consecutive_failure_threshold,
            replication_factor = config.replication_factor,
            "Shard manager started"
        );

        Ok(Self {
            config,
            topology,
            connector,
            stats: Statistics::new(),
            monitor,
            next_index: AtomicUsize::new(0),
            topology_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            cancel_token,
            monitor_handle: Mutex::new(Some(monitor_handle)),
        })
    }

    /// Connect a new shard and place it on the ring.
    ///
    /// The pool is opened and verified before the shard becomes routable, so
    /// an unreachable endpoint is reported here. The index is consumed even
    /// when connecting fails.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the manager is closed
    /// - [`Error::Connectivity`] if the shard cannot be reached
    pub async fn add_shard(&self, config: ShardConfig) -> Result<ShardIndex, Error> {
        self.ensure_open()?;
        let _guard = self.topology_lock.lock().await;
        self.ensure_open()?;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let endpoint = config.endpoint();
        let backend = match self.connector.connect(&config).await {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(shard_index = index, %endpoint, error = %e, "Failed to add shard");
                return Err(e);
            }
        };
        let shard = Arc::new(Shard::new(index, config, backend));

        let mut next = (**self.topology.load()).clone();
        next.ring.add_node(index);
        next.shards.insert(index, shard.clone());
        let shard_count = next.shards.len();
        self.topology.store(Arc::new(next));
        self.stats.inc_rebalance();

        tracing::info!(
            shard_index = index,
            shard = %shard.name(),
            %endpoint,
            shard_count,
            "Shard added"
        );
        Ok(index)
    }

    /// Take a shard off the ring and close its pool.
    ///
    /// The ring is updated first so no new query routes to the shard. Queries
    /// already running against it fail on the closed pool and fail over.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the index is unknown or the
    /// manager is closed.
    pub async fn remove_shard(&self, index: ShardIndex) -> Result<(), Error> {
        self.ensure_open()?;
        let _guard = self.topology_lock.lock().await;

        let mut next = (**self.topology.load()).clone();
        let Some(shard) = next.shards.remove(&index) else {
            return Err(Error::configuration(format!("unknown shard index {}", index)));
        };
        next.ring.remove_node(index);
        let shard_count = next.shards.len();
        self.topology.store(Arc::new(next));

        shard.retire().await;
        self.stats.inc_rebalance();

        tracing::info!(
            shard_index = index,
            shard = %shard.name(),
            shard_count,
            "Shard removed"
        );
        Ok(())
    }

    /// Run a statement on the shard owning `shard_key`.
    ///
    /// If the owner is unhealthy, or fails with a connectivity error, the
    /// remaining shards are tried in index order, skipping anything already
    /// tried or unhealthy. The ring itself is never changed by a failure.
    ///
    /// # Errors
    ///
    /// - [`Error::Configuration`] if the manager is closed or has no shards
    /// - [`Error::ShardUnavailable`] once every candidate is exhausted
    /// - [`Error::Database`] if a reachable shard rejected the statement
    pub async fn query(
        &self,
        shard_key: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Row>, Error> {
        self.ensure_open()?;
        let topology = self.topology.load_full();
        let primary = topology.ring.get_node(shard_key)?;
        self.stats.inc_query(shard_key);

        let threshold = self.config.consecutive_failure_threshold;
        let mut attempted: Vec<ShardIndex> = Vec::new();
        let mut candidate = match topology.shards.get(&primary) {
            Some(shard) if shard.is_available() => Some(shard.clone()),
            _ => {
                tracing::debug!(shard_key, primary, "Primary shard unavailable, skipping");
                attempted.push(primary);
                None
            }
        };

        loop {
            let shard = match candidate.take() {
                Some(shard) => shard,
                None => match topology.next_fallback(&attempted) {
                    Some(shard) => {
                        self.stats.inc_failover();
                        tracing::warn!(
                            shard_key,
                            primary,
                            fallback = shard.index(),
                            "Failing over to next shard"
                        );
                        shard
                    }
                    None => break,
                },
            };
            attempted.push(shard.index());

            match shard.execute(sql, params).await {
                Ok(rows) => {
                    record_outcome(&shard, true, threshold);
                    tracing::trace!(shard_key, shard_index = shard.index(), rows = rows.len(), "Query served");
                    return Ok(rows);
                }
                Err(e) if e.is_retryable() => {
                    record_outcome(&shard, false, threshold);
                    tracing::debug!(
                        shard_key,
                        shard_index = shard.index(),
                        error = %e,
                        "Query failed on shard"
                    );
                }
                Err(e) => {
                    // The shard answered; the statement itself is at fault.
                    record_outcome(&shard, true, threshold);
                    return Err(e);
                }
            }
        }

        self.stats.inc_failed_query();
        tracing::error!(shard_key, ?attempted, "No shard available, failover exhausted");
        Err(Error::ShardUnavailable {
            key: shard_key.to_string(),
            attempted,
        })
    }

    /// Run a statement on every shard in parallel.
    ///
    /// Returns one entry per shard. A failing shard yields an `Err` entry
    /// and never affects the others. Each shard applies its own statement
    /// timeout; there is no shared deadline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] only if the manager is closed.
    pub async fn query_all(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<ShardQueryResult>, Error> {
        self.ensure_open()?;
        self.stats.inc_fanout();
        let topology = self.topology.load_full();
        let threshold = self.config.consecutive_failure_threshold;

        let queries = topology.shards().map(|shard| async move {
            let result = shard.execute(sql, params).await;
            let reachable = match &result {
                Ok(_) => true,
                Err(e) => !e.is_retryable(),
            };
            record_outcome(shard, reachable, threshold);
            if let Err(e) = &result {
                tracing::warn!(shard_index = shard.index(), error = %e, "Fan-out query failed on shard");
            }
            ShardQueryResult {
                shard_index: shard.index(),
                shard_name: shard.name().to_string(),
                result,
            }
        });
        Ok(join_all(queries).await)
    }

    /// Resolve the shard for `shard_key` without any I/O.
    ///
    /// Reports the ring owner even when it is currently unhealthy.
    pub fn get_shard_for_key(&self, shard_key: &str) -> Result<ShardLocation, Error> {
        let topology = self.topology.load();
        let index = topology.ring.get_node(shard_key)?;
        let shard = topology.shards.get(&index).ok_or_else(|| {
            Error::configuration(format!("ring points at unknown shard {}", index))
        })?;
        Ok(ShardLocation {
            shard_index: index,
            shard_name: shard.name().to_string(),
            healthy: shard.health().is_healthy(),
            host: shard.host().to_string(),
        })
    }

    /// Group `keys` by owning shard. Every shard appears, with a zero count
    /// if no key mapped to it.
    pub fn get_distribution<K: AsRef<str>>(
        &self,
        keys: &[K],
    ) -> Result<BTreeMap<ShardIndex, KeyDistribution>, Error> {
        let topology = self.topology.load();
        if topology.ring.is_empty() {
            return Err(Error::configuration("hash ring is empty; add a shard first"));
        }

        let mut distribution: BTreeMap<ShardIndex, KeyDistribution> = topology
            .shards
            .keys()
            .map(|&index| (index, KeyDistribution::default()))
            .collect();
        for key in keys {
            let key = key.as_ref();
            let entry = distribution
                .entry(topology.ring.get_node(key)?)
                .or_default();
            entry.count += 1;
            entry.keys.push(key.to_string());
        }
        Ok(distribution)
    }

    /// Counters, config echo and a health snapshot of every shard.
    pub fn get_stats(&self) -> ManagerStats {
        let topology = self.topology.load();
        let shards: Vec<ShardStats> = topology
            .shards()
            .map(|shard| ShardStats {
                index: shard.index(),
                name: shard.name().to_string(),
                host: shard.host().to_string(),
                weight: shard.weight(),
                health: shard.health().snapshot(),
                pool: shard.pool_status(),
            })
            .collect();

        ManagerStats {
            total_queries: self.stats.total_queries(),
            failovers: self.stats.failovers(),
            failed_queries: self.stats.failed_queries(),
            fanout_queries: self.stats.fanout_queries(),
            rebalances: self.stats.rebalances(),
            key_prefixes: self.stats.key_prefixes(),
            shard_count: shards.len(),
            healthy_shards: shards.iter().filter(|s| s.health.healthy).count(),
            ring_size: topology.ring.len(),
            virtual_nodes_per_shard: self.config.virtual_nodes_per_shard,
            replication_factor: self.config.replication_factor,
            shards,
        }
    }

    /// Probe every shard now instead of waiting for the next tick.
    pub async fn check_health(&self) -> Vec<ProbeReport> {
        self.monitor.check_now().await
    }

    pub fn shard_count(&self) -> usize {
        self.topology.load().shards.len()
    }

    pub fn shard_indices(&self) -> Vec<ShardIndex> {
        self.topology.load().shards.keys().copied().collect()
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the health monitor and close every shard pool.
    ///
    /// Safe to call more than once. Afterwards every routing call fails with
    /// [`Error::Configuration`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel_token.cancel();
        let handle = self
            .monitor_handle
            .lock()
            .ok()
            .and_then(|mut handle| handle.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let _guard = self.topology_lock.lock().await;
        let previous = self.topology.swap(Arc::new(Topology::new(
            self.config.virtual_nodes_per_shard,
        )));
        join_all(previous.shards().map(|shard| shard.retire())).await;

        tracing::info!(shards = previous.shards.len(), "Shard manager closed");
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::configuration("shard manager is closed"));
        }
        Ok(())
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        // Stops the monitor task even if close() was never awaited
        self.cancel_token.cancel();
    }
}
