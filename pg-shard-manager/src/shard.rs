use crate::backend::{PoolStatus, Row, ShardBackend};
use crate::health::ShardHealth;
use crate::{Error, ShardConfig, ShardIndex};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A named database endpoint with its own pool and health record.
///
/// Shards are created by [`ShardManager::add_shard`](crate::ShardManager::add_shard)
/// and shared through topology snapshots. Once removed, a shard is marked
/// retired and its pool closed; queries still holding it fail over.
pub struct Shard {
    index: ShardIndex,
    name: String,
    config: ShardConfig,
    backend: Arc<dyn ShardBackend>,
    health: ShardHealth,
    retired: AtomicBool,
}

impl Shard {
    pub(crate) fn new(index: ShardIndex, config: ShardConfig, backend: Arc<dyn ShardBackend>) -> Self {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("shard-{}", index));
        Self {
            index,
            name,
            config,
            backend,
            health: ShardHealth::new(),
            retired: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> ShardIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn weight(&self) -> u32 {
        self.config.weight
    }

    pub fn config(&self) -> &ShardConfig {
        &self.config
    }

    pub fn health(&self) -> &ShardHealth {
        &self.health
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Eligible as a routing target: healthy and not removed.
    pub fn is_available(&self) -> bool {
        !self.is_retired() && self.health.is_healthy()
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.backend.pool_status()
    }

    /// Run a statement, bounded by the shard's `statement_timeout`. A
    /// timeout is a connectivity error, so the router fails over.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        if self.is_retired() {
            return Err(Error::connectivity(&self.name, "shard has been removed"));
        }
        tokio::time::timeout(self.config.statement_timeout, self.backend.execute(sql, params))
            .await
            .map_err(|_| Error::connectivity(&self.name, "statement timed out"))?
    }

    /// Liveness probe bounded by `timeout`. A timeout is a connectivity error.
    pub async fn ping(&self, timeout: Duration) -> Result<(), Error> {
        tokio::time::timeout(timeout, self.backend.ping())
            .await
            .map_err(|_| Error::connectivity(&self.name, "health probe timed out"))?
    }

    /// Stop routing to this shard and close its pool. Idempotent.
    pub(crate) async fn retire(&self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            tracing::debug!(shard_index = self.index, shard = %self.name, "Draining shard pool");
        }
        self.backend.close().await;
    }
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("endpoint", &self.config.endpoint())
            .field("retired", &self.is_retired())
            .finish()
    }
}
