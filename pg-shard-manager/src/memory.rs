//! In-process shard backend with fault injection.
//!
//! Useful for exercising routing, failover and health tracking without a
//! database. Every statement returns a single row echoing the shard name, the
//! SQL and the params, so callers can see which shard served a query.

use crate::backend::{PoolStatus, Row, ShardBackend, ShardConnector};
use crate::{Error, ShardConfig};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Hands out [`MemoryBackend`]s keyed by shard host.
///
/// The connector keeps a handle to every backend it created so tests can
/// break or slow down a shard after it has been added.
#[derive(Default)]
pub struct MemoryConnector {
    backends: DashMap<String, Arc<MemoryBackend>>,
    refused: DashSet<String>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make future `connect` calls for `host` fail.
    pub fn refuse(&self, host: &str) {
        self.refused.insert(host.to_string());
    }

    pub fn accept(&self, host: &str) {
        self.refused.remove(host);
    }

    /// Backend most recently created for `host`.
    pub fn backend(&self, host: &str) -> Option<Arc<MemoryBackend>> {
        self.backends.get(host).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl ShardConnector for MemoryConnector {
    async fn connect(&self, config: &ShardConfig) -> Result<Arc<dyn ShardBackend>, Error> {
        if self.refused.contains(&config.host) {
            return Err(Error::connectivity(config.endpoint(), "connection refused"));
        }
        let backend = Arc::new(MemoryBackend::new(config));
        self.backends.insert(config.host.clone(), backend.clone());
        Ok(backend)
    }
}

pub struct MemoryBackend {
    label: String,
    endpoint: String,
    permits: Semaphore,
    max_size: u32,
    failing: AtomicBool,
    latency_ms: AtomicU64,
    closed: AtomicBool,
    executed: AtomicU64,
    statements: Mutex<Vec<String>>,
}

impl MemoryBackend {
    pub fn new(config: &ShardConfig) -> Self {
        let max_size = config.pool_size.max(1);
        Self {
            label: config.name.clone().unwrap_or_else(|| config.host.clone()),
            endpoint: config.endpoint(),
            permits: Semaphore::new(max_size as usize),
            max_size,
            failing: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            executed: AtomicU64::new(0),
            statements: Mutex::new(Vec::new()),
        }
    }

    /// While set, every statement and ping fails with a connectivity error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Artificial delay applied to every statement and ping.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Number of statements that reached this backend (pings excluded).
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Acquire)
    }

    /// SQL text of every executed statement, oldest first.
    pub fn statements(&self) -> Vec<String> {
        self.statements
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    async fn enter(&self) -> Result<tokio::sync::SemaphorePermit<'_>, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connectivity(&self.endpoint, "pool closed"));
        }
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::connectivity(&self.endpoint, "pool closed"))?;

        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.failing.load(Ordering::Acquire) {
            return Err(Error::connectivity(&self.endpoint, "connection reset"));
        }
        Ok(permit)
    }
}

#[async_trait]
impl ShardBackend for MemoryBackend {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, Error> {
        let _permit = self.enter().await?;
        self.executed.fetch_add(1, Ordering::AcqRel);
        if let Ok(mut log) = self.statements.lock() {
            log.push(sql.to_string());
        }

        let row = json!({
            "shard": self.label,
            "sql": sql,
            "params": params,
        });
        Ok(match row {
            Value::Object(map) => vec![map],
            _ => Vec::new(),
        })
    }

    async fn ping(&self) -> Result<(), Error> {
        self.enter().await.map(|_| ())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.permits.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn pool_status(&self) -> PoolStatus {
        let idle = self.permits.available_permits();
        PoolStatus {
            size: self.max_size,
            idle,
            max_size: self.max_size,
        }
    }
}
