//! Consistent-hashing shard router over independent PostgreSQL pools.
//!
//! This crate provides:
//! - A virtual-node hash ring (150 positions per shard by default) mapping
//!   keys to shards with minimal remapping when shards join or leave
//! - One bounded, eagerly verified connection pool per shard
//! - Per-shard health tracking: unhealthy after 3 consecutive failures,
//!   healthy again on the first success
//! - Automatic failover to the next available shard
//! - Fan-out queries that report per-shard results
//! - A background health monitor (30s interval) that stops on `close()`
//!
//! # Example
//!
//! ```rust,ignore
//! use pg_shard_manager::{ManagerConfig, ShardConfig, ShardManager};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ShardManager::start(ManagerConfig::from_env()?)?;
//!
//!     // Each shard is connected and verified before it becomes routable
//!     manager
//!         .add_shard(ShardConfig::new("db-0.internal", "app").with_credentials("app", "secret"))
//!         .await?;
//!     manager
//!         .add_shard(ShardConfig::new("db-1.internal", "app").with_credentials("app", "secret"))
//!         .await?;
//!
//!     // Routed by key, failing over if the owning shard is down
//!     let rows = manager
//!         .query("user:42", "SELECT * FROM users WHERE id = $1", &[json!(42)])
//!         .await?;
//!
//!     // Every shard, partial failures reported per entry
//!     for entry in manager.query_all("SELECT count(*) AS n FROM users", &[]).await? {
//!         println!("{}: {:?}", entry.shard_name, entry.rows());
//!     }
//!
//!     manager.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Routing and Failover
//!
//! - A key resolves to the first virtual node clockwise from its hash
//! - If that shard is unhealthy, or fails with a connectivity error, the
//!   remaining shards are tried in index order
//! - Failures never change the ring; only `add_shard`/`remove_shard` do
//! - Statement errors reported by a reachable shard are returned as-is
//!
//! # Topology Changes
//!
//! - Shard indices are sequential and never reused
//! - `remove_shard` unroutes the shard before draining its pool; queries
//!   already running against it fail over
//! - Data is not migrated between shards; this is a routing layer only

mod config;
mod error;
mod manager;
mod ring;
mod shard;

pub mod backend;
pub mod health;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod stats;

pub use backend::{PgBackend, PgConnector, PoolStatus, Row, ShardBackend, ShardConnector};
pub use config::{
    ManagerConfig, ShardConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_HEALTH_CHECK_TIMEOUT, DEFAULT_REPLICATION_FACTOR, DEFAULT_VIRTUAL_NODES,
};
pub use error::{Error, Result};
pub use health::{HealthState, HealthTransition, ProbeReport, ShardHealth};
pub use manager::{KeyDistribution, ShardLocation, ShardManager, ShardQueryResult};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryBackend, MemoryConnector};
pub use ring::HashRing;
pub use shard::Shard;
pub use stats::{ManagerStats, ShardStats};

/// Stable identifier of a shard for the lifetime of a manager.
pub type ShardIndex = usize;
