//! Connect a set of shards, run one health round and print the result.
//!
//! Shards are read as a JSON array of shard configs, from the file given as
//! the first argument or from the `SHARD_CONFIG` environment variable.
//! Remaining arguments are keys to resolve against the ring.
//!
//! Run: cargo run -p pg-shard-manager --bin shard_probe -- shards.json user:1 user:2
//!
//! ```json
//! [
//!   { "host": "db-0.internal", "database": "app", "username": "app", "password": "secret" },
//!   { "host": "db-1.internal", "database": "app", "name": "orders-eu", "pool_size": 20 }
//! ]
//! ```

use pg_shard_manager::{ManagerConfig, ShardConfig, ShardManager};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // JSON logs in production, human-readable otherwise
    let is_production = std::env::var("NODE_ENV").unwrap_or_default() == "production";
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if is_production {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let mut args = std::env::args().skip(1);
    let raw = match args.next() {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read shard config {}: {}", path, e))?,
        None => std::env::var("SHARD_CONFIG")
            .map_err(|_| "usage: shard_probe <shards.json> [key...] (or set SHARD_CONFIG)")?,
    };
    let shards: Vec<ShardConfig> = serde_json::from_str(&raw)?;
    let keys: Vec<String> = args.collect();

    let manager = ShardManager::start(ManagerConfig::from_env()?)?;

    let mut failed = 0usize;
    for shard in shards {
        let endpoint = shard.endpoint();
        match manager.add_shard(shard).await {
            Ok(index) => tracing::info!(shard_index = index, %endpoint, "Connected"),
            Err(e) => {
                failed += 1;
                tracing::error!(%endpoint, error = %e, "Could not connect shard");
            }
        }
    }

    let reports = manager.check_health().await;
    let routes: Vec<_> = keys
        .iter()
        .map(|key| match manager.get_shard_for_key(key) {
            Ok(location) => json!({ "key": key, "location": location }),
            Err(e) => json!({ "key": key, "error": e.to_string() }),
        })
        .collect();

    let output = json!({
        "health": reports,
        "stats": manager.get_stats(),
        "routes": routes,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);

    manager.close().await;

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
