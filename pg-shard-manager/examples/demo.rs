//! Walk-through of routing, failover and topology changes using in-memory
//! shards.
//!
//! Run:
//!   cargo run -p pg-shard-manager --example demo
//!
//! Set RUST_LOG=debug to watch the health state machine and failover
//! decisions as they happen.

use pg_shard_manager::{ManagerConfig, MemoryConnector, ShardConfig, ShardManager};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let connector = Arc::new(MemoryConnector::new());
    let config = ManagerConfig::default().with_health_check_interval(Duration::from_millis(200));
    let manager = ShardManager::with_connector(config, connector.clone())?;

    for name in ["users-a", "users-b", "users-c"] {
        manager
            .add_shard(ShardConfig::new(name, "app").with_name(name))
            .await?;
    }

    let keys: Vec<String> = (1..=12).map(|i| format!("user:{}", i)).collect();

    println!("\n== Routing ==");
    for key in &keys[..4] {
        let rows = manager
            .query(key, "SELECT * FROM users WHERE id = $1", &[json!(key)])
            .await?;
        println!("  {:<8} -> {}", key, rows[0]["shard"]);
    }

    println!("\n== Distribution of {} keys ==", keys.len());
    print_distribution(&manager, &keys)?;

    println!("\n== users-b goes down ==");
    connector
        .backend("users-b")
        .ok_or("users-b backend missing")?
        .set_failing(true);
    for key in &keys {
        let rows = manager.query(key, "SELECT 1", &[]).await?;
        let owner = manager.get_shard_for_key(key)?;
        if owner.shard_name == "users-b" {
            println!(
                "  {:<8} owned by users-b (healthy={}), served by {}",
                key, owner.healthy, rows[0]["shard"]
            );
        }
    }

    println!("\n== users-b comes back; monitor notices within one interval ==");
    connector
        .backend("users-b")
        .ok_or("users-b backend missing")?
        .set_failing(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    for shard in manager.get_stats().shards {
        println!("  {:<8} healthy={}", shard.name, shard.health.healthy);
    }

    println!("\n== Scale out: add users-d ==");
    manager
        .add_shard(ShardConfig::new("users-d", "app").with_name("users-d"))
        .await?;
    print_distribution(&manager, &keys)?;

    println!("\n== Scale in: remove users-a ==");
    manager.remove_shard(0).await?;
    print_distribution(&manager, &keys)?;

    println!("\n== Fan-out ==");
    for entry in manager.query_all("SELECT count(*) FROM users", &[]).await? {
        println!(
            "  {:<8} ok={} rows={}",
            entry.shard_name,
            entry.is_ok(),
            entry.rows().map_or(0, |rows| rows.len())
        );
    }

    println!("\n== Stats ==");
    println!("{}", serde_json::to_string_pretty(&manager.get_stats())?);

    manager.close().await;
    Ok(())
}

fn print_distribution(
    manager: &ShardManager,
    keys: &[String],
) -> Result<(), Box<dyn std::error::Error>> {
    for (index, entry) in manager.get_distribution(keys)? {
        println!("  shard {}: {:>2} keys {:?}", index, entry.count, entry.keys);
    }
    Ok(())
}
