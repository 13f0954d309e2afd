//! A multi-process cluster on localhost.
//!
//! Run this in three terminals:
//!   RUST_LOG=info cargo run --example cluster -- 1
//!   RUST_LOG=info cargo run --example cluster -- 2
//!   RUST_LOG=info cargo run --example cluster -- 3
//!
//! Node 1 forms the cluster; the others join through it. Every node creates
//! the "orders" cache, writes a few keys and prints how many buckets it owns
//! as nodes come and go. Ctrl+C hands the node's buckets off and leaves.

use cachegrid::{CacheConfig, CacheNode, ClusterEvent, ClusterEventListener, NodeConfig};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

struct PrintEvents;

impl ClusterEventListener for PrintEvents {
    fn on_event(&self, event: &ClusterEvent) {
        println!("  event: {:?}", event);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args: Vec<String> = env::args().collect();
    let node_id: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(1);

    let addr: SocketAddr = format!("127.0.0.1:{}", 7400 + node_id).parse()?;
    let seeds: Vec<SocketAddr> = if node_id == 1 {
        vec![]
    } else {
        vec!["127.0.0.1:7401".parse()?]
    };

    println!("===========================================");
    println!("  Cache node {} on {}", node_id, addr);
    println!("===========================================");

    let node = CacheNode::builder(NodeConfig::new(addr).with_seeds(seeds))
        .start()
        .await?;
    node.subscribe(None, Arc::new(PrintEvents))?;
    println!("Node {} operational, members: {:?}", node_id, node.members());

    let orders = node
        .create_cache(
            CacheConfig::new("orders")
                .with_bucket_count(17)
                .with_replica_count(1)
                .with_default_ttl(Duration::from_secs(300)),
        )
        .await?;

    for i in 0..10 {
        orders
            .put(format!("node{}-order{}", node_id, i), format!("{}", i * 10))
            .await?;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(3));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let size = orders.size().await.map_or_else(|e| format!("error: {e}"), |n| n.to_string());
                println!(
                    "[{}] members: {}, owned buckets: {:?}, entries in cluster: {}",
                    node.status(),
                    node.members().len(),
                    orders.local_buckets(),
                    size,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Leaving the cluster...");
    let stats = orders.stats();
    println!("  Hits: {}, Misses: {}", stats.hits, stats.misses);
    node.leave().await?;
    Ok(())
}
