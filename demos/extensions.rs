//! Cache extensions on a single node: a loader, write-through, read-through,
//! an invalidator and a custom scatter-gather executable.
//!
//!   RUST_LOG=cachegrid=debug cargo run --example extensions

use async_trait::async_trait;
use bytes::Bytes;
use cachegrid::{
    CacheConfig, CacheInvalidator, CacheLoader, CacheNode, DataSource, DataStore, EntryView,
    Executable, ExtensionRef, ExtensionRegistry, InvalidatorElement, Loadable, NodeConfig,
    Storable, Sum, WriteMode,
};
use std::sync::Arc;
use std::time::Duration;

/// Prints what would be written to a database.
struct ConsoleStore;

#[async_trait]
impl DataStore for ConsoleStore {
    async fn store(&self, entries: &[Storable]) -> cachegrid::Result<()> {
        for entry in entries {
            println!(
                "  store: {} = {}",
                String::from_utf8_lossy(&entry.key),
                String::from_utf8_lossy(&entry.value)
            );
        }
        Ok(())
    }

    async fn remove(&self, keys: &[Bytes]) -> cachegrid::Result<()> {
        for key in keys {
            println!("  remove: {}", String::from_utf8_lossy(key));
        }
        Ok(())
    }
}

/// Serves `price:<sku>` lookups from a fixed table.
struct PriceList {
    currency: String,
}

#[async_trait]
impl DataSource for PriceList {
    async fn get(&self, key: &[u8]) -> cachegrid::Result<Option<Bytes>> {
        let price = match key {
            b"price:apple" => "3",
            b"price:pear" => "4",
            _ => return Ok(None),
        };
        Ok(Some(Bytes::from(format!("{} {}", price, self.currency))))
    }
}

struct Catalog;

#[async_trait]
impl CacheLoader for Catalog {
    async fn load(&self, sink: &mut Loadable) -> cachegrid::Result<()> {
        for sku in ["apple", "pear", "plum", "fig"] {
            sink.load(format!("sku:{sku}"), sku.to_uppercase());
        }
        Ok(())
    }
}

/// Drops anything marked as discontinued.
struct Discontinued;

impl CacheInvalidator for Discontinued {
    fn process(&self, element: &mut InvalidatorElement<'_>) {
        if element.value().starts_with(b"DISCONTINUED") {
            element.invalidate();
        }
    }
}

/// Total bytes of all values, summed across nodes with [`Sum`].
struct ValueBytes;

impl Executable for ValueBytes {
    fn execute(
        &self,
        entries: &mut dyn Iterator<Item = EntryView<'_>>,
    ) -> cachegrid::Result<Bytes> {
        let total: u64 = entries.map(|entry| entry.value.len() as u64).sum();
        Ok(Bytes::from(bincode::serialize(&total)?))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let registry = Arc::new(ExtensionRegistry::new());
    registry.register_data_store("console", |_| Ok(Arc::new(ConsoleStore)));
    registry.register_data_source("price-list", |ctx| {
        let currency = ctx.required("price-list", "currency")?.to_string();
        Ok(Arc::new(PriceList { currency }))
    });
    registry.register_loader("catalog", |_| Ok(Arc::new(Catalog)));
    registry.register_invalidator("discontinued", |_| Ok(Arc::new(Discontinued)));
    registry.register_executable("value-bytes", |_| Ok(Arc::new(ValueBytes)));

    let node = CacheNode::builder(NodeConfig::new("127.0.0.1:7500".parse()?))
        .with_registry(registry)
        .start()
        .await?;

    println!("Creating cache (runs the loader)...");
    let products = node
        .create_cache(
            CacheConfig::new("products")
                .with_default_ttl(Duration::from_secs(600))
                .with_loader(ExtensionRef::new("catalog"))
                .with_invalidator(ExtensionRef::new("discontinued"))
                .with_data_source(ExtensionRef::new("price-list").with_property("currency", "EUR"))
                .with_data_store(ExtensionRef::new("console"), WriteMode::Synchronous),
        )
        .await?;
    println!("Loaded {} entries", products.size().await?);

    println!("\n--- Write-through ---");
    products.put("sku:kiwi", "KIWI").await?;
    products.remove("sku:fig").await?;

    println!("\n--- Read-through ---");
    for key in ["price:apple", "price:apple", "price:mango"] {
        println!("  {} -> {:?}", key, products.get(key).await?);
    }

    println!("\n--- Invalidator ---");
    products.put("sku:plum", "DISCONTINUED plum").await?;
    println!("  sku:plum -> {:?}", products.get("sku:plum").await?);

    println!("\n--- Scatter-gather ---");
    let bytes = products
        .execute(ExtensionRef::new("value-bytes"), None, &Sum)
        .await?;
    println!("  value bytes across the cluster: {}", bytes);

    let stats = products.stats();
    println!("\nCache stats:");
    println!("  Hits: {}", stats.hits);
    println!("  Misses: {}", stats.misses);
    println!("  Read-through loads: {}", stats.read_through_loads);
    println!("  Invalidations: {}", stats.invalidations);

    node.leave().await?;
    Ok(())
}
