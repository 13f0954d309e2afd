//! Single-node cache behavior over a real node: expiration, eviction and the
//! extension hooks.

#[cfg(test)]
mod tests {
    use crate::cache::{
        CacheInvalidator, CacheLoader, DataSource, DataStore, ExtensionRegistry,
        InvalidatorElement, Loadable, Storable,
    };
    use crate::config::{CacheConfig, EvictionConfig, ExtensionRef, WriteMode};
    use crate::error::{ConfigError, Error, Result, StoreError};
    use crate::testing::{init_tracing, wait_for_result, TestCluster};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingStore {
        stored: Mutex<Vec<Storable>>,
        removed: Mutex<Vec<Bytes>>,
        fail: bool,
    }

    #[async_trait]
    impl DataStore for RecordingStore {
        async fn store(&self, entries: &[Storable]) -> Result<()> {
            if self.fail {
                return Err(Error::Internal("database is down".into()));
            }
            self.stored.lock().extend_from_slice(entries);
            Ok(())
        }

        async fn remove(&self, keys: &[Bytes]) -> Result<()> {
            self.removed.lock().extend_from_slice(keys);
            Ok(())
        }
    }

    /// Answers keys starting with `db:` with the key reversed.
    struct ReversingSource;

    #[async_trait]
    impl DataSource for ReversingSource {
        async fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
            if key.starts_with(b"db:") {
                let mut value = key.to_vec();
                value.reverse();
                Ok(Some(Bytes::from(value)))
            } else if key == b"broken" {
                Err(Error::Internal("lookup failed".into()))
            } else {
                Ok(None)
            }
        }
    }

    struct StaleValues;

    impl CacheInvalidator for StaleValues {
        fn process(&self, element: &mut InvalidatorElement<'_>) {
            if element.value().as_ref() == b"stale" {
                element.invalidate();
            }
        }
    }

    struct TenOrders;

    #[async_trait]
    impl CacheLoader for TenOrders {
        async fn load(&self, sink: &mut Loadable) -> Result<()> {
            for i in 0..10 {
                sink.load(format!("order-{i}"), format!("{i}"));
            }
            Ok(())
        }
    }

    async fn single_node() -> TestCluster {
        init_tracing();
        TestCluster::start(1).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let cluster = single_node().await;
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("basic"))
            .await
            .unwrap();

        assert_eq!(cache.put("k1", "v1").await.unwrap(), None);
        assert_eq!(cache.get("k1").await.unwrap(), Some(Bytes::from("v1")));
        assert_eq!(cache.put("k1", "v2").await.unwrap(), Some(Bytes::from("v1")));
        assert!(cache.contains_key("k1").await.unwrap());

        assert_eq!(cache.remove("k1").await.unwrap(), Some(Bytes::from("v2")));
        assert_eq!(cache.get("k1").await.unwrap(), None);
        assert!(!cache.contains_key("k1").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_orders_expire_after_ttl() {
        init_tracing();
        let cluster = TestCluster::builder()
            .with_manual_clock(1_000_000)
            .start()
            .await
            .unwrap();
        let wall = cluster.wall_clock().unwrap().clone();
        let orders = cluster
            .node(0)
            .create_cache(
                CacheConfig::new("orders")
                    .with_bucket_count(17)
                    .with_default_ttl(Duration::from_millis(5000)),
            )
            .await
            .unwrap();
        assert_eq!(orders.local_buckets().len(), 17);

        orders.put("o1", "42").await.unwrap();
        assert_eq!(orders.get("o1").await.unwrap(), Some(Bytes::from("42")));

        wall.advance(Duration::from_millis(4999));
        assert_eq!(orders.get("o1").await.unwrap(), Some(Bytes::from("42")));

        wall.advance(Duration::from_millis(2));
        assert_eq!(orders.get("o1").await.unwrap(), None);
        assert_eq!(orders.stats().expirations, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_ttl_overrides_default() {
        init_tracing();
        let cluster = TestCluster::builder()
            .with_manual_clock(0)
            .start()
            .await
            .unwrap();
        let wall = cluster.wall_clock().unwrap().clone();
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("ttl").with_default_ttl(Duration::from_secs(60)))
            .await
            .unwrap();

        cache
            .put_with_ttl("short", "x", Duration::from_millis(100))
            .await
            .unwrap();
        cache.put("long", "y").await.unwrap();

        wall.advance(Duration::from_secs(1));
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap(), Some(Bytes::from("y")));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_lru_bound_evicts_least_recently_used() {
        let cluster = single_node().await;
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("bounded").with_eviction(EvictionConfig::lru(3)))
            .await
            .unwrap();

        cache.put("a", "1").await.unwrap();
        cache.put("b", "2").await.unwrap();
        cache.put("c", "3").await.unwrap();
        cache.get("a").await.unwrap();
        cache.put("d", "4").await.unwrap();

        assert_eq!(cache.size().await.unwrap(), 3);
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(cache.get("a").await.unwrap(), Some(Bytes::from("1")));
        assert_eq!(cache.stats().evictions, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_put_if_absent_and_bulk_operations() {
        let cluster = single_node().await;
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("bulk"))
            .await
            .unwrap();

        assert_eq!(cache.put_if_absent("k", "first").await.unwrap(), None);
        assert_eq!(
            cache.put_if_absent("k", "second").await.unwrap(),
            Some(Bytes::from("first"))
        );

        cache
            .put_all((0..20).map(|i| (format!("bulk-{i}"), format!("{i}"))))
            .await
            .unwrap();
        let found = cache
            .get_all(["bulk-0", "bulk-19", "missing"])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&Bytes::from("bulk-19")], Bytes::from("19"));

        assert_eq!(cache.size().await.unwrap(), 21);
        assert_eq!(cache.clear().await.unwrap(), 21);
        assert_eq!(cache.size().await.unwrap(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalidator_and_explicit_invalidate() {
        let cluster = single_node().await;
        cluster
            .registry()
            .register_invalidator("stale-values", |_| Ok(Arc::new(StaleValues)));
        let cache = cluster
            .node(0)
            .create_cache(
                CacheConfig::new("invalidated").with_invalidator(ExtensionRef::new("stale-values")),
            )
            .await
            .unwrap();

        cache.put("fresh", "ok").await.unwrap();
        cache.put("old", "stale").await.unwrap();
        assert_eq!(cache.get("old").await.unwrap(), None);
        assert_eq!(cache.get("fresh").await.unwrap(), Some(Bytes::from("ok")));

        assert!(cache.invalidate("fresh").await.unwrap());
        assert_eq!(cache.get("fresh").await.unwrap(), None);
        assert!(!cache.invalidate("never-written").await.unwrap());
        assert!(cache.stats().invalidations >= 2);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_synchronous_write_through() {
        let cluster = single_node().await;
        let store = Arc::new(RecordingStore::default());
        let shared = store.clone();
        cluster
            .registry()
            .register_data_store("recording", move |_| Ok(shared.clone()));
        let cache = cluster
            .node(0)
            .create_cache(
                CacheConfig::new("written")
                    .with_data_store(ExtensionRef::new("recording"), WriteMode::Synchronous),
            )
            .await
            .unwrap();

        cache.put("k", "v").await.unwrap();
        {
            let stored = store.stored.lock();
            assert_eq!(stored.len(), 1);
            assert_eq!(stored[0].key, Bytes::from("k"));
            assert_eq!(stored[0].value, Bytes::from("v"));
        }

        cache.remove("k").await.unwrap();
        assert_eq!(store.removed.lock().as_slice(), &[Bytes::from("k")]);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_write_through_keeps_the_write() {
        let cluster = single_node().await;
        cluster.registry().register_data_store("failing", |_| {
            Ok(Arc::new(RecordingStore {
                fail: true,
                ..Default::default()
            }))
        });
        let cache = cluster
            .node(0)
            .create_cache(
                CacheConfig::new("failing")
                    .with_data_store(ExtensionRef::new("failing"), WriteMode::Synchronous),
            )
            .await
            .unwrap();

        let err = cache.put("k", "v").await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::WriteThrough(_))));
        assert!(!err.is_retryable());
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("v")));
        assert_eq!(cache.stats().write_through_failures, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_queued_write_through_flushes_in_background() {
        let cluster = single_node().await;
        let store = Arc::new(RecordingStore::default());
        let shared = store.clone();
        cluster
            .registry()
            .register_data_store("queued", move |_| Ok(shared.clone()));
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("queued").with_data_store(
                ExtensionRef::new("queued"),
                WriteMode::Queued {
                    batch_size: 100,
                    flush_interval: Duration::from_millis(50),
                },
            ))
            .await
            .unwrap();

        for i in 0..5 {
            cache.put(format!("k{i}"), "v").await.unwrap();
        }
        let flushed = wait_for_result(
            || async { store.stored.lock().len() },
            |len| *len == 5,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(flushed, Some(5));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_read_through_on_miss() {
        let cluster = single_node().await;
        cluster
            .registry()
            .register_data_source("reversing", |_| Ok(Arc::new(ReversingSource)));
        let cache = cluster
            .node(0)
            .create_cache(
                CacheConfig::new("read-through").with_data_source(ExtensionRef::new("reversing")),
            )
            .await
            .unwrap();

        assert_eq!(cache.get("db:abc").await.unwrap(), Some(Bytes::from("cba:bd")));
        assert_eq!(cache.get("db:abc").await.unwrap(), Some(Bytes::from("cba:bd")));
        assert_eq!(cache.get("other").await.unwrap(), None);
        assert_eq!(cache.get("broken").await.unwrap(), None);

        let stats = cache.stats();
        assert_eq!(stats.read_through_loads, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_loader_runs_before_handle_is_returned() {
        let cluster = single_node().await;
        cluster
            .registry()
            .register_loader("ten-orders", |_| Ok(Arc::new(TenOrders)));
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("loaded").with_loader(ExtensionRef::new("ten-orders")))
            .await
            .unwrap();

        assert_eq!(cache.size().await.unwrap(), 10);
        assert_eq!(cache.get("order-7").await.unwrap(), Some(Bytes::from("7")));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_extension_fails_only_that_cache() {
        let cluster = single_node().await;
        let node = cluster.node(0);

        let err = node
            .create_cache(CacheConfig::new("broken").with_data_source(ExtensionRef::new("missing")))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Config(ConfigError::UnknownExtension { .. })
        ));
        assert!(node.cache("broken").is_none());

        let fine = node.create_cache(CacheConfig::new("fine")).await.unwrap();
        fine.put("k", "v").await.unwrap();
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_cache_is_rejected() {
        let cluster = single_node().await;
        let node = cluster.node(0);
        node.create_cache(CacheConfig::new("once")).await.unwrap();

        let err = node.create_cache(CacheConfig::new("once")).await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::CacheExists(_))));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_filtered_execute_counts_matching_keys() {
        let cluster = single_node().await;
        let cache = cluster
            .node(0)
            .create_cache(CacheConfig::new("filtered"))
            .await
            .unwrap();
        for i in 0..12 {
            let prefix = if i % 3 == 0 { "red" } else { "blue" };
            cache.put(format!("{prefix}:{i}"), "x").await.unwrap();
        }

        let reds = cache
            .execute(
                ExtensionRef::new(crate::executor::CountEntries::NAME),
                Some(ExtensionRef::new("key-prefix").with_property("prefix", "red:")),
                &crate::executor::Sum,
            )
            .await
            .unwrap();
        assert_eq!(reds, 4);

        let err = cache
            .execute(ExtensionRef::new("nope"), None, &crate::executor::Sum)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::UnknownExtension { .. })));
        cluster.shutdown().await;
    }
}
