//! Multi-node tests over localhost: ownership, rebalancing on join and leave,
//! failover to replicas and cluster-wide scatter-gather.

#[cfg(test)]
mod tests {
    use crate::cache::{CacheLoader, ExtensionRegistry, Loadable};
    use crate::cluster::{ClusterEvent, ClusterEventListener};
    use crate::config::{CacheConfig, ExecutionPolicy, ExtensionRef, TransportConfig};
    use crate::error::{Error, Result, StoreError};
    use crate::partitioning::BucketEventListener;
    use crate::testing::{init_tracing, wait_for, wait_for_result, TestCluster};
    use crate::types::{BucketId, ClusterNodeAddress, GroupKey, GroupType, NodeStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const STABLE: Duration = Duration::from_secs(15);

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ClusterEvent>>);

    impl ClusterEventListener for Recorder {
        fn on_event(&self, event: &ClusterEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[derive(Default)]
    struct MovedBuckets(Mutex<Vec<(BucketId, Option<ClusterNodeAddress>)>>);

    impl BucketEventListener for MovedBuckets {
        fn bucket_transferred(
            &self,
            bucket: BucketId,
            _from: Option<&ClusterNodeAddress>,
            to: Option<&ClusterNodeAddress>,
        ) {
            self.0.lock().push((bucket, to.cloned()));
        }
    }

    /// Loads 120 items slowly, counting how often it runs.
    struct SlowCatalog(Arc<AtomicUsize>);

    #[async_trait]
    impl CacheLoader for SlowCatalog {
        async fn load(&self, sink: &mut Loadable) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            for i in 0..120 {
                sink.load(format!("item-{i}"), format!("{i}"));
            }
            Ok(())
        }
    }

    fn owned_counts(cluster: &TestCluster, cache: &str) -> Vec<usize> {
        cluster
            .nodes()
            .iter()
            .map(|node| node.cache(cache).map_or(0, |c| c.local_buckets().len()))
            .collect()
    }

    #[tokio::test]
    async fn test_nodes_join_one_cluster() {
        init_tracing();
        let cluster = TestCluster::start(3).await.unwrap();
        cluster
            .wait_for_members(3, Duration::from_secs(5))
            .await
            .unwrap();

        let first = cluster.node(0).members();
        for node in cluster.nodes() {
            assert_eq!(node.status(), NodeStatus::Operational);
            assert_eq!(node.members(), first);
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_every_bucket_has_exactly_one_owner() {
        init_tracing();
        let cluster = TestCluster::start(3).await.unwrap();
        let caches = cluster
            .create_cache(CacheConfig::new("owners").with_bucket_count(31))
            .await
            .unwrap();
        assert!(cluster.wait_stable("owners", STABLE).await);

        let mut owners: BTreeMap<u32, usize> = BTreeMap::new();
        for cache in &caches {
            for bucket in cache.local_buckets() {
                *owners.entry(bucket).or_default() += 1;
            }
        }
        assert_eq!(owners.len(), 31);
        assert!(owners.values().all(|count| *count == 1));

        for key in ["a", "b", "c", "order-17", "user:42"] {
            let views: Vec<_> = caches.iter().map(|c| c.owner_of(key)).collect();
            assert!(views[0].is_some());
            assert!(views.windows(2).all(|pair| pair[0] == pair[1]));
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_writes_are_visible_from_every_node() {
        init_tracing();
        let cluster = TestCluster::start(3).await.unwrap();
        let caches = cluster
            .create_cache(CacheConfig::new("shared"))
            .await
            .unwrap();
        assert!(cluster.wait_stable("shared", STABLE).await);

        for i in 0..60 {
            caches[i % 3]
                .put(format!("key-{i}"), format!("value-{i}"))
                .await
                .unwrap();
        }
        for i in 0..60 {
            let value = caches[(i + 1) % 3].get(format!("key-{i}")).await.unwrap();
            assert_eq!(value, Some(Bytes::from(format!("value-{i}"))));
        }

        let found = caches[2]
            .get_all((0..60).map(|i| format!("key-{i}")))
            .await
            .unwrap();
        assert_eq!(found.len(), 60);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_scatter_gather_count_over_three_nodes() {
        init_tracing();
        let cluster = TestCluster::start(3).await.unwrap();
        let caches = cluster
            .create_cache(
                CacheConfig::new("counted").with_execution_policy(ExecutionPolicy::FailOnPartial),
            )
            .await
            .unwrap();
        assert!(cluster.wait_stable("counted", STABLE).await);

        caches[0]
            .put_all((0..300).map(|i| (format!("k{i}"), "v")))
            .await
            .unwrap();

        // Entry gauges are refreshed on the store's tick.
        let per_node = wait_for_result(
            || async { caches.iter().map(|c| c.stats().entry_count).collect::<Vec<u64>>() },
            |counts| counts.iter().sum::<u64>() == 300,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(per_node.iter().all(|count| *count > 0));

        for cache in &caches {
            assert_eq!(cache.size().await.unwrap(), 300);
        }
        assert_eq!(caches[1].clear().await.unwrap(), 300);
        assert_eq!(caches[2].size().await.unwrap(), 0);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_rebalances_evenly_and_keeps_data() {
        init_tracing();
        let mut cluster = TestCluster::start(2).await.unwrap();
        let config = CacheConfig::new("rebalanced").with_bucket_count(100);
        let caches = cluster.create_cache(config.clone()).await.unwrap();
        assert!(cluster.wait_stable("rebalanced", STABLE).await);
        assert_eq!(owned_counts(&cluster, "rebalanced"), vec![50, 50]);

        for i in 0..200 {
            caches[0].put(format!("k{i}"), format!("{i}")).await.unwrap();
        }

        cluster.add_node().await.unwrap();
        let joined = cluster.node(2).create_cache(config).await.unwrap();
        assert!(cluster.wait_stable("rebalanced", STABLE).await);

        let counts = owned_counts(&cluster, "rebalanced");
        assert_eq!(counts.iter().sum::<usize>(), 100);
        assert!(counts.iter().all(|count| (33..=34).contains(count)), "{counts:?}");

        for i in 0..200 {
            let value = joined.get(format!("k{i}")).await.unwrap();
            assert_eq!(value, Some(Bytes::from(format!("{i}"))), "key k{i}");
        }
        assert_eq!(joined.size().await.unwrap(), 200);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_graceful_leave_hands_buckets_off() {
        init_tracing();
        let mut cluster = TestCluster::start(3).await.unwrap();
        let caches = cluster
            .create_cache(CacheConfig::new("leaving").with_bucket_count(17))
            .await
            .unwrap();
        assert!(cluster.wait_stable("leaving", STABLE).await);
        for i in 0..100 {
            caches[0].put(format!("k{i}"), "v").await.unwrap();
        }

        let departing = cluster.take_node(1);
        let departed = departing.local_address().clone();
        departing.leave().await.unwrap();
        assert!(cluster.wait_stable("leaving", STABLE).await);

        let key = GroupKey::cache("leaving");
        for node in cluster.nodes() {
            let state = node.replicated_state();
            assert!(!state.is_member(&departed));
            let group = state.group(&key).unwrap();
            assert!(!group.group_map().contains_key(&departed));
            assert!(group.unowned_buckets().is_empty());
        }

        let remaining = cluster.node(1).cache("leaving").unwrap();
        assert_eq!(remaining.size().await.unwrap(), 100);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_backup_takes_over_after_owner_failure() {
        init_tracing();
        let mut cluster = TestCluster::start(3).await.unwrap();
        let caches = cluster
            .create_cache(CacheConfig::new("replicated").with_replica_count(1))
            .await
            .unwrap();
        assert!(cluster.wait_stable("replicated", STABLE).await);
        for i in 0..150 {
            caches[0].put(format!("k{i}"), format!("{i}")).await.unwrap();
        }

        let failed = cluster.take_node(2);
        let failed_address = failed.local_address().clone();
        failed.shutdown().await;

        let survivors = wait_for(
            || {
                cluster
                    .nodes()
                    .iter()
                    .all(|node| !node.replicated_state().is_member(&failed_address))
            },
            STABLE,
            Duration::from_millis(100),
        )
        .await;
        assert!(survivors);
        assert!(cluster.wait_stable("replicated", STABLE).await);

        let reader = cluster.node(0).cache("replicated").unwrap();
        let size = wait_for_result(
            || async { reader.size().await.ok() },
            |size| *size == Some(150),
            STABLE,
        )
        .await;
        assert_eq!(size, Some(Some(150)));
        for i in 0..150 {
            assert_eq!(
                reader.get(format!("k{i}")).await.unwrap(),
                Some(Bytes::from(format!("{i}")))
            );
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_listeners_see_membership_and_group_changes() {
        init_tracing();
        let mut cluster = TestCluster::start(1).await.unwrap();
        let all = Arc::new(Recorder::default());
        let caches_only = Arc::new(Recorder::default());
        cluster.node(0).subscribe(None, all.clone()).unwrap();
        cluster
            .node(0)
            .subscribe(Some(GroupType::Cache), caches_only.clone())
            .unwrap();

        cluster.node(0).create_cache(CacheConfig::new("watched")).await.unwrap();
        cluster.add_node().await.unwrap();
        let joined = cluster.node(1).local_address().clone();

        let seen = wait_for(
            || {
                all.0
                    .lock()
                    .iter()
                    .any(|e| matches!(e, ClusterEvent::MemberJoined { node } if *node == joined))
            },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;
        assert!(seen);

        let group_changed = wait_for(
            || {
                caches_only
                    .0
                    .lock()
                    .iter()
                    .any(|e| matches!(e, ClusterEvent::GroupStateChanged { .. }))
            },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;
        assert!(group_changed);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_bucket_listener_fires_on_handoff() {
        init_tracing();
        let mut cluster = TestCluster::start(1).await.unwrap();
        let config = CacheConfig::new("moving").with_bucket_count(10);
        let first = cluster.node(0).create_cache(config.clone()).await.unwrap();

        let moved = Arc::new(MovedBuckets::default());
        first.add_bucket_listener(moved.clone()).unwrap();

        cluster.add_node().await.unwrap();
        let joiner = cluster.node(1).local_address().clone();
        cluster.node(1).create_cache(config).await.unwrap();
        assert!(cluster.wait_stable("moving", STABLE).await);

        let fired = wait_for(
            || moved.0.lock().len() >= 5,
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await;
        let moved = moved.0.lock();
        assert!(fired, "{moved:?}");
        let to_joiner: BTreeSet<u32> = moved
            .iter()
            .filter(|(_, to)| to.as_ref() == Some(&joiner))
            .map(|(bucket, _)| *bucket)
            .collect();
        assert_eq!(to_joiner.len(), 5);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_creation_loads_once() {
        init_tracing();
        let runs = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ExtensionRegistry::new());
        let counter = runs.clone();
        registry.register_loader("catalog", move |_| Ok(Arc::new(SlowCatalog(counter.clone()))));
        let cluster = TestCluster::builder()
            .with_size(3)
            .with_registry(registry)
            .start()
            .await
            .unwrap();

        let config = CacheConfig::new("catalog")
            .with_bucket_count(20)
            .with_loader(ExtensionRef::new("catalog"));
        let (a, b, c) = tokio::join!(
            cluster.node(0).create_cache(config.clone()),
            cluster.node(1).create_cache(config.clone()),
            cluster.node(2).create_cache(config),
        );
        let caches = [a.unwrap(), b.unwrap(), c.unwrap()];
        assert!(cluster.wait_stable("catalog", STABLE).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Buckets that moved while the loader ran carried its entries along.
        for cache in &caches {
            assert_eq!(cache.size().await.unwrap(), 120);
        }
        for i in 0..120 {
            let value = caches[i % 3].get(format!("item-{i}")).await.unwrap();
            assert_eq!(value, Some(Bytes::from(format!("{i}"))), "item-{i}");
        }
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_oversized_values_never_evict_members() {
        init_tracing();
        let mut cluster = TestCluster::builder()
            .with_size(2)
            .with_node_config(|config| {
                config.with_transport(TransportConfig::default().with_max_frame_size(64 * 1024))
            })
            .start()
            .await
            .unwrap();
        let config = CacheConfig::new("framed")
            .with_bucket_count(8)
            .with_replica_count(1);
        let caches = cluster.create_cache(config.clone()).await.unwrap();
        assert!(cluster.wait_stable("framed", STABLE).await);

        let sequencer = cluster.node(0).local_address().clone();
        let key = (0..)
            .map(|i| format!("big-{i}"))
            .find(|k| caches[0].owner_of(k) == Some(sequencer.clone()))
            .unwrap();
        for cache in &caches {
            let err = cache.put(key.clone(), vec![7u8; 100 * 1024]).await.unwrap_err();
            assert!(matches!(err, Error::Store(StoreError::EntryTooLarge { .. })), "{err}");
        }

        // Each bucket holds more than one frame's worth of these.
        let value = Bytes::from(vec![3u8; 20 * 1024]);
        for i in 0..40 {
            caches[0].put(format!("wide-{i}"), value.clone()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        for node in cluster.nodes() {
            assert_eq!(node.members().len(), 2);
        }

        cluster.add_node().await.unwrap();
        let joined = cluster.node(2).create_cache(config).await.unwrap();
        assert!(cluster.wait_stable("framed", STABLE).await);
        for node in cluster.nodes() {
            assert_eq!(node.members().len(), 3);
        }
        for i in 0..40 {
            assert_eq!(joined.get(format!("wide-{i}")).await.unwrap(), Some(value.clone()));
        }
        assert_eq!(joined.size().await.unwrap(), 40);
        cluster.shutdown().await;
    }
}
