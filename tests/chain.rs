use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tiercache::{
    CacheChain, CacheConfig, CacheError, EncodingKind, LoadOptions, LocalTier, MemoryStore,
    RemoteBackend, RemoteStore, RemoteTier, Tier, async_trait,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    lines: Vec<String>,
    total_cents: i64,
}

fn order(id: u64) -> Order {
    Order {
        id,
        lines: vec!["widget".to_owned(); 12],
        total_cents: 1999,
    }
}

fn standalone() -> CacheConfig {
    CacheConfig {
        enable_pubsub: false,
        ..CacheConfig::default()
    }
}

async fn chain_over(store: Arc<MemoryStore>) -> CacheChain {
    CacheChain::builder(standalone())
        .remote_store(store)
        .build()
        .await
        .unwrap()
}

/// A store that never answers in time.
struct StalledStore;

#[async_trait]
impl RemoteStore for StalledStore {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _expire: Option<u64>) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn remove(&self, _key: &str) -> Result<(), CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    async fn increment(&self, _key: &str, _by: i64) -> Result<i64, CacheError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(0)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cold_chain_loads_once() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_over(Arc::clone(&store)).await;
    let calls = AtomicUsize::new(0);
    let counter = &calls;
    let opts = LoadOptions::new().with_prefix("order:");

    for _ in 0..3 {
        let loaded = chain
            .load(
                "17",
                |id| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(Some(order(id.parse().unwrap_or_default())))
                },
                &opts,
            )
            .await
            .unwrap();
        assert_eq!(loaded, Some(order(17)));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(store.contains("order:17").await);
}

#[tokio::test]
async fn test_partial_miss_batch() {
    let chain = chain_over(Arc::new(MemoryStore::new())).await;
    let opts = LoadOptions::new();
    chain.set("k1", &order(1), &opts).await.unwrap();
    chain.set("k2", &order(2), &opts).await.unwrap();

    let keys: Vec<String> = vec!["k1".into(), "k2".into(), "k3".into()];
    let values = chain
        .load_multi(
            &keys,
            |missing| async move {
                assert_eq!(missing, vec!["k3".to_owned()]);
                Ok::<_, Infallible>(HashMap::from([("k3".to_owned(), order(3))]))
            },
            &opts,
        )
        .await
        .unwrap();

    assert_eq!(values.len(), 3);
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(values[key], order(i as u64 + 1));
    }
}

#[tokio::test(start_paused = true)]
async fn test_absent_ttl_is_shortened() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_over(Arc::clone(&store)).await;
    let opts = LoadOptions::new()
        .cache_absent()
        .with_expire(Duration::from_secs(10240));

    chain
        .load("present", |_| async { Ok::<_, Infallible>(Some(order(1))) }, &opts)
        .await
        .unwrap();
    chain
        .load("absent", |_| async { Ok::<Option<Order>, Infallible>(None) }, &opts)
        .await
        .unwrap();

    let present = store.ttl("present").await.unwrap();
    let absent = store.ttl("absent").await.unwrap();
    assert_eq!(present, Duration::from_secs(10240));
    assert_eq!(absent, Duration::from_secs(10240 >> 10));

    tokio::time::advance(Duration::from_secs(11)).await;
    let reloaded = chain
        .load("absent", |_| async { Ok::<_, Infallible>(Some(order(9))) }, &opts)
        .await
        .unwrap();
    assert_eq!(reloaded, Some(order(9)));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_remote_degrades_to_miss() {
    let config = standalone();
    let local = Arc::new(LocalTier::new(100));
    let remote = Arc::new(RemoteTier::new(
        Arc::new(StalledStore),
        config.default_expire,
        Duration::from_millis(500),
    ));
    let chain = CacheChain::new(
        vec![
            Arc::clone(&local) as Arc<dyn Tier>,
            Arc::clone(&remote) as Arc<dyn Tier>,
        ],
        &config,
    )
    .with_counters(remote);

    let started = tokio::time::Instant::now();
    let loaded = chain
        .load(
            "k",
            |_| async { Ok::<_, Infallible>(Some("fresh".to_owned())) },
            &LoadOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(loaded.as_deref(), Some("fresh"));
    assert!(local.get("k").is_some());
    // one timed-out read and one timed-out fill
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        chain.increment("hits", 1).await,
        Err(CacheError::Timeout { op: "increment", .. })
    ));
}

#[tokio::test]
async fn test_disabled_backend_still_serves() {
    let chain = CacheChain::from_config(CacheConfig {
        remote_backend: RemoteBackend::Disabled,
        ..standalone()
    })
    .await
    .unwrap();

    let loaded = chain
        .load("k", |_| async { Ok::<_, Infallible>(Some(order(4))) }, &LoadOptions::new())
        .await
        .unwrap();
    assert_eq!(loaded, Some(order(4)));
    assert_eq!(chain.get::<Order>("k", &LoadOptions::new()).await, Some(order(4)));
    assert!(chain.increment("hits", 1).await.is_err());
}

#[tokio::test]
async fn test_instrumented_chain_behaves_the_same() {
    let chain = CacheChain::from_config(CacheConfig {
        instrument_tiers: true,
        ..standalone()
    })
    .await
    .unwrap();

    let names: Vec<&str> = chain.tiers().iter().map(|t| t.name()).collect();
    assert_eq!(names, vec!["local", "memory"]);

    for kind in [
        EncodingKind::Json,
        EncodingKind::StructuredBinary,
        EncodingKind::NativeBinary,
    ] {
        let opts = LoadOptions::new().with_encoding(kind);
        chain.set("o", &order(5), &opts).await.unwrap();
        assert_eq!(chain.get::<Order>("o", &opts).await, Some(order(5)));
    }
}

#[tokio::test]
async fn test_skip_runtime_cache_reads_remote() {
    let store = Arc::new(MemoryStore::new());
    let chain = chain_over(Arc::clone(&store)).await;
    let remote_only = LoadOptions::new().skip_runtime_cache();

    chain.set("k", &order(6), &remote_only).await.unwrap();

    assert_eq!(
        chain
            .get::<Order>("k", &LoadOptions::new().skip_cache())
            .await,
        None
    );
    assert_eq!(chain.get::<Order>("k", &remote_only).await, Some(order(6)));
    assert!(store.contains("k").await);
}

#[tokio::test]
#[ignore = "requires a running Redis; set REDIS_URL"]
async fn test_redis_backend_round_trip() {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_owned());
    let chain = CacheChain::from_config(CacheConfig {
        app_name: "tiercache-it".to_owned(),
        remote_backend: RemoteBackend::Redis { url },
        ..CacheConfig::default()
    })
    .await
    .unwrap();

    let remote_only = LoadOptions::new().skip_runtime_cache();
    chain.set("it:order", &order(7), &remote_only).await.unwrap();
    assert_eq!(chain.get::<Order>("it:order", &remote_only).await, Some(order(7)));

    chain.remove("it:counter", &LoadOptions::new()).await;
    assert_eq!(chain.increment("it:counter", 5).await.unwrap(), 5);
    assert_eq!(chain.decrement("it:counter", 2).await.unwrap(), 3);

    chain.remove("it:order", &LoadOptions::new()).await;
    assert_eq!(chain.get::<Order>("it:order", &remote_only).await, None);
}
