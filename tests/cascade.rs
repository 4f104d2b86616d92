//! Behaviour of several caches sharing one remote store, the way several
//! processes share one Redis.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use tiercache::{
    Alteration, BoxError, CacheConfig, CascadingCache, InvalidationBus, LayerMask, Lookup,
    MemoryStore, RemoteStore, is_negative,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(app_id: &str) -> CacheConfig {
    CacheConfig::default()
        .with_layer(LayerMask::BOTH)
        .with_default_ttl(Duration::from_secs(60))
        .with_app_id(app_id)
}

async fn process(store: &Arc<MemoryStore>, app_id: &str) -> CascadingCache {
    CascadingCache::new(store.clone(), store.clone(), config(app_id))
        .await
        .expect("cache should build")
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn cross_process_invalidation() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let a = process(&store, "orders").await;
    let b = process(&store, "orders").await;
    assert_eq!(b.invalidation_topic(), "cnel:updating:orders");

    let data = b
        .get_or_fetch("user:42", || async {
            Ok::<_, BoxError>(Some(Bytes::from_static(b"Alice")))
        })
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static(b"Alice"));
    assert!(b.local().get("user:42").await.is_hit());

    // A changes the source of truth; B never calls update
    a.update("user:%d", &[&42]).await.unwrap();

    eventually(|| async { b.local().get("user:42").await == Lookup::Miss }).await;
    assert_eq!(store.get("user:42").await.unwrap(), None);

    let calls = AtomicUsize::new(0);
    let data = b
        .get_or_fetch("user:42", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(Some(Bytes::from_static(b"Alicia")))
        })
        .await
        .unwrap();
    assert_eq!(data, Bytes::from_static(b"Alicia"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalidation_is_scoped_to_the_application() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let orders = process(&store, "orders").await;
    let billing = process(&store, "billing").await;

    billing.store_local("user:1", "kept").await.unwrap();
    orders.update("user:%d", &[&1]).await.unwrap();

    // let the orders purge (which also drops the shared copy) land
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(billing.local().get("user:1").await.is_hit());
}

#[tokio::test]
async fn raw_alterations_from_other_publishers_are_applied() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = process(&store, "orders").await;
    cache.store_both("order:7", "pending").await.unwrap();

    store
        .publish(
            "cnel:updating:orders",
            &Alteration::delete("order:7").encode(),
        )
        .await
        .unwrap();

    eventually(|| async { cache.get("order:7").await.unwrap().is_none() }).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stampede_collapses_to_one_fetch() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = process(&store, "orders").await;
    let calls = Arc::new(AtomicUsize::new(0));
    let start = Arc::new(tokio::sync::Barrier::new(16));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let (cache, calls, start) = (cache.clone(), calls.clone(), start.clone());
            tokio::spawn(async move {
                start.wait().await;
                cache
                    .get_or_fetch("product:1", move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok::<_, BoxError>(Some(Bytes::from_static(b"widget")))
                    })
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Bytes::from_static(b"widget"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn negative_entries_are_shared_between_processes() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let a = process(&store, "orders").await;
    let b = process(&store, "orders").await;

    let first = a
        .get_or_fetch("user:99", || async { Ok::<_, BoxError>(None) })
        .await
        .unwrap();
    assert!(is_negative(&first));

    // B has no local copy and finds the negative entry in the shared layer
    let calls = AtomicUsize::new(0);
    let second = b
        .get_or_fetch("user:99", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, BoxError>(Some(Bytes::from_static(b"Bob")))
        })
        .await
        .unwrap();
    assert!(is_negative(&second));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(b.local().get("user:99").await, Lookup::Negative);
}

#[tokio::test]
async fn lost_subscription_is_not_restored() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = process(&store, "orders").await;
    assert!(cache.is_subscribed());

    store.close_subscriptions();
    eventually(|| async { !cache.is_subscribed() }).await;

    cache.store_local("user:5", "stale").await.unwrap();
    cache.update("user:%d", &[&5]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.local().get("user:5").await.is_hit());
}

#[tokio::test]
async fn entries_expire_with_the_default_ttl() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let cache = CascadingCache::new(
        store.clone(),
        store.clone(),
        config("orders").with_default_ttl(Duration::from_millis(100)),
    )
    .await
    .unwrap();

    cache
        .get_or_fetch("user:1", || async {
            Ok::<_, BoxError>(Some(Bytes::from_static(b"Ann")))
        })
        .await
        .unwrap();
    assert!(cache.get("user:1").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(cache.get("user:1").await.unwrap(), None);
}
