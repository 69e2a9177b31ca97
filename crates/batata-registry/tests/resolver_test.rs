// Integration tests for the registry resolver
// Covers address pushes driven by discovery and watch events

mod common;

use std::sync::Arc;
use std::time::Duration;

use batata_coordination::{CoordinationClient, MemoryCoordinator};
use batata_registry::{AddressSink, RegistryError, ResolverTarget, SCHEME, SchemeRegistry};
use common::{eventually, instance, new_registry, serial};
use parking_lot::Mutex;

/// Records every address set pushed to it.
#[derive(Default)]
struct RecordingSink {
    pushes: Mutex<Vec<Vec<String>>>,
}

impl RecordingSink {
    fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    fn last(&self) -> Option<Vec<String>> {
        self.pushes.lock().last().cloned()
    }
}

impl AddressSink for RecordingSink {
    fn update_addresses(&self, addresses: Vec<String>) {
        self.pushes.lock().push(addresses);
    }
}

#[tokio::test]
async fn test_resolver_follows_service() {
    let _guard = serial().await;
    let store = MemoryCoordinator::new();
    let registry = new_registry(&store);

    registry
        .register(
            &instance("o-1", "orders", "grpc://10.0.0.1:9000").with_endpoint("10.0.0.1:9000"),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let builder = SchemeRegistry::global().get(SCHEME).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let handle = builder
        .build(&ResolverTarget::parse("batata:///orders").unwrap(), sink.clone())
        .unwrap();

    // Schemes stripped and duplicates dropped.
    eventually("initial push", || {
        sink.last() == Some(vec!["10.0.0.1:9000".to_string()])
    })
    .await;

    registry
        .register(&instance("o-2", "orders", "http://10.0.0.2:9000"), Duration::ZERO)
        .await
        .unwrap();
    eventually("push after put", || {
        sink.last()
            == Some(vec![
                "10.0.0.1:9000".to_string(),
                "10.0.0.2:9000".to_string(),
            ])
    })
    .await;

    registry.deregister("o-1").await.unwrap();
    eventually("push after delete", || {
        sink.last() == Some(vec!["10.0.0.2:9000".to_string()])
    })
    .await;

    handle.close().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_resolver_never_pushes_empty_set() {
    let _guard = serial().await;
    let store = MemoryCoordinator::new();
    let registry = new_registry(&store);

    registry
        .register(&instance("o-1", "orders", "10.0.0.1:9000"), Duration::ZERO)
        .await
        .unwrap();

    let builder = SchemeRegistry::global().get(SCHEME).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let handle = builder
        .build(&ResolverTarget::for_service("orders"), sink.clone())
        .unwrap();
    eventually("initial push", || sink.push_count() == 1).await;

    registry.deregister("o-1").await.unwrap();
    // Give the delete time to reach the resolver.
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(sink.push_count(), 1);
    assert_eq!(sink.last(), Some(vec!["10.0.0.1:9000".to_string()]));

    handle.close().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_resolver_converges_after_compaction() {
    let _guard = serial().await;
    let store = MemoryCoordinator::new();
    let registry = new_registry(&store);

    for i in 1..=3 {
        registry
            .register(
                &instance(&format!("o-{}", i), "orders", &format!("10.0.0.{}:1", i)),
                Duration::ZERO,
            )
            .await
            .unwrap();
    }

    let builder = SchemeRegistry::global().get(SCHEME).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let handle = builder
        .build(&ResolverTarget::for_service("orders"), sink.clone())
        .unwrap();
    eventually("initial push", || sink.push_count() == 1).await;
    eventually("watch to open", || store.watcher_count() == 1).await;

    // The delete falls inside a window the store compacts away before the
    // watch comes back, so no event is ever delivered for it.
    store.disconnect_watchers();
    registry.deregister("o-2").await.unwrap();
    store.put("/test/other/x", vec![], None).await.unwrap();
    store.compact(store.current_revision());
    eventually("watch to reopen", || store.watcher_count() == 1).await;

    registry
        .register(&instance("o-4", "orders", "10.0.0.4:1"), Duration::ZERO)
        .await
        .unwrap();
    eventually("push matching the store", || {
        sink.last()
            == Some(vec![
                "10.0.0.1:1".to_string(),
                "10.0.0.3:1".to_string(),
                "10.0.0.4:1".to_string(),
            ])
    })
    .await;

    handle.close().await;
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_resolve_now_and_close() {
    let _guard = serial().await;
    let store = MemoryCoordinator::new();
    let registry = new_registry(&store);

    registry
        .register(&instance("o-1", "orders", "10.0.0.1:9000"), Duration::ZERO)
        .await
        .unwrap();

    let builder = SchemeRegistry::global().get(SCHEME).unwrap();
    let sink = Arc::new(RecordingSink::default());
    let handle = builder
        .build(&ResolverTarget::for_service("orders"), sink.clone())
        .unwrap();
    eventually("initial push", || sink.push_count() == 1).await;

    handle.resolve_now();
    eventually("refresh push", || sink.push_count() == 2).await;

    handle.close().await;
    assert!(handle.is_closed());
    eventually("resolver watch to stop", || registry.watch_count() == 0).await;

    registry
        .register(&instance("o-2", "orders", "10.0.0.2:9000"), Duration::ZERO)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.push_count(), 2);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_builder_after_close() {
    let _guard = serial().await;
    let store = MemoryCoordinator::new();
    let registry = new_registry(&store);

    let builder = SchemeRegistry::global().get(SCHEME).unwrap();
    registry.close().await.unwrap();
    assert!(SchemeRegistry::global().get(SCHEME).is_none());

    let sink = Arc::new(RecordingSink::default());
    let result = builder.build(&ResolverTarget::for_service("orders"), sink);
    assert!(matches!(result, Err(RegistryError::Closed)));
}
