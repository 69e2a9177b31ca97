//! MemoryCoordinator behaviour tests
//!
//! Exercises the lease + watch contract the registry relies on.

use std::time::Duration;

use batata_coordination::{
    CoordinationClient, CoordinationError, MemoryCoordinator, WatchEventKind,
};
use futures::StreamExt;

// ============== Watch Tests ==============

#[tokio::test]
async fn test_watch_delivers_put_and_delete_in_order() {
    let store = MemoryCoordinator::new();
    let mut watch = store.watch_prefix("/svc/", 0).await.unwrap();

    let lease = store.grant(10).await.unwrap();
    store.put("/svc/a", b"a".to_vec(), Some(lease)).await.unwrap();
    store.put("/other/b", b"b".to_vec(), None).await.unwrap();
    store.revoke(lease).await.unwrap();

    let first = watch.next().await.unwrap().unwrap();
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].kind, WatchEventKind::Put);
    assert_eq!(first.events[0].kv.key, "/svc/a");
    assert_eq!(first.events[0].kv.mod_revision, 1);

    let second = watch.next().await.unwrap().unwrap();
    assert_eq!(second.events[0].kind, WatchEventKind::Delete);
    assert_eq!(second.events[0].kv.key, "/svc/a");
    assert!(second.events[0].kv.value.is_empty());
    assert_eq!(second.events[0].kv.mod_revision, 3);
}

#[tokio::test]
async fn test_watch_replays_from_revision() {
    let store = MemoryCoordinator::new();
    store.put("/svc/a", b"1".to_vec(), None).await.unwrap();
    store.put("/svc/b", b"2".to_vec(), None).await.unwrap();
    store.put("/svc/c", b"3".to_vec(), None).await.unwrap();

    let mut watch = store.watch_prefix("/svc/", 2).await.unwrap();
    let first = watch.next().await.unwrap().unwrap();
    assert_eq!(first.events[0].kv.key, "/svc/b");
    let second = watch.next().await.unwrap().unwrap();
    assert_eq!(second.events[0].kv.key, "/svc/c");

    store.put("/svc/d", b"4".to_vec(), None).await.unwrap();
    let live = watch.next().await.unwrap().unwrap();
    assert_eq!(live.events[0].kv.key, "/svc/d");
}

#[tokio::test]
async fn test_watch_from_compacted_revision_fails() {
    let store = MemoryCoordinator::new();
    for i in 0..5 {
        store
            .put(&format!("/svc/{}", i), vec![], None)
            .await
            .unwrap();
    }
    store.compact(4);

    let mut watch = store.watch_prefix("/svc/", 2).await.unwrap();
    match watch.next().await {
        Some(Err(CoordinationError::Compacted { compact_revision })) => {
            assert_eq!(compact_revision, 4)
        }
        other => panic!("expected compaction error, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(watch.next().await.is_none());

    // Starting at the compaction point is still allowed.
    let mut watch = store.watch_prefix("/svc/", 4).await.unwrap();
    let resp = watch.next().await.unwrap().unwrap();
    assert_eq!(resp.events[0].kv.mod_revision, 4);
}

#[tokio::test]
async fn test_disconnect_watchers_ends_streams() {
    let store = MemoryCoordinator::new();
    let mut watch = store.watch_prefix("/svc/", 0).await.unwrap();
    assert_eq!(store.watcher_count(), 1);

    store.disconnect_watchers();
    assert!(watch.next().await.is_none());
    assert_eq!(store.watcher_count(), 0);
}

#[tokio::test]
async fn test_dropped_watch_is_pruned() {
    let store = MemoryCoordinator::new();
    let watch = store.watch_prefix("/svc/", 0).await.unwrap();
    drop(watch);
    assert_eq!(store.watcher_count(), 0);
}

// ============== Lease Tests ==============

#[tokio::test(start_paused = true)]
async fn test_lease_expires_without_keep_alive() {
    let store = MemoryCoordinator::new();
    let lease = store.grant(1).await.unwrap();
    store.put("/svc/a", vec![], Some(lease)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(store.lease_count(), 0);
    assert_eq!(store.key_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_extends_lease() {
    let store = MemoryCoordinator::new();
    let lease = store.grant(1).await.unwrap();
    store.put("/svc/a", vec![], Some(lease)).await.unwrap();

    let mut acks = store.keep_alive(lease).await.unwrap();
    let consumer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(Ok(ack)) = acks.next().await {
            assert_eq!(ack.ttl_secs, 1);
            count += 1;
        }
        count
    });

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(store.lease_count(), 1);
    assert_eq!(store.key_count(), 1);

    assert!(store.expire_lease(lease));
    let count = consumer.await.unwrap();
    assert!(count >= 4);
    assert_eq!(store.key_count(), 0);
}

#[tokio::test]
async fn test_keep_alive_unknown_lease() {
    let store = MemoryCoordinator::new();
    assert!(matches!(
        store.keep_alive(7).await.err(),
        Some(CoordinationError::LeaseNotFound(7))
    ));
}

#[tokio::test]
async fn test_expire_lease_emits_delete() {
    let store = MemoryCoordinator::new();
    let lease = store.grant(30).await.unwrap();
    store.put("/svc/a", vec![], Some(lease)).await.unwrap();
    let mut watch = store.watch_prefix("/svc/", 0).await.unwrap();

    assert!(store.expire_lease(lease));
    assert!(!store.expire_lease(lease));

    let resp = watch.next().await.unwrap().unwrap();
    assert_eq!(resp.events[0].kind, WatchEventKind::Delete);
}
