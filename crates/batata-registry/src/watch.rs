//! Self-healing service watch
//!
//! Each subscription runs a small state machine:
//!
//! ```text
//!   Watching ──error / channel closed──▶ Reconnecting ──retry interval──▶ Watching
//!      │                                      ▲
//!      └──compacted──▶ Resyncing ──read failed┘
//!                         └──ok──▶ Watching
//!   any state ──cancelled──▶ Stopped
//! ```
//!
//! The first open is anchored with a prefix read: the watch starts right
//! after the read's revision, so a reconnect before any event has been seen
//! still resumes from a known revision instead of "now". After a compaction
//! the subscription adopts the revision of a fresh prefix read and continues
//! from there. Changes that happened inside the compacted window are not
//! replayed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use batata_coordination::{CoordinationClient, Revision, WatchEvent, WatchEventKind, WatchStream};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::{ServiceEvent, ServiceInstance, decode_instance, instance_id_from_key};

/// Receiving side of a service watch.
///
/// Dropping the watcher stops the subscription.
pub struct ServiceWatcher {
    service_name: String,
    rx: mpsc::Receiver<ServiceEvent>,
    token: CancellationToken,
}

impl ServiceWatcher {
    pub(crate) fn new(
        service_name: String,
        rx: mpsc::Receiver<ServiceEvent>,
        token: CancellationToken,
    ) -> Self {
        Self {
            service_name,
            rx,
            token,
        }
    }

    /// Next event, or `None` once the subscription has stopped.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        self.rx.recv().await
    }

    /// Stop the subscription. Events already queued can still be received.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}

impl Stream for ServiceWatcher {
    type Item = ServiceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ServiceWatcher {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WatchState {
    Watching,
    Reconnecting,
    Resyncing,
    Stopped,
}

/// Everything one subscription task needs.
pub(crate) struct WatchTask {
    pub client: Arc<dyn CoordinationClient>,
    pub service_name: String,
    pub prefix: String,
    pub retry_interval: Duration,
    /// First revision to watch from; 0 anchors at the current revision
    pub start_revision: Revision,
    pub tx: mpsc::Sender<ServiceEvent>,
    pub token: CancellationToken,
}

impl WatchTask {
    /// Drive the subscription until it is cancelled or its receiver is gone.
    pub async fn run(self) {
        info!(service = %self.service_name, prefix = %self.prefix, "Watch started");

        // Revision the next open starts from; 0 until anchored by a read.
        let mut next_revision = self.start_revision;
        let mut state = WatchState::Watching;

        while state != WatchState::Stopped {
            state = match state {
                WatchState::Watching => self.watching(&mut next_revision).await,
                WatchState::Reconnecting => self.reconnecting().await,
                WatchState::Resyncing => self.resyncing(&mut next_revision).await,
                WatchState::Stopped => WatchState::Stopped,
            };
        }

        info!(service = %self.service_name, next_revision, "Watch stopped");
    }

    async fn watching(&self, next_revision: &mut Revision) -> WatchState {
        if *next_revision == 0 {
            let read = tokio::select! {
                biased;
                _ = self.token.cancelled() => return WatchState::Stopped,
                read = self.client.get_prefix(&self.prefix) => read,
            };
            match read {
                Ok(response) => *next_revision = response.revision + 1,
                Err(e) => {
                    warn!(service = %self.service_name, error = %e, "Failed to anchor watch");
                    return WatchState::Reconnecting;
                }
            }
        }
        let from = *next_revision;

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return WatchState::Stopped,
            opened = self.client.watch_prefix(&self.prefix, from) => opened,
        };
        let mut stream: WatchStream = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_compacted() => return WatchState::Resyncing,
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Failed to open watch");
                return WatchState::Reconnecting;
            }
        };
        debug!(service = %self.service_name, from_revision = from, "Watch channel open");

        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => return WatchState::Stopped,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(response)) => {
                    for event in response.events {
                        *next_revision = (*next_revision).max(event.kv.mod_revision + 1);
                        let Some(event) = self.to_service_event(event) else {
                            continue;
                        };
                        debug!(
                            service = %self.service_name,
                            instance_id = %event.instance().id,
                            put = event.is_put(),
                            next_revision = *next_revision,
                            "Watch event"
                        );
                        if !self.deliver(event).await {
                            return WatchState::Stopped;
                        }
                    }
                }
                Some(Err(e)) if e.is_compacted() => {
                    warn!(
                        service = %self.service_name,
                        from_revision = from,
                        error = %e,
                        "Watch revision compacted, resyncing"
                    );
                    return WatchState::Resyncing;
                }
                Some(Err(e)) => {
                    warn!(service = %self.service_name, error = %e, "Watch failed");
                    return WatchState::Reconnecting;
                }
                None => {
                    warn!(service = %self.service_name, "Watch channel closed");
                    return WatchState::Reconnecting;
                }
            }
        }
    }

    async fn reconnecting(&self) -> WatchState {
        debug!(
            service = %self.service_name,
            retry_in = ?self.retry_interval,
            "Reconnecting watch"
        );
        tokio::select! {
            biased;
            _ = self.token.cancelled() => WatchState::Stopped,
            _ = tokio::time::sleep(self.retry_interval) => WatchState::Watching,
        }
    }

    async fn resyncing(&self, next_revision: &mut Revision) -> WatchState {
        let read = tokio::select! {
            biased;
            _ = self.token.cancelled() => return WatchState::Stopped,
            read = self.client.get_prefix(&self.prefix) => read,
        };
        match read {
            Ok(response) => {
                info!(
                    service = %self.service_name,
                    from_revision = *next_revision,
                    to_revision = response.revision,
                    instances = response.kvs.len(),
                    "Watch resynced; changes inside the compacted window are not replayed"
                );
                *next_revision = response.revision + 1;
                WatchState::Watching
            }
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Resync read failed");
                WatchState::Reconnecting
            }
        }
    }

    /// Queue an event, waiting for room. Returns `false` when the subscription
    /// should stop.
    async fn deliver(&self, event: ServiceEvent) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    fn to_service_event(&self, event: WatchEvent) -> Option<ServiceEvent> {
        let id = instance_id_from_key(&self.prefix, &event.kv.key)?;
        match event.kind {
            WatchEventKind::Put => decode_instance(&event.kv).map(ServiceEvent::Put),
            WatchEventKind::Delete => Some(ServiceEvent::Delete(ServiceInstance::new(
                id,
                self.service_name.as_str(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use batata_coordination::MemoryCoordinator;

    use super::*;
    use crate::model::service_prefix;

    fn spawn_task(
        store: &MemoryCoordinator,
        capacity: usize,
    ) -> (ServiceWatcher, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let token = CancellationToken::new();
        let task = WatchTask {
            client: Arc::new(store.clone()),
            service_name: "orders".to_string(),
            prefix: service_prefix("/ns", "orders"),
            retry_interval: Duration::from_millis(20),
            start_revision: 0,
            tx,
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run());
        (ServiceWatcher::new("orders".to_string(), rx, token), handle)
    }

    async fn put(store: &MemoryCoordinator, id: &str) {
        let value = serde_json::to_vec(&ServiceInstance::new(id, "orders")).unwrap();
        store
            .put(&format!("/ns/orders/{}", id), value, None)
            .await
            .unwrap();
    }

    async fn wait_for_watchers(store: &MemoryCoordinator, n: usize) {
        for _ in 0..200 {
            if store.watcher_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("watcher count never reached {}", n);
    }

    #[tokio::test]
    async fn test_malformed_put_is_skipped() {
        let store = MemoryCoordinator::new();
        let (mut watcher, _handle) = spawn_task(&store, 8);
        wait_for_watchers(&store, 1).await;

        store
            .put("/ns/orders/bad", b"{".to_vec(), None)
            .await
            .unwrap();
        put(&store, "o-1").await;

        let event = watcher.recv().await.unwrap();
        assert_eq!(event.instance().id, "o-1");
    }

    #[tokio::test]
    async fn test_reconnects_from_next_revision() {
        let store = MemoryCoordinator::new();
        let (mut watcher, _handle) = spawn_task(&store, 8);
        wait_for_watchers(&store, 1).await;

        put(&store, "o-1").await;
        assert_eq!(watcher.recv().await.unwrap().instance().id, "o-1");

        store.disconnect_watchers();
        // Written while no watch is open; replayed after reconnecting.
        put(&store, "o-2").await;

        let event = watcher.recv().await.unwrap();
        assert_eq!(event.instance().id, "o-2");
        wait_for_watchers(&store, 1).await;
    }

    #[tokio::test]
    async fn test_cancel_stops_task_and_closes_queue() {
        let store = MemoryCoordinator::new();
        let (mut watcher, handle) = spawn_task(&store, 8);
        wait_for_watchers(&store, 1).await;

        watcher.cancel();
        handle.await.unwrap();
        assert!(watcher.recv().await.is_none());
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_watcher_stops_task() {
        let store = MemoryCoordinator::new();
        let (watcher, handle) = spawn_task(&store, 1);
        wait_for_watchers(&store, 1).await;

        drop(watcher);
        handle.await.unwrap();
    }
}
