//! etcd v3 coordination store backend

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions};
use etcd_client::{WatchOptions, WatchStream as EtcdWatchStream, Watcher};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::client::CoordinationClient;
use crate::error::{CoordinationError, Result};
use crate::types::{
    GetResponse, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, Revision, WatchEvent,
    WatchEventKind, WatchResponse, WatchStream,
};

/// Lower bound between two keep-alive renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(500);

/// Coordination client backed by an etcd cluster.
#[derive(Clone)]
pub struct EtcdCoordinator {
    client: Client,
}

impl EtcdCoordinator {
    /// Connect to the given etcd endpoints (e.g. `["127.0.0.1:2379"]`).
    pub async fn connect<E: AsRef<str>, S: AsRef<[E]>>(endpoints: S) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self { client })
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        lease: kv.lease(),
    }
}

fn convert_watch_response(resp: &etcd_client::WatchResponse) -> WatchResponse {
    let events = resp
        .events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => WatchEventKind::Put,
                EventType::Delete => WatchEventKind::Delete,
            };
            Some(WatchEvent {
                kind,
                kv: convert_kv(kv),
            })
        })
        .collect();

    WatchResponse {
        revision: resp.header().map_or(0, |h| h.revision()),
        events,
    }
}

#[async_trait]
impl CoordinationClient for EtcdCoordinator {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        let resp = self.client.clone().put(key, value, options).await?;
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let resp = self
            .client
            .clone()
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;

        Ok(GetResponse {
            kvs: resp.kvs().iter().map(convert_kv).collect(),
            revision: resp.header().map_or(0, |h| h.revision()),
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let mut options = WatchOptions::new().with_prefix();
        if from_revision > 0 {
            options = options.with_start_revision(from_revision);
        }
        let (watcher, stream) = self.client.clone().watch(prefix, Some(options)).await?;
        debug!(
            "etcd watch {} opened on prefix {} from revision {}",
            watcher.watch_id(),
            prefix,
            from_revision
        );

        // The watcher is carried along with the stream: dropping it cancels the watch.
        let state: Option<(Watcher, EtcdWatchStream)> = Some((watcher, stream));
        let stream = futures::stream::unfold(state, |state| async move {
            let (watcher, mut stream) = state?;
            match stream.message().await {
                Ok(Some(resp)) => {
                    if resp.compact_revision() > 0 {
                        let err = CoordinationError::Compacted {
                            compact_revision: resp.compact_revision(),
                        };
                        return Some((Err(err), None));
                    }
                    if resp.canceled() {
                        warn!("etcd watch {} canceled by server", watcher.watch_id());
                        return None;
                    }
                    Some((
                        Ok(convert_watch_response(&resp)),
                        Some((watcher, stream)),
                    ))
                }
                Ok(None) => None,
                Err(e) => Some((Err(CoordinationError::from(e)), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let (keeper, responses) = self.client.clone().lease_keep_alive(lease).await?;

        let state: Option<(LeaseKeeper, LeaseKeepAliveStream, Option<Duration>)> =
            Some((keeper, responses, None));
        let stream = futures::stream::unfold(state, |state| async move {
            let (mut keeper, mut responses, wait) = state?;
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }
            if let Err(e) = keeper.keep_alive().await {
                return Some((Err(CoordinationError::from(e)), None));
            }
            match responses.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    let ack = KeepAliveResponse {
                        lease: resp.id(),
                        ttl_secs: resp.ttl(),
                    };
                    let wait = (Duration::from_secs(resp.ttl() as u64) / 3).max(MIN_RENEW_INTERVAL);
                    Some((Ok(ack), Some((keeper, responses, Some(wait)))))
                }
                // A non-positive TTL means the lease is gone.
                Ok(_) => None,
                Err(e) => Some((Err(CoordinationError::from(e)), None)),
            }
        });

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.client.clone().lease_revoke(lease).await?;
        Ok(())
    }
}
