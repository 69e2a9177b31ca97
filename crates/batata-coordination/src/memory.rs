//! In-process coordination store
//!
//! `MemoryCoordinator` implements the full lease + watch contract inside the
//! process: a single global revision counter, prefix reads, prefix watches
//! replayable from a past revision, history compaction, and leases that
//! expire (deleting their keys) unless renewed. History is capped: once it
//! holds more than the configured number of events, the oldest revisions are
//! compacted automatically. It backs tests and embedded
//! single-process deployments, and exposes fault-injection hooks for
//! exercising recovery paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::client::CoordinationClient;
use crate::error::{CoordinationError, Result};
use crate::types::{
    GetResponse, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, Revision, WatchEvent,
    WatchEventKind, WatchResponse, WatchStream,
};

/// Default interval of the lease expiry sweeper
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of watch events retained for replay
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

/// Lower bound between two keep-alive renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(100);

/// In-memory coordination store.
///
/// Cloning yields another handle on the same store.
#[derive(Clone)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    fail_puts: AtomicBool,
}

#[derive(Default)]
struct State {
    /// Upper bound on `history.len()`, except for the newest revision
    history_limit: usize,
    revision: Revision,
    compact_revision: Revision,
    next_lease: LeaseId,
    next_watcher: u64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    history: VecDeque<WatchEvent>,
    watchers: HashMap<u64, Watcher>,
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchResponse>>,
}

impl MemoryCoordinator {
    /// Create a store with the default expiry sweep interval.
    ///
    /// Must be called from within a Tokio runtime: the lease sweeper is spawned
    /// immediately and stops once every handle on the store is dropped.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a store whose lease sweeper runs every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                history_limit: DEFAULT_HISTORY_LIMIT,
                ..State::default()
            }),
            fail_puts: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.state.lock().expire_leases(Instant::now());
            }
        });

        Self { inner }
    }

    /// Retain at most `limit` events for replay.
    pub fn with_history_limit(self, limit: usize) -> Self {
        {
            let mut state = self.inner.state.lock();
            state.history_limit = limit.max(1);
            state.trim_history();
        }
        self
    }

    /// Number of events currently retained for replay.
    pub fn history_len(&self) -> usize {
        self.inner.state.lock().history.len()
    }

    /// Revision below which watches fail with `Compacted`.
    pub fn compact_revision(&self) -> Revision {
        self.inner.state.lock().compact_revision
    }

    /// Current store revision.
    pub fn current_revision(&self) -> Revision {
        self.inner.state.lock().revision
    }

    /// Number of live leases.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases.len()
    }

    /// Number of keys currently stored.
    pub fn key_count(&self) -> usize {
        self.inner.state.lock().kvs.len()
    }

    /// Number of open watch streams.
    pub fn watcher_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.watchers.retain(|_, w| !w.tx.is_closed());
        state.watchers.len()
    }

    /// Make every subsequent `put` fail with `Unavailable` while set.
    pub fn set_fail_puts(&self, fail: bool) {
        self.inner.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Close every open watch stream, as a dropped store connection would.
    pub fn disconnect_watchers(&self) {
        let dropped = std::mem::take(&mut self.inner.state.lock().watchers);
        info!("Disconnected {} watchers", dropped.len());
    }

    /// Expire a lease immediately, as if its TTL had elapsed.
    ///
    /// Returns `false` when the lease does not exist.
    pub fn expire_lease(&self, lease: LeaseId) -> bool {
        self.inner.state.lock().remove_lease(lease).is_some()
    }

    /// Discard history older than `revision`.
    ///
    /// Watches subsequently started below the compaction point fail with
    /// `CoordinationError::Compacted`.
    pub fn compact(&self, revision: Revision) {
        let mut state = self.inner.state.lock();
        let revision = revision.min(state.revision);
        if revision <= state.compact_revision {
            return;
        }
        state.compact_revision = revision;
        while state
            .history
            .front()
            .is_some_and(|e| e.kv.mod_revision < revision)
        {
            state.history.pop_front();
        }
        info!("Compacted history at revision {}", revision);
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Append events to history and fan them out to matching watchers.
    fn emit(&mut self, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }
        let revision = self.revision;
        self.history.extend(events.iter().cloned());
        self.trim_history();

        self.watchers.retain(|_, watcher| {
            let matching: Vec<WatchEvent> = events
                .iter()
                .filter(|e| e.kv.key.starts_with(&watcher.prefix))
                .cloned()
                .collect();
            if matching.is_empty() {
                return !watcher.tx.is_closed();
            }
            watcher
                .tx
                .send(Ok(WatchResponse {
                    revision,
                    events: matching,
                }))
                .is_ok()
        });
    }

    /// Compact whole revisions off the front until history fits its limit.
    /// The newest revision is never dropped.
    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            let Some(oldest) = self.history.front().map(|e| e.kv.mod_revision) else {
                break;
            };
            if oldest >= self.revision {
                break;
            }
            while self
                .history
                .front()
                .is_some_and(|e| e.kv.mod_revision == oldest)
            {
                self.history.pop_front();
            }
            self.compact_revision = self.compact_revision.max(oldest + 1);
        }
    }

    fn remove_lease(&mut self, lease: LeaseId) -> Option<LeaseEntry> {
        let entry = self.leases.remove(&lease)?;
        if !entry.keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            let mut events = Vec::with_capacity(entry.keys.len());
            for key in &entry.keys {
                if self.kvs.remove(key).is_some() {
                    events.push(WatchEvent {
                        kind: WatchEventKind::Delete,
                        kv: KeyValue {
                            key: key.clone(),
                            mod_revision: revision,
                            ..Default::default()
                        },
                    });
                }
            }
            self.emit(events);
        }
        Some(entry)
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for lease in expired {
            if let Some(entry) = self.remove_lease(lease) {
                debug!(
                    "Lease {} expired, removed {} keys",
                    lease,
                    entry.keys.len()
                );
            }
        }
    }

    fn live_lease(&self, lease: LeaseId, now: Instant) -> Option<&LeaseEntry> {
        self.leases.get(&lease).filter(|entry| entry.deadline > now)
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs <= 0 {
            return Err(CoordinationError::InvalidArgument(format!(
                "lease TTL must be positive, got {}",
                ttl_secs
            )));
        }
        let ttl = Duration::from_secs(ttl_secs as u64);

        let mut state = self.inner.state.lock();
        state.next_lease += 1;
        let lease = state.next_lease;
        state.leases.insert(
            lease,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(lease)
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision> {
        if self.inner.fail_puts.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable("put rejected".to_string()));
        }
        if key.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "key must not be empty".to_string(),
            ));
        }

        let mut state = self.inner.state.lock();
        if let Some(lease) = lease
            && state.live_lease(lease, Instant::now()).is_none()
        {
            return Err(CoordinationError::LeaseNotFound(lease));
        }

        state.revision += 1;
        let revision = state.revision;

        let previous = state.kvs.get(key).cloned();
        if let Some(prev) = &previous
            && prev.lease != 0
            && Some(prev.lease) != lease
            && let Some(entry) = state.leases.get_mut(&prev.lease)
        {
            entry.keys.remove(key);
        }
        if let Some(lease) = lease
            && let Some(entry) = state.leases.get_mut(&lease)
        {
            entry.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            lease: lease.unwrap_or(0),
        };
        state.kvs.insert(key.to_string(), kv.clone());
        state.emit(vec![WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        }]);

        Ok(revision)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let state = self.inner.state.lock();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();

        Ok(GetResponse {
            kvs,
            revision: state.revision,
        })
    }

    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.state.lock();

        if from_revision > 0 && from_revision < state.compact_revision {
            let _ = tx.send(Err(CoordinationError::Compacted {
                compact_revision: state.compact_revision,
            }));
            return Ok(UnboundedReceiverStream::new(rx).boxed());
        }

        if from_revision > 0 {
            // Replay history grouped by revision so batches match live delivery.
            let mut batch: Vec<WatchEvent> = Vec::new();
            let mut batch_revision = 0;
            for event in state
                .history
                .iter()
                .filter(|e| e.kv.mod_revision >= from_revision && e.kv.key.starts_with(prefix))
            {
                if event.kv.mod_revision != batch_revision && !batch.is_empty() {
                    let _ = tx.send(Ok(WatchResponse {
                        revision: batch_revision,
                        events: std::mem::take(&mut batch),
                    }));
                }
                batch_revision = event.kv.mod_revision;
                batch.push(event.clone());
            }
            if !batch.is_empty() {
                let _ = tx.send(Ok(WatchResponse {
                    revision: batch_revision,
                    events: batch,
                }));
            }
        }

        state.next_watcher += 1;
        let id = state.next_watcher;
        state.watchers.insert(
            id,
            Watcher {
                prefix: prefix.to_string(),
                tx,
            },
        );
        debug!(
            "Watch {} opened on prefix {} from revision {}",
            id, prefix, from_revision
        );

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream> {
        let ttl = {
            let state = self.inner.state.lock();
            state
                .live_lease(lease, Instant::now())
                .map(|entry| entry.ttl)
                .ok_or(CoordinationError::LeaseNotFound(lease))?
        };
        let renew_every = (ttl / 3).max(MIN_RENEW_INTERVAL);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let stream = futures::stream::unfold(true, move |first| {
            let weak = weak.clone();
            async move {
                if !first {
                    tokio::time::sleep(renew_every).await;
                }
                let inner = weak.upgrade()?;
                let mut state = inner.state.lock();
                let now = Instant::now();
                let entry = state
                    .leases
                    .get_mut(&lease)
                    .filter(|entry| entry.deadline > now)?;
                entry.deadline = now + entry.ttl;
                let response = KeepAliveResponse {
                    lease,
                    ttl_secs: entry.ttl.as_secs() as i64,
                };
                Some((Ok::<_, CoordinationError>(response), false))
            }
        });

        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.inner
            .state
            .lock()
            .remove_lease(lease)
            .map(|_| ())
            .ok_or(CoordinationError::LeaseNotFound(lease))
    }
}
