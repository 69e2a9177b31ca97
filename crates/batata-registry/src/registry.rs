//! Lease-backed service registry
//!
//! Instances are written under a lease that a background task keeps alive.
//! Discovery reads the service prefix, and watches follow it with the
//! self-healing subscription in [`crate::watch`]. Only one registry may be
//! active per process, since it owns the `batata` resolver scheme.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use batata_coordination::{CoordinationClient, CoordinationError, LeaseId, Revision};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{MIN_TTL, RegistryConfig};
use crate::connection::{DialOptions, ServiceConnection};
use crate::error::{RegistryError, Result};
use crate::lease::{Lease, LeaseTable, supervise};
use crate::model::{
    ServiceInstance, decode_instance, instance_id_from_key, instance_key, service_prefix,
    validate_service_name,
};
use crate::resolver::{RegistryResolverBuilder, ResolverTarget, SCHEME, SchemeRegistry};
use crate::watch::{ServiceWatcher, WatchTask};

/// Set while a registry is open in this process
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Service registry handle.
///
/// Call [`Registry::close`] to revoke every lease and stop background work.
/// Dropping an open registry stops background work but leaves its leases to
/// expire on their own.
pub struct Registry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    client: Arc<dyn CoordinationClient>,
    config: RegistryConfig,
    leases: Arc<LeaseTable>,
    subscriptions: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_subscription: AtomicU64,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl Registry {
    /// Create the process's registry on top of a connected store client.
    ///
    /// Fails with `AlreadyActive` while another registry is open.
    pub fn new(client: Arc<dyn CoordinationClient>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        if ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::AlreadyActive);
        }

        let inner = Arc::new(RegistryInner {
            client,
            config,
            leases: Arc::new(LeaseTable::default()),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        });
        SchemeRegistry::global().register(Arc::new(RegistryResolverBuilder::new(
            Arc::downgrade(&inner),
        )));

        info!(namespace = %inner.config.namespace, "Registry created");
        Ok(Self { inner })
    }

    /// Register `instance` under a lease of `ttl`.
    ///
    /// A zero `ttl` uses the configured default; anything between zero and
    /// one second is rejected.
    pub async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<()> {
        self.inner.register(instance, ttl).await
    }

    /// Revoke the lease of `instance_id`, removing it from the store.
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        self.inner.deregister(instance_id).await
    }

    /// Current instances of `service_name`. Malformed records are skipped.
    pub async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.inner.get_service(service_name).await
    }

    /// Follow changes to `service_name` until the watcher is dropped or the
    /// registry closes.
    pub fn watch(&self, service_name: &str) -> Result<ServiceWatcher> {
        self.inner
            .watch_with_cancel(service_name, &self.inner.shutdown)
    }

    /// Like [`Registry::watch`], additionally stopped when `cancel` fires.
    pub fn watch_with_cancel(
        &self,
        service_name: &str,
        cancel: &CancellationToken,
    ) -> Result<ServiceWatcher> {
        self.inner.watch_with_cancel(service_name, cancel)
    }

    /// Load-balanced connection to `service_name` through the registry resolver.
    pub async fn get_connection(
        &self,
        service_name: &str,
        options: DialOptions,
    ) -> Result<ServiceConnection> {
        self.inner.ensure_open()?;
        validate_service_name(service_name)?;

        let target = ResolverTarget::for_service(service_name).to_string();
        let deadline = options.deadline;
        let connection = ServiceConnection::dial(&target, options)?;

        if let Some(deadline) = deadline
            && let Err(e) = connection.wait_until_ready(deadline).await
        {
            connection.close().await;
            return Err(e);
        }
        Ok(connection)
    }

    /// Revoke every lease, stop every watch and wait for background tasks.
    ///
    /// Idempotent. Revocation is best effort: every lease is attempted and
    /// the first failure is returned.
    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    pub fn registered_ids(&self) -> Vec<String> {
        self.inner.leases.ids()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.leases.len()
    }

    /// Number of running watch subscriptions.
    pub fn watch_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub(crate) fn inner(&self) -> &Arc<RegistryInner> {
        &self.inner
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if self.inner.mark_closed() {
            let leases = self.inner.leases.drain();
            if !leases.is_empty() {
                warn!(
                    leases = leases.len(),
                    "Registry dropped without close; leases will expire after their TTL"
                );
            }
            for lease in leases {
                lease.release();
            }
            self.inner.stop_background();
            self.inner.release_process_slot();
        }
    }
}

impl RegistryInner {
    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    /// Flip to closed. Returns `true` for the caller that performed the flip.
    fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn effective_ttl(&self, ttl: Duration) -> Result<Duration> {
        if ttl.is_zero() {
            return Ok(self.config.default_ttl());
        }
        if ttl < MIN_TTL {
            return Err(RegistryError::InvalidTtl(ttl));
        }
        Ok(ttl)
    }

    async fn register(&self, instance: &ServiceInstance, ttl: Duration) -> Result<()> {
        self.ensure_open()?;
        instance.validate()?;
        let ttl = self.effective_ttl(ttl)?;

        let reservation = self.leases.reserve(&instance.id)?;
        let key = instance_key(&self.config.namespace, &instance.name, &instance.id);
        let value = serde_json::to_vec(instance)?;

        let lease_id = self
            .client
            .grant(ttl.as_secs() as i64)
            .await
            .map_err(RegistryError::coordination("grant"))?;

        let responses = match self.attach(&key, value, lease_id).await {
            Ok(responses) => responses,
            Err(e) => {
                self.revoke_quietly(lease_id).await;
                return Err(e);
            }
        };

        let lease = Arc::new(Lease::new(
            instance.id.clone(),
            instance.name.clone(),
            lease_id,
            self.shutdown.child_token(),
        ));
        self.leases.activate(reservation, lease.clone());
        self.tracker
            .spawn(supervise(lease.clone(), responses, self.leases.clone()));

        // A close that started meanwhile may have drained the table already.
        if self.is_closed() {
            if self.leases.remove_if_current(&lease) {
                lease.release();
                self.revoke_quietly(lease_id).await;
            }
            return Err(RegistryError::Closed);
        }

        info!(
            service = %instance.name,
            instance_id = %instance.id,
            lease_id,
            ttl_secs = ttl.as_secs(),
            "Instance registered"
        );
        Ok(())
    }

    async fn attach(
        &self,
        key: &str,
        value: Vec<u8>,
        lease_id: LeaseId,
    ) -> Result<batata_coordination::KeepAliveStream> {
        self.client
            .put(key, value, Some(lease_id))
            .await
            .map_err(RegistryError::coordination("put"))?;
        self.client
            .keep_alive(lease_id)
            .await
            .map_err(RegistryError::coordination("keep_alive"))
    }

    async fn revoke_quietly(&self, lease_id: LeaseId) {
        if let Err(e) = self.client.revoke(lease_id).await {
            warn!(lease_id, error = %e, "Failed to revoke lease");
        }
    }

    async fn deregister(&self, instance_id: &str) -> Result<()> {
        self.ensure_open()?;
        let lease = self
            .leases
            .remove(instance_id)
            .ok_or_else(|| RegistryError::NotFound(instance_id.to_string()))?;
        lease.release();
        revoke(self.client.as_ref(), lease.lease_id).await?;

        info!(
            service = %lease.service_name,
            instance_id = %instance_id,
            lease_id = lease.lease_id,
            "Instance deregistered"
        );
        Ok(())
    }

    pub(crate) fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub(crate) async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>> {
        self.read_service(service_name)
            .await
            .map(|(instances, _)| instances)
    }

    /// Current instances together with the store revision they were read at.
    pub(crate) async fn read_service(
        &self,
        service_name: &str,
    ) -> Result<(Vec<ServiceInstance>, Revision)> {
        self.ensure_open()?;
        validate_service_name(service_name)?;

        let prefix = service_prefix(&self.config.namespace, service_name);
        let response = self
            .client
            .get_prefix(&prefix)
            .await
            .map_err(RegistryError::coordination("get"))?;

        let instances: Vec<ServiceInstance> = response
            .kvs
            .iter()
            .filter(|kv| instance_id_from_key(&prefix, &kv.key).is_some())
            .filter_map(decode_instance)
            .collect();
        debug!(
            service = %service_name,
            instances = instances.len(),
            revision = response.revision,
            "Service read"
        );
        Ok((instances, response.revision))
    }

    pub(crate) fn watch_with_cancel(
        &self,
        service_name: &str,
        parent: &CancellationToken,
    ) -> Result<ServiceWatcher> {
        self.watch_from(service_name, parent, 0)
    }

    /// Start a subscription at `from_revision`; 0 anchors it at the current
    /// revision once the watch opens.
    pub(crate) fn watch_from(
        &self,
        service_name: &str,
        parent: &CancellationToken,
        from_revision: Revision,
    ) -> Result<ServiceWatcher> {
        self.ensure_open()?;
        validate_service_name(service_name)?;

        let token = parent.child_token();
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().insert(id, token.clone());
        // Pairs with `close`, which flips the flag before cancelling subscriptions.
        if self.is_closed() {
            self.subscriptions.lock().remove(&id);
            token.cancel();
            return Err(RegistryError::Closed);
        }

        let (tx, rx) = mpsc::channel(self.config.watch_buffer_size);
        let task = WatchTask {
            client: self.client.clone(),
            service_name: service_name.to_string(),
            prefix: service_prefix(&self.config.namespace, service_name),
            retry_interval: self.config.watch_retry_interval(),
            start_revision: from_revision,
            tx,
            token: token.clone(),
        };
        let subscriptions = self.subscriptions.clone();
        self.tracker.spawn(async move {
            task.run().await;
            subscriptions.lock().remove(&id);
        });

        Ok(ServiceWatcher::new(service_name.to_string(), rx, token))
    }

    async fn close(&self) -> Result<()> {
        if !self.mark_closed() {
            return Ok(());
        }
        info!("Closing registry");

        let mut first_error = None;
        for lease in self.leases.drain() {
            lease.release();
            if let Err(e) = revoke(self.client.as_ref(), lease.lease_id).await {
                warn!(instance_id = %lease.instance_id, error = %e, "Failed to revoke lease on close");
                first_error.get_or_insert(e);
            }
        }

        self.stop_background();
        self.tracker.wait().await;
        self.release_process_slot();

        info!("Registry closed");
        first_error.map_or(Ok(()), Err)
    }

    fn stop_background(&self) {
        let subscriptions: Vec<CancellationToken> =
            self.subscriptions.lock().values().cloned().collect();
        for token in subscriptions {
            token.cancel();
        }
        self.shutdown.cancel();
        self.tracker.close();
    }

    fn release_process_slot(&self) {
        SchemeRegistry::global().deregister(SCHEME);
        ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Revoke a lease; one that already expired counts as revoked.
async fn revoke(client: &dyn CoordinationClient, lease_id: LeaseId) -> Result<()> {
    match client.revoke(lease_id).await {
        Ok(()) => Ok(()),
        Err(CoordinationError::LeaseNotFound(_)) => {
            debug!(lease_id, "Lease already gone");
            Ok(())
        }
        Err(e) => Err(RegistryError::coordination("revoke")(e)),
    }
}
