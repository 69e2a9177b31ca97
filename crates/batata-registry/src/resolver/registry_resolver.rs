//! Resolver backed by the registry's discovery and watch
//!
//! Watch events are only a trigger: every event causes a full re-read of the
//! service and a push of the complete address set. Addresses are never
//! patched incrementally, so a watch that resynced past a compacted window
//! still converges on the store's contents.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{AddressSink, ResolverBuilder, ResolverHandle, ResolverTarget, SCHEME, normalize_endpoints};
use crate::error::{RegistryError, Result};
use crate::model::ServiceInstance;
use crate::registry::RegistryInner;
use crate::watch::ServiceWatcher;

/// Builds resolvers for `batata:///<service_name>` targets.
///
/// Holds only a weak handle so an installed builder never keeps a closed
/// registry alive.
pub struct RegistryResolverBuilder {
    registry: Weak<RegistryInner>,
}

impl RegistryResolverBuilder {
    pub(crate) fn new(registry: Weak<RegistryInner>) -> Self {
        Self { registry }
    }
}

impl ResolverBuilder for RegistryResolverBuilder {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn build(&self, target: &ResolverTarget, sink: Arc<dyn AddressSink>) -> Result<ResolverHandle> {
        let registry = self.registry.upgrade().ok_or(RegistryError::Closed)?;
        if registry.is_closed() {
            return Err(RegistryError::Closed);
        }
        let token = registry.shutdown_token().child_token();

        let refresh = Arc::new(Notify::new());
        let tracker = TaskTracker::new();
        let resolver = ServiceResolver {
            registry: self.registry.clone(),
            service_name: target.service_name.clone(),
            retry_interval: registry.config().watch_retry_interval(),
            sink,
        };
        tracker.spawn(resolver.run(token.clone(), refresh.clone()));
        tracker.close();

        info!(target = %target, "Resolver started");
        Ok(ResolverHandle::new(refresh, token, tracker))
    }
}

struct ServiceResolver {
    registry: Weak<RegistryInner>,
    service_name: String,
    retry_interval: Duration,
    sink: Arc<dyn AddressSink>,
}

impl ServiceResolver {
    async fn run(self, token: CancellationToken, refresh: Arc<Notify>) {
        let mut watcher = loop {
            let subscribed = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                subscribed = self.subscribe(&token) => subscribed,
            };
            match subscribed {
                Ok(watcher) => break watcher,
                Err(RegistryError::Closed) => return,
                Err(e) => {
                    warn!(
                        service = %self.service_name,
                        error = %e,
                        "Resolver failed to start, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
            }
        };

        loop {
            tokio::select! {
                _ = refresh.notified() => self.reload().await,
                event = watcher.recv() => match event {
                    Some(event) => {
                        debug!(
                            service = %self.service_name,
                            instance_id = %event.instance().id,
                            "Change observed, re-reading service"
                        );
                        self.reload().await;
                    }
                    None => break,
                },
            }
        }

        debug!(service = %self.service_name, "Resolver stopped");
    }

    /// Push the current addresses, then watch from the revision after that
    /// read so no change falls between the two.
    async fn subscribe(&self, token: &CancellationToken) -> Result<ServiceWatcher> {
        let registry = self.registry.upgrade().ok_or(RegistryError::Closed)?;
        let (instances, revision) = registry.read_service(&self.service_name).await?;
        self.push(&instances);
        registry.watch_from(&self.service_name, token, revision + 1)
    }

    /// Read the service afresh and push the full address set.
    async fn reload(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.get_service(&self.service_name).await {
            Ok(instances) => self.push(&instances),
            Err(e) => {
                warn!(service = %self.service_name, error = %e, "Resolver refresh failed");
            }
        }
    }

    fn push(&self, instances: &[ServiceInstance]) {
        let addresses = normalize_endpoints(instances);
        if addresses.is_empty() {
            warn!(
                service = %self.service_name,
                "No endpoints resolved; keeping last known addresses"
            );
            return;
        }
        debug!(service = %self.service_name, addresses = ?addresses, "Pushing addresses");
        self.sink.update_addresses(addresses);
    }
}
