//! Stream manager
//!
//! Keeps exactly one open stream per live instance of a service:
//!
//! - `Put` for an unknown instance opens a stream; for a tracked one it only
//!   refreshes the cached instance.
//! - `Delete` closes the instance's stream for good.
//! - A stream that ends on its own is rebuilt, first over the connection it
//!   used, then over a fresh connection to an endpoint chosen by the picker.
//!
//! Every entry carries a generation. A rebuild or retry only installs its
//! stream if the entry still has the generation it started from, so a
//! replacement racing with a removal or a newer rebuild is discarded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tracing::{debug, error, info, warn};

use super::picker::{EndpointPicker, RoundRobinPicker};
use super::{BidiStream, StreamError};
use crate::connection::DialOptions;
use crate::error::{RegistryError, Result};
use crate::model::{ServiceEvent, ServiceInstance, validate_service_name};
use crate::registry::{Registry, RegistryInner};
use crate::watch::ServiceWatcher;

/// Default wait between failed attempts to open an instance's stream
pub const DEFAULT_REBUILD_BACKOFF: Duration = Duration::from_secs(1);

/// Opens a stream to one instance over a connected channel.
pub type StreamFactory<S> = Arc<
    dyn Fn(Channel, ServiceInstance) -> BoxFuture<'static, std::result::Result<S, StreamError>>
        + Send
        + Sync,
>;

pub type InstanceCallback = Arc<dyn Fn(&ServiceInstance) + Send + Sync>;

pub type ErrorCallback = Arc<dyn Fn(&ServiceInstance, &StreamError) + Send + Sync>;

pub struct StreamManagerConfig<S> {
    pub service_name: String,
    pub dial_options: DialOptions,
    pub factory: StreamFactory<S>,
    /// Defaults to [`RoundRobinPicker`]
    pub picker: Option<Arc<dyn EndpointPicker>>,
    /// Called whenever a stream is installed, including after a rebuild
    pub on_add: Option<InstanceCallback>,
    /// Called when a removed instance's stream has been closed
    pub on_remove: Option<InstanceCallback>,
    /// Called for every failed attempt to open a stream
    pub on_error: Option<ErrorCallback>,
    pub rebuild_backoff: Duration,
}

impl<S: BidiStream> StreamManagerConfig<S> {
    pub fn new<F, Fut>(service_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Channel, ServiceInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<S, StreamError>> + Send + 'static,
    {
        Self {
            service_name: service_name.into(),
            dial_options: DialOptions::default(),
            factory: Arc::new(move |channel, instance| factory(channel, instance).boxed()),
            picker: None,
            on_add: None,
            on_remove: None,
            on_error: None,
            rebuild_backoff: DEFAULT_REBUILD_BACKOFF,
        }
    }

    pub fn with_dial_options(mut self, options: DialOptions) -> Self {
        self.dial_options = options;
        self
    }

    pub fn with_picker(mut self, picker: Arc<dyn EndpointPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    pub fn on_add(mut self, f: impl Fn(&ServiceInstance) + Send + Sync + 'static) -> Self {
        self.on_add = Some(Arc::new(f));
        self
    }

    pub fn on_remove(mut self, f: impl Fn(&ServiceInstance) + Send + Sync + 'static) -> Self {
        self.on_remove = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(&ServiceInstance, &StreamError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn with_rebuild_backoff(mut self, backoff: Duration) -> Self {
        self.rebuild_backoff = backoff;
        self
    }
}

/// An open stream and the connection it runs over.
struct ManagedStream<S> {
    stream: Arc<S>,
    channel: Channel,
    instance: ServiceInstance,
    /// Stops the monitor
    token: CancellationToken,
    closed_by_manager: AtomicBool,
}

impl<S: BidiStream> ManagedStream<S> {
    async fn shutdown(&self) -> std::result::Result<(), StreamError> {
        self.closed_by_manager.store(true, Ordering::SeqCst);
        self.token.cancel();
        self.stream.close().await
    }
}

struct Entry<S> {
    /// Latest known instance
    instance: ServiceInstance,
    generation: u64,
    stream: Option<Arc<ManagedStream<S>>>,
}

enum Attempt {
    Installed,
    /// The entry changed or the manager stopped; nothing left to do
    Stale,
    Failed,
}

struct Shared<S> {
    registry: Arc<RegistryInner>,
    service_name: String,
    dial_options: DialOptions,
    factory: StreamFactory<S>,
    picker: Arc<dyn EndpointPicker>,
    on_add: Option<InstanceCallback>,
    on_remove: Option<InstanceCallback>,
    on_error: Option<ErrorCallback>,
    rebuild_backoff: Duration,
    entries: Mutex<HashMap<String, Entry<S>>>,
    next_generation: AtomicU64,
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Maintains one stream per live instance of a service.
pub struct StreamManager<S> {
    shared: Arc<Shared<S>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl<S: BidiStream> StreamManager<S> {
    pub fn new(registry: &Registry, config: StreamManagerConfig<S>) -> Result<Self> {
        validate_service_name(&config.service_name)?;
        if registry.is_closed() {
            return Err(RegistryError::Closed);
        }

        let shared = Shared {
            registry: registry.inner().clone(),
            service_name: config.service_name,
            dial_options: config.dial_options,
            factory: config.factory,
            picker: config
                .picker
                .unwrap_or_else(|| Arc::new(RoundRobinPicker::new())),
            on_add: config.on_add,
            on_remove: config.on_remove,
            on_error: config.on_error,
            rebuild_backoff: config.rebuild_backoff,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        Ok(Self {
            shared: Arc::new(shared),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Open streams to every current instance and start following changes.
    ///
    /// Returns once the initial streams have been attempted. Instances whose
    /// stream could not be opened are retried in the background.
    pub async fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RegistryError::AlreadyStarted);
        }

        let shared = &self.shared;
        let (watcher, instances) = match shared.subscribe().await {
            Ok(opened) => opened,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            service = %shared.service_name,
            instances = instances.len(),
            "Stream manager starting"
        );
        for instance in instances {
            shared.upsert(instance).await;
        }

        shared.tracker.spawn(shared.clone().dispatch(watcher));
        Ok(())
    }

    /// Close every stream and wait for all background work. Idempotent.
    ///
    /// Every stream is closed even when some fail to; the first failure is
    /// returned.
    pub async fn stop(&self) -> Result<()> {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let shared = &self.shared;
        shared.token.cancel();

        let mut first_error = None;
        let entries: Vec<Entry<S>> = shared.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Some(managed) = entry.stream
                && let Err(e) = managed.shutdown().await
            {
                warn!(
                    service = %shared.service_name,
                    instance_id = %entry.instance.id,
                    error = %e,
                    "Failed to close stream on stop"
                );
                first_error.get_or_insert(e);
            }
        }

        shared.tracker.close();
        shared.tracker.wait().await;
        info!(service = %shared.service_name, "Stream manager stopped");
        first_error.map_or(Ok(()), |e| Err(RegistryError::Stream(e)))
    }

    /// Snapshot of the open streams keyed by instance id.
    pub fn streams(&self) -> HashMap<String, Arc<S>> {
        self.shared
            .entries
            .lock()
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .stream
                    .as_ref()
                    .map(|managed| (id.clone(), managed.stream.clone()))
            })
            .collect()
    }

    /// Tracked instances, with or without an open stream.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.shared
            .entries
            .lock()
            .values()
            .map(|entry| entry.instance.clone())
            .collect()
    }

    pub fn service_name(&self) -> &str {
        &self.shared.service_name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopped.load(Ordering::SeqCst)
    }
}

impl<S> Drop for StreamManager<S> {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

impl<S: BidiStream> Shared<S> {
    /// Read the current instances, then watch from the revision right after
    /// the read so no change falls between the two.
    async fn subscribe(&self) -> Result<(ServiceWatcher, Vec<ServiceInstance>)> {
        let (instances, revision) = self.registry.read_service(&self.service_name).await?;
        let watcher = self
            .registry
            .watch_from(&self.service_name, &self.token, revision + 1)?;
        Ok((watcher, instances))
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    async fn dispatch(self: Arc<Self>, mut watcher: ServiceWatcher) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                event = watcher.recv() => event,
            };
            match event {
                Some(ServiceEvent::Put(instance)) => self.upsert(instance).await,
                Some(ServiceEvent::Delete(instance)) => self.remove(&instance.id).await,
                None => {
                    info!(service = %self.service_name, "Watch ended, stream manager idle");
                    break;
                }
            }
        }
    }

    async fn upsert(self: &Arc<Self>, instance: ServiceInstance) {
        let generation = {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&instance.id) {
                debug!(
                    service = %self.service_name,
                    instance_id = %instance.id,
                    "Refreshed tracked instance"
                );
                entry.instance = instance;
                return;
            }
            let generation = self.next_generation();
            entries.insert(
                instance.id.clone(),
                Entry {
                    instance: instance.clone(),
                    generation,
                    stream: None,
                },
            );
            generation
        };
        self.establish(instance.id, generation, None).await;
    }

    async fn remove(&self, instance_id: &str) {
        let Some(entry) = self.entries.lock().remove(instance_id) else {
            return;
        };
        self.picker.forget(instance_id);
        if let Some(managed) = entry.stream
            && let Err(e) = managed.shutdown().await
        {
            warn!(
                service = %self.service_name,
                instance_id = %instance_id,
                error = %e,
                "Failed to close removed stream"
            );
        }
        if let Some(on_remove) = &self.on_remove {
            on_remove(&entry.instance);
        }
        info!(
            service = %self.service_name,
            instance_id = %instance_id,
            "Stream removed"
        );
    }

    /// Open and install a stream for entry `(instance_id, generation)`,
    /// retrying in the background after a failure.
    ///
    /// Boxed because monitors call back into it.
    fn establish(
        self: &Arc<Self>,
        instance_id: String,
        generation: u64,
        reuse: Option<Channel>,
    ) -> BoxFuture<'static, ()> {
        let shared = self.clone();
        async move {
            if let Attempt::Failed = shared.attempt(&instance_id, generation, reuse).await {
                let retrying = shared.clone();
                shared
                    .tracker
                    .spawn(async move { retrying.retry(instance_id, generation).await });
            }
        }
        .boxed()
    }

    async fn retry(self: Arc<Self>, instance_id: String, generation: u64) {
        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                _ = tokio::time::sleep(self.rebuild_backoff) => {}
            }
            debug!(
                service = %self.service_name,
                instance_id = %instance_id,
                "Retrying stream"
            );
            match self.attempt(&instance_id, generation, None).await {
                Attempt::Failed => continue,
                Attempt::Installed | Attempt::Stale => return,
            }
        }
    }

    async fn attempt(
        self: &Arc<Self>,
        instance_id: &str,
        generation: u64,
        reuse: Option<Channel>,
    ) -> Attempt {
        let Some(instance) = self.current(instance_id, generation) else {
            return Attempt::Stale;
        };

        let opened = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Attempt::Stale,
            opened = self.open(&instance, reuse) => opened,
        };
        let (channel, stream) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(
                    service = %self.service_name,
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to open stream"
                );
                if let Some(on_error) = &self.on_error {
                    on_error(&instance, &e);
                }
                return Attempt::Failed;
            }
        };

        let managed = Arc::new(ManagedStream {
            stream: Arc::new(stream),
            channel,
            instance: instance.clone(),
            token: self.token.child_token(),
            closed_by_manager: AtomicBool::new(false),
        });

        let installed = {
            let mut entries = self.entries.lock();
            match entries.get_mut(instance_id) {
                Some(entry)
                    if entry.generation == generation
                        && entry.stream.is_none()
                        && !self.token.is_cancelled() =>
                {
                    entry.stream = Some(managed.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            debug!(
                service = %self.service_name,
                instance_id = %instance_id,
                "Discarding stream for a superseded entry"
            );
            if let Err(e) = managed.shutdown().await {
                debug!(instance_id = %instance_id, error = %e, "Discarded stream failed to close");
            }
            return Attempt::Stale;
        }

        self.tracker
            .spawn(self.clone().monitor(managed, instance_id.to_string(), generation));
        if let Some(on_add) = &self.on_add {
            on_add(&instance);
        }
        info!(
            service = %self.service_name,
            instance_id = %instance_id,
            generation,
            "Stream added"
        );
        Attempt::Installed
    }

    fn current(&self, instance_id: &str, generation: u64) -> Option<ServiceInstance> {
        self.entries
            .lock()
            .get(instance_id)
            .filter(|entry| entry.generation == generation)
            .map(|entry| entry.instance.clone())
    }

    /// Open a stream, over `reuse` first when given, else over a new
    /// connection to an endpoint chosen by the picker.
    async fn open(
        &self,
        instance: &ServiceInstance,
        reuse: Option<Channel>,
    ) -> std::result::Result<(Channel, S), StreamError> {
        if let Some(channel) = reuse {
            match (self.factory)(channel.clone(), instance.clone()).await {
                Ok(stream) => return Ok((channel, stream)),
                Err(e) => {
                    warn!(
                        instance_id = %instance.id,
                        error = %e,
                        "Reopening over existing connection failed, dialing a new one"
                    );
                }
            }
        }

        let address = self.picker.pick(instance).ok_or_else(|| {
            StreamError::Open(format!("instance '{}' has no endpoints", instance.id))
        })?;
        let endpoint = self
            .dial_options
            .endpoint(&address)
            .map_err(|e| StreamError::Open(e.to_string()))?;
        let channel = if self.dial_options.eager {
            endpoint.connect().await?
        } else {
            endpoint.connect_lazy()
        };
        debug!(instance_id = %instance.id, address = %address, "Dialed instance");

        let stream = (self.factory)(channel.clone(), instance.clone()).await?;
        Ok((channel, stream))
    }

    /// Wait for the stream to end and rebuild it unless the manager closed it.
    async fn monitor(
        self: Arc<Self>,
        managed: Arc<ManagedStream<S>>,
        instance_id: String,
        generation: u64,
    ) {
        tokio::select! {
            biased;
            _ = managed.token.cancelled() => return,
            _ = managed.stream.closed() => {}
        }
        if managed.closed_by_manager.load(Ordering::SeqCst) {
            return;
        }

        let next = {
            let mut entries = self.entries.lock();
            match entries.get_mut(&instance_id) {
                Some(entry)
                    if entry.generation == generation
                        && entry
                            .stream
                            .as_ref()
                            .is_some_and(|current| Arc::ptr_eq(current, &managed)) =>
                {
                    let next = self.next_generation();
                    entry.generation = next;
                    entry.stream = None;
                    Some(next)
                }
                _ => None,
            }
        };
        let Some(next) = next else {
            return;
        };

        warn!(
            service = %self.service_name,
            instance_id = %instance_id,
            endpoints = ?managed.instance.endpoints,
            "Stream ended unexpectedly, rebuilding"
        );
        self.establish(instance_id, next, Some(managed.channel.clone()))
            .await;
    }
}
