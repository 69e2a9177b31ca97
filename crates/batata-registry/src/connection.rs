//! Client connections to registered services
//!
//! A `ServiceConnection` is a tonic balance channel whose endpoint set is
//! maintained by the resolver registered for the target's scheme. The channel
//! connects lazily; `connect` additionally dials the resolved addresses so
//! callers can observe a connectivity state and wait for readiness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, Result};
use crate::resolver::balance::BalanceForwarder;
use crate::resolver::{AddressSink, BalanceSink, ResolverHandle, ResolverTarget, SchemeRegistry};

/// Default timeout for establishing one transport connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of the balance channel's update queue
pub const DEFAULT_BALANCE_BUFFER: usize = 1024;

/// Default wait before probing again after every address failed
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Transport settings for connections created by the registry.
#[derive(Clone, Debug)]
pub struct DialOptions {
    pub connect_timeout: Option<Duration>,
    /// Per-request timeout applied by the channel
    pub request_timeout: Option<Duration>,
    pub tcp_keepalive: Option<Duration>,
    pub http2_keep_alive_interval: Option<Duration>,
    /// When set, dialing waits until the connection is ready or fails with
    /// `DeadlineExceeded` once this much time has passed
    pub deadline: Option<Duration>,
    pub balance_buffer: usize,
    pub reconnect_backoff: Duration,
    /// Start probing immediately instead of on first `connect`
    pub eager: bool,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            request_timeout: None,
            tcp_keepalive: None,
            http2_keep_alive_interval: None,
            deadline: None,
            balance_buffer: DEFAULT_BALANCE_BUFFER,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            eager: false,
        }
    }
}

impl DialOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_tcp_keepalive(mut self, interval: Duration) -> Self {
        self.tcp_keepalive = Some(interval);
        self
    }

    pub fn with_http2_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.http2_keep_alive_interval = Some(interval);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn eager(mut self) -> Self {
        self.eager = true;
        self
    }

    /// Build a tonic endpoint for a resolved `host:port` address.
    pub fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(format!("http://{}", address))?;
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.request_timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(interval) = self.http2_keep_alive_interval {
            endpoint = endpoint.http2_keep_alive_interval(interval);
        }
        Ok(endpoint.tcp_keepalive(self.tcp_keepalive))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

struct Shared {
    state: watch::Sender<ConnectivityState>,
    addresses: watch::Receiver<Vec<String>>,
    options: DialOptions,
    probing: AtomicBool,
    token: CancellationToken,
}

/// A load-balanced client connection to one service.
pub struct ServiceConnection {
    target: ResolverTarget,
    channel: Channel,
    shared: Arc<Shared>,
    resolver: ResolverHandle,
    tracker: TaskTracker,
}

impl ServiceConnection {
    /// Dial `target` using the resolver registered for its scheme in the
    /// process-wide table.
    pub fn dial(target: &str, options: DialOptions) -> Result<Self> {
        Self::dial_with(SchemeRegistry::global(), target, options)
    }

    pub fn dial_with(schemes: &SchemeRegistry, target: &str, options: DialOptions) -> Result<Self> {
        let target = ResolverTarget::parse(target)?;
        let builder = schemes
            .get(&target.scheme)
            .ok_or_else(|| RegistryError::UnknownScheme(target.scheme.clone()))?;

        let sink = Arc::new(BalanceSink::new());
        let addresses = sink.subscribe();
        let (channel, changes) = Channel::balance_channel::<String>(options.balance_buffer);

        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(
            BalanceForwarder {
                addresses: sink.subscribe(),
                changes,
                options: options.clone(),
                token: token.clone(),
            }
            .run(),
        );

        let resolver = match builder.build(&target, sink as Arc<dyn AddressSink>) {
            Ok(resolver) => resolver,
            Err(e) => {
                token.cancel();
                return Err(e);
            }
        };

        let (state, _) = watch::channel(ConnectivityState::Idle);
        let eager = options.eager;
        let connection = Self {
            target,
            channel,
            shared: Arc::new(Shared {
                state,
                addresses,
                options,
                probing: AtomicBool::new(false),
                token,
            }),
            resolver,
            tracker,
        };
        info!(target = %connection.target, "Connection created");

        if eager {
            connection.connect();
        }
        Ok(connection)
    }

    /// Channel to build generated clients on.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn target(&self) -> &ResolverTarget {
        &self.target
    }

    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    /// Addresses the resolver last pushed.
    pub fn addresses(&self) -> Vec<String> {
        self.shared.addresses.borrow().clone()
    }

    /// Start a dial attempt unless one is running or the connection is
    /// already ready.
    pub fn connect(&self) {
        if !matches!(
            self.state(),
            ConnectivityState::Idle | ConnectivityState::TransientFailure
        ) {
            return;
        }
        if self
            .shared
            .probing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.tracker.spawn(dial_attempt(self.shared.clone()));
    }

    /// Wait until the state differs from `from` and return the new state.
    pub async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(|state| *state != from).await {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        }
    }

    /// Drive the connection to `Ready`, failing with `DeadlineExceeded` when
    /// `deadline` passes first.
    pub async fn wait_until_ready(&self, deadline: Duration) -> Result<()> {
        let until = Instant::now() + deadline;
        loop {
            let state = self.state();
            match state {
                ConnectivityState::Ready => return Ok(()),
                ConnectivityState::Shutdown => return Err(RegistryError::Closed),
                ConnectivityState::Idle | ConnectivityState::TransientFailure => self.connect(),
                ConnectivityState::Connecting => {}
            }
            if tokio::time::timeout_at(until, self.wait_for_state_change(state))
                .await
                .is_err()
            {
                return Err(RegistryError::DeadlineExceeded);
            }
        }
    }

    /// Ask the resolver to re-read the service now.
    pub fn resolve_now(&self) {
        self.resolver.resolve_now();
    }

    /// Stop resolution and probing, and mark the connection shut down.
    pub async fn close(&self) {
        self.shared.token.cancel();
        self.resolver.close().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.shared.state.send_replace(ConnectivityState::Shutdown);
        debug!(target = %self.target, "Connection closed");
    }
}

impl Drop for ServiceConnection {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

async fn dial_attempt(shared: Arc<Shared>) {
    let after_failure = *shared.state.borrow() == ConnectivityState::TransientFailure;
    shared.state.send_replace(ConnectivityState::Connecting);

    let outcome = tokio::select! {
        biased;
        _ = shared.token.cancelled() => None,
        ready = try_connect(&shared, after_failure) => Some(ready),
    };

    shared.probing.store(false, Ordering::SeqCst);
    match outcome {
        Some(true) => {
            shared.state.send_replace(ConnectivityState::Ready);
        }
        Some(false) => {
            shared
                .state
                .send_replace(ConnectivityState::TransientFailure);
        }
        None => {
            shared.state.send_replace(ConnectivityState::Shutdown);
        }
    }
}

async fn try_connect(shared: &Shared, after_failure: bool) -> bool {
    if after_failure {
        tokio::time::sleep(shared.options.reconnect_backoff).await;
    }

    let mut addresses = shared.addresses.clone();
    let resolved = match addresses.wait_for(|a| !a.is_empty()).await {
        Ok(resolved) => resolved.clone(),
        Err(_) => return false,
    };

    for address in &resolved {
        let endpoint = match shared.options.endpoint(address) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(address = %address, error = %e, "Skipping unusable address");
                continue;
            }
        };
        match endpoint.connect().await {
            Ok(_) => {
                debug!(address = %address, "Dial attempt succeeded");
                return true;
            }
            Err(e) => {
                warn!(address = %address, error = %e, "Dial attempt failed");
            }
        }
    }
    false
}
