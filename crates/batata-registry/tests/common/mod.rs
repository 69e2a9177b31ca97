// Shared helpers for registry integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use batata_coordination::MemoryCoordinator;
use batata_registry::{BidiStream, Registry, RegistryConfig, ServiceInstance, StreamError};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Only one registry may be open per process, so tests that create one run
/// one at a time.
static SERIAL: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn serial() -> MutexGuard<'static, ()> {
    init_tracing();
    SERIAL.lock().await
}

/// Install a test-writer subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config() -> RegistryConfig {
    RegistryConfig::default()
        .with_namespace("/test/registry")
        .with_watch_retry_interval(Duration::from_millis(20))
}

pub fn new_registry(store: &MemoryCoordinator) -> Registry {
    Registry::new(Arc::new(store.clone()), test_config()).unwrap()
}

pub fn instance(id: &str, name: &str, endpoint: &str) -> ServiceInstance {
    ServiceInstance::new(id, name)
        .with_version("1.0.0")
        .with_endpoint(endpoint)
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// In-process stand-in for a remote stream.
pub struct FakeStream {
    pub instance_id: String,
    pub serial: usize,
    done: CancellationToken,
    closes: AtomicUsize,
    close_fails: AtomicBool,
}

impl FakeStream {
    /// Make every later `close` report an error, after closing anyway.
    pub fn fail_close(&self) {
        self.close_fails.store(true, Ordering::SeqCst);
    }

    /// Simulate the remote side ending the stream.
    pub fn break_remote(&self) {
        self.done.cancel();
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

#[async_trait]
impl BidiStream for FakeStream {
    async fn closed(&self) {
        self.done.cancelled().await;
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.done.cancel();
        if self.close_fails.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }
}

/// Counts stream opens and can be told to fail the next few.
#[derive(Default)]
pub struct RecordingFactory {
    opened: AtomicUsize,
    failures_left: AtomicUsize,
    failed: AtomicUsize,
}

impl RecordingFactory {
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn open(&self, instance: &ServiceInstance) -> Result<FakeStream, StreamError> {
        let should_fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            self.failed.fetch_add(1, Ordering::SeqCst);
            return Err(StreamError::Open(format!("refused by {}", instance.id)));
        }

        let serial = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(FakeStream {
            instance_id: instance.id.clone(),
            serial,
            done: CancellationToken::new(),
            closes: AtomicUsize::new(0),
            close_fails: AtomicBool::new(false),
        })
    }
}
