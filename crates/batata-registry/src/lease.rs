//! Lease bookkeeping and keep-alive supervision
//!
//! Every registered instance owns one store lease. A supervising task drains
//! the lease's keep-alive stream for as long as the lease lives and reports
//! how it ended: voluntary deregistration is quiet, anything else is a lost
//! registration that is surfaced at error level and never re-registered.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use batata_coordination::{KeepAliveStream, LeaseId};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{RegistryError, Result};

/// One registered instance's hold on the store.
pub(crate) struct Lease {
    pub instance_id: String,
    pub service_name: String,
    pub lease_id: LeaseId,
    /// Stops the supervising task
    pub cancel: CancellationToken,
    /// Set before a voluntary stop so the end of keep-alive is not treated as a loss
    pub closed_by_caller: AtomicBool,
}

impl Lease {
    pub fn new(
        instance_id: String,
        service_name: String,
        lease_id: LeaseId,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            instance_id,
            service_name,
            lease_id,
            cancel,
            closed_by_caller: AtomicBool::new(false),
        }
    }

    /// Mark the lease as released by its owner and stop supervision.
    pub fn release(&self) {
        self.closed_by_caller.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_closed_by_caller(&self) -> bool {
        self.closed_by_caller.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Tables {
    active: HashMap<String, Arc<Lease>>,
    /// Instance ids whose registration is in flight
    pending: HashSet<String>,
}

/// Leases keyed by instance id.
#[derive(Default)]
pub(crate) struct LeaseTable {
    inner: RwLock<Tables>,
}

impl LeaseTable {
    /// Claim `instance_id` for a registration in flight.
    ///
    /// The claim is released when the returned guard drops unless it is
    /// turned into an active lease with `LeaseTable::activate`.
    pub fn reserve(self: &Arc<Self>, instance_id: &str) -> Result<Reservation> {
        let mut tables = self.inner.write();
        if tables.active.contains_key(instance_id) || tables.pending.contains(instance_id) {
            return Err(RegistryError::AlreadyRegistered(instance_id.to_string()));
        }
        tables.pending.insert(instance_id.to_string());
        Ok(Reservation {
            table: self.clone(),
            instance_id: instance_id.to_string(),
        })
    }

    pub fn activate(&self, reservation: Reservation, lease: Arc<Lease>) {
        self.inner
            .write()
            .active
            .insert(reservation.instance_id.clone(), lease);
        // The pending claim is released only once the active entry exists.
        drop(reservation);
    }

    pub fn remove(&self, instance_id: &str) -> Option<Arc<Lease>> {
        self.inner.write().active.remove(instance_id)
    }

    /// Remove `lease` only if it is still the one registered for its instance.
    pub fn remove_if_current(&self, lease: &Arc<Lease>) -> bool {
        let mut tables = self.inner.write();
        match tables.active.get(&lease.instance_id) {
            Some(current) if Arc::ptr_eq(current, lease) => {
                tables.active.remove(&lease.instance_id);
                true
            }
            _ => false,
        }
    }

    pub fn drain(&self) -> Vec<Arc<Lease>> {
        self.inner.write().active.drain().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().active.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.read().active.keys().cloned().collect()
    }
}

/// Claim on an instance id held while its registration is in flight.
pub(crate) struct Reservation {
    table: Arc<LeaseTable>,
    instance_id: String,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.table.inner.write().pending.remove(&self.instance_id);
    }
}

/// Drain a lease's keep-alive stream until it ends or the lease is released.
pub(crate) async fn supervise(
    lease: Arc<Lease>,
    mut responses: KeepAliveStream,
    table: Arc<LeaseTable>,
) {
    loop {
        tokio::select! {
            biased;
            _ = lease.cancel.cancelled() => break,
            item = responses.next() => match item {
                Some(Ok(ack)) => {
                    debug!(
                        instance_id = %lease.instance_id,
                        lease_id = ack.lease,
                        ttl_secs = ack.ttl_secs,
                        "Lease renewed"
                    );
                }
                Some(Err(e)) => {
                    warn!(
                        instance_id = %lease.instance_id,
                        lease_id = lease.lease_id,
                        error = %e,
                        "Keep-alive failed"
                    );
                    break;
                }
                None => break,
            },
        }
    }
    drop(responses);

    if lease.is_closed_by_caller() {
        info!(
            instance_id = %lease.instance_id,
            lease_id = lease.lease_id,
            "Keep-alive stopped after deregistration"
        );
        return;
    }

    if lease.cancel.is_cancelled() {
        debug!(
            instance_id = %lease.instance_id,
            lease_id = lease.lease_id,
            "Keep-alive stopped by shutdown"
        );
        return;
    }

    let removed = table.remove_if_current(&lease);
    error!(
        service = %lease.service_name,
        instance_id = %lease.instance_id,
        lease_id = lease.lease_id,
        removed,
        "Lease lost: TTL exceeded or coordination store unreachable; instance is no longer registered"
    );
}
