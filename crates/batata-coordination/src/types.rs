//! Wire-level types shared by every coordination store backend

use futures::stream::BoxStream;

use crate::error::CoordinationError;

/// Store-assigned lease identifier
pub type LeaseId = i64;

/// Store-wide, monotonically increasing modification counter
pub type Revision = i64;

/// A key/value record as held by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created
    pub create_revision: Revision,
    /// Revision of the last modification (or of the deletion, for delete events)
    pub mod_revision: Revision,
    /// Lease the key is attached to, 0 when none
    pub lease: LeaseId,
}

/// Result of a prefix read.
#[derive(Clone, Debug, Default)]
pub struct GetResponse {
    pub kvs: Vec<KeyValue>,
    /// Store revision the read was served at
    pub revision: Revision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A single change notification.
///
/// Delete notifications carry the key and the delete revision but no value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// A batch of notifications delivered together.
#[derive(Clone, Debug, Default)]
pub struct WatchResponse {
    /// Store revision when the batch was produced
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Renewal acknowledgement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    /// Remaining TTL after the renewal, in seconds
    pub ttl_secs: i64,
}

/// Stream of watch batches. Ends when the watch is closed by the store.
pub type WatchStream = BoxStream<'static, Result<WatchResponse, CoordinationError>>;

/// Stream of renewal acknowledgements. Ends when the lease is lost.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveResponse, CoordinationError>>;
