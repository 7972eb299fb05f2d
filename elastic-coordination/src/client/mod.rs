//! Capability interface over the external coordination service.
//!
//! The rest of the crate only talks to a `CoordinationClient`; the etcd
//! implementation is the production backend and the mock backs the tests.

mod etcd;
mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use etcd::EtcdClient;
pub use mock::MockCoordinationClient;

pub type LeaseId = i64;

/// Handle for an active watch registration, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: WatchEventKind,
}

/// One delivery from a watch: every event the service reported together.
///
/// An empty batch is sent after a watch had to be re-established, since
/// changes may have been missed in between.
pub type WatchBatch = Vec<WatchEvent>;

/// A time-bounded liveness token. Its expiry deletes every key bound to it.
#[async_trait]
pub trait Lease: Send + Sync {
    fn id(&self) -> LeaseId;

    /// Extend the lease by its TTL. An error means liveness can no longer be
    /// vouched for.
    async fn refresh(&self) -> Result<()>;

    async fn revoke(&self) -> Result<()>;
}

/// Minimal surface of a strongly consistent key/value store with leases and
/// prefix watches.
///
/// Watch deliveries are pushed into the caller's channel from a task owned by
/// the client, never by invoking caller code re-entrantly.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Write `value` only if `key` does not exist yet. Returns whether the
    /// write happened.
    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Values of every key under `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    async fn grant_lease(&self, ttl: i64) -> Result<Arc<dyn Lease>>;

    async fn add_watch(&self, key: &str, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId>;

    async fn add_watch_prefix(&self, prefix: &str, sink: mpsc::Sender<WatchBatch>)
        -> Result<WatchId>;

    /// Cancel a watch. Cancelling an unknown or already cancelled watch is a
    /// no-op.
    async fn cancel_watch(&self, id: WatchId) -> Result<()>;
}
