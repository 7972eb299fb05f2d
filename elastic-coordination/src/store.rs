use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::{CoordinationClient, Lease, LeaseId, WatchBatch, WatchId};
use crate::error::{Error, Result};
use crate::types::{PeerSet, Roster};

/// Status value written while the job is running.
pub const STATUS_RUNNING: &str = "0";
/// Status value written once the job completed.
pub const STATUS_COMPLETED: &str = "1";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Key prefix shared by every job (e.g., "/elastic/" or "/test-{uuid}/").
    pub prefix: String,
    pub job_id: String,
}

/// All key patterns used by the store.
enum StoreKey<'a> {
    JobPrefix,
    NodesPrefix,
    Node(&'a str),
    Np,
    Endpoints,
    Status,
}

impl StoreKey<'_> {
    fn resolve(&self, prefix: &str, job: &str) -> String {
        match self {
            StoreKey::JobPrefix => format!("{prefix}{job}/"),
            StoreKey::NodesPrefix => format!("{prefix}{job}/nodes/"),
            StoreKey::Node(tag) => format!("{prefix}{job}/nodes/{tag}"),
            StoreKey::Np => format!("{prefix}{job}/np"),
            StoreKey::Endpoints => format!("{prefix}{job}/endpoints"),
            StoreKey::Status => format!("{prefix}{job}/status"),
        }
    }
}

/// Typed view of one job's coordination state.
#[derive(Clone)]
pub struct JobStore {
    client: Arc<dyn CoordinationClient>,
    config: StoreConfig,
}

impl JobStore {
    pub fn new(client: Arc<dyn CoordinationClient>, config: StoreConfig) -> Self {
        Self { client, config }
    }

    fn key(&self, k: StoreKey<'_>) -> String {
        k.resolve(&self.config.prefix, &self.config.job_id)
    }

    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    pub fn nodes_prefix(&self) -> String {
        self.key(StoreKey::NodesPrefix)
    }

    pub fn node_key(&self, tag: &str) -> String {
        self.key(StoreKey::Node(tag))
    }

    pub fn np_key(&self) -> String {
        self.key(StoreKey::Np)
    }

    pub fn endpoints_key(&self) -> String {
        self.key(StoreKey::Endpoints)
    }

    // ── Leases ──────────────────────────────────────────────────

    pub async fn grant_lease(&self, ttl: i64) -> Result<Arc<dyn Lease>> {
        self.client.grant_lease(ttl).await
    }

    // ── Node registrations ──────────────────────────────────────

    pub async fn register_node(&self, tag: &str, host_port: &str, lease_id: LeaseId) -> Result<()> {
        self.client
            .put(&self.node_key(tag), host_port, Some(lease_id))
            .await
    }

    pub async fn delete_node(&self, tag: &str) -> Result<()> {
        self.client.delete(&self.node_key(tag)).await
    }

    /// Every live registration, in key order.
    pub async fn list_nodes(&self) -> Result<PeerSet> {
        let values = self.client.get_prefix(&self.nodes_prefix()).await?;
        Ok(PeerSet::from_values(values))
    }

    /// Raw registration count, including values that do not parse.
    pub async fn count_nodes(&self) -> Result<usize> {
        Ok(self.client.get_prefix(&self.nodes_prefix()).await?.len())
    }

    // ── Committed roster ────────────────────────────────────────

    pub async fn put_roster(&self, roster: &Roster) -> Result<()> {
        let value = serde_json::to_string(roster)?;
        self.client.put(&self.endpoints_key(), &value, None).await
    }

    pub async fn get_roster(&self) -> Result<Option<Roster>> {
        match self.client.get(&self.endpoints_key()).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    // ── Target size ─────────────────────────────────────────────

    pub async fn get_np(&self) -> Result<Option<usize>> {
        match self.client.get(&self.np_key()).await? {
            Some(value) => value.trim().parse().map(Some).map_err(|e| {
                Error::invalid_state(format!("np value {value:?} is not a size: {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Advertise the target size. Without `force` an existing value wins.
    /// Returns whether `np` was written.
    pub async fn put_np(&self, np: usize, force: bool) -> Result<bool> {
        let key = self.np_key();
        if force {
            self.client.put(&key, &np.to_string(), None).await?;
            return Ok(true);
        }
        self.client.put_if_absent(&key, &np.to_string()).await
    }

    // ── Job status ──────────────────────────────────────────────

    pub async fn set_status(&self, status: &str) -> Result<()> {
        self.client.put(&self.key(StoreKey::Status), status, None).await
    }

    pub async fn get_status(&self) -> Result<Option<String>> {
        self.client.get(&self.key(StoreKey::Status)).await
    }

    /// Remove every key of the job.
    pub async fn delete_job(&self) -> Result<()> {
        self.client.delete_prefix(&self.key(StoreKey::JobPrefix)).await
    }

    // ── Watches ─────────────────────────────────────────────────

    pub async fn watch_nodes(&self, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId> {
        self.client.add_watch_prefix(&self.nodes_prefix(), sink).await
    }

    pub async fn watch_roster(&self, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId> {
        self.client.add_watch(&self.endpoints_key(), sink).await
    }

    pub async fn watch_np(&self, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId> {
        self.client.add_watch(&self.np_key(), sink).await
    }

    pub async fn cancel_watch(&self, id: WatchId) -> Result<()> {
        self.client.cancel_watch(id).await
    }
}
