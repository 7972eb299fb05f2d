//! This process's liveness: one renewable lease and the node registration
//! bound to it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::{Lease, LeaseId};
use crate::error::{Error, Result};
use crate::store::JobStore;
use crate::types::PeerAddress;

/// Liveness transitions reported by the heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Lost(String),
    Restored,
}

/// The key this process is registered under and the address it advertises.
#[derive(Debug, Clone)]
pub struct Registration {
    pub tag: String,
    pub address: PeerAddress,
}

struct LeaseState {
    lease: Option<Arc<dyn Lease>>,
    ttl: i64,
}

pub struct LeaseKeeper {
    store: JobStore,
    registration: Registration,
    state: Mutex<LeaseState>,
}

impl LeaseKeeper {
    pub fn new(store: JobStore, registration: Registration, ttl: i64) -> Self {
        Self {
            store,
            registration,
            state: Mutex::new(LeaseState { lease: None, ttl }),
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// Refresh period: a third of the TTL, so one missed refresh does not
    /// let the lease expire.
    pub async fn heartbeat_interval(&self) -> Duration {
        let ttl = self.state.lock().await.ttl;
        Duration::from_secs((ttl.max(0) as u64 / 3).max(1))
    }

    pub async fn lease_id(&self) -> Option<LeaseId> {
        self.state.lock().await.lease.as_ref().map(|lease| lease.id())
    }

    /// Grant a lease of `ttl` seconds. A lease already held is replaced
    /// without being revoked.
    pub async fn acquire(&self, ttl: i64) -> Result<LeaseId> {
        let lease = self.store.grant_lease(ttl).await?;
        let id = lease.id();
        let mut state = self.state.lock().await;
        state.ttl = ttl;
        state.lease = Some(lease);
        tracing::info!(lease_id = id, ttl, "acquired lease");
        Ok(id)
    }

    /// Write this process's registration, bound to the current lease.
    pub async fn register(&self) -> Result<()> {
        let id = self
            .lease_id()
            .await
            .ok_or_else(|| Error::liveness_lost("no lease held"))?;
        self.store
            .register_node(
                &self.registration.tag,
                self.registration.address.as_str(),
                id,
            )
            .await?;
        tracing::info!(host = %self.registration.address, lease_id = id, "registered node");
        Ok(())
    }

    /// Extend the current lease. Any failure is reported as `LivenessLost`.
    pub async fn refresh(&self) -> Result<()> {
        let lease = self
            .state
            .lock()
            .await
            .lease
            .clone()
            .ok_or_else(|| Error::liveness_lost("no lease held"))?;
        lease.refresh().await.map_err(|e| match e {
            Error::LivenessLost(_) => e,
            other => Error::liveness_lost(format!("lease {} refresh failed: {other}", lease.id())),
        })
    }

    /// Replace the lease with a fresh one and re-register under it. The old
    /// lease is revoked only after the registration moved over.
    pub async fn reacquire(&self) -> Result<LeaseId> {
        let (old, ttl) = {
            let state = self.state.lock().await;
            (state.lease.clone(), state.ttl)
        };
        let id = self.acquire(ttl).await?;
        self.register().await?;
        if let Some(old) = old {
            if let Err(e) = old.revoke().await {
                tracing::debug!(lease_id = old.id(), error = %e, "failed to revoke replaced lease");
            }
        }
        Ok(id)
    }

    /// Revoke the lease. Safe to call when none is held.
    pub async fn release(&self) -> Result<()> {
        let Some(lease) = self.state.lock().await.lease.take() else {
            return Ok(());
        };
        lease.revoke().await?;
        tracing::info!(lease_id = lease.id(), "released lease");
        Ok(())
    }
}

/// Keep the lease alive until `cancel` fires.
///
/// Refresh failures never end the loop: they are reported as
/// `LivenessEvent::Lost` and a new lease is acquired. `Restored` follows the
/// next successful refresh. `initially_live` tells the loop whether the
/// first refresh at startup succeeded.
pub async fn run_heartbeat(
    keeper: Arc<LeaseKeeper>,
    initially_live: bool,
    events: mpsc::Sender<LivenessEvent>,
    cancel: CancellationToken,
) {
    let interval = keeper.heartbeat_interval().await;
    let mut live = initially_live;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        match keeper.refresh().await {
            Ok(()) => {
                if !live {
                    live = true;
                    tracing::info!(host = %keeper.registration().address, "liveness restored");
                    if events.send(LivenessEvent::Restored).await.is_err() {
                        return;
                    }
                }
                ensure_registered(&keeper).await;
            }
            Err(e) => {
                if live {
                    live = false;
                    tracing::warn!(error = %e, "lease refresh failed, liveness lost");
                    if events.send(LivenessEvent::Lost(e.to_string())).await.is_err() {
                        return;
                    }
                } else {
                    tracing::warn!(error = %e, "lease refresh still failing");
                }
                if cancel.is_cancelled() {
                    return;
                }
                match keeper.reacquire().await {
                    Ok(id) => tracing::info!(lease_id = id, "re-acquired lease"),
                    Err(e) => tracing::warn!(error = %e, "failed to re-acquire lease"),
                }
            }
        }
    }
}

/// Re-register if this node's key disappeared from the listing.
async fn ensure_registered(keeper: &LeaseKeeper) {
    let address = &keeper.registration().address;
    match keeper.store.list_nodes().await {
        Ok(nodes) if nodes.contains(address) => {}
        Ok(_) => {
            tracing::info!(host = %address, "registration missing, registering again");
            if let Err(e) = keeper.register().await {
                tracing::warn!(host = %address, error = %e, "failed to re-register node");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list nodes during heartbeat"),
    }
}
