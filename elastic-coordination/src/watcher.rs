use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::client::{WatchBatch, WatchId};
use crate::error::Result;
use crate::store::JobStore;
use crate::types::PeerSet;
use crate::util::{self, Backoff};

/// Tracks the set of live peers registered under the job's node prefix.
///
/// Every delivery is the full current set, re-read from the store after each
/// watch batch, never a diff.
pub struct MembershipWatcher {
    store: JobStore,
    backoff: Backoff,
    cancel: CancellationToken,
    watch_id: Mutex<Option<WatchId>>,
    latest: watch::Sender<PeerSet>,
}

impl MembershipWatcher {
    pub fn new(store: JobStore, cancel: CancellationToken) -> Self {
        let (latest, _) = watch::channel(PeerSet::new());
        Self {
            store,
            backoff: Backoff::default(),
            cancel,
            watch_id: Mutex::new(None),
            latest,
        }
    }

    /// Query the registrations now, retrying transient failures.
    pub async fn snapshot(&self) -> Result<PeerSet> {
        let peers = util::retry_with_backoff("list nodes", self.backoff, &self.cancel, || {
            self.store.list_nodes()
        })
        .await?;
        self.latest.send_replace(peers.clone());
        Ok(peers)
    }

    /// The last peer set seen, empty before the first snapshot.
    pub fn current(&self) -> PeerSet {
        self.latest.borrow().clone()
    }

    /// Deliver the current peer set to `sink` now, then again after every
    /// change until cancelled.
    pub async fn on_change(self: &Arc<Self>, sink: mpsc::Sender<PeerSet>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<WatchBatch>(64);
        let id = self.store.watch_nodes(tx).await?;
        *self.watch_id.lock().await = Some(id);

        // Snapshot after the watch exists so no change can fall in between.
        let initial = self.snapshot().await?;
        if sink.send(initial).await.is_err() {
            return Ok(());
        }

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = watcher.cancel.cancelled() => return,
                    batch = rx.recv() => {
                        let Some(batch) = batch else { return };
                        let mut events = batch.len();
                        // Coalesce whatever else is already queued.
                        while let Ok(more) = rx.try_recv() {
                            events += more.len();
                        }
                        tracing::debug!(events, "membership watch fired");

                        match watcher.snapshot().await {
                            Ok(peers) => {
                                if sink.send(peers).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to re-read membership after watch event");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Stop watching. Safe to call repeatedly, and before `on_change`.
    pub async fn cancel(&self) {
        self.cancel.cancel();
        let Some(id) = self.watch_id.lock().await.take() else {
            return;
        };
        if let Err(e) = self.store.cancel_watch(id).await {
            tracing::warn!(%id, error = %e, "failed to cancel membership watch");
        }
    }
}
