use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{
    Client, Compare, CompareOp, DeleteOptions, EventType, GetOptions, LeaseKeepAliveStream,
    LeaseKeeper, PutOptions, Txn, TxnOp, WatchOptions, WatchResponse,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{
    CoordinationClient, Lease, LeaseId, WatchBatch, WatchEvent, WatchEventKind, WatchId,
};
use crate::error::{Error, Result};
use crate::util::Backoff;

/// `CoordinationClient` backed by etcd.
///
/// `Client` is `Clone` (it wraps an inner `Arc`), so each method clones it.
pub struct EtcdClient {
    client: Client,
    watches: Arc<DashMap<WatchId, CancellationToken>>,
    next_watch_id: AtomicU64,
}

impl EtcdClient {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            watches: Arc::new(DashMap::new()),
            next_watch_id: AtomicU64::new(1),
        }
    }

    async fn spawn_watch(
        &self,
        key: &str,
        prefix: bool,
        sink: mpsc::Sender<WatchBatch>,
    ) -> Result<WatchId> {
        let options = move || prefix.then(|| WatchOptions::new().with_prefix());
        // Establish the first stream eagerly so registration errors reach the caller.
        let stream = self.client.clone().watch(key, options()).await?;

        let id = WatchId(self.next_watch_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.watches.insert(id, token.clone());

        let client = self.client.clone();
        let key = key.to_string();
        let watches = Arc::clone(&self.watches);
        tokio::spawn(async move {
            let mut stream = stream;
            let backoff = Backoff::default();
            'watch: loop {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break 'watch,
                        msg = stream.message() => match msg {
                            Ok(Some(resp)) => {
                                if resp.canceled() {
                                    tracing::warn!(%id, key, "watch cancelled by server");
                                    break;
                                }
                                let batch = convert_events(&resp);
                                if batch.is_empty() {
                                    continue;
                                }
                                if sink.send(batch).await.is_err() {
                                    tracing::debug!(%id, key, "watch receiver dropped");
                                    break 'watch;
                                }
                            }
                            Ok(None) => {
                                tracing::warn!(%id, key, "watch stream ended");
                                break;
                            }
                            Err(e) => {
                                tracing::warn!(%id, key, error = %e, "watch stream failed");
                                break;
                            }
                        }
                    }
                }

                // Re-establish the watch; events in the gap are not replayed,
                // so consumers get an empty batch telling them to re-read.
                let mut delays = backoff.delays();
                let mut attempt = 0;
                stream = loop {
                    attempt += 1;
                    let delay = delays.next().unwrap_or(backoff.max);
                    tokio::select! {
                        _ = token.cancelled() => break 'watch,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match client.clone().watch(key.as_str(), options()).await {
                        Ok(stream) => break stream,
                        Err(e) => {
                            tracing::warn!(%id, key, attempt, error = %e, "failed to re-establish watch");
                        }
                    }
                };
                tracing::info!(%id, key, "watch re-established");
                if sink.send(Vec::new()).await.is_err() {
                    break;
                }
            }
            watches.remove(&id);
        });

        Ok(id)
    }
}

fn convert_events(resp: &WatchResponse) -> WatchBatch {
    resp.events()
        .iter()
        .filter_map(|event| {
            let kv = event.kv()?;
            let kind = match event.event_type() {
                EventType::Put => WatchEventKind::Put,
                EventType::Delete => WatchEventKind::Delete,
            };
            Some(WatchEvent {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                kind,
            })
        })
        .collect()
}

fn value_string(key: &str, value: &[u8]) -> Result<String> {
    String::from_utf8(value.to_vec())
        .map_err(|e| Error::invalid_state(format!("non-utf8 value under {key}: {e}")))
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.client.clone().put(key, value, options).await?;
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        // CAS: only succeed if the key does not exist (version == 0)
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp = self.client.clone().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok(Some(value_string(key, kv.value())?)),
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let options = GetOptions::new().with_prefix();
        let resp = self.client.clone().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| value_string(prefix, kv.value()))
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.clone().delete(key, None).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let options = DeleteOptions::new().with_prefix();
        self.client.clone().delete(prefix, Some(options)).await?;
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Arc<dyn Lease>> {
        let resp = self.client.clone().lease_grant(ttl, None).await?;
        Ok(Arc::new(EtcdLease {
            client: self.client.clone(),
            id: resp.id(),
            keepalive: Mutex::new(None),
        }))
    }

    async fn add_watch(&self, key: &str, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId> {
        self.spawn_watch(key, false, sink).await
    }

    async fn add_watch_prefix(
        &self,
        prefix: &str,
        sink: mpsc::Sender<WatchBatch>,
    ) -> Result<WatchId> {
        self.spawn_watch(prefix, true, sink).await
    }

    async fn cancel_watch(&self, id: WatchId) -> Result<()> {
        if let Some((_, token)) = self.watches.remove(&id) {
            token.cancel();
        }
        Ok(())
    }
}

/// An etcd lease with a lazily opened keepalive stream.
struct EtcdLease {
    client: Client,
    id: LeaseId,
    keepalive: Mutex<Option<(LeaseKeeper, LeaseKeepAliveStream)>>,
}

#[async_trait]
impl Lease for EtcdLease {
    fn id(&self) -> LeaseId {
        self.id
    }

    async fn refresh(&self) -> Result<()> {
        let mut guard = self.keepalive.lock().await;
        if guard.is_none() {
            *guard = Some(self.client.clone().lease_keep_alive(self.id).await?);
        }
        let Some((keeper, stream)) = guard.as_mut() else {
            return Err(Error::liveness_lost("keepalive stream unavailable"));
        };

        let outcome = match keeper.keep_alive().await {
            Ok(()) => match stream.message().await {
                Ok(Some(resp)) if resp.ttl() > 0 => Ok(()),
                Ok(Some(_)) => Err(Error::liveness_lost(format!("lease {} expired", self.id))),
                Ok(None) => Err(Error::liveness_lost("keepalive stream closed")),
                Err(e) => Err(Error::from(e)),
            },
            Err(e) => Err(Error::from(e)),
        };
        if outcome.is_err() {
            // Reopen the stream on the next attempt.
            *guard = None;
        }
        outcome
    }

    async fn revoke(&self) -> Result<()> {
        self.keepalive.lock().await.take();
        self.client.clone().lease_revoke(self.id).await?;
        Ok(())
    }
}
