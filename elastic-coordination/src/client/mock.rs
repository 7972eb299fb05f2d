use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{
    CoordinationClient, Lease, LeaseId, WatchBatch, WatchEvent, WatchEventKind, WatchId,
};
use crate::error::{Error, Result};

struct MockWatch {
    key: String,
    prefix: bool,
    tx: mpsc::UnboundedSender<WatchBatch>,
    cancel: CancellationToken,
}

impl MockWatch {
    fn covers(&self, key: &str) -> bool {
        if self.prefix {
            key.starts_with(&self.key)
        } else {
            key == self.key
        }
    }
}

#[derive(Default)]
struct MockState {
    kv: BTreeMap<String, (String, Option<LeaseId>)>,
    leases: HashMap<LeaseId, i64>,
    watches: HashMap<WatchId, MockWatch>,
    next_lease: LeaseId,
    next_watch: u64,
    unavailable: bool,
    refresh_failing: bool,
    refresh_failures_left: u32,
    refresh_count: u64,
    grant_count: u64,
}

impl MockState {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::invalid_state("coordination service unavailable"));
        }
        Ok(())
    }

    /// Queue `events` on every watch that covers them. Delivery happens on
    /// each watch's forwarding task, so this never blocks.
    fn notify(&self, events: &[WatchEvent]) {
        for watch in self.watches.values() {
            let batch: WatchBatch = events
                .iter()
                .filter(|e| watch.covers(&e.key))
                .cloned()
                .collect();
            if !batch.is_empty() {
                drop(watch.tx.send(batch));
            }
        }
    }

    fn remove_matching(&mut self, matches: impl Fn(&str) -> bool) {
        let removed: Vec<String> = self.kv.keys().filter(|k| matches(k.as_str())).cloned().collect();
        let events: Vec<WatchEvent> = removed
            .into_iter()
            .filter_map(|key| {
                self.kv.remove(&key).map(|_| WatchEvent {
                    key,
                    kind: WatchEventKind::Delete,
                })
            })
            .collect();
        self.notify(&events);
    }
}

/// In-memory `CoordinationClient` with lease expiry and failure injection.
///
/// Clones share the same store, so a test can hold one handle while the code
/// under test owns another.
#[derive(Clone, Default)]
pub struct MockCoordinationClient {
    state: Arc<Mutex<MockState>>,
}

impl MockCoordinationClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Every lease refresh fails until `set_refresh_failing(false)`.
    pub fn with_failing_refresh(self) -> Self {
        self.set_refresh_failing(true);
        self
    }

    pub fn set_refresh_failing(&self, failing: bool) {
        self.lock().refresh_failing = failing;
    }

    /// The next `n` lease refreshes fail, then refreshes succeed again.
    pub fn fail_next_refreshes(&self, n: u32) {
        self.lock().refresh_failures_left = n;
    }

    /// Make every key/value call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Expire a lease as the service would after its TTL: the lease is gone
    /// and every key bound to it is deleted.
    pub fn expire_lease(&self, id: LeaseId) {
        let mut state = self.lock();
        state.leases.remove(&id);
        let bound: Vec<String> = state
            .kv
            .iter()
            .filter(|(_, (_, lease))| *lease == Some(id))
            .map(|(key, _)| key.clone())
            .collect();
        state.remove_matching(|key| bound.iter().any(|b| b == key));
    }

    /// Expire the lease that `key` is bound to, if any. Returns the lease id.
    pub fn expire_lease_of(&self, key: &str) -> Option<LeaseId> {
        let lease = self.lock().kv.get(key).and_then(|(_, lease)| *lease)?;
        self.expire_lease(lease);
        Some(lease)
    }

    /// Simulate every watch being re-established after a gap.
    pub fn interrupt_watches(&self) {
        let state = self.lock();
        for watch in state.watches.values() {
            drop(watch.tx.send(Vec::new()));
        }
    }

    pub fn refresh_count(&self) -> u64 {
        self.lock().refresh_count
    }

    pub fn grant_count(&self) -> u64 {
        self.lock().grant_count
    }

    pub fn watch_count(&self) -> usize {
        self.lock().watches.len()
    }

    pub fn active_leases(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.lock().kv.get(key).map(|(value, _)| value.clone())
    }

    pub fn values_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, (value, _))| value.clone())
            .collect()
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn register_watch(&self, key: &str, prefix: bool, sink: mpsc::Sender<WatchBatch>) -> WatchId {
        let (tx, mut rx) = mpsc::unbounded_channel::<WatchBatch>();
        let cancel = CancellationToken::new();

        let id = {
            let mut state = self.lock();
            state.next_watch += 1;
            let id = WatchId(state.next_watch);
            state.watches.insert(
                id,
                MockWatch {
                    key: key.to_string(),
                    prefix,
                    tx,
                    cancel: cancel.clone(),
                },
            );
            id
        };

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = rx.recv() => match batch {
                        Some(batch) => {
                            if sink.send(batch).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
        id
    }

    fn put_locked(state: &mut MockState, key: &str, value: &str, lease: Option<LeaseId>) {
        state
            .kv
            .insert(key.to_string(), (value.to_string(), lease));
        state.notify(&[WatchEvent {
            key: key.to_string(),
            kind: WatchEventKind::Put,
        }]);
    }
}

#[async_trait]
impl CoordinationClient for MockCoordinationClient {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(Error::liveness_lost(format!("lease {id} not found")));
            }
        }
        Self::put_locked(&mut state, key, value, lease);
        Ok(())
    }

    async fn put_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut state = self.lock();
        state.check_available()?;
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        Self::put_locked(&mut state, key, value, None);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let state = self.lock();
        state.check_available()?;
        Ok(state.kv.get(key).map(|(value, _)| value.clone()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.lock().check_available()?;
        Ok(self.values_under(prefix))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;
        state.remove_matching(|k| k == key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut state = self.lock();
        state.check_available()?;
        state.remove_matching(|k| k.starts_with(prefix));
        Ok(())
    }

    async fn grant_lease(&self, ttl: i64) -> Result<Arc<dyn Lease>> {
        let mut state = self.lock();
        state.check_available()?;
        state.next_lease += 1;
        state.grant_count += 1;
        let id = state.next_lease;
        state.leases.insert(id, ttl);
        Ok(Arc::new(MockLease {
            id,
            client: self.clone(),
        }))
    }

    async fn add_watch(&self, key: &str, sink: mpsc::Sender<WatchBatch>) -> Result<WatchId> {
        self.lock().check_available()?;
        Ok(self.register_watch(key, false, sink))
    }

    async fn add_watch_prefix(
        &self,
        prefix: &str,
        sink: mpsc::Sender<WatchBatch>,
    ) -> Result<WatchId> {
        self.lock().check_available()?;
        Ok(self.register_watch(prefix, true, sink))
    }

    async fn cancel_watch(&self, id: WatchId) -> Result<()> {
        if let Some(watch) = self.lock().watches.remove(&id) {
            watch.cancel.cancel();
        }
        Ok(())
    }
}

struct MockLease {
    id: LeaseId,
    client: MockCoordinationClient,
}

#[async_trait]
impl Lease for MockLease {
    fn id(&self) -> LeaseId {
        self.id
    }

    async fn refresh(&self) -> Result<()> {
        let mut state = self.client.lock();
        state.refresh_count += 1;
        if state.refresh_failing {
            return Err(Error::liveness_lost("injected refresh failure"));
        }
        if state.refresh_failures_left > 0 {
            state.refresh_failures_left -= 1;
            return Err(Error::liveness_lost("injected refresh failure"));
        }
        if !state.leases.contains_key(&self.id) {
            return Err(Error::liveness_lost(format!("lease {} expired", self.id)));
        }
        Ok(())
    }

    async fn revoke(&self) -> Result<()> {
        self.client.expire_lease(self.id);
        Ok(())
    }
}
