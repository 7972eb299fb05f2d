//! The elastic manager: registration, discovery, reconciliation and the
//! readiness gate for one training process.
//!
//! The committed roster has a single writer, the reconciliation loop spawned
//! by [`ElasticManager::start`]. Membership changes, rosters published by
//! other peers, target-size updates and liveness transitions all arrive on
//! channels that only this loop consumes. Everything else observes the
//! outcome through `tokio::sync::watch` receivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{CoordinationClient, WatchBatch, WatchId};
use crate::config::ElasticConfig;
use crate::error::{Error, Result};
use crate::lease::{self, LeaseKeeper, LivenessEvent, Registration};
use crate::publish::PublishedRoster;
use crate::readiness;
use crate::reconciler::RosterReconciler;
use crate::store::{JobStore, StoreConfig, STATUS_COMPLETED, STATUS_RUNNING};
use crate::types::{ManagerState, PeerSet, Roster, SelfIdentity, SizePolicy};
use crate::util::{self, Backoff};
use crate::watcher::MembershipWatcher;

const CHANNEL_SIZE: usize = 64;

/// What the manager currently believes about the cluster.
#[derive(Debug, Clone)]
pub struct MembershipStatus {
    pub state: ManagerState,
    pub discovered: PeerSet,
    pub committed: Roster,
    /// Whether the last lease refresh succeeded.
    pub live: bool,
    /// When the manager last left `Ready` (or was created). The convergence
    /// timeout counts from here.
    pub since: Instant,
}

/// Components that only exist while elastic mode is on.
struct Coordination {
    store: JobStore,
    policy: SizePolicy,
    keeper: Arc<LeaseKeeper>,
    watcher: Arc<MembershipWatcher>,
    reconciler: RosterReconciler,
    initially_live: bool,
    initial_np: usize,
}

pub struct ElasticManager {
    config: ElasticConfig,
    me: SelfIdentity,
    coordination: Option<Arc<Coordination>>,
    status: Arc<watch::Sender<MembershipStatus>>,
    published: Arc<watch::Sender<PublishedRoster>>,
    cancel: CancellationToken,
    started: AtomicBool,
    exited: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watch_ids: Mutex<Vec<WatchId>>,
}

impl ElasticManager {
    /// Create the manager and register this process with the job.
    ///
    /// Only configuration errors fail construction. The coordination
    /// service being unreachable, or the first lease refresh failing, leaves
    /// a manager that is not yet live and retries on the heartbeat interval.
    pub async fn new(config: ElasticConfig, client: Arc<dyn CoordinationClient>) -> Result<Self> {
        let Some(policy) = config.policy.filter(|_| config.enabled()) else {
            return Ok(Self::disabled(config));
        };
        util::validate_identifier(&config.job_id)?;

        let cancel = CancellationToken::new();
        let me = config.identity();
        let store = JobStore::new(
            client,
            StoreConfig {
                prefix: config.prefix.clone(),
                job_id: config.job_id.clone(),
            },
        );
        let job = config.job_id.as_str();

        if let Err(e) = store.set_status(STATUS_RUNNING).await {
            tracing::warn!(job, error = %e, "failed to write job status");
        }

        let target_np = config.target_np();
        let initial_np = match store.put_np(target_np, config.force).await {
            Ok(true) => target_np,
            Ok(false) => match store.get_np().await {
                Ok(Some(np)) => np,
                _ => target_np,
            },
            Err(e) => {
                tracing::warn!(job, error = %e, "failed to advertise target size");
                target_np
            }
        };

        let keeper = Arc::new(LeaseKeeper::new(
            store.clone(),
            Registration {
                tag: util::node_tag(),
                address: me.address.clone(),
            },
            config.lease_ttl,
        ));
        let initially_live = match register(&keeper, config.lease_ttl).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    job,
                    host = %me.address,
                    error = %e,
                    "initial registration incomplete, will retry on heartbeat"
                );
                false
            }
        };

        let previous = if config.prior_roster.is_empty() {
            match store.get_roster().await {
                Ok(Some(roster)) => roster,
                Ok(None) => Roster::empty(),
                Err(e) => {
                    tracing::warn!(job, error = %e, "failed to load committed roster");
                    Roster::empty()
                }
            }
        } else {
            config.prior_roster.clone()
        };

        tracing::info!(
            job,
            host = %me.address,
            rank = ?me.rank,
            %policy,
            np = initial_np,
            roster = %previous.trainer_endpoints(),
            "elastic manager initialized"
        );

        let published = PublishedRoster::new(
            &previous,
            &me,
            policy,
            config.nproc_per_node,
            config.elastic_timeout,
            initial_np,
        );
        let status = MembershipStatus {
            state: ManagerState::Initializing,
            discovered: PeerSet::new(),
            committed: previous,
            live: initially_live,
            since: Instant::now(),
        };

        let coordination = Coordination {
            watcher: Arc::new(MembershipWatcher::new(store.clone(), cancel.child_token())),
            reconciler: RosterReconciler::new(store.clone(), policy),
            store,
            policy,
            keeper,
            initially_live,
            initial_np,
        };

        Ok(Self {
            config,
            me,
            coordination: Some(Arc::new(coordination)),
            status: Arc::new(watch::channel(status).0),
            published: Arc::new(watch::channel(published).0),
            cancel,
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            watch_ids: Mutex::new(Vec::new()),
        })
    }

    /// A manager with elastic mode off: immediately ready with the prior
    /// roster, and every lifecycle call is a no-op.
    pub fn disabled(config: ElasticConfig) -> Self {
        tracing::info!(job = %config.job_id, "elastic mode is off");
        let me = config.identity();
        let roster = config.prior_roster.clone();
        let published = PublishedRoster::new(
            &roster,
            &me,
            SizePolicy::Fixed(roster.len()),
            config.nproc_per_node,
            config.elastic_timeout,
            config.elastic_np,
        );
        let status = MembershipStatus {
            state: ManagerState::Ready,
            discovered: roster.member_set(),
            committed: roster,
            live: true,
            since: Instant::now(),
        };
        Self {
            config,
            me,
            coordination: None,
            status: Arc::new(watch::channel(status).0),
            published: Arc::new(watch::channel(published).0),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            watch_ids: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.coordination.is_some()
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    pub fn identity(&self) -> &SelfIdentity {
        &self.me
    }

    pub fn policy(&self) -> Option<SizePolicy> {
        self.coordination.as_ref().map(|c| c.policy)
    }

    /// The key this process is registered under.
    pub fn node_key(&self) -> Option<String> {
        self.coordination
            .as_ref()
            .map(|c| c.store.node_key(&c.keeper.registration().tag))
    }

    pub fn status(&self) -> MembershipStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ManagerState {
        self.status.borrow().state
    }

    pub fn committed(&self) -> Roster {
        self.status.borrow().committed.clone()
    }

    /// Whether the peers discovered last match the committed roster.
    pub fn matches(&self) -> bool {
        let status = self.status.borrow();
        readiness::matches(&status.discovered, &status.committed)
    }

    /// Receiver of every roster this manager publishes, starting with the
    /// current one.
    pub fn published(&self) -> watch::Receiver<PublishedRoster> {
        self.published.subscribe()
    }

    pub fn current_published(&self) -> PublishedRoster {
        self.published.borrow().clone()
    }

    /// Fires once `exit` has begun.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start watching the job and reconciling. Call once.
    pub async fn start(&self) -> Result<()> {
        let Some(coordination) = &self.coordination else {
            return Ok(());
        };
        if self.exited.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state("elastic manager already started"));
        }

        let (peers_tx, peers_rx) = mpsc::channel::<PeerSet>(CHANNEL_SIZE);
        let (roster_tx, roster_rx) = mpsc::channel::<WatchBatch>(CHANNEL_SIZE);
        let (np_tx, np_rx) = mpsc::channel::<WatchBatch>(CHANNEL_SIZE);
        let (liveness_tx, liveness_rx) = mpsc::channel::<LivenessEvent>(CHANNEL_SIZE);

        let heartbeat = tokio::spawn(lease::run_heartbeat(
            Arc::clone(&coordination.keeper),
            coordination.initially_live,
            liveness_tx,
            self.cancel.child_token(),
        ));
        self.tasks.lock().await.push(heartbeat);

        let store = &coordination.store;
        let backoff = Backoff::default();
        let roster_watch = util::retry_with_backoff("watch roster", backoff, &self.cancel, || {
            store.watch_roster(roster_tx.clone())
        })
        .await?;
        self.watch_ids.lock().await.push(roster_watch);
        let np_watch = util::retry_with_backoff("watch np", backoff, &self.cancel, || {
            store.watch_np(np_tx.clone())
        })
        .await?;
        self.watch_ids.lock().await.push(np_watch);

        coordination.watcher.on_change(peers_tx).await?;

        // `exit` may have drained the watch ids before these were pushed.
        if self.exited.load(Ordering::SeqCst) {
            coordination.watcher.cancel().await;
            for id in self.watch_ids.lock().await.drain(..) {
                if let Err(e) = store.cancel_watch(id).await {
                    tracing::warn!(error = %e, "failed to cancel watch");
                }
            }
            return Err(Error::ShuttingDown);
        }

        let (committed, live) = {
            let status = self.status.borrow();
            (status.committed.clone(), status.live)
        };
        let reconcile_loop = ReconcileLoop {
            coordination: Arc::clone(coordination),
            me: self.me.clone(),
            nproc_per_node: self.config.nproc_per_node,
            elastic_timeout: self.config.elastic_timeout,
            status: Arc::clone(&self.status),
            published: Arc::clone(&self.published),
            cancel: self.cancel.child_token(),
            committed,
            discovered: PeerSet::new(),
            np: coordination.initial_np,
            live,
        };
        let handle = tokio::spawn(reconcile_loop.run(peers_rx, roster_rx, np_rx, liveness_rx));
        self.tasks.lock().await.push(handle);

        tracing::info!(job = %self.config.job_id, host = %self.me.address, "elastic manager started");
        Ok(())
    }

    /// Wait until the discovered peers match the committed roster.
    ///
    /// Fails with `ConvergenceTimeout` once the manager has spent
    /// `elastic_timeout` out of `Ready`, or with `LivenessLost` if liveness
    /// was not restored by then. Returns `ShuttingDown` as soon as `exit`
    /// begins.
    pub async fn wait_ready(&self) -> Result<PublishedRoster> {
        let mut rx = self.status.subscribe();
        loop {
            let deadline = {
                let status = rx.borrow_and_update();
                match status.state {
                    ManagerState::Ready => return Ok(self.current_published()),
                    ManagerState::Exiting => return Err(Error::ShuttingDown),
                    _ => status.since + self.config.elastic_timeout,
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::ShuttingDown),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::ShuttingDown);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let status = rx.borrow().clone();
                    if status.state == ManagerState::Ready {
                        continue;
                    }
                    let elapsed = status.since.elapsed();
                    if !status.live {
                        tracing::error!(job = %self.config.job_id, ?elapsed, "liveness not restored in time");
                        return Err(Error::liveness_lost(format!(
                            "lease not restored within {elapsed:?}"
                        )));
                    }
                    tracing::error!(
                        job = %self.config.job_id,
                        discovered = ?status.discovered.to_strings(),
                        committed = %status.committed.trainer_endpoints(),
                        ?elapsed,
                        "membership did not converge"
                    );
                    return Err(Error::ConvergenceTimeout {
                        discovered: status.discovered.to_strings(),
                        committed: status
                            .committed
                            .endpoints()
                            .iter()
                            .map(ToString::to_string)
                            .collect(),
                        elapsed,
                    });
                }
            }
        }
    }

    /// Whether the job was marked completed. Always true with elastic mode
    /// off.
    pub async fn completed(&self) -> bool {
        let Some(coordination) = &self.coordination else {
            return true;
        };
        match coordination.store.get_status().await {
            Ok(status) => status.as_deref() == Some(STATUS_COMPLETED),
            Err(e) => {
                tracing::warn!(job = %self.config.job_id, error = %e, "failed to read job status");
                false
            }
        }
    }

    /// Leave the job. Safe to call any number of times; never fails.
    ///
    /// Watches are cancelled before the lease is released. With `completed`
    /// the job is marked done, and the last node to leave removes the job's
    /// keys.
    pub async fn exit(&self, completed: bool) {
        if self.exited.swap(true, Ordering::SeqCst) {
            tracing::debug!(job = %self.config.job_id, "exit already done");
            return;
        }
        self.status.send_modify(|status| status.state = ManagerState::Exiting);
        self.cancel.cancel();

        let Some(coordination) = &self.coordination else {
            return;
        };
        let job = self.config.job_id.as_str();
        tracing::info!(job, host = %self.me.address, completed, "leaving job");

        for handle in self.tasks.lock().await.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(job, error = %e, "background task failed");
            }
        }

        coordination.watcher.cancel().await;
        for id in self.watch_ids.lock().await.drain(..) {
            if let Err(e) = coordination.store.cancel_watch(id).await {
                tracing::error!(job, %id, error = %e, "failed to cancel watch");
            }
        }

        if completed {
            if let Err(e) = coordination.store.set_status(STATUS_COMPLETED).await {
                tracing::error!(job, error = %e, "failed to mark job completed");
            }
        }
        if let Err(e) = coordination.keeper.release().await {
            tracing::error!(job, error = %e, "failed to release lease");
        }
        let tag = &coordination.keeper.registration().tag;
        if let Err(e) = coordination.store.delete_node(tag).await {
            tracing::error!(job, error = %e, "failed to delete node registration");
        }

        match coordination.store.count_nodes().await {
            Ok(0) => match coordination.store.delete_job().await {
                Ok(()) => tracing::info!(job, "last node left, removed job state"),
                Err(e) => tracing::error!(job, error = %e, "failed to remove job state"),
            },
            Ok(remaining) => tracing::debug!(job, remaining, "nodes remain in job"),
            Err(e) => tracing::error!(job, error = %e, "failed to count remaining nodes"),
        }
    }
}

async fn register(keeper: &LeaseKeeper, ttl: i64) -> Result<()> {
    keeper.acquire(ttl).await?;
    keeper.register().await?;
    keeper.refresh().await
}

/// Single writer of the committed roster.
struct ReconcileLoop {
    coordination: Arc<Coordination>,
    me: SelfIdentity,
    nproc_per_node: usize,
    elastic_timeout: std::time::Duration,
    status: Arc<watch::Sender<MembershipStatus>>,
    published: Arc<watch::Sender<PublishedRoster>>,
    cancel: CancellationToken,
    committed: Roster,
    discovered: PeerSet,
    np: usize,
    live: bool,
}

impl ReconcileLoop {
    async fn run(
        mut self,
        mut peers: mpsc::Receiver<PeerSet>,
        mut rosters: mpsc::Receiver<WatchBatch>,
        mut nps: mpsc::Receiver<WatchBatch>,
        mut liveness: mpsc::Receiver<LivenessEvent>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                Some(discovered) = peers.recv() => {
                    tracing::debug!(peers = ?discovered.to_strings(), "membership changed");
                    self.discovered = discovered;
                    self.converge().await;
                }
                Some(_) = rosters.recv() => self.on_remote_roster().await,
                Some(_) = nps.recv() => self.on_np_changed().await,
                Some(event) = liveness.recv() => self.on_liveness(event),
                else => return,
            }
        }
    }

    /// Reconcile when the discovered peers differ from the roster, then
    /// re-evaluate readiness.
    async fn converge(&mut self) {
        if self.discovered != self.committed.member_set() {
            self.set_state(ManagerState::Reconfiguring);
            let result = self.coordination.reconciler.reconcile(
                &self.discovered,
                &self.committed,
                &self.me,
            );
            if result.changed() {
                self.committed = result.roster;
                self.publish();
                if let Err(e) = self
                    .coordination
                    .reconciler
                    .persist(&self.committed, &self.cancel)
                    .await
                {
                    tracing::warn!(error = %e, "failed to persist roster");
                }
            }
        }
        if readiness::matches(&self.discovered, &self.committed)
            && self.coordination.reconciler.admits(&self.committed)
        {
            self.set_state(ManagerState::Ready);
        } else {
            self.set_state(ManagerState::Watching);
        }
    }

    /// Adopt a roster another peer committed, if it is new and admissible.
    async fn on_remote_roster(&mut self) {
        let remote = match self.coordination.store.get_roster().await {
            Ok(Some(remote)) => remote,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read published roster");
                return;
            }
        };
        if remote == self.committed {
            return;
        }
        if !self.coordination.reconciler.admits(&remote) {
            tracing::debug!(
                roster = %remote.trainer_endpoints(),
                policy = %self.coordination.policy,
                "ignoring roster outside size policy"
            );
            return;
        }
        tracing::info!(
            previous = %self.committed.trainer_endpoints(),
            roster = %remote.trainer_endpoints(),
            "adopting roster published by a peer"
        );
        self.committed = remote;
        self.publish();
        self.converge().await;
    }

    async fn on_np_changed(&mut self) {
        match self.coordination.store.get_np().await {
            Ok(Some(np)) if np != self.np => {
                tracing::info!(previous = self.np, np, "target size changed");
                self.np = np;
                self.publish();
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "failed to read target size"),
        }
    }

    fn on_liveness(&mut self, event: LivenessEvent) {
        match event {
            LivenessEvent::Lost(reason) => {
                tracing::warn!(host = %self.me.address, reason, "liveness lost");
                self.live = false;
            }
            LivenessEvent::Restored => {
                tracing::info!(host = %self.me.address, "liveness restored");
                self.live = true;
            }
        }
        let live = self.live;
        self.status.send_modify(|status| status.live = live);
    }

    fn publish(&self) {
        let next = PublishedRoster::new(
            &self.committed,
            &self.me,
            self.coordination.policy,
            self.nproc_per_node,
            self.elastic_timeout,
            self.np,
        );
        self.published.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn set_state(&self, state: ManagerState) {
        self.status.send_modify(|status| {
            if status.state == ManagerState::Exiting {
                return;
            }
            if status.state != state {
                tracing::debug!(from = %status.state, to = %state, "state transition");
                if state == ManagerState::Ready {
                    tracing::info!(
                        roster = %self.committed.trainer_endpoints(),
                        "membership converged"
                    );
                }
            }
            if status.state == ManagerState::Ready && state != ManagerState::Ready {
                status.since = Instant::now();
            }
            status.state = state;
            status.discovered = self.discovered.clone();
            status.committed = self.committed.clone();
            status.live = self.live;
        });
    }
}
