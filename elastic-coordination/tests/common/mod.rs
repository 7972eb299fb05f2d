#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use elastic_coordination::client::{CoordinationClient, EtcdClient, MockCoordinationClient};
use elastic_coordination::config::ElasticConfig;
use elastic_coordination::error::Result;
use elastic_coordination::launcher::Launcher;
use elastic_coordination::manager::ElasticManager;
use elastic_coordination::publish::PublishedRoster;
use elastic_coordination::store::{JobStore, StoreConfig};
use elastic_coordination::types::{ManagerState, PeerAddress, Roster, SizePolicy};

pub const ETCD_ENDPOINT: &str = "http://localhost:2379";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const PREFIX: &str = "/elastic/";
pub const JOB: &str = "job";

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

pub fn addr(s: &str) -> PeerAddress {
    PeerAddress::new(s).expect("valid peer address")
}

pub fn roster(endpoints: &[&str]) -> Roster {
    Roster::from_endpoints(endpoints.iter().map(|e| addr(e)))
}

pub fn job_prefix() -> String {
    format!("{PREFIX}{JOB}/")
}

pub fn nodes_prefix() -> String {
    format!("{PREFIX}{JOB}/nodes/")
}

// ── Component builders ──────────────────────────────────────────

pub fn test_config(host_port: &str, policy: SizePolicy) -> ElasticConfig {
    let mut config = ElasticConfig::new(JOB, policy, addr(host_port));
    config.prefix = PREFIX.to_string();
    config.lease_ttl = 3;
    config.elastic_timeout = Duration::from_secs(30);
    config.supervise_interval = Duration::from_millis(50);
    config
}

pub fn test_store(client: &MockCoordinationClient) -> JobStore {
    JobStore::new(
        Arc::new(client.clone()),
        StoreConfig {
            prefix: PREFIX.to_string(),
            job_id: JOB.to_string(),
        },
    )
}

pub async fn start_with(
    client: Arc<dyn CoordinationClient>,
    config: ElasticConfig,
) -> Arc<ElasticManager> {
    let manager = ElasticManager::new(config, client)
        .await
        .expect("failed to create manager");
    manager.start().await.expect("failed to start manager");
    Arc::new(manager)
}

pub async fn start_manager(
    client: &MockCoordinationClient,
    host_port: &str,
    policy: SizePolicy,
) -> Arc<ElasticManager> {
    start_with(Arc::new(client.clone()), test_config(host_port, policy)).await
}

pub async fn start_ranked(
    client: &MockCoordinationClient,
    host_port: &str,
    policy: SizePolicy,
    rank: usize,
    prior: Roster,
) -> Arc<ElasticManager> {
    let mut config = test_config(host_port, policy);
    config.rank = Some(rank);
    config.prior_roster = prior;
    start_with(Arc::new(client.clone()), config).await
}

pub async fn wait_all_ready(managers: &[&Arc<ElasticManager>], expected_len: usize) {
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        let first = managers[0].committed();
        first.len() == expected_len
            && managers
                .iter()
                .all(|m| m.state() == ManagerState::Ready && m.committed() == first)
    })
    .await;
}

pub async fn exit_all(managers: &[&Arc<ElasticManager>]) {
    for manager in managers {
        manager.exit(false).await;
    }
}

// ── etcd ────────────────────────────────────────────────────────

pub async fn test_etcd_client() -> Arc<dyn CoordinationClient> {
    Arc::new(
        EtcdClient::connect(&[ETCD_ENDPOINT.to_string()])
            .await
            .expect("failed to connect to etcd"),
    )
}

pub fn test_etcd_config(test_name: &str, host_port: &str, policy: SizePolicy) -> ElasticConfig {
    let mut config = test_config(host_port, policy);
    config.endpoints = vec![ETCD_ENDPOINT.to_string()];
    config.prefix = format!("/test-{}-{}/", test_name, uuid::Uuid::new_v4());
    config
}

// ── Launcher ────────────────────────────────────────────────────

/// Launcher whose job exits with whatever code the test sets.
#[derive(Default)]
pub struct MockLauncher {
    exit_code: Mutex<Option<i32>>,
    launched: Mutex<Vec<PublishedRoster>>,
    stops: AtomicUsize,
}

impl MockLauncher {
    pub fn exiting_with(code: i32) -> Self {
        let launcher = Self::default();
        launcher.set_exit_code(code);
        launcher
    }

    pub fn set_exit_code(&self, code: i32) {
        *self.exit_code.lock().unwrap() = Some(code);
    }

    pub fn launched(&self) -> Vec<PublishedRoster> {
        self.launched.lock().unwrap().clone()
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, roster: &PublishedRoster) -> Result<()> {
        self.launched.lock().unwrap().push(roster.clone());
        Ok(())
    }

    async fn poll_exit(&self) -> Result<Option<i32>> {
        Ok(*self.exit_code.lock().unwrap())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
