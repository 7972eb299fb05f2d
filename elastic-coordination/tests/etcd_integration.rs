//! Tests against a real etcd at `localhost:2379`. Run with
//! `cargo test -- --ignored` once etcd is up.

mod common;

use std::sync::Arc;

use tokio::sync::mpsc;

use common::*;
use elastic_coordination::client::{CoordinationClient, Lease, WatchBatch, WatchEventKind};
use elastic_coordination::types::{ManagerState, SizePolicy};

const A: &str = "10.0.0.1:6170";
const B: &str = "10.0.0.2:6170";

async fn next_batch(rx: &mut mpsc::Receiver<WatchBatch>) -> WatchBatch {
    tokio::time::timeout(WAIT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for watch batch")
        .expect("watch channel closed")
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn put_if_absent_and_prefix_listing() {
    let client = test_etcd_client().await;
    let prefix = format!("/test-kv-{}/", uuid::Uuid::new_v4());

    assert!(client.put_if_absent(&format!("{prefix}np"), "2").await.unwrap());
    assert!(!client.put_if_absent(&format!("{prefix}np"), "3").await.unwrap());
    assert_eq!(
        client.get(&format!("{prefix}np")).await.unwrap().as_deref(),
        Some("2")
    );

    client.put(&format!("{prefix}nodes/b"), B, None).await.unwrap();
    client.put(&format!("{prefix}nodes/a"), A, None).await.unwrap();
    assert_eq!(
        client.get_prefix(&format!("{prefix}nodes/")).await.unwrap(),
        vec![A, B]
    );

    client.delete_prefix(&prefix).await.unwrap();
    assert!(client.get_prefix(&prefix).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn revoked_lease_deletes_bound_keys() {
    let client = test_etcd_client().await;
    let key = format!("/test-lease-{}/nodes/a", uuid::Uuid::new_v4());

    let lease = client.grant_lease(5).await.unwrap();
    client.put(&key, A, Some(lease.id())).await.unwrap();
    lease.refresh().await.unwrap();
    assert_eq!(client.get(&key).await.unwrap().as_deref(), Some(A));

    lease.revoke().await.unwrap();
    assert!(client.get(&key).await.unwrap().is_none());
    assert!(lease.refresh().await.is_err());
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn prefix_watch_reports_puts_and_deletes() {
    let client = test_etcd_client().await;
    let prefix = format!("/test-watch-{}/nodes/", uuid::Uuid::new_v4());
    let (tx, mut rx) = mpsc::channel(16);
    let id = client.add_watch_prefix(&prefix, tx).await.unwrap();

    client.put(&format!("{prefix}a"), A, None).await.unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(batch[0].kind, WatchEventKind::Put);

    client.delete(&format!("{prefix}a")).await.unwrap();
    let batch = next_batch(&mut rx).await;
    assert_eq!(batch[0].kind, WatchEventKind::Delete);

    client.cancel_watch(id).await.unwrap();
    client.cancel_watch(id).await.unwrap();
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn two_nodes_converge_and_clean_up() {
    let client = test_etcd_client().await;
    let config_a = test_etcd_config("converge", A, SizePolicy::Fixed(2));
    let mut config_b = config_a.clone();
    config_b.host_port = addr(B);
    let job_prefix = format!("{}{}/", config_a.prefix, config_a.job_id);

    let a = start_with(Arc::clone(&client), config_a).await;
    let b = start_with(Arc::clone(&client), config_b).await;
    wait_all_ready(&[&a, &b], 2).await;
    assert_eq!(a.committed(), b.committed());

    a.exit(true).await;
    assert!(b.completed().await);
    b.exit(false).await;

    assert!(client.get_prefix(&job_prefix).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires etcd at localhost:2379"]
async fn elastic_job_shrinks_when_node_leaves() {
    let client = test_etcd_client().await;
    let policy = SizePolicy::Range { min: 1, max: 2 };
    let config_a = test_etcd_config("shrink", A, policy);
    let mut config_b = config_a.clone();
    config_b.host_port = addr(B);

    let a = start_with(Arc::clone(&client), config_a).await;
    let b = start_with(Arc::clone(&client), config_b).await;
    wait_all_ready(&[&a, &b], 2).await;

    b.exit(false).await;
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || async {
        a.state() == ManagerState::Ready && a.committed() == roster(&[A])
    })
    .await;
    assert_eq!(a.current_published().trainer_id, Some(0));

    a.exit(false).await;
}
