//! Shared helpers for multi-node tests

#![allow(dead_code)]

use mpc_node::protocols::DistKey;
use mpc_node::{MemoryCluster, Node, NodeConfig, PartnerId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Short timeouts so failure paths finish quickly
pub fn fast(config: &mut NodeConfig) {
    config.mpc.run_timeout_secs = 10;
    config.mpc.round_timeout_secs = 2;
    config.mpc.retry_backoff_ms = 50;
    config.confirmation.timeout_secs = 5;
}

pub fn cluster(t: usize, partners: &[PartnerId]) -> MemoryCluster {
    MemoryCluster::new(t, partners, fast).unwrap()
}

/// Poll `check` until it yields a value, failing the test after five seconds
pub async fn eventually<T, F, Fut>(what: &str, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// The key a node stored for run `id`, once its run has finished
pub async fn stored_key(node: &Arc<Node>, id: &str) -> Arc<DistKey> {
    let what = format!("key {} on node {}", id, node.id());
    eventually(&what, move || async move { node.keys().keys().get(id).await }).await
}

/// Wait until every node of the cluster has an active signing key
pub async fn all_active(cluster: &MemoryCluster) {
    for node in cluster.nodes.values() {
        let what = format!("active key on node {}", node.id());
        eventually(&what, move || async move { node.keys().active_key() }).await;
    }
}

/// Wait until every listed node has an active nonce batch
pub async fn all_batches(cluster: &MemoryCluster, ids: &[PartnerId]) {
    for id in ids {
        let node = cluster.node(*id).unwrap();
        let what = format!("nonce batch on node {}", id);
        eventually(&what, move || async move { node.keys().active_batch() }).await;
    }
}
