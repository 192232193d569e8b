//! Registered MPC runs and the protocol table
//!
//! The registry maps MPC ids to running instances so round data requests
//! can be served. The protocol table is built once at startup and tells
//! the node how to instantiate a run it learns about from a partner.

use super::engine::{MpcInstance, MpcNetwork, MpcOptions};
use crate::arena::SessionArena;
use crate::error::{NodeError, Result};
use crate::protocols::dkg::DistKey;
use crate::protocols::nonce::NonceBatch;
use crate::types::{MpcInit, PartnerId, RoundRequest, RoundResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct MpcRegistry {
    instances: SessionArena<Arc<MpcInstance>>,
    /// Ids a lazy start is already under way for
    starting: SessionArena<()>,
    registered: Notify,
}

impl MpcRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            instances: SessionArena::new("mpc", ttl),
            starting: SessionArena::new("mpc-starting", ttl),
            registered: Notify::new(),
        }
    }

    pub fn instances(&self) -> &SessionArena<Arc<MpcInstance>> {
        &self.instances
    }

    /// Register a run; re-registering the same instance is a no-op
    pub async fn register(&self, mpc: Arc<MpcInstance>) -> Result<()> {
        if self.instances.insert_if_absent(mpc.id(), mpc.clone()).await {
            self.registered.notify_waiters();
            return Ok(());
        }
        match self.instances.get(mpc.id()).await {
            Some(existing) if Arc::ptr_eq(&existing, &mpc) => Ok(()),
            _ => Err(NodeError::invalid(format!(
                "mpc {} is already registered",
                mpc.id()
            ))),
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<MpcInstance>> {
        self.instances.get(id).await
    }

    /// Claim the right to lazily start `id`; only the first caller gets it
    pub async fn reserve(&self, id: &str) -> bool {
        if self.instances.contains(id).await {
            return false;
        }
        self.starting.insert_if_absent(id, ()).await
    }

    /// Give up a reservation whose start failed
    pub async fn release(&self, id: &str) {
        self.starting.remove(id).await;
    }

    /// Sweep expired runs and reservations every `interval` until dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.instances.sweep().await + registry.starting.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "Swept expired mpc runs");
                }
            }
        })
    }

    /// Wait until `id` is registered
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> Result<Arc<MpcInstance>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.registered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(instance) = self.get(id).await {
                return Ok(instance);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NodeError::SessionNotFound(format!("mpc {}", id)));
            }
        }
    }

    /// Answer a round data request from a registered run
    pub async fn serve(&self, request: &RoundRequest, wait: Duration) -> Result<RoundResponse> {
        let instance = self.wait_for(&request.mpc_id, wait).await?;
        instance.round_data(request.round, request.from).await
    }
}

/// Finished protocol output
#[derive(Debug, Clone)]
pub enum ProtocolOutcome {
    Key(Arc<DistKey>),
    Batch(Arc<NonceBatch>),
}

pub type RunHandle = JoinHandle<Result<ProtocolOutcome>>;

/// Where protocol runs look up inputs and leave their results
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    async fn key(&self, id: &str) -> Option<Arc<DistKey>>;

    async fn save_key(&self, id: &str, key: Arc<DistKey>, activate: bool) -> Result<()>;

    /// Keep a one-time Schnorr nonce apart from signing keys
    async fn save_nonce(&self, id: &str, nonce: Arc<DistKey>) -> Result<()>;

    async fn save_batch(&self, batch: Arc<NonceBatch>, activate: bool) -> Result<()>;
}

/// Shared context every protocol factory starts runs with
#[derive(Clone)]
pub struct ProtocolEnv {
    pub self_id: PartnerId,
    pub network: Arc<dyn MpcNetwork>,
    pub options: MpcOptions,
    pub store: Arc<dyn ProtocolStore>,
}

/// Builds and starts one protocol kind
#[async_trait]
pub trait ProtocolFactory: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Validate `init`, spawn the run and return its handle
    async fn start(&self, env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle>;
}

/// Kind -> factory table, immutable once built
pub struct ProtocolTable {
    env: ProtocolEnv,
    factories: HashMap<&'static str, Arc<dyn ProtocolFactory>>,
}

impl ProtocolTable {
    pub fn builder(env: ProtocolEnv) -> ProtocolTableBuilder {
        ProtocolTableBuilder {
            env,
            factories: HashMap::new(),
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    pub async fn start(&self, init: MpcInit) -> Result<RunHandle> {
        let factory = self
            .factories
            .get(init.kind.as_str())
            .ok_or_else(|| NodeError::schema(format!("unknown mpc kind {}", init.kind)))?;
        tracing::info!(
            mpc_id = %init.id,
            kind = %init.kind,
            starter = init.starter,
            node_id = self.env.self_id,
            "Starting mpc"
        );
        factory.start(&self.env, init).await
    }
}

pub struct ProtocolTableBuilder {
    env: ProtocolEnv,
    factories: HashMap<&'static str, Arc<dyn ProtocolFactory>>,
}

impl ProtocolTableBuilder {
    pub fn register(mut self, factory: impl ProtocolFactory + 'static) -> Self {
        self.factories.insert(factory.kind(), Arc::new(factory));
        self
    }

    pub fn build(self) -> ProtocolTable {
        ProtocolTable {
            env: self.env,
            factories: self.factories,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn instance(id: &str) -> Arc<MpcInstance> {
        MpcInstance::new(
            MpcInit {
                kind: "test".into(),
                id: id.into(),
                starter: 1,
                partners: vec![1, 2],
                t: 1,
                params: Value::Null,
            },
            1,
            &["only"],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_is_idempotent_per_instance() {
        let registry = MpcRegistry::new(Duration::from_secs(60));
        let mpc = instance("a");
        registry.register(mpc.clone()).await.unwrap();
        registry.register(mpc).await.unwrap();
        assert!(registry.register(instance("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_register() {
        let registry = Arc::new(MpcRegistry::new(Duration::from_secs(60)));
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for("late", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.register(instance("late")).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().id(), "late");

        let missing = registry.wait_for("never", Duration::from_millis(20)).await;
        assert!(matches!(missing, Err(NodeError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_reserve_only_once() {
        let registry = MpcRegistry::new(Duration::from_secs(60));
        assert!(registry.reserve("x").await);
        assert!(!registry.reserve("x").await);
        registry.register(instance("y")).await.unwrap();
        assert!(!registry.reserve("y").await);
    }
}
