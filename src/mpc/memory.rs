//! In-process network
//!
//! All nodes share one `MemoryHub`. Requests go straight to the target's
//! peer handler (a `Node`) or, for bare test nodes, to its registry.
//! Nodes can be switched offline to inject failures.

use super::engine::{MpcInstance, MpcNetwork};
use super::registry::MpcRegistry;
use crate::confirmation::{Announcer, Availability, RemoteSigner};
use crate::error::{NodeError, Result};
use crate::types::{
    ConfirmedAnnouncement, PartialSignature, PartnerId, RoundRequest, RoundResponse, SignRequest,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

/// Everything a node answers to its partners
#[async_trait]
pub trait PeerHandler: Send + Sync {
    async fn handle_round_request(&self, request: RoundRequest) -> Result<RoundResponse>;

    async fn handle_sign_request(&self, request: SignRequest) -> Result<PartialSignature>;

    async fn handle_confirmed(&self, announcement: ConfirmedAnnouncement) -> Result<()>;
}

struct HubEntry {
    registry: Arc<MpcRegistry>,
    handler: Option<Weak<dyn PeerHandler>>,
    online: bool,
}

pub struct MemoryHub {
    nodes: RwLock<BTreeMap<PartnerId, HubEntry>>,
    /// How long a bare registry waits for an unknown mpc id
    wait: Duration,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Self::with_wait(Duration::from_secs(2))
    }

    pub fn with_wait(wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            nodes: RwLock::new(BTreeMap::new()),
            wait,
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<PartnerId, HubEntry>> {
        match self.nodes.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<PartnerId, HubEntry>> {
        match self.nodes.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Join the hub with a fresh registry and return the node's network
    pub fn add_node(self: &Arc<Self>, id: PartnerId) -> Arc<MemoryNetwork> {
        self.add_node_with_registry(id, Arc::new(MpcRegistry::new(Duration::from_secs(300))))
    }

    pub fn add_node_with_registry(
        self: &Arc<Self>,
        id: PartnerId,
        registry: Arc<MpcRegistry>,
    ) -> Arc<MemoryNetwork> {
        self.write().insert(
            id,
            HubEntry {
                registry: registry.clone(),
                handler: None,
                online: true,
            },
        );
        Arc::new(MemoryNetwork {
            hub: self.clone(),
            self_id: id,
            registry,
        })
    }

    /// Route requests for `id` through `handler` instead of the bare registry
    pub fn attach_handler(&self, id: PartnerId, handler: Weak<dyn PeerHandler>) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.handler = Some(handler);
        }
    }

    pub fn network(self: &Arc<Self>, id: PartnerId) -> Option<Arc<MemoryNetwork>> {
        let registry = self.read().get(&id).map(|entry| entry.registry.clone())?;
        Some(Arc::new(MemoryNetwork {
            hub: self.clone(),
            self_id: id,
            registry,
        }))
    }

    pub fn set_online(&self, id: PartnerId, online: bool) {
        if let Some(entry) = self.write().get_mut(&id) {
            entry.online = online;
        }
    }

    pub fn is_online(&self, id: PartnerId) -> bool {
        self.read().get(&id).map(|entry| entry.online).unwrap_or(false)
    }

    pub fn node_ids(&self) -> Vec<PartnerId> {
        self.read().keys().copied().collect()
    }

    fn route(
        &self,
        from: PartnerId,
        to: PartnerId,
    ) -> Result<(Arc<MpcRegistry>, Option<Arc<dyn PeerHandler>>)> {
        let nodes = self.read();
        if !nodes.get(&from).map(|entry| entry.online).unwrap_or(false) {
            return Err(NodeError::network(format!("node {} is offline", from)));
        }
        let entry = nodes
            .get(&to)
            .filter(|entry| entry.online)
            .ok_or_else(|| NodeError::network(format!("partner {} unreachable", to)))?;
        Ok((
            entry.registry.clone(),
            entry.handler.as_ref().and_then(Weak::upgrade),
        ))
    }

    fn handler(&self, from: PartnerId, to: PartnerId) -> Result<Arc<dyn PeerHandler>> {
        self.route(from, to)?
            .1
            .ok_or_else(|| NodeError::network(format!("partner {} has no peer handler", to)))
    }

    async fn deliver(
        &self,
        from: PartnerId,
        to: PartnerId,
        request: RoundRequest,
    ) -> Result<RoundResponse> {
        let (registry, handler) = self.route(from, to)?;
        match handler {
            Some(handler) => handler.handle_round_request(request).await,
            None => registry.serve(&request, self.wait).await,
        }
    }
}

/// One node's view of the hub
pub struct MemoryNetwork {
    hub: Arc<MemoryHub>,
    self_id: PartnerId,
    registry: Arc<MpcRegistry>,
}

impl MemoryNetwork {
    pub fn self_id(&self) -> PartnerId {
        self.self_id
    }

    pub fn registry(&self) -> &Arc<MpcRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait]
impl MpcNetwork for MemoryNetwork {
    async fn register_mpc(&self, mpc: Arc<MpcInstance>) -> Result<()> {
        self.registry.register(mpc).await
    }

    async fn ask_round_data(
        &self,
        partner: PartnerId,
        request: RoundRequest,
    ) -> Result<RoundResponse> {
        self.hub.deliver(self.self_id, partner, request).await
    }
}

#[async_trait]
impl RemoteSigner for MemoryNetwork {
    async fn request_signature(
        &self,
        partner: PartnerId,
        request: &SignRequest,
    ) -> Result<PartialSignature> {
        let handler = self.hub.handler(self.self_id, partner)?;
        handler.handle_sign_request(request.clone()).await
    }
}

#[async_trait]
impl Announcer for MemoryNetwork {
    async fn announce(
        &self,
        partners: &[PartnerId],
        announcement: &ConfirmedAnnouncement,
    ) -> Result<()> {
        for &partner in partners {
            let delivered = match self.hub.handler(self.self_id, partner) {
                Ok(handler) => handler.handle_confirmed(announcement.clone()).await,
                Err(e) => Err(e),
            };
            if let Err(e) = delivered {
                tracing::debug!(partner, error = %e, "Announcement not delivered");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Availability for MemoryNetwork {
    async fn available(&self, partners: &[PartnerId]) -> Vec<PartnerId> {
        if !self.hub.is_online(self.self_id) {
            return Vec::new();
        }
        partners
            .iter()
            .copied()
            .filter(|id| self.hub.is_online(*id))
            .collect()
    }
}
