//! The MPC node
//!
//! Wires the engine, the protocol table, the key ring, the signer service and
//! the confirmation orchestrator together behind one handle that the HTTP
//! server and the in-memory hub both talk to.

use crate::arena::Published;
use crate::config::NodeConfig;
use crate::confirmation::{
    Announcer, Availability, BoundNonce, ConfirmationOutcome, ConfirmationSettings,
    ConfirmerParts, NonceBinder, RemoteSigner, RequestConfirmer, Scheme, select_signers,
};
use crate::crypto::curve::scalar_from_hex;
use crate::crypto::frost::FrostSignature;
use crate::crypto::polynomial::CommitmentJson;
use crate::crypto::schnorr::{self, SchnorrSignature};
use crate::crypto::{frost, curve::hash32_from_hex};
use crate::error::{NodeError, RejectionGraph, Result};
use crate::keystore::Keystore;
use crate::logging::log_security_event;
use crate::mpc::{
    MemoryHub, MpcNetwork, MpcOptions, MpcRegistry, PeerHandler, ProtocolEnv, ProtocolOutcome,
    ProtocolStore, ProtocolTable, RunHandle,
};
use crate::protocols::dkg::{start_dkg, DkgParams, DKG_KIND};
use crate::protocols::nonce::{start_nonce_batch, NonceBatchParams, NONCE_BATCH_KIND};
use crate::protocols::reshare::{start_reshare, ReshareParams, RESHARE_KIND};
use crate::protocols::{DistKey, DkgFactory, NonceBatch, NonceBatchFactory, ReshareFactory};
use crate::signing::{EchoApp, KeyRing, Signable, SignerService};
use crate::types::{
    ConfirmRequest, ConfirmedAnnouncement, DkgStartRequest, HealthResponse, KeyResponse, MpcInit,
    NodeInfo, NonceBatchResponse, NonceBatchStartRequest, PartialSignature, Party, PartnerId,
    ReshareStartRequest, RoundRequest, RoundResponse, SignRequest,
};
use crate::usage::{MemoryUsageRegistry, UsageRegistry};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Outbound capabilities of a node, usually all served by one transport
#[derive(Clone)]
pub struct Peers {
    pub network: Arc<dyn MpcNetwork>,
    pub signer: Arc<dyn RemoteSigner>,
    pub announcer: Arc<dyn Announcer>,
    pub availability: Arc<dyn Availability>,
}

impl Peers {
    pub fn shared<T>(transport: Arc<T>) -> Self
    where
        T: MpcNetwork + RemoteSigner + Announcer + Availability + 'static,
    {
        Self {
            network: transport.clone(),
            signer: transport.clone(),
            announcer: transport.clone(),
            availability: transport,
        }
    }
}

async fn await_run(handle: RunHandle) -> Result<ProtocolOutcome> {
    handle
        .await
        .map_err(|e| NodeError::Aborted(format!("protocol task failed: {}", e)))?
}

async fn await_key(handle: RunHandle) -> Result<Arc<DistKey>> {
    match await_run(handle).await? {
        ProtocolOutcome::Key(key) => Ok(key),
        ProtocolOutcome::Batch(_) => Err(NodeError::invalid("run produced a nonce batch")),
    }
}

async fn await_batch(handle: RunHandle) -> Result<Arc<NonceBatch>> {
    match await_run(handle).await? {
        ProtocolOutcome::Batch(batch) => Ok(batch),
        ProtocolOutcome::Key(_) => Err(NodeError::invalid("run produced a key")),
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Binds fresh DKG nonces or FROST batch slots to requests
struct NodeNonceBinder {
    env: ProtocolEnv,
    keys: Arc<KeyRing>,
}

#[async_trait]
impl NonceBinder for NodeNonceBinder {
    async fn bind_nonce(
        &self,
        req_id: &str,
        scheme: Scheme,
        candidates: &[PartnerId],
        t: usize,
    ) -> Result<BoundNonce> {
        match scheme {
            Scheme::Schnorr => {
                let nonce_id = format!("{}-nonce", req_id);
                let init = MpcInit {
                    kind: DKG_KIND.to_string(),
                    id: nonce_id.clone(),
                    starter: self.env.self_id,
                    partners: candidates.to_vec(),
                    t,
                    params: serde_json::to_value(DkgParams {
                        nonce: true,
                        ..Default::default()
                    })?,
                };
                let nonce = await_key(start_dkg(&self.env, init, None)?).await?;
                Ok(BoundNonce::Schnorr { nonce_id, nonce })
            }
            Scheme::Frost => {
                let cursor = self
                    .keys
                    .active_batch()
                    .ok_or_else(|| NodeError::SessionNotFound("no active nonce batch".into()))?;
                let batch = cursor.batch().clone();
                let eligible: Vec<PartnerId> = candidates
                    .iter()
                    .copied()
                    .filter(|id| batch.partners.contains(id))
                    .collect();
                let signers = select_signers(self.env.self_id, &eligible, t);
                if signers.len() < t {
                    return Err(NodeError::InsufficientPartners {
                        threshold: t,
                        qualified: signers.len(),
                        graph: RejectionGraph {
                            unreachable: batch
                                .partners
                                .iter()
                                .copied()
                                .filter(|id| !candidates.contains(id))
                                .collect(),
                            ..Default::default()
                        },
                    });
                }
                let index = cursor.allocate().ok_or_else(|| {
                    NodeError::SessionNotFound(format!("nonce batch {} is exhausted", batch.id))
                })?;
                Ok(BoundNonce::Frost {
                    batch,
                    index,
                    signers,
                })
            }
        }
    }
}

/// Signs through the local signer service for itself and the transport otherwise
struct LocalFirstSigner {
    self_id: PartnerId,
    local: Arc<SignerService>,
    remote: Arc<dyn RemoteSigner>,
}

#[async_trait]
impl RemoteSigner for LocalFirstSigner {
    async fn request_signature(
        &self,
        partner: PartnerId,
        request: &SignRequest,
    ) -> Result<PartialSignature> {
        if partner == self.self_id {
            self.local.sign(request).await
        } else {
            self.remote.request_signature(partner, request).await
        }
    }
}

pub struct Node {
    config: NodeConfig,
    party: Published<Party>,
    registry: Arc<MpcRegistry>,
    env: ProtocolEnv,
    table: ProtocolTable,
    keys: Arc<KeyRing>,
    signer: Arc<SignerService>,
    confirmer: RequestConfirmer,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        registry: Arc<MpcRegistry>,
        peers: Peers,
        app: Arc<dyn Signable>,
        usage: Arc<dyn UsageRegistry>,
    ) -> Result<Arc<Self>> {
        let party = config.party()?;
        let self_id = party.id;

        let mut keys = KeyRing::new(self_id, Duration::from_secs(config.cache.key_ttl_secs));
        if let Some(password) = &config.key_password {
            keys = keys.with_keystore(Keystore::new(config.keystore_path(), self_id), password);
        }
        let keys = Arc::new(keys);

        let env = ProtocolEnv {
            self_id,
            network: peers.network.clone(),
            options: MpcOptions::from(&config),
            store: keys.clone(),
        };
        let table = ProtocolTable::builder(env.clone())
            .register(DkgFactory)
            .register(ReshareFactory)
            .register(NonceBatchFactory)
            .build();

        let signer = Arc::new(SignerService::new(
            keys.clone(),
            usage,
            app.clone(),
            Duration::from_secs(config.confirmation.freshness_secs),
        )
        .with_lookup_wait(config.round_timeout()));
        let confirmer = RequestConfirmer::new(
            keys.clone(),
            ConfirmerParts {
                app,
                signer: Arc::new(LocalFirstSigner {
                    self_id,
                    local: signer.clone(),
                    remote: peers.signer,
                }),
                announcer: peers.announcer,
                availability: peers.availability,
                binder: Arc::new(NodeNonceBinder {
                    env: env.clone(),
                    keys: keys.clone(),
                }),
            },
            ConfirmationSettings {
                timeout: Duration::from_secs(config.confirmation.timeout_secs),
                max_failures: config.confirmation.max_failures,
            },
            Duration::from_secs(config.cache.session_ttl_secs),
        );

        tracing::info!(
            node_id = self_id,
            t = party.t,
            partners = ?party.partners,
            kinds = ?table.kinds(),
            "Node initialized"
        );

        Ok(Arc::new(Self {
            config,
            party: Published::new(party),
            registry,
            env,
            table,
            keys,
            signer,
            confirmer,
        }))
    }

    /// Node on `hub` with an in-memory used-for registry and the echo app
    pub fn in_memory(hub: &Arc<MemoryHub>, config: NodeConfig) -> Result<Arc<Self>> {
        let registry = Arc::new(MpcRegistry::new(Duration::from_secs(
            config.cache.session_ttl_secs,
        )));
        let network = hub.add_node_with_registry(config.node.id, registry.clone());
        let node = Self::new(
            config,
            registry,
            Peers::shared(network),
            Arc::new(EchoApp),
            Arc::new(MemoryUsageRegistry::new()),
        )?;
        let weak = Arc::downgrade(&node);
        let handler: Weak<dyn PeerHandler> = weak;
        hub.attach_handler(node.id(), handler);
        Ok(node)
    }

    pub fn id(&self) -> PartnerId {
        self.env.self_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn party(&self) -> Arc<Party> {
        self.party.load()
    }

    /// Replace the membership view
    pub fn update_party(&self, party: Party) -> Result<()> {
        if party.id != self.id() {
            return Err(NodeError::invalid("party belongs to another node"));
        }
        tracing::info!(
            node_id = self.id(),
            partners = ?party.partners,
            t = party.t,
            "Party updated"
        );
        self.party.store(party);
        Ok(())
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn registry(&self) -> &Arc<MpcRegistry> {
        &self.registry
    }

    pub fn confirmer(&self) -> &RequestConfirmer {
        &self.confirmer
    }

    /// Load the persisted signing key, if there is one
    pub async fn load_keystore(&self) -> Result<bool> {
        match self.keys.load_keystore().await? {
            Some(active) => {
                tracing::info!(
                    node_id = self.id(),
                    key_id = %active.id,
                    address = %active.key.address,
                    "Restored signing key from keystore"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Background sweeps of every session arena
    pub fn spawn_sweepers(&self) -> Vec<JoinHandle<()>> {
        let interval = Duration::from_secs(self.config.cache.sweep_interval_secs);
        vec![
            self.registry.spawn_sweeper(interval),
            self.keys.keys().spawn_sweeper(interval),
            self.keys.nonces().spawn_sweeper(interval),
            self.keys.batches().spawn_sweeper(interval),
            self.confirmer.records().spawn_sweeper(interval),
        ]
    }

    fn group(
        &self,
        t: Option<usize>,
        partners: Option<Vec<PartnerId>>,
    ) -> Result<(usize, Vec<PartnerId>)> {
        let party = self.party();
        let t = t.unwrap_or(party.t);
        let mut partners = partners.unwrap_or_else(|| party.partners.clone());
        partners.sort_unstable();
        partners.dedup();
        if let Some(outsider) = partners.iter().find(|id| !party.contains(**id)) {
            return Err(NodeError::invalid(format!("{} is not a party member", outsider)));
        }
        if !partners.contains(&self.id()) {
            return Err(NodeError::invalid("the starting node must take part"));
        }
        if t == 0 || t > partners.len() {
            return Err(NodeError::invalid(format!(
                "threshold {} out of range for {} partners",
                t,
                partners.len()
            )));
        }
        Ok((t, partners))
    }

    pub async fn run_dkg(&self, request: DkgStartRequest) -> Result<KeyResponse> {
        let (t, partners) = self.group(request.t, request.partners)?;
        let seed = request.seed.as_deref().map(scalar_from_hex).transpose()?;
        let id = request.id.unwrap_or_else(|| new_id("dkg"));
        let init = MpcInit {
            kind: DKG_KIND.to_string(),
            id: id.clone(),
            starter: self.id(),
            partners,
            t,
            params: serde_json::to_value(DkgParams {
                seeded: seed.is_some(),
                activate: request.activate,
                nonce: false,
            })?,
        };
        let key = await_key(start_dkg(&self.env, init, seed)?).await?;
        Ok(KeyResponse {
            id,
            public_key: key.public_key_hex(),
            address: key.address.clone(),
            partners: key.partners.clone(),
            t,
        })
    }

    pub async fn run_reshare(&self, request: ReshareStartRequest) -> Result<KeyResponse> {
        let previous = self
            .keys
            .key(&request.key_id)
            .await
            .ok_or_else(|| NodeError::SessionNotFound(format!("key {}", request.key_id)))?;
        let polynomial = previous
            .polynomial
            .as_ref()
            .ok_or_else(|| NodeError::invalid("key has no public polynomial to reshare"))?;
        let dealers = request
            .dealers
            .unwrap_or_else(|| previous.partners.clone());
        let (t, partners) = self.group(Some(request.t), Some(request.partners))?;

        let id = request.id.unwrap_or_else(|| new_id("reshare"));
        let init = MpcInit {
            kind: RESHARE_KIND.to_string(),
            id: id.clone(),
            starter: self.id(),
            partners,
            t,
            params: serde_json::to_value(ReshareParams {
                key_id: request.key_id,
                dealers,
                previous: CommitmentJson::from(polynomial),
                public_key: previous.public_key_hex(),
                activate: request.activate,
            })?,
        };
        let key = await_key(start_reshare(&self.env, init).await?).await?;
        Ok(KeyResponse {
            id,
            public_key: key.public_key_hex(),
            address: key.address.clone(),
            partners: key.partners.clone(),
            t,
        })
    }

    pub async fn run_nonce_batch(
        &self,
        request: NonceBatchStartRequest,
    ) -> Result<NonceBatchResponse> {
        let (t, partners) = self.group(request.t, request.partners)?;
        let id = request.id.unwrap_or_else(|| new_id("nonces"));
        let init = MpcInit {
            kind: NONCE_BATCH_KIND.to_string(),
            id: id.clone(),
            starter: self.id(),
            partners,
            t,
            params: serde_json::to_value(NonceBatchParams {
                n: request.n,
                activate: request.activate,
            })?,
        };
        let batch = await_batch(start_nonce_batch(&self.env, init)?).await?;
        Ok(NonceBatchResponse {
            id,
            n: batch.n,
            partners: batch.partners.clone(),
        })
    }

    pub async fn confirm(&self, request: ConfirmRequest) -> Result<ConfirmationOutcome> {
        self.confirmer.confirm(request).await
    }

    pub fn info(&self) -> NodeInfo {
        let party = self.party();
        let active = self.keys.active_key();
        NodeInfo {
            node_id: party.id,
            t: party.t,
            max: party.max,
            partners: party.partners.clone(),
            public_key: active.as_ref().map(|a| a.key.public_key_hex()),
            address: active.as_ref().map(|a| a.key.address.clone()),
            nonces_left: self
                .keys
                .active_batch()
                .map(|cursor| cursor.remaining())
                .unwrap_or(0),
        }
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "healthy".to_string(),
            node_id: self.id(),
            key_loaded: self.keys.active_key().is_some(),
        }
    }

    /// Instantiate a run a partner asks about before we have seen it
    async fn lazy_start(&self, request: &RoundRequest, init: &MpcInit) -> Result<()> {
        if init.id != request.mpc_id {
            return Err(NodeError::schema("init payload is for another mpc"));
        }
        let party = self.party();
        if !party.contains(init.starter) || !party.contains(request.from) {
            log_security_event(
                "foreign_mpc_refused",
                false,
                serde_json::json!({
                    "mpc_id": init.id,
                    "starter": init.starter,
                    "from": request.from,
                }),
                None,
            );
            return Err(NodeError::NotQualified(format!(
                "mpc {} was not started by a party member",
                init.id
            )));
        }
        if !init.partners.contains(&self.id()) {
            return Err(NodeError::NotQualified(format!(
                "node {} is not a partner of mpc {}",
                self.id(),
                init.id
            )));
        }
        if !self.registry.reserve(&init.id).await {
            return Ok(());
        }

        let handle = match self.table.start(init.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.release(&init.id).await;
                return Err(e);
            }
        };
        let mpc_id = init.id.clone();
        let node_id = self.id();
        tokio::spawn(async move {
            match await_run(handle).await {
                Ok(_) => {
                    tracing::debug!(node_id, mpc_id = %mpc_id, "Lazily started mpc finished")
                }
                Err(e) => tracing::warn!(
                    node_id,
                    mpc_id = %mpc_id,
                    error = %e,
                    "Lazily started mpc failed"
                ),
            }
        });
        Ok(())
    }
}

#[async_trait]
impl PeerHandler for Node {
    async fn handle_round_request(&self, request: RoundRequest) -> Result<RoundResponse> {
        if let Some(init) = &request.init {
            if self.registry.get(&request.mpc_id).await.is_none() {
                self.lazy_start(&request, init).await?;
            }
        }
        self.registry
            .serve(&request, self.config.round_timeout())
            .await
    }

    async fn handle_sign_request(&self, request: SignRequest) -> Result<PartialSignature> {
        self.signer.sign(&request).await
    }

    async fn handle_confirmed(&self, announcement: ConfirmedAnnouncement) -> Result<()> {
        let active = self
            .keys
            .active_key()
            .ok_or_else(|| NodeError::SessionNotFound("no active signing key".into()))?;
        if !announcement
            .owner_pub_key
            .eq_ignore_ascii_case(&active.key.public_key_hex())
        {
            return Err(NodeError::verification("announcement for another key"));
        }
        let hash = hash32_from_hex(&announcement.result_hash)?;
        let valid = if announcement.aggregated_signature.contains(',') {
            let signature = SchnorrSignature::from_wire(&announcement.aggregated_signature)?;
            schnorr::verify(&active.key.public_key, &hash, &signature)
        } else {
            let signature = FrostSignature::from_hex(&announcement.aggregated_signature)?;
            frost::verify(&active.key.public_key, &hash, &signature)
        };
        if !valid {
            log_security_event(
                "invalid_announcement",
                false,
                serde_json::json!({ "req_id": announcement.req_id }),
                Some(&announcement.req_id),
            );
            return Err(NodeError::verification("announced signature does not verify"));
        }
        tracing::info!(
            node_id = self.id(),
            req_id = %announcement.req_id,
            result_hash = %announcement.result_hash,
            "Request confirmed by quorum"
        );
        Ok(())
    }
}

/// Nodes sharing one in-memory hub
pub struct MemoryCluster {
    pub hub: Arc<MemoryHub>,
    pub nodes: BTreeMap<PartnerId, Arc<Node>>,
}

impl MemoryCluster {
    /// One node per partner, each configured by `configure`
    pub fn new(
        t: usize,
        partners: &[PartnerId],
        configure: impl Fn(&mut NodeConfig),
    ) -> Result<Self> {
        let hub = MemoryHub::new();
        let mut nodes = BTreeMap::new();
        for &id in partners {
            let mut config = NodeConfig::local(id, t, partners.to_vec());
            configure(&mut config);
            nodes.insert(id, Node::in_memory(&hub, config)?);
        }
        Ok(Self { hub, nodes })
    }

    pub fn node(&self, id: PartnerId) -> Result<&Arc<Node>> {
        self.nodes
            .get(&id)
            .ok_or_else(|| NodeError::invalid(format!("no node {}", id)))
    }
}
