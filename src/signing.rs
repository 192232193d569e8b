//! Signer side of request confirmation
//!
//! `KeyRing` holds the node's keys, Schnorr nonces and nonce batches;
//! `SignerService` validates an inbound sign request and produces a partial
//! signature. Schnorr nonces live in their own arena: signing with a
//! long-term key as the nonce would reveal that key's share.

use crate::arena::{Published, SessionArena};
use crate::crypto::curve::{hash32_from_hex, keccak256, scalar_to_hex};
use crate::crypto::{frost, schnorr};
use crate::error::{NodeError, Result};
use crate::keystore::Keystore;
use crate::logging::log_security_event;
use crate::mpc::ProtocolStore;
use crate::protocols::{BatchCursor, DistKey, NonceBatch};
use crate::types::{NonceRef, PartialSignature, PartnerId, SignRequest};
use crate::usage::{UsageRegistry, FROST_NONCE, SCHNORR_NONCE};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const LOOKUP_POLL: Duration = Duration::from_millis(20);

/// Retry `lookup` until it yields a value or `wait` has passed.
///
/// Partners finish a shared run at slightly different times, so a sign
/// request can arrive before this node stored the nonce it refers to.
async fn poll_until<T, F, Fut>(wait: Duration, mut lookup: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if let Some(found) = lookup().await {
            return Some(found);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(LOOKUP_POLL).await;
    }
}

/// App that computes the result a request confirms
#[async_trait]
pub trait Signable: Send + Sync {
    async fn compute(&self, app: &str, params: &Value) -> Result<Value>;
}

/// keccak256 over the canonical JSON encoding of a result
pub fn result_hash(result: &Value) -> Result<[u8; 32]> {
    let bytes = serde_json::to_vec(result)?;
    Ok(keccak256(&[&bytes]))
}

/// Deterministic demo app: the result is the request itself
pub struct EchoApp;

#[async_trait]
impl Signable for EchoApp {
    async fn compute(&self, app: &str, params: &Value) -> Result<Value> {
        Ok(serde_json::json!({ "app": app, "params": params }))
    }
}

/// Active signing key with the id it was generated under
#[derive(Debug, Clone)]
pub struct ActiveKey {
    pub id: String,
    pub key: Arc<DistKey>,
}

/// Keys and nonces this node holds
pub struct KeyRing {
    self_id: PartnerId,
    keys: Arc<SessionArena<Arc<DistKey>>>,
    nonces: Arc<SessionArena<Arc<DistKey>>>,
    batches: Arc<SessionArena<Arc<NonceBatch>>>,
    active_key: Published<Option<ActiveKey>>,
    active_batch: Published<Option<Arc<BatchCursor>>>,
    keystore: Option<(Keystore, String)>,
}

impl KeyRing {
    pub fn new(self_id: PartnerId, ttl: Duration) -> Self {
        Self {
            self_id,
            keys: Arc::new(SessionArena::new("keys", ttl)),
            nonces: Arc::new(SessionArena::new("schnorr-nonces", ttl)),
            batches: Arc::new(SessionArena::new("nonce-batches", ttl)),
            active_key: Published::new(None),
            active_batch: Published::new(None),
            keystore: None,
        }
    }

    /// Persist activated keys to `keystore` encrypted with `password`
    pub fn with_keystore(mut self, keystore: Keystore, password: impl Into<String>) -> Self {
        self.keystore = Some((keystore, password.into()));
        self
    }

    pub fn self_id(&self) -> PartnerId {
        self.self_id
    }

    pub fn keys(&self) -> &Arc<SessionArena<Arc<DistKey>>> {
        &self.keys
    }

    pub fn nonces(&self) -> &Arc<SessionArena<Arc<DistKey>>> {
        &self.nonces
    }

    pub fn batches(&self) -> &Arc<SessionArena<Arc<NonceBatch>>> {
        &self.batches
    }

    pub async fn nonce(&self, id: &str) -> Option<Arc<DistKey>> {
        self.nonces.get(id).await
    }

    /// Load the persisted key, if any, and make it active
    pub async fn load_keystore(&self) -> Result<Option<ActiveKey>> {
        let Some((keystore, password)) = &self.keystore else {
            return Ok(None);
        };
        if !keystore.exists() {
            return Ok(None);
        }
        let (id, json) = keystore.load(password)?;
        let key = Arc::new(DistKey::from_json(&json)?);
        self.keys.insert_pinned(&id, key.clone()).await;
        let active = ActiveKey { id, key };
        self.active_key.store(Some(active.clone()));
        Ok(Some(active))
    }

    pub fn active_key(&self) -> Option<ActiveKey> {
        (*self.active_key.load()).clone()
    }

    pub fn active_batch(&self) -> Option<Arc<BatchCursor>> {
        (*self.active_batch.load()).clone()
    }

    pub async fn batch(&self, id: &str) -> Option<Arc<NonceBatch>> {
        if let Some(cursor) = self.active_batch() {
            if cursor.batch().id == id {
                return Some(cursor.batch().clone());
            }
        }
        self.batches.get(id).await
    }
}

#[async_trait]
impl ProtocolStore for KeyRing {
    async fn key(&self, id: &str) -> Option<Arc<DistKey>> {
        if let Some(active) = self.active_key() {
            if active.id == id {
                return Some(active.key);
            }
        }
        self.keys.get(id).await
    }

    async fn save_key(&self, id: &str, key: Arc<DistKey>, activate: bool) -> Result<()> {
        if !activate {
            self.keys.insert(id, key).await;
            return Ok(());
        }
        if let Some((keystore, password)) = &self.keystore {
            keystore.save(id, &key.to_json(), password)?;
        }
        self.keys.insert_pinned(id, key.clone()).await;
        self.active_key.store(Some(ActiveKey {
            id: id.to_string(),
            key: key.clone(),
        }));
        tracing::info!(
            node_id = self.self_id,
            key_id = %id,
            address = %key.address,
            "Activated signing key"
        );
        Ok(())
    }

    async fn save_nonce(&self, id: &str, nonce: Arc<DistKey>) -> Result<()> {
        if !self.nonces.insert_if_absent(id, nonce).await {
            return Err(NodeError::ReplayOrMisuse(format!("nonce {} already exists", id)));
        }
        Ok(())
    }

    async fn save_batch(&self, batch: Arc<NonceBatch>, activate: bool) -> Result<()> {
        self.batches.insert(&batch.id, batch.clone()).await;
        if activate {
            tracing::info!(
                node_id = self.self_id,
                batch_id = %batch.id,
                n = batch.n,
                "Activated nonce batch"
            );
            self.active_batch
                .store(Some(Arc::new(BatchCursor::new(batch))));
        }
        Ok(())
    }
}

/// Validates sign requests and produces partial signatures
pub struct SignerService {
    keys: Arc<KeyRing>,
    usage: Arc<dyn UsageRegistry>,
    app: Arc<dyn Signable>,
    freshness: Duration,
    lookup_wait: Duration,
}

impl SignerService {
    pub fn new(
        keys: Arc<KeyRing>,
        usage: Arc<dyn UsageRegistry>,
        app: Arc<dyn Signable>,
        freshness: Duration,
    ) -> Self {
        Self {
            keys,
            usage,
            app,
            freshness,
            lookup_wait: Duration::ZERO,
        }
    }

    /// How long to wait for a key, nonce or batch this node is still finishing
    pub fn with_lookup_wait(mut self, wait: Duration) -> Self {
        self.lookup_wait = wait;
        self
    }

    fn check_freshness(&self, timestamp: i64) -> Result<()> {
        let age = chrono::Utc::now().timestamp() - timestamp;
        let window = i64::try_from(self.freshness.as_secs()).unwrap_or(i64::MAX);
        if age.abs() > window {
            return Err(NodeError::verification(format!(
                "request timestamp is {}s off, window is {}s",
                age, window
            )));
        }
        Ok(())
    }

    /// Check `request` and sign it with the referenced nonce
    pub async fn sign(&self, request: &SignRequest) -> Result<PartialSignature> {
        self.check_freshness(request.timestamp)?;

        let active = poll_until(self.lookup_wait, || async {
            self.keys.active_key().filter(|active| {
                request
                    .public_key
                    .eq_ignore_ascii_case(&active.key.public_key_hex())
            })
        })
        .await
        .ok_or_else(|| {
            NodeError::verification("request is not for the active signing key")
        })?;
        let key = active.key.clone();

        let result = self.app.compute(&request.app, &request.params).await?;
        let hash = result_hash(&result)?;
        if hash32_from_hex(&request.result_hash)? != hash {
            return Err(NodeError::verification(format!(
                "result hash mismatch for request {}",
                request.req_id
            )));
        }
        let hash_hex = hex::encode(hash);

        let partial = match &request.nonce {
            NonceRef::Schnorr { nonce_id } => {
                let nonce = poll_until(self.lookup_wait, || self.keys.nonce(nonce_id))
                    .await
                    .ok_or_else(|| NodeError::SessionNotFound(format!("nonce {}", nonce_id)))?;
                self.check_schnorr_nonce(&active, nonce_id, &nonce, &request.req_id)
                    .await?;
                self.bind(SCHNORR_NONCE, nonce_id, &hash_hex, &request.req_id)
                    .await?;
                schnorr::partial_sign(&key.share, &nonce.share, &nonce.public_key, &hash)
            }
            NonceRef::Frost {
                batch_id,
                index,
                signers,
            } => {
                let batch = poll_until(self.lookup_wait, || self.keys.batch(batch_id))
                    .await
                    .ok_or_else(|| {
                        NodeError::SessionNotFound(format!("nonce batch {}", batch_id))
                    })?;
                if !signers.contains(&key.index) {
                    return Err(NodeError::invalid("this node is not among the signers"));
                }
                if let Some(outsider) = signers.iter().find(|id| !key.partners.contains(id)) {
                    return Err(NodeError::invalid(format!(
                        "signer {} holds no share of the key",
                        outsider
                    )));
                }
                let commitments = batch.signing_commitments(*index, signers)?;
                let nonce = batch.nonce(*index)?;

                let signer_list = signers
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let slot = format!("{}:{}", batch_id, index);
                let bound_to = format!("{}:{}", hash_hex, signer_list);
                self.bind(FROST_NONCE, &slot, &bound_to, &request.req_id)
                    .await?;

                frost::partial_sign(
                    key.index,
                    &key.share,
                    (&nonce.d, &nonce.e),
                    &commitments,
                    &key.public_key,
                    &hash,
                )?
            }
        };

        tracing::debug!(
            req_id = %request.req_id,
            signer_id = key.index,
            "Produced partial signature"
        );
        Ok(PartialSignature {
            req_id: request.req_id.clone(),
            result_hash: request.result_hash.clone(),
            signer_id: key.index,
            partial_signature: scalar_to_hex(&partial),
        })
    }

    /// The nonce must be a fresh sharing among holders of the signing key
    async fn check_schnorr_nonce(
        &self,
        active: &ActiveKey,
        nonce_id: &str,
        nonce: &DistKey,
        req_id: &str,
    ) -> Result<()> {
        let key = &active.key;
        let misuse = if nonce_id == active.id || self.keys.keys.contains(nonce_id).await {
            Some(format!("nonce {} names a signing key", nonce_id))
        } else if nonce.index != key.index {
            Some("nonce share belongs to another node".to_string())
        } else if nonce.public_key == key.public_key {
            Some("nonce has the signing key's public key".to_string())
        } else if nonce.threshold() != key.threshold() {
            Some(format!(
                "nonce threshold {:?} differs from key threshold {:?}",
                nonce.threshold(),
                key.threshold()
            ))
        } else {
            nonce
                .partners
                .iter()
                .find(|id| !key.partners.contains(id))
                .map(|outsider| format!("nonce partner {} holds no share of the key", outsider))
        };

        match misuse {
            Some(reason) => {
                log_security_event(
                    "schnorr_nonce_refused",
                    false,
                    serde_json::json!({ "nonce_id": nonce_id, "reason": reason }),
                    Some(req_id),
                );
                Err(NodeError::ReplayOrMisuse(reason))
            }
            None => Ok(()),
        }
    }

    async fn bind(&self, purpose: &str, item: &str, value: &str, req_id: &str) -> Result<()> {
        let bound = self.usage.mark(purpose, item, value).await;
        if let Err(e) = &bound {
            log_security_event(
                "nonce_reuse_refused",
                false,
                serde_json::json!({ "purpose": purpose, "item": item, "error": e.to_string() }),
                Some(req_id),
            );
        }
        bound
    }
}
