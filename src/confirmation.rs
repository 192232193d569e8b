//! Request confirmation orchestrator
//!
//! Turns an app computation into a quorum-signed result:
//! `Computed -> AwaitingSignatures -> Confirmed | Failed`.
//!
//! The orchestrator binds a nonce to the request, fans sign requests out to
//! a subset of available partners, verifies every partial against the
//! sender's public share and aggregates as soon as `t` valid partials are in.

use crate::arena::SessionArena;
use crate::crypto::curve::{scalar_from_hex, Scalar};
use crate::crypto::{frost, schnorr};
use crate::error::{NodeError, RejectionGraph, Result};
use crate::logging::{log_confirmation_event, log_security_event};
use crate::protocols::{DistKey, NonceBatch};
use crate::signing::{result_hash, KeyRing, Signable};
use crate::types::{
    ConfirmRequest, ConfirmedAnnouncement, NonceRef, PartialSignature, PartnerId, SignRequest,
};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Asks a partner for its partial signature
#[async_trait]
pub trait RemoteSigner: Send + Sync {
    async fn request_signature(
        &self,
        partner: PartnerId,
        request: &SignRequest,
    ) -> Result<PartialSignature>;
}

/// Publishes a confirmed result to the partners
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(
        &self,
        partners: &[PartnerId],
        announcement: &ConfirmedAnnouncement,
    ) -> Result<()>;
}

/// Which partners currently answer
#[async_trait]
pub trait Availability: Send + Sync {
    async fn available(&self, partners: &[PartnerId]) -> Vec<PartnerId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Schnorr,
    Frost,
}

/// Nonce bound to one request
#[derive(Debug, Clone)]
pub enum BoundNonce {
    /// Fresh DKG generated nonce; signers are its holders
    Schnorr {
        nonce_id: String,
        nonce: Arc<DistKey>,
    },
    /// One slot of a FROST batch
    Frost {
        batch: Arc<NonceBatch>,
        index: usize,
        signers: Vec<PartnerId>,
    },
}

impl BoundNonce {
    pub fn signers(&self) -> &[PartnerId] {
        match self {
            BoundNonce::Schnorr { nonce, .. } => &nonce.partners,
            BoundNonce::Frost { signers, .. } => signers,
        }
    }

    pub fn to_ref(&self) -> NonceRef {
        match self {
            BoundNonce::Schnorr { nonce_id, .. } => NonceRef::Schnorr {
                nonce_id: nonce_id.clone(),
            },
            BoundNonce::Frost {
                batch,
                index,
                signers,
            } => NonceRef::Frost {
                batch_id: batch.id.clone(),
                index: *index,
                signers: signers.clone(),
            },
        }
    }
}

/// Supplies the nonce a request is signed with
#[async_trait]
pub trait NonceBinder: Send + Sync {
    /// Bind a nonce to `req_id` among `candidates`
    async fn bind_nonce(
        &self,
        req_id: &str,
        scheme: Scheme,
        candidates: &[PartnerId],
        t: usize,
    ) -> Result<BoundNonce>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Computed,
    AwaitingSignatures,
    Confirmed,
    Failed,
}

/// Progress of one request
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub req_id: String,
    pub result_hash: String,
    /// Valid partials needed
    pub n_sign: usize,
    state: RequestState,
    signatures: BTreeMap<PartnerId, Scalar>,
    errors: BTreeMap<PartnerId, String>,
    signature: Option<String>,
    failure: Option<String>,
}

impl RequestRecord {
    pub fn new(req_id: impl Into<String>, result_hash: impl Into<String>, n_sign: usize) -> Self {
        Self {
            req_id: req_id.into(),
            result_hash: result_hash.into(),
            n_sign,
            state: RequestState::Computed,
            signatures: BTreeMap::new(),
            errors: BTreeMap::new(),
            signature: None,
            failure: None,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn signatures(&self) -> &BTreeMap<PartnerId, Scalar> {
        &self.signatures
    }

    pub fn errors(&self) -> &BTreeMap<PartnerId, String> {
        &self.errors
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn start_signing(&mut self) -> bool {
        if self.state != RequestState::Computed {
            return false;
        }
        self.state = RequestState::AwaitingSignatures;
        true
    }

    /// Record a verified partial; the first one per signer wins
    pub fn add_signature(&mut self, signer: PartnerId, partial: Scalar) -> bool {
        if self.state != RequestState::AwaitingSignatures
            || self.signatures.contains_key(&signer)
        {
            return false;
        }
        self.signatures.insert(signer, partial);
        true
    }

    pub fn add_error(&mut self, signer: PartnerId, error: impl Into<String>) {
        self.errors.insert(signer, error.into());
    }

    pub fn has_quorum(&self) -> bool {
        self.signatures.len() >= self.n_sign
    }

    pub fn still_needed(&self) -> usize {
        self.n_sign.saturating_sub(self.signatures.len())
    }

    /// Transition to `Confirmed`; true only for the call that flips it
    pub fn confirm(&mut self, signature: impl Into<String>) -> bool {
        if self.state != RequestState::AwaitingSignatures {
            return false;
        }
        self.state = RequestState::Confirmed;
        self.signature = Some(signature.into());
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if matches!(self.state, RequestState::Confirmed | RequestState::Failed) {
            return false;
        }
        self.state = RequestState::Failed;
        self.failure = Some(reason.into());
        true
    }
}

/// Result handed back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationOutcome {
    pub req_id: String,
    pub result: Value,
    pub result_hash: String,
    pub state: RequestState,
    pub confirmed: bool,
    /// Aggregated signature once confirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Partners whose partials went into the signature
    pub signers: Vec<PartnerId>,
    /// Per-partner failures
    pub errors: BTreeMap<PartnerId, String>,
    /// Deadline hit before quorum
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct ConfirmationSettings {
    /// Bound on the whole fan-out
    pub timeout: Duration,
    /// Failed partials tolerated before the request fails
    pub max_failures: usize,
}

impl Default for ConfirmationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_failures: 3,
        }
    }
}

/// min(⌈1.5t⌉, |partners|)
pub fn schnorr_subset_size(t: usize, partners: usize) -> usize {
    ((3 * t + 1) / 2).min(partners)
}

/// This node when available plus a random draw of the others, sorted
pub fn select_signers(self_id: PartnerId, available: &[PartnerId], size: usize) -> Vec<PartnerId> {
    let mut others: Vec<PartnerId> = available
        .iter()
        .copied()
        .filter(|id| *id != self_id)
        .collect();
    others.shuffle(&mut rand::thread_rng());
    let mut chosen: Vec<PartnerId> = available
        .iter()
        .copied()
        .filter(|id| *id == self_id)
        .take(1)
        .chain(others)
        .collect();
    chosen.truncate(size);
    chosen.sort_unstable();
    chosen
}

enum FanOut {
    Quorum,
    Failed(String),
    TimedOut,
}

/// Drives requests from computation to confirmation
pub struct RequestConfirmer {
    self_id: PartnerId,
    keys: Arc<KeyRing>,
    app: Arc<dyn Signable>,
    signer: Arc<dyn RemoteSigner>,
    announcer: Arc<dyn Announcer>,
    availability: Arc<dyn Availability>,
    binder: Arc<dyn NonceBinder>,
    records: Arc<SessionArena<Arc<Mutex<RequestRecord>>>>,
    settings: ConfirmationSettings,
}

pub struct ConfirmerParts {
    pub app: Arc<dyn Signable>,
    pub signer: Arc<dyn RemoteSigner>,
    pub announcer: Arc<dyn Announcer>,
    pub availability: Arc<dyn Availability>,
    pub binder: Arc<dyn NonceBinder>,
}

impl RequestConfirmer {
    pub fn new(
        keys: Arc<KeyRing>,
        parts: ConfirmerParts,
        settings: ConfirmationSettings,
        record_ttl: Duration,
    ) -> Self {
        Self {
            self_id: keys.self_id(),
            keys,
            app: parts.app,
            signer: parts.signer,
            announcer: parts.announcer,
            availability: parts.availability,
            binder: parts.binder,
            records: Arc::new(SessionArena::new("requests", record_ttl)),
            settings,
        }
    }

    pub fn records(&self) -> &Arc<SessionArena<Arc<Mutex<RequestRecord>>>> {
        &self.records
    }

    /// Snapshot of a request's record
    pub async fn record(&self, req_id: &str) -> Option<RequestRecord> {
        let record = self.records.get(req_id).await?;
        let snapshot = record.lock().await.clone();
        Some(snapshot)
    }

    pub async fn confirm(&self, request: ConfirmRequest) -> Result<ConfirmationOutcome> {
        let active = self
            .keys
            .active_key()
            .ok_or_else(|| NodeError::SessionNotFound("no active signing key".into()))?;
        let key = active.key;
        let t = key
            .threshold()
            .ok_or_else(|| NodeError::crypto("active key has no public polynomial"))?;

        let result = self.app.compute(&request.app, &request.params).await?;
        let hash = result_hash(&result)?;
        let hash_hex = hex::encode(hash);
        let req_id = uuid::Uuid::new_v4().to_string();
        let record = Arc::new(Mutex::new(RequestRecord::new(&req_id, &hash_hex, t)));
        self.records.insert(&req_id, record.clone()).await;

        let available = self.availability.available(&key.partners).await;
        if available.len() < t {
            let reason = format!("{} of {} partners available", available.len(), t);
            record.lock().await.fail(&reason);
            return Err(NodeError::InsufficientPartners {
                threshold: t,
                qualified: available.len(),
                graph: RejectionGraph {
                    unreachable: key
                        .partners
                        .iter()
                        .copied()
                        .filter(|id| !available.contains(id))
                        .collect(),
                    ..Default::default()
                },
            });
        }

        let scheme = if request.frost {
            Scheme::Frost
        } else {
            Scheme::Schnorr
        };
        let candidates = match scheme {
            Scheme::Schnorr => select_signers(
                self.self_id,
                &available,
                schnorr_subset_size(t, key.partners.len()),
            ),
            Scheme::Frost => select_signers(self.self_id, &available, available.len()),
        };
        let bound = match self.binder.bind_nonce(&req_id, scheme, &candidates, t).await {
            Ok(bound) => bound,
            Err(e) => {
                record.lock().await.fail(e.to_string());
                return Err(e);
            }
        };
        let signers = bound.signers().to_vec();

        let sign_request = SignRequest {
            req_id: req_id.clone(),
            app: request.app.clone(),
            params: request.params.clone(),
            result_hash: hash_hex.clone(),
            timestamp: chrono::Utc::now().timestamp(),
            public_key: key.public_key_hex(),
            nonce: bound.to_ref(),
        };
        record.lock().await.start_signing();
        tracing::info!(
            req_id = %req_id,
            scheme = ?scheme,
            signers = ?signers,
            t,
            "Requesting partial signatures"
        );

        let fan_out = self
            .collect(&key, &bound, &sign_request, &signers, &hash, &record)
            .await;

        let mut rec = record.lock().await;
        let timed_out = match fan_out {
            FanOut::Quorum => {
                match aggregate(&key, &bound, &hash, rec.signatures()) {
                    Ok(signature) => {
                        if rec.confirm(&signature) {
                            drop(rec);
                            self.announce(&key, &req_id, &hash_hex, &signature).await;
                            rec = record.lock().await;
                        }
                    }
                    Err(e) => {
                        rec.fail(e.to_string());
                    }
                }
                false
            }
            FanOut::Failed(reason) => {
                rec.fail(reason);
                false
            }
            FanOut::TimedOut => {
                for id in &signers {
                    if !rec.signatures().contains_key(id) && !rec.errors().contains_key(id) {
                        rec.add_error(*id, "no response before the deadline");
                    }
                }
                true
            }
        };

        let confirmed = rec.state() == RequestState::Confirmed;
        log_confirmation_event(
            &req_id,
            confirmed,
            serde_json::json!({
                "state": rec.state(),
                "signatures": rec.signatures().len(),
                "errors": rec.errors().len(),
                "timed_out": timed_out,
            }),
        );
        Ok(ConfirmationOutcome {
            req_id,
            result,
            result_hash: hash_hex,
            state: rec.state(),
            confirmed,
            signature: rec.signature().map(str::to_string),
            signers: rec.signatures().keys().copied().collect(),
            errors: rec.errors().clone(),
            timed_out,
        })
    }

    async fn collect(
        &self,
        key: &DistKey,
        bound: &BoundNonce,
        request: &SignRequest,
        signers: &[PartnerId],
        hash: &[u8; 32],
        record: &Mutex<RequestRecord>,
    ) -> FanOut {
        let mut pending: FuturesUnordered<_> = signers
            .iter()
            .map(|&id| {
                let signer = self.signer.clone();
                async move { (id, signer.request_signature(id, request).await) }
            })
            .collect();
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        let mut outstanding = signers.len();

        loop {
            let next = match tokio::time::timeout_at(deadline, pending.next()).await {
                Err(_) => return FanOut::TimedOut,
                Ok(None) => return FanOut::Failed("every signer answered without quorum".into()),
                Ok(Some(next)) => next,
            };
            outstanding -= 1;
            let (id, response) = next;
            let verified = response
                .and_then(|partial| verify_partial(key, bound, request, hash, id, &partial));

            let mut rec = record.lock().await;
            match verified {
                Ok(partial) => {
                    rec.add_signature(id, partial);
                }
                Err(e) => {
                    if matches!(e, NodeError::Verification(_)) {
                        log_security_event(
                            "partial_signature_rejected",
                            false,
                            serde_json::json!({ "signer": id, "error": e.to_string() }),
                            Some(&request.req_id),
                        );
                    }
                    rec.add_error(id, e.to_string());
                }
            }

            if rec.has_quorum() {
                return FanOut::Quorum;
            }
            if outstanding < rec.still_needed() {
                return FanOut::Failed(format!(
                    "{} signatures still needed, {} requests outstanding",
                    rec.still_needed(),
                    outstanding
                ));
            }
            if rec.errors().len() > self.settings.max_failures {
                return FanOut::Failed(format!("{} signers failed", rec.errors().len()));
            }
        }
    }

    async fn announce(&self, key: &DistKey, req_id: &str, hash_hex: &str, signature: &str) {
        let announcement = ConfirmedAnnouncement {
            req_id: req_id.to_string(),
            result_hash: hash_hex.to_string(),
            owner_pub_key: key.public_key_hex(),
            aggregated_signature: signature.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let partners: Vec<PartnerId> = key
            .partners
            .iter()
            .copied()
            .filter(|id| *id != self.self_id)
            .collect();
        if let Err(e) = self.announcer.announce(&partners, &announcement).await {
            tracing::warn!(req_id = %req_id, error = %e, "Failed to announce confirmation");
        }
    }
}

fn verify_partial(
    key: &DistKey,
    bound: &BoundNonce,
    request: &SignRequest,
    hash: &[u8; 32],
    id: PartnerId,
    partial: &PartialSignature,
) -> Result<Scalar> {
    if partial.signer_id != id || partial.req_id != request.req_id {
        return Err(NodeError::verification("partial signature for another request"));
    }
    if !partial.result_hash.eq_ignore_ascii_case(&request.result_hash) {
        return Err(NodeError::verification("partial signature over another result"));
    }
    let s = scalar_from_hex(&partial.partial_signature)?;
    let public_share = key.public_share(id)?;

    let valid = match bound {
        BoundNonce::Schnorr { nonce, .. } => schnorr::verify_partial(
            &public_share,
            &nonce.public_share(id)?,
            &nonce.public_key,
            hash,
            &s,
        ),
        BoundNonce::Frost {
            batch,
            index,
            signers,
        } => {
            let commitments = batch.signing_commitments(*index, signers)?;
            frost::verify_partial(id, &s, &public_share, &commitments, &key.public_key, hash)?
        }
    };
    if !valid {
        return Err(NodeError::verification(format!(
            "partial signature of {} does not verify",
            id
        )));
    }
    Ok(s)
}

/// Aggregate and check against the group key
fn aggregate(
    key: &DistKey,
    bound: &BoundNonce,
    hash: &[u8; 32],
    partials: &BTreeMap<PartnerId, Scalar>,
) -> Result<String> {
    match bound {
        BoundNonce::Schnorr { nonce, .. } => {
            let signature = schnorr::aggregate(&nonce.public_key, hash, partials)?;
            if !schnorr::verify(&key.public_key, hash, &signature) {
                return Err(NodeError::verification("aggregated signature does not verify"));
            }
            Ok(signature.to_wire())
        }
        BoundNonce::Frost {
            batch,
            index,
            signers,
        } => {
            let commitments = batch.signing_commitments(*index, signers)?;
            let signature = frost::aggregate(&commitments, hash, partials)?;
            if !frost::verify(&key.public_key, hash, &signature) {
                return Err(NodeError::verification("aggregated signature does not verify"));
            }
            Ok(signature.to_hex())
        }
    }
}
