//! FROST nonce batch generation
//!
//! round1 broadcasts `n` commitment pairs (D, E). round2 narrows the
//! qualified set to partners whose round1 data was valid and broadcasts a
//! hash of every commitment list this node accepted. Once the set is final,
//! a node whose hashes differ from any partner's aborts: a partner that
//! served different lists to different nodes would otherwise leave them
//! with batches that never aggregate.

use super::Activation;
use crate::crypto::curve::{
    point_from_hex, point_to_bytes, point_to_hex, random_scalar, scalar_from_hex, scalar_to_hex,
    ProjectivePoint, Scalar,
};
use crate::crypto::frost::NonceCommitment;
use crate::error::{NodeError, Result};
use crate::logging::log_security_event;
use crate::mpc::{
    MpcInstance, MpcProtocol, ProtocolEnv, ProtocolFactory, ProtocolOutcome, RoundContext,
    RoundOutput, RunHandle,
};
use crate::types::{MpcInit, NonceBatchJson, NonceCommitmentJson, NonceJson, PartnerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const NONCE_BATCH_KIND: &str = "nonce-batch";
pub const NONCE_ROUNDS: &[&str] = &["round1", "round2"];

/// Upper bound on `n` accepted from a partner's init payload
pub const MAX_BATCH_SIZE: usize = 1024;

/// One slot of a batch: own secret pair plus everyone's commitments
#[derive(Clone)]
pub struct BatchNonce {
    pub d: Scalar,
    pub e: Scalar,
    pub commitments: BTreeMap<PartnerId, NonceCommitment>,
}

/// Single-use FROST nonce pairs shared by a partner set
#[derive(Clone)]
pub struct NonceBatch {
    pub id: String,
    pub n: usize,
    pub partners: Vec<PartnerId>,
    pub nonces: Vec<BatchNonce>,
}

impl std::fmt::Debug for NonceBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NonceBatch")
            .field("id", &self.id)
            .field("n", &self.n)
            .field("partners", &self.partners)
            .finish_non_exhaustive()
    }
}

fn commitment_to_json(commitment: &NonceCommitment) -> NonceCommitmentJson {
    NonceCommitmentJson {
        d: point_to_hex(&commitment.hiding),
        e: point_to_hex(&commitment.binding),
    }
}

fn commitment_from_json(json: &NonceCommitmentJson) -> Result<NonceCommitment> {
    let hiding = point_from_hex(&json.d)?;
    let binding = point_from_hex(&json.e)?;
    if hiding == ProjectivePoint::IDENTITY || binding == ProjectivePoint::IDENTITY {
        return Err(NodeError::schema("nonce commitment is the identity"));
    }
    Ok(NonceCommitment { hiding, binding })
}

impl NonceBatch {
    pub fn to_json(&self) -> NonceBatchJson {
        NonceBatchJson {
            n: self.n,
            partners: self.partners.clone(),
            nonces: self
                .nonces
                .iter()
                .map(|nonce| NonceJson {
                    d: scalar_to_hex(&nonce.d),
                    e: scalar_to_hex(&nonce.e),
                    commitments: nonce
                        .commitments
                        .iter()
                        .map(|(id, c)| (*id, commitment_to_json(c)))
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn from_json(id: impl Into<String>, json: &NonceBatchJson) -> Result<Self> {
        if json.nonces.len() != json.n {
            return Err(NodeError::schema(format!(
                "batch declares {} nonces but holds {}",
                json.n,
                json.nonces.len()
            )));
        }
        let nonces = json
            .nonces
            .iter()
            .map(|nonce| {
                let commitments = nonce
                    .commitments
                    .iter()
                    .map(|(id, c)| Ok((*id, commitment_from_json(c)?)))
                    .collect::<Result<BTreeMap<_, _>>>()?;
                if !json.partners.iter().all(|p| commitments.contains_key(p)) {
                    return Err(NodeError::schema("nonce lacks a partner commitment"));
                }
                Ok(BatchNonce {
                    d: scalar_from_hex(&nonce.d)?,
                    e: scalar_from_hex(&nonce.e)?,
                    commitments,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id: id.into(),
            n: json.n,
            partners: json.partners.clone(),
            nonces,
        })
    }

    pub fn nonce(&self, index: usize) -> Result<&BatchNonce> {
        self.nonces.get(index).ok_or_else(|| {
            NodeError::invalid(format!("batch {} has no nonce {}", self.id, index))
        })
    }

    /// Commitment set of `signers` for slot `index`
    pub fn signing_commitments(
        &self,
        index: usize,
        signers: &[PartnerId],
    ) -> Result<BTreeMap<PartnerId, NonceCommitment>> {
        let nonce = self.nonce(index)?;
        signers
            .iter()
            .map(|id| {
                nonce
                    .commitments
                    .get(id)
                    .map(|c| (*id, *c))
                    .ok_or_else(|| {
                        NodeError::invalid(format!("signer {} is not in batch {}", id, self.id))
                    })
            })
            .collect()
    }
}

/// Hands out batch slots one at a time
#[derive(Debug)]
pub struct BatchCursor {
    batch: Arc<NonceBatch>,
    next: AtomicUsize,
}

impl BatchCursor {
    pub fn new(batch: Arc<NonceBatch>) -> Self {
        Self {
            batch,
            next: AtomicUsize::new(0),
        }
    }

    pub fn batch(&self) -> &Arc<NonceBatch> {
        &self.batch
    }

    /// Next never-handed-out index, `None` once the batch is exhausted
    pub fn allocate(&self) -> Option<usize> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next < self.batch.n).then_some(next + 1)
            })
            .ok()
    }

    pub fn remaining(&self) -> usize {
        self.batch
            .n
            .saturating_sub(self.next.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitBroadcast {
    nonces: Vec<NonceCommitmentJson>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenBroadcast {
    /// Accepted partner -> sha256 of its commitment list
    seen: BTreeMap<PartnerId, String>,
}

fn commitments_hash(list: &[NonceCommitment]) -> String {
    let mut hasher = Sha256::new();
    for commitment in list {
        hasher.update(point_to_bytes(&commitment.hiding));
        hasher.update(point_to_bytes(&commitment.binding));
    }
    hex::encode(hasher.finalize())
}

pub struct NonceGeneration {
    n: usize,
    secrets: Vec<(Scalar, Scalar)>,
    commitments: BTreeMap<PartnerId, Vec<NonceCommitment>>,
}

impl NonceGeneration {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            secrets: Vec::new(),
            commitments: BTreeMap::new(),
        }
    }

    fn seen(&self) -> BTreeMap<PartnerId, String> {
        self.commitments
            .iter()
            .map(|(id, list)| (*id, commitments_hash(list)))
            .collect()
    }

    /// Every final partner must have accepted the same lists as this node
    fn check_views(&self, ctx: &RoundContext<'_>) -> Result<()> {
        let own = self.seen();
        let mut conflicts = Vec::new();
        for &reporter in ctx.qualified.iter().filter(|id| **id != ctx.self_id) {
            let seen = match ctx.broadcast::<SeenBroadcast>(1, reporter) {
                Ok(data) => data.seen,
                Err(_) => BTreeMap::new(),
            };
            for &id in ctx.qualified {
                if seen.get(&id) != own.get(&id) {
                    conflicts.push((reporter, id));
                }
            }
        }
        if conflicts.is_empty() {
            return Ok(());
        }
        log_security_event(
            "nonce_commitments_diverged",
            false,
            serde_json::json!({ "node_id": ctx.self_id, "conflicts": conflicts }),
            Some(ctx.mpc_id),
        );
        Err(NodeError::verification(format!(
            "partners saw different nonce commitments: {:?}",
            conflicts
        )))
    }

    fn check_commit(&self, ctx: &RoundContext<'_>, id: PartnerId) -> Result<Vec<NonceCommitment>> {
        let data: CommitBroadcast = ctx.broadcast(0, id)?;
        if data.nonces.len() != self.n {
            return Err(NodeError::schema(format!(
                "expected {} nonce commitments, got {}",
                self.n,
                data.nonces.len()
            )));
        }
        data.nonces.iter().map(commitment_from_json).collect()
    }
}

impl MpcProtocol for NonceGeneration {
    type Output = NonceBatch;

    fn rounds(&self) -> &'static [&'static str] {
        NONCE_ROUNDS
    }

    fn process_round(&mut self, round: usize, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        match round {
            0 => {
                self.secrets = (0..self.n)
                    .map(|_| (random_scalar(), random_scalar()))
                    .collect();
                let nonces = self
                    .secrets
                    .iter()
                    .map(|(d, e)| NonceCommitmentJson {
                        d: point_to_hex(&(ProjectivePoint::GENERATOR * d)),
                        e: point_to_hex(&(ProjectivePoint::GENERATOR * e)),
                    })
                    .collect();
                Ok(RoundOutput::broadcast(serde_json::to_value(CommitBroadcast {
                    nonces,
                })?))
            }
            1 => {
                for &id in ctx.qualified {
                    match self.check_commit(ctx, id) {
                        Ok(commitments) => {
                            self.commitments.insert(id, commitments);
                        }
                        Err(e) => log_security_event(
                            "nonce_commitment_rejected",
                            false,
                            serde_json::json!({ "partner": id, "error": e.to_string() }),
                            Some(ctx.mpc_id),
                        ),
                    }
                }
                if !self.commitments.contains_key(&ctx.self_id) {
                    return Err(NodeError::verification("own nonce commitments failed validation"));
                }
                let seen = SeenBroadcast { seen: self.seen() };
                Ok(RoundOutput::broadcast(serde_json::to_value(seen)?)
                    .with_qualifieds(self.commitments.keys().copied().collect()))
            }
            _ => Err(NodeError::invalid(format!("nonce batch has no round {}", round))),
        }
    }

    fn on_complete(&mut self, ctx: &RoundContext<'_>) -> Result<NonceBatch> {
        self.check_views(ctx)?;
        let nonces = self
            .secrets
            .iter()
            .enumerate()
            .map(|(index, (d, e))| {
                let commitments = ctx
                    .qualified
                    .iter()
                    .map(|id| {
                        self.commitments
                            .get(id)
                            .and_then(|list| list.get(index))
                            .map(|c| (*id, *c))
                            .ok_or_else(|| {
                                NodeError::verification(format!("no commitments from {}", id))
                            })
                    })
                    .collect::<Result<BTreeMap<_, _>>>()?;
                Ok(BatchNonce {
                    d: *d,
                    e: *e,
                    commitments,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(NonceBatch {
            id: ctx.mpc_id.to_string(),
            n: self.n,
            partners: ctx.qualified.to_vec(),
            nonces,
        })
    }
}

/// `params` of a `nonce-batch` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceBatchParams {
    pub n: usize,
    #[serde(default)]
    pub activate: bool,
}

pub fn start_nonce_batch(env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle> {
    let params: NonceBatchParams = serde_json::from_value(init.params.clone())?;
    if params.n == 0 || params.n > MAX_BATCH_SIZE {
        return Err(NodeError::invalid(format!(
            "batch size must be within 1..={}",
            MAX_BATCH_SIZE
        )));
    }
    let activation = Activation::from_flag(params.activate);
    let instance = MpcInstance::new(init, env.self_id, NONCE_ROUNDS)?;
    let env = env.clone();
    Ok(tokio::spawn(async move {
        let batch = instance
            .run(NonceGeneration::new(params.n), env.network.clone(), &env.options)
            .await?;
        let batch = Arc::new(batch);
        env.store
            .save_batch(batch.clone(), activation.is_active())
            .await?;
        Ok(ProtocolOutcome::Batch(batch))
    }))
}

pub struct NonceBatchFactory;

#[async_trait]
impl ProtocolFactory for NonceBatchFactory {
    fn kind(&self) -> &'static str {
        NONCE_BATCH_KIND
    }

    async fn start(&self, env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle> {
        start_nonce_batch(env, init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(n: usize) -> NonceBatch {
        let partners = vec![1, 2];
        let nonces = (0..n)
            .map(|_| {
                let commitments = partners
                    .iter()
                    .map(|id| {
                        (
                            *id,
                            NonceCommitment {
                                hiding: ProjectivePoint::GENERATOR * random_scalar(),
                                binding: ProjectivePoint::GENERATOR * random_scalar(),
                            },
                        )
                    })
                    .collect();
                BatchNonce {
                    d: random_scalar(),
                    e: random_scalar(),
                    commitments,
                }
            })
            .collect();
        NonceBatch {
            id: "b".into(),
            n,
            partners,
            nonces,
        }
    }

    #[test]
    fn test_cursor_hands_out_each_index_once() {
        let cursor = BatchCursor::new(Arc::new(batch(2)));
        assert_eq!(cursor.remaining(), 2);
        assert_eq!(cursor.allocate(), Some(0));
        assert_eq!(cursor.allocate(), Some(1));
        assert_eq!(cursor.allocate(), None);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_json_round_trip_keeps_commitments() {
        let original = batch(3);
        let parsed = NonceBatch::from_json("b", &original.to_json()).unwrap();
        assert_eq!(parsed.n, 3);
        assert_eq!(parsed.nonces[2].d, original.nonces[2].d);
        assert_eq!(
            parsed.signing_commitments(1, &[1, 2]).unwrap(),
            original.signing_commitments(1, &[1, 2]).unwrap()
        );
    }

    #[test]
    fn test_signing_commitments_reject_outsiders() {
        let batch = batch(1);
        assert!(batch.signing_commitments(0, &[1, 3]).is_err());
        assert!(batch.signing_commitments(1, &[1]).is_err());
    }

    #[test]
    fn test_from_json_rejects_count_mismatch() {
        let mut json = batch(2).to_json();
        json.n = 3;
        assert!(NonceBatch::from_json("b", &json).is_err());
    }
}
