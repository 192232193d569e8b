//! Distributed key generation
//!
//! Three rounds over the MPC engine:
//!
//! 1. `round1`: every dealer draws a polynomial of degree t-1 and
//!    broadcasts its Feldman commitment with a proof of possession of the
//!    constant term.
//! 2. `round2`: dealers send `f(j)` to every qualified partner and everyone
//!    broadcasts a hash of each commitment it accepted.
//! 3. `round3`: inbound shares are checked against the sender's
//!    commitment; bad senders are listed as malicious and left out of this
//!    node's qualified list. The engine's pruning then drops the partner
//!    named by the most surviving partners, so the dealer is excluded and
//!    the node it cheated stays in.
//!
//! Resharing reuses the same rounds through `DkgVariant`.

use super::{spawn_key_run, Activation};
use crate::crypto::curve::{
    address, point_to_hex, public_key_from_hex, random_scalar, scalar_from_hex, scalar_to_hex,
    ProjectivePoint, Scalar,
};
use crate::crypto::polynomial::{Commitment, CommitmentJson, Polynomial};
use crate::crypto::schnorr::{self, SchnorrSignature};
use crate::error::{NodeError, Result};
use crate::logging::log_security_event;
use crate::mpc::{
    MpcProtocol, ProtocolEnv, ProtocolFactory, RoundContext, RoundOutput, RunHandle,
};
use crate::types::{DistKeyJson, MpcInit, PartnerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

pub const DKG_KIND: &str = "dkg";
pub const DKG_ROUNDS: &[&str] = &["round1", "round2", "round3"];

/// A share of a distributed secret
#[derive(Clone)]
pub struct DistKey {
    /// Partner id this share belongs to
    pub index: PartnerId,
    pub share: Scalar,
    pub public_key: ProjectivePoint,
    pub address: String,
    /// Partners holding shares, sorted
    pub partners: Vec<PartnerId>,
    /// Public polynomial; lets any holder recompute any partner's public share
    pub polynomial: Option<Commitment>,
}

impl std::fmt::Debug for DistKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistKey")
            .field("index", &self.index)
            .field("address", &self.address)
            .field("partners", &self.partners)
            .finish_non_exhaustive()
    }
}

impl DistKey {
    /// Threshold of the underlying polynomial
    pub fn threshold(&self) -> Option<usize> {
        self.polynomial.as_ref().map(Commitment::threshold)
    }

    pub fn public_key_hex(&self) -> String {
        point_to_hex(&self.public_key)
    }

    /// g^{x_id} for any partner
    pub fn public_share(&self, id: PartnerId) -> Result<ProjectivePoint> {
        self.polynomial
            .as_ref()
            .map(|poly| poly.public_share(id))
            .ok_or_else(|| NodeError::crypto("key has no public polynomial"))
    }

    pub fn to_json(&self) -> DistKeyJson {
        DistKeyJson {
            index: self.index,
            share: scalar_to_hex(&self.share),
            address: self.address.clone(),
            public_key: self.public_key_hex(),
            partners: self.partners.clone(),
            polynomial: self.polynomial.as_ref().map(CommitmentJson::from),
        }
    }

    /// Parse and check internal consistency
    pub fn from_json(json: &DistKeyJson) -> Result<Self> {
        let share = scalar_from_hex(&json.share)?;
        let public_key = public_key_from_hex(&json.public_key)?;
        let polynomial = json
            .polynomial
            .as_ref()
            .map(Commitment::try_from)
            .transpose()?;

        if let Some(poly) = &polynomial {
            if poly.constant() != public_key {
                return Err(NodeError::verification(
                    "polynomial constant does not match the public key",
                ));
            }
            if !poly.verify_share(json.index, &share) {
                return Err(NodeError::verification(
                    "share does not lie on the public polynomial",
                ));
            }
        }
        let derived = address(&public_key);
        if !json.address.eq_ignore_ascii_case(&derived) {
            return Err(NodeError::verification(format!(
                "address {} does not match public key ({})",
                json.address, derived
            )));
        }

        Ok(Self {
            index: json.index,
            share,
            public_key,
            address: derived,
            partners: json.partners.clone(),
            polynomial,
        })
    }
}

/// What this node puts into a key generation
#[derive(Clone)]
pub enum Contribution {
    /// Fresh random constant term
    Random,
    /// Known constant term (seed or an existing share)
    Secret(Scalar),
    /// Polynomial with a zero constant term; randomizes shares only
    ZeroConstant,
    /// No polynomial at all
    Nothing,
}

/// Hooks that distinguish plain DKG from resharing
pub trait DkgVariant: Send + 'static {
    /// Whether `id` must deal a polynomial
    fn is_dealer(&self, id: PartnerId) -> bool;

    /// Whether `id`'s commitment must have the identity as constant term
    fn zero_constant(&self, _id: PartnerId) -> bool {
        false
    }

    /// Extra check of a dealer's commitment during round3
    fn check_dealer(&self, _id: PartnerId, _commitment: &Commitment) -> Result<()> {
        Ok(())
    }

    /// Combine the verified shares of the final qualified set
    fn finish(&self, ctx: &RoundContext<'_>, dealt: &DealtShares) -> Result<DistKey>;
}

/// Verified inputs handed to `DkgVariant::finish`
pub struct DealtShares {
    pub commitments: BTreeMap<PartnerId, Commitment>,
    pub shares: BTreeMap<PartnerId, Scalar>,
}

impl DealtShares {
    /// Dealers of the final qualified set, sorted
    pub fn dealers_in(&self, qualified: &[PartnerId]) -> Vec<PartnerId> {
        qualified
            .iter()
            .copied()
            .filter(|id| self.commitments.contains_key(id))
            .collect()
    }

    fn dealt(&self, id: PartnerId) -> Result<(&Commitment, &Scalar)> {
        match (self.commitments.get(&id), self.shares.get(&id)) {
            (Some(c), Some(s)) => Ok((c, s)),
            _ => Err(NodeError::verification(format!(
                "no verified share from dealer {}",
                id
            ))),
        }
    }

    /// Σ f_j(self) and Σ Fx_j over `dealers`
    pub fn sum(&self, dealers: &[PartnerId]) -> Result<(Scalar, Commitment)> {
        let mut share = Scalar::ZERO;
        let mut combined: Option<Commitment> = None;
        for &id in dealers {
            let (commitment, s) = self.dealt(id)?;
            share += s;
            combined = Some(match combined {
                Some(acc) => acc.add(commitment)?,
                None => commitment.clone(),
            });
        }
        let combined = combined.ok_or_else(|| NodeError::verification("no dealer qualified"))?;
        Ok((share, combined))
    }

    /// Σ λ_j f_j(self) and Σ λ_j Fx_j over `dealers`
    pub fn interpolate(&self, dealers: &[PartnerId]) -> Result<(Scalar, Commitment)> {
        let mut share = Scalar::ZERO;
        let mut combined: Option<Commitment> = None;
        for &id in dealers {
            let (commitment, s) = self.dealt(id)?;
            let lambda = crate::crypto::lagrange::lagrange_coefficient(id, dealers)?;
            share += lambda * s;
            let scaled = commitment.scale(&lambda);
            combined = Some(match combined {
                Some(acc) => acc.add(&scaled)?,
                None => scaled,
            });
        }
        let combined = combined.ok_or_else(|| NodeError::verification("no dealer qualified"))?;
        Ok((share, combined))
    }
}

/// Build the output key and run the checks every variant shares
pub fn assemble_key(
    ctx: &RoundContext<'_>,
    share: Scalar,
    polynomial: Commitment,
) -> Result<DistKey> {
    let public_key = polynomial.constant();
    if public_key == ProjectivePoint::IDENTITY {
        return Err(NodeError::verification("generated public key is the identity"));
    }
    if !polynomial.verify_share(ctx.self_id, &share) {
        return Err(NodeError::verification(
            "combined share does not match the combined polynomial",
        ));
    }
    Ok(DistKey {
        index: ctx.self_id,
        share,
        public_key,
        address: address(&public_key),
        partners: ctx.qualified.to_vec(),
        polynomial: Some(polynomial),
    })
}

/// Plain key generation; optionally seeded by the starter
pub struct FreshKey {
    /// Only this partner contributes a constant term
    pub seeded_by: Option<PartnerId>,
}

impl DkgVariant for FreshKey {
    fn is_dealer(&self, _id: PartnerId) -> bool {
        true
    }

    fn zero_constant(&self, id: PartnerId) -> bool {
        matches!(self.seeded_by, Some(starter) if starter != id)
    }

    fn finish(&self, ctx: &RoundContext<'_>, dealt: &DealtShares) -> Result<DistKey> {
        if let Some(starter) = self.seeded_by {
            if !ctx.is_qualified(starter) {
                return Err(NodeError::NotQualified(format!(
                    "seeding partner {} was dropped",
                    starter
                )));
            }
        }
        let dealers = dealt.dealers_in(ctx.qualified);
        let (share, polynomial) = dealt.sum(&dealers)?;
        assemble_key(ctx, share, polynomial)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CommitBroadcast {
    #[serde(rename = "Fx", default)]
    fx: Option<Vec<String>>,
    /// Proof of possession of the constant term, Schnorr wire form
    #[serde(default)]
    pop: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ShareBroadcast {
    /// Accepted partner -> sha256 of its commitment ("" for non-dealers)
    seen: BTreeMap<PartnerId, String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct VerifyBroadcast {
    malicious: Vec<PartnerId>,
}

fn pop_message(mpc_id: &str, id: PartnerId) -> Vec<u8> {
    format!("mpc-node/pop/{}/{}", mpc_id, id).into_bytes()
}

fn commitment_hash(commitment: Option<&Commitment>) -> String {
    match commitment {
        Some(c) => {
            let mut hasher = Sha256::new();
            c.digest_into(&mut hasher);
            hex::encode(hasher.finalize())
        }
        None => String::new(),
    }
}

/// DKG state machine, generic over the variant
pub struct DkgProtocol<V> {
    t: usize,
    contribution: Contribution,
    variant: V,
    polynomial: Option<Polynomial>,
    /// Partners whose round1 data was valid
    accepted: BTreeSet<PartnerId>,
    commitments: BTreeMap<PartnerId, Commitment>,
    shares: BTreeMap<PartnerId, Scalar>,
}

impl<V: DkgVariant> DkgProtocol<V> {
    pub fn new(t: usize, contribution: Contribution, variant: V) -> Self {
        Self {
            t,
            contribution,
            variant,
            polynomial: None,
            accepted: BTreeSet::new(),
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
        }
    }

    fn commit(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        self.polynomial = match &self.contribution {
            Contribution::Random => Some(Polynomial::random(self.t)),
            Contribution::Secret(secret) => Some(Polynomial::with_secret(self.t, *secret)),
            Contribution::ZeroConstant => Some(Polynomial::with_secret(self.t, Scalar::ZERO)),
            Contribution::Nothing => None,
        };

        let broadcast = match &self.polynomial {
            Some(poly) => {
                let secret = poly.secret();
                let pop = (secret != Scalar::ZERO).then(|| {
                    schnorr::sign(&secret, &random_scalar(), &pop_message(ctx.mpc_id, ctx.self_id))
                        .to_wire()
                });
                CommitBroadcast {
                    fx: Some(poly.commitment().to_hex()),
                    pop,
                }
            }
            None => CommitBroadcast { fx: None, pop: None },
        };
        Ok(RoundOutput::broadcast(serde_json::to_value(broadcast)?))
    }

    fn check_commit(&self, ctx: &RoundContext<'_>, id: PartnerId) -> Result<Option<Commitment>> {
        let data: CommitBroadcast = ctx.broadcast(0, id)?;
        if !self.variant.is_dealer(id) {
            return match data.fx {
                None => Ok(None),
                Some(_) => Err(NodeError::verification("non-dealer sent a polynomial")),
            };
        }

        let fx = data
            .fx
            .ok_or_else(|| NodeError::verification("dealer sent no polynomial"))?;
        let commitment = Commitment::from_hex(&fx)?;
        if commitment.threshold() != self.t {
            return Err(NodeError::verification(format!(
                "polynomial has {} coefficients, expected {}",
                commitment.threshold(),
                self.t
            )));
        }

        let constant = commitment.constant();
        if self.variant.zero_constant(id) {
            if constant != ProjectivePoint::IDENTITY {
                return Err(NodeError::verification("constant term must be zero"));
            }
        } else {
            if constant == ProjectivePoint::IDENTITY {
                return Err(NodeError::verification("constant term is zero"));
            }
            let pop = data
                .pop
                .ok_or_else(|| NodeError::verification("missing proof of possession"))?;
            let sig = SchnorrSignature::from_wire(&pop)?;
            if !schnorr::verify(&constant, &pop_message(ctx.mpc_id, id), &sig) {
                return Err(NodeError::verification("invalid proof of possession"));
            }
        }
        Ok(Some(commitment))
    }

    fn share(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        for &id in ctx.qualified {
            match self.check_commit(ctx, id) {
                Ok(commitment) => {
                    self.accepted.insert(id);
                    if let Some(c) = commitment {
                        self.commitments.insert(id, c);
                    }
                }
                Err(e) => {
                    log_security_event(
                        "dkg_commitment_rejected",
                        false,
                        serde_json::json!({ "partner": id, "error": e.to_string() }),
                        Some(ctx.mpc_id),
                    );
                }
            }
        }
        if !self.accepted.contains(&ctx.self_id) {
            return Err(NodeError::verification("own commitment failed validation"));
        }

        let mut send = BTreeMap::new();
        if let Some(poly) = &self.polynomial {
            for &id in &self.accepted {
                send.insert(id, serde_json::json!(scalar_to_hex(&poly.evaluate_at(id))));
            }
        }
        let seen = self
            .accepted
            .iter()
            .map(|id| (*id, commitment_hash(self.commitments.get(id))))
            .collect();

        Ok(RoundOutput::broadcast(serde_json::to_value(ShareBroadcast { seen })?)
            .with_send(send)
            .with_qualifieds(self.accepted.iter().copied().collect()))
    }

    fn verify(&mut self, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        let mut malicious = Vec::new();
        let mut inconsistent = Vec::new();

        for &id in ctx.qualified {
            // equivocation: the partner accepted a different commitment than we did
            let consistent = ctx
                .broadcast::<ShareBroadcast>(1, id)
                .map(|data| {
                    ctx.qualified.iter().all(|q| {
                        data.seen.get(q).map(String::as_str)
                            == Some(commitment_hash(self.commitments.get(q)).as_str())
                    })
                })
                .unwrap_or(false);
            if !consistent {
                inconsistent.push(id);
                continue;
            }

            let Some(commitment) = self.commitments.get(&id) else {
                continue;
            };
            let share = ctx
                .send::<String>(1, id)
                .and_then(|hex| scalar_from_hex(&hex))
                .and_then(|share| {
                    if commitment.verify_share(ctx.self_id, &share) {
                        Ok(share)
                    } else {
                        Err(NodeError::verification("share does not match commitment"))
                    }
                })
                .and_then(|share| {
                    self.variant.check_dealer(id, commitment)?;
                    Ok(share)
                });
            match share {
                Ok(share) => {
                    self.shares.insert(id, share);
                }
                Err(e) => {
                    log_security_event(
                        "dkg_share_rejected",
                        false,
                        serde_json::json!({ "dealer": id, "error": e.to_string() }),
                        Some(ctx.mpc_id),
                    );
                    malicious.push(id);
                }
            }
        }

        let qualifieds = ctx
            .qualified
            .iter()
            .copied()
            .filter(|id| !malicious.contains(id) && !inconsistent.contains(id))
            .collect();
        Ok(
            RoundOutput::broadcast(serde_json::to_value(VerifyBroadcast { malicious })?)
                .with_qualifieds(qualifieds),
        )
    }
}

impl<V: DkgVariant> MpcProtocol for DkgProtocol<V> {
    type Output = DistKey;

    fn rounds(&self) -> &'static [&'static str] {
        DKG_ROUNDS
    }

    fn process_round(&mut self, round: usize, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        match round {
            0 => self.commit(ctx),
            1 => self.share(ctx),
            2 => self.verify(ctx),
            _ => Err(NodeError::invalid(format!("dkg has no round {}", round))),
        }
    }

    fn on_complete(&mut self, ctx: &RoundContext<'_>) -> Result<DistKey> {
        let dealt = DealtShares {
            commitments: std::mem::take(&mut self.commitments),
            shares: std::mem::take(&mut self.shares),
        };
        self.variant.finish(ctx, &dealt)
    }
}

/// `params` of a `dkg` run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkgParams {
    /// The starter seeds the key; everyone else deals a zero constant
    #[serde(default)]
    pub seeded: bool,
    #[serde(default)]
    pub activate: bool,
    /// The output signs one request as a Schnorr nonce
    #[serde(default)]
    pub nonce: bool,
}

impl DkgParams {
    fn activation(&self) -> Result<Activation> {
        if !self.nonce {
            return Ok(Activation::from_flag(self.activate));
        }
        // a seeded nonce is known to the starter, and zero-constant shares
        // of degree 0 would expose the signers' key shares
        if self.seeded || self.activate {
            return Err(NodeError::invalid(
                "a signing nonce can be neither seeded nor activated",
            ));
        }
        Ok(Activation::Nonce)
    }
}

/// Start a DKG run. `seed` is only known to the starter and never leaves it.
pub fn start_dkg(env: &ProtocolEnv, init: MpcInit, seed: Option<Scalar>) -> Result<RunHandle> {
    let params: DkgParams = serde_json::from_value(init.params.clone())?;
    let activation = params.activation()?;
    let (contribution, seeded_by) = if params.seeded {
        if env.self_id == init.starter {
            let seed = seed.ok_or_else(|| NodeError::invalid("seeded dkg without a seed"))?;
            (Contribution::Secret(seed), Some(init.starter))
        } else {
            (Contribution::ZeroConstant, Some(init.starter))
        }
    } else {
        (Contribution::Random, None)
    };

    let protocol = DkgProtocol::new(init.t, contribution, FreshKey { seeded_by });
    spawn_key_run(env, init, protocol, activation)
}

pub struct DkgFactory;

#[async_trait]
impl ProtocolFactory for DkgFactory {
    fn kind(&self) -> &'static str {
        DKG_KIND
    }

    async fn start(&self, env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle> {
        start_dkg(env, init, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::polynomial::Polynomial;

    fn sample_key() -> DistKey {
        let poly = Polynomial::random(2);
        let commitment = poly.commitment();
        let public_key = commitment.constant();
        DistKey {
            index: 3,
            share: poly.evaluate_at(3),
            public_key,
            address: address(&public_key),
            partners: vec![1, 2, 3],
            polynomial: Some(commitment),
        }
    }

    #[test]
    fn test_dist_key_json_round_trip() {
        let key = sample_key();
        let json = key.to_json();
        let parsed = DistKey::from_json(&json).unwrap();
        assert_eq!(parsed.share, key.share);
        assert_eq!(parsed.public_key, key.public_key);
        assert_eq!(parsed.threshold(), Some(2));
        assert_eq!(parsed.public_share(3).unwrap(), ProjectivePoint::GENERATOR * key.share);
    }

    #[test]
    fn test_dist_key_rejects_inconsistent_json() {
        let key = sample_key();

        let mut wrong_share = key.to_json();
        wrong_share.share = scalar_to_hex(&(key.share + Scalar::ONE));
        assert!(DistKey::from_json(&wrong_share).is_err());

        let mut wrong_address = key.to_json();
        wrong_address.address = "0x0000000000000000000000000000000000000000".into();
        assert!(DistKey::from_json(&wrong_address).is_err());
    }

    #[test]
    fn test_debug_hides_share() {
        let key = sample_key();
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(&scalar_to_hex(&key.share)));
    }
}
