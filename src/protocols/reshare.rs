//! Key redistribution
//!
//! Moves an existing secret to a new partner set and threshold without
//! changing the group public key. Dealers (holders of the previous key)
//! deal their old share as the constant term of a fresh polynomial; the
//! new shares are the Lagrange combination over `prev_t` dealers.

use super::dkg::{assemble_key, Contribution, DealtShares, DistKey, DkgProtocol, DkgVariant};
use super::{spawn_key_run, Activation};
use crate::crypto::curve::public_key_from_hex;
use crate::crypto::polynomial::{Commitment, CommitmentJson};
use crate::error::{NodeError, RejectionGraph, Result};
use crate::mpc::{ProtocolEnv, ProtocolFactory, RoundContext, RunHandle};
use crate::types::{MpcInit, PartnerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const RESHARE_KIND: &str = "reshare";

/// `params` of a `reshare` run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareParams {
    /// Id the previous key is stored under on dealers
    pub key_id: String,
    /// Partners that hold a share of the previous key
    pub dealers: Vec<PartnerId>,
    /// Public polynomial of the previous key
    pub previous: CommitmentJson,
    /// Compressed previous group public key (hex)
    pub public_key: String,
    #[serde(default)]
    pub activate: bool,
}

/// Resharing hooks for the DKG rounds
pub struct Redistribution {
    dealers: Vec<PartnerId>,
    previous: Commitment,
}

impl Redistribution {
    pub fn new(mut dealers: Vec<PartnerId>, previous: Commitment) -> Result<Self> {
        dealers.sort_unstable();
        dealers.dedup();
        if dealers.len() < previous.threshold() {
            return Err(NodeError::invalid(format!(
                "{} dealers cannot reshare a {}-of-n key",
                dealers.len(),
                previous.threshold()
            )));
        }
        Ok(Self { dealers, previous })
    }

    fn prev_t(&self) -> usize {
        self.previous.threshold()
    }
}

impl DkgVariant for Redistribution {
    fn is_dealer(&self, id: PartnerId) -> bool {
        self.dealers.binary_search(&id).is_ok()
    }

    /// The dealt constant term must be the dealer's old public share
    fn check_dealer(&self, id: PartnerId, commitment: &Commitment) -> Result<()> {
        if commitment.constant() != self.previous.public_share(id) {
            return Err(NodeError::verification(format!(
                "dealer {} did not deal its previous share",
                id
            )));
        }
        Ok(())
    }

    fn finish(&self, ctx: &RoundContext<'_>, dealt: &DealtShares) -> Result<DistKey> {
        let qualified_dealers = dealt.dealers_in(ctx.qualified);
        if qualified_dealers.len() < self.prev_t() {
            let removed = self
                .dealers
                .iter()
                .copied()
                .filter(|id| !qualified_dealers.contains(id))
                .collect();
            return Err(NodeError::InsufficientPartners {
                threshold: self.prev_t(),
                qualified: qualified_dealers.len(),
                graph: RejectionGraph {
                    removed,
                    ..Default::default()
                },
            });
        }

        let chosen = &qualified_dealers[..self.prev_t()];
        let (share, polynomial) = dealt.interpolate(chosen)?;
        if polynomial.constant() != self.previous.constant() {
            return Err(NodeError::verification(
                "reshared polynomial does not preserve the public key",
            ));
        }
        assemble_key(ctx, share, polynomial)
    }
}

/// Start a reshare run; dealers look up their previous share in the store
pub async fn start_reshare(env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle> {
    let params: ReshareParams = serde_json::from_value(init.params.clone())?;
    let previous = Commitment::try_from(&params.previous)?;
    let public_key = public_key_from_hex(&params.public_key)?;
    if previous.constant() != public_key {
        return Err(NodeError::verification(
            "previous polynomial does not match the public key",
        ));
    }

    if let Some(outsider) = params
        .dealers
        .iter()
        .find(|dealer| !init.partners.contains(dealer))
    {
        return Err(NodeError::invalid(format!(
            "dealer {} is not a partner of the reshare",
            outsider
        )));
    }

    let variant = Redistribution::new(params.dealers, previous)?;
    let contribution = if variant.is_dealer(env.self_id) {
        let key = env.store.key(&params.key_id).await.ok_or_else(|| {
            NodeError::SessionNotFound(format!("key {} to reshare", params.key_id))
        })?;
        if key.public_key != public_key {
            return Err(NodeError::verification(format!(
                "local key {} has a different public key",
                params.key_id
            )));
        }
        Contribution::Secret(key.share)
    } else {
        Contribution::Nothing
    };

    let protocol = DkgProtocol::new(init.t, contribution, variant);
    spawn_key_run(env, init, protocol, Activation::from_flag(params.activate))
}

pub struct ReshareFactory;

#[async_trait]
impl ProtocolFactory for ReshareFactory {
    fn kind(&self) -> &'static str {
        RESHARE_KIND
    }

    async fn start(&self, env: &ProtocolEnv, init: MpcInit) -> Result<RunHandle> {
        start_reshare(env, init).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::polynomial::Polynomial;

    #[test]
    fn test_dealers_must_cover_previous_threshold() {
        let previous = Polynomial::random(3).commitment();
        assert!(Redistribution::new(vec![1, 2], previous.clone()).is_err());
        let variant = Redistribution::new(vec![3, 1, 2, 2], previous).unwrap();
        assert_eq!(variant.dealers, vec![1, 2, 3]);
        assert!(variant.is_dealer(2));
        assert!(!variant.is_dealer(4));
    }

    #[test]
    fn test_check_dealer_requires_previous_share() {
        let old = Polynomial::random(2);
        let variant = Redistribution::new(vec![1, 2], old.commitment()).unwrap();

        let honest = Polynomial::with_secret(2, old.evaluate_at(1)).commitment();
        assert!(variant.check_dealer(1, &honest).is_ok());
        assert!(variant.check_dealer(2, &honest).is_err());
    }
}
