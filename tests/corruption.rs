//! Runs with partners that deal shares inconsistent with their commitments
//! or show different commitments to different partners

use async_trait::async_trait;
use futures_util::future::join_all;
use k256::ProjectivePoint;
use mpc_node::crypto::curve::{point_to_hex, random_scalar, scalar_to_hex};
use mpc_node::crypto::lagrange::interpolate_scalar;
use mpc_node::error::Result;
use mpc_node::mpc::{
    MemoryHub, MemoryNetwork, MpcInstance, MpcNetwork, MpcOptions, MpcProtocol, RoundContext,
    RoundOutput,
};
use mpc_node::protocols::dkg::{Contribution, FreshKey, DKG_ROUNDS};
use mpc_node::protocols::nonce::{NonceGeneration, NONCE_ROUNDS};
use mpc_node::protocols::{DistKey, DkgProtocol, NonceBatch};
use mpc_node::{
    MpcInit, NodeError, NonceCommitmentJson, PartnerId, RoundRequest, RoundResponse,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Honest DKG, except that the dealt shares to `victims` are replaced
struct Corrupting {
    inner: DkgProtocol<FreshKey>,
    victims: Vec<PartnerId>,
}

impl MpcProtocol for Corrupting {
    type Output = DistKey;

    fn rounds(&self) -> &'static [&'static str] {
        self.inner.rounds()
    }

    fn process_round(&mut self, round: usize, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
        let mut output = self.inner.process_round(round, ctx)?;
        if round == 1 {
            for (id, share) in output.send.iter_mut() {
                if self.victims.contains(id) {
                    *share = serde_json::json!(scalar_to_hex(&random_scalar()));
                }
            }
        }
        Ok(output)
    }

    fn on_complete(&mut self, ctx: &RoundContext<'_>) -> Result<DistKey> {
        self.inner.on_complete(ctx)
    }
}

fn options() -> MpcOptions {
    MpcOptions {
        run_timeout: Duration::from_secs(10),
        round_timeout: Duration::from_secs(1),
        retry_backoff: Duration::from_millis(20),
    }
}

fn init(kind: &str, t: usize, ids: &[PartnerId]) -> MpcInit {
    MpcInit {
        kind: kind.into(),
        id: format!("corrupt-{}", kind),
        starter: ids[0],
        partners: ids.to_vec(),
        t,
        params: serde_json::json!({}),
    }
}

/// `corrupt` maps a dealer to the partners it sends bad shares to
async fn run(
    t: usize,
    ids: &[PartnerId],
    corrupt: &BTreeMap<PartnerId, Vec<PartnerId>>,
) -> Vec<(PartnerId, Result<DistKey>)> {
    let hub = MemoryHub::new();
    let init = init("dkg", t, ids);
    let runs = ids.iter().map(|&id| {
        let network = hub.add_node(id);
        let instance = MpcInstance::new(init.clone(), id, DKG_ROUNDS).unwrap();
        let protocol = Corrupting {
            inner: DkgProtocol::new(t, Contribution::Random, FreshKey { seeded_by: None }),
            victims: corrupt.get(&id).cloned().unwrap_or_default(),
        };
        async move { (id, instance.run(protocol, network, &options()).await) }
    });
    join_all(runs).await
}

/// Every dealer in `dealers` corrupts the shares of everyone else
fn against_all(ids: &[PartnerId], dealers: &[PartnerId]) -> BTreeMap<PartnerId, Vec<PartnerId>> {
    dealers
        .iter()
        .map(|dealer| {
            let victims = ids.iter().copied().filter(|id| id != dealer).collect();
            (*dealer, victims)
        })
        .collect()
}

fn assert_consistent_keys(results: Vec<(PartnerId, Result<DistKey>)>, honest: &[PartnerId]) {
    let keys: Vec<(PartnerId, DistKey)> = results
        .into_iter()
        .filter(|(id, _)| honest.contains(id))
        .map(|(id, result)| (id, result.unwrap()))
        .collect();
    assert_eq!(keys.len(), honest.len());

    let public_key = keys[0].1.public_key;
    for (_, key) in &keys {
        assert_eq!(key.public_key, public_key);
        assert_eq!(key.partners, honest);
    }
    let secret = interpolate_scalar(&[(keys[0].0, keys[0].1.share), (keys[2].0, keys[2].1.share)])
        .unwrap();
    assert_eq!(ProjectivePoint::GENERATOR * secret, public_key);
}

#[tokio::test]
async fn test_corrupted_dealer_is_excluded() {
    let ids = [1, 2, 3, 4];
    let results = run(2, &ids, &against_all(&ids, &[4])).await;
    assert_consistent_keys(results, &[1, 2, 3]);
}

#[tokio::test]
async fn test_low_id_dealer_cheating_one_partner_is_excluded() {
    let corrupt = BTreeMap::from([(1, vec![4])]);
    let results = run(2, &[1, 2, 3, 4], &corrupt).await;

    for (id, result) in &results {
        if *id == 1 {
            assert!(
                matches!(result, Err(NodeError::NotQualified(_))),
                "cheating dealer finished with {:?}",
                result.as_ref().map(|key| &key.partners)
            );
        }
    }
    assert_consistent_keys(results, &[2, 3, 4]);
}

#[tokio::test]
async fn test_too_many_corrupted_dealers() {
    let ids = [1, 2, 3, 4];
    let results = run(3, &ids, &against_all(&ids, &[3, 4])).await;

    for (id, result) in results.into_iter().filter(|(id, _)| *id <= 2) {
        match result {
            Err(NodeError::InsufficientPartners { threshold, qualified, graph }) => {
                assert_eq!(threshold, 3);
                assert_eq!(qualified, 2);
                assert_eq!(graph.removed.len(), 2, "node {}", id);
            }
            other => panic!("node {} finished with {:?}", id, other.map(|k| k.address)),
        }
    }
}

/// Replaces the round1 commitments `source` serves to this node
struct Tampering {
    inner: Arc<MemoryNetwork>,
    source: PartnerId,
    n: usize,
}

#[async_trait]
impl MpcNetwork for Tampering {
    async fn register_mpc(&self, mpc: Arc<MpcInstance>) -> Result<()> {
        self.inner.register_mpc(mpc).await
    }

    async fn ask_round_data(
        &self,
        partner: PartnerId,
        request: RoundRequest,
    ) -> Result<RoundResponse> {
        let round = request.round;
        let mut response = self.inner.ask_round_data(partner, request).await?;
        if partner == self.source && round == 0 {
            let nonces: Vec<NonceCommitmentJson> = (0..self.n)
                .map(|_| NonceCommitmentJson {
                    d: point_to_hex(&(ProjectivePoint::GENERATOR * random_scalar())),
                    e: point_to_hex(&(ProjectivePoint::GENERATOR * random_scalar())),
                })
                .collect();
            response.broadcast = serde_json::json!({ "nonces": nonces });
        }
        Ok(response)
    }
}

#[tokio::test]
async fn test_equivocated_nonce_commitments_abort_the_batch() {
    let ids = [1, 2, 3];
    let n = 3;
    let hub = MemoryHub::new();
    let init = init("nonce-batch", 2, &ids);

    // node 3 sees a different commitment list from node 2 than node 1 does
    let runs = ids.iter().map(|&id| {
        let inner = hub.add_node(id);
        let network: Arc<dyn MpcNetwork> = if id == 3 {
            Arc::new(Tampering {
                inner,
                source: 2,
                n,
            })
        } else {
            inner
        };
        let instance = MpcInstance::new(init.clone(), id, NONCE_ROUNDS).unwrap();
        async move {
            let result: Result<NonceBatch> = instance
                .run(NonceGeneration::new(n), network, &options())
                .await;
            (id, result)
        }
    });

    for (id, result) in join_all(runs).await {
        assert!(
            matches!(result, Err(NodeError::Verification(_))),
            "node {} kept a batch: {:?}",
            id,
            result.map(|batch| batch.partners)
        );
    }
}

#[tokio::test]
async fn test_consistent_nonce_commitments_agree() {
    let ids = [1, 2, 3];
    let hub = MemoryHub::new();
    let init = init("nonce-batch", 2, &ids);
    let runs = ids.iter().map(|&id| {
        let network = hub.add_node(id);
        let instance = MpcInstance::new(init.clone(), id, NONCE_ROUNDS).unwrap();
        async move { instance.run(NonceGeneration::new(2), network, &options()).await }
    });

    let batches: Vec<NonceBatch> = join_all(runs)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();
    for batch in &batches {
        assert_eq!(batch.partners, vec![1, 2, 3]);
        assert_eq!(
            batch.signing_commitments(1, &ids).unwrap(),
            batches[0].signing_commitments(1, &ids).unwrap()
        );
    }
}
