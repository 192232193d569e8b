//! Round engine
//!
//! An `MpcInstance` runs an ordered list of named rounds across a partner
//! set. Each round the local handler produces point-to-point `send`
//! payloads and one `broadcast`, the engine publishes them, fetches every
//! other qualified partner's output for the same round and recomputes the
//! qualified set from what every responder reports.

use super::phaser::Phaser;
use super::qualify::qualified_partners;
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::logging::{log_mpc_event, log_security_event};
use crate::types::{MpcInit, PartnerId, RoundRequest, RoundResponse};
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::Instrument;

/// Transport used by a run to reach its partners
#[async_trait]
pub trait MpcNetwork: Send + Sync {
    /// Make a local run reachable for partners' round data requests
    async fn register_mpc(&self, mpc: Arc<MpcInstance>) -> Result<()>;

    /// Fetch `partner`'s published output of `request.round`
    async fn ask_round_data(&self, partner: PartnerId, request: RoundRequest)
        -> Result<RoundResponse>;
}

/// Output of the local round handler
#[derive(Debug, Clone, Default)]
pub struct RoundOutput {
    /// Payload per recipient; may include this node itself
    pub send: BTreeMap<PartnerId, Value>,
    pub broadcast: Value,
    /// Narrowed qualified list; `None` keeps the frozen list
    pub qualifieds: Option<Vec<PartnerId>>,
}

impl RoundOutput {
    pub fn broadcast(broadcast: Value) -> Self {
        Self {
            broadcast,
            ..Default::default()
        }
    }

    pub fn with_send(mut self, send: BTreeMap<PartnerId, Value>) -> Self {
        self.send = send;
        self
    }

    pub fn with_qualifieds(mut self, qualifieds: Vec<PartnerId>) -> Self {
        self.qualifieds = Some(qualifieds);
        self
    }
}

/// One partner's round output as received by this node
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerMessage {
    pub send: Option<Value>,
    pub broadcast: Value,
}

/// Read-only view a round handler works on
pub struct RoundContext<'a> {
    pub mpc_id: &'a str,
    pub self_id: PartnerId,
    pub partners: &'a [PartnerId],
    /// Qualified set frozen for this round (final set in `on_complete`)
    pub qualified: &'a [PartnerId],
    messages: &'a [BTreeMap<PartnerId, PartnerMessage>],
}

impl<'a> RoundContext<'a> {
    pub fn message(&self, round: usize, from: PartnerId) -> Option<&'a PartnerMessage> {
        self.messages.get(round).and_then(|arrived| arrived.get(&from))
    }

    /// Partners whose output of `round` arrived, this node included
    pub fn responders(&self, round: usize) -> Vec<PartnerId> {
        self.messages
            .get(round)
            .map(|arrived| arrived.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Decode `from`'s broadcast of `round`
    pub fn broadcast<T: DeserializeOwned>(&self, round: usize, from: PartnerId) -> Result<T> {
        let message = self.message(round, from).ok_or_else(|| {
            NodeError::schema(format!("no round {} data from partner {}", round, from))
        })?;
        serde_json::from_value(message.broadcast.clone()).map_err(|e| {
            NodeError::schema(format!("round {} broadcast from {}: {}", round, from, e))
        })
    }

    /// Decode what `from` sent to this node in `round`
    pub fn send<T: DeserializeOwned>(&self, round: usize, from: PartnerId) -> Result<T> {
        let payload = self
            .message(round, from)
            .and_then(|message| message.send.clone())
            .ok_or_else(|| {
                NodeError::schema(format!("no round {} send from partner {}", round, from))
            })?;
        serde_json::from_value(payload)
            .map_err(|e| NodeError::schema(format!("round {} send from {}: {}", round, from, e)))
    }

    pub fn is_qualified(&self, id: PartnerId) -> bool {
        self.qualified.contains(&id)
    }
}

/// A round based protocol driven by `MpcInstance::run`
pub trait MpcProtocol: Send + 'static {
    type Output: Send + 'static;

    /// Round names in execution order
    fn rounds(&self) -> &'static [&'static str];

    fn process_round(&mut self, round: usize, ctx: &RoundContext<'_>) -> Result<RoundOutput>;

    /// Called once after the last round with the final qualified set
    fn on_complete(&mut self, ctx: &RoundContext<'_>) -> Result<Self::Output>;
}

/// Timing knobs of a run
#[derive(Debug, Clone)]
pub struct MpcOptions {
    pub run_timeout: Duration,
    pub round_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for MpcOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(60),
            round_timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl From<&NodeConfig> for MpcOptions {
    fn from(config: &NodeConfig) -> Self {
        Self {
            run_timeout: config.run_timeout(),
            round_timeout: config.round_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }
}

#[derive(Debug)]
struct PublishedRound {
    send: BTreeMap<PartnerId, Value>,
    broadcast: Value,
    qualifieds: Vec<PartnerId>,
}

/// State of one MPC run shared between the driver and remote requesters
pub struct MpcInstance {
    init: MpcInit,
    self_id: PartnerId,
    rounds: &'static [&'static str],
    phaser: Phaser,
    published: RwLock<Vec<Option<Arc<PublishedRound>>>>,
}

impl std::fmt::Debug for MpcInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpcInstance")
            .field("id", &self.init.id)
            .field("kind", &self.init.kind)
            .field("self_id", &self.self_id)
            .finish_non_exhaustive()
    }
}

impl MpcInstance {
    pub fn new(
        init: MpcInit,
        self_id: PartnerId,
        rounds: &'static [&'static str],
    ) -> Result<Arc<Self>> {
        let partners: BTreeSet<PartnerId> = init.partners.iter().copied().collect();
        if partners.len() != init.partners.len() {
            return Err(NodeError::invalid("duplicate partner in mpc"));
        }
        if partners.contains(&0) {
            return Err(NodeError::invalid("partner id 0 is reserved"));
        }
        if !partners.contains(&self_id) {
            return Err(NodeError::NotQualified(format!(
                "node {} is not a partner of mpc {}",
                self_id, init.id
            )));
        }
        if !partners.contains(&init.starter) {
            return Err(NodeError::invalid("mpc starter is not a partner"));
        }
        if init.t == 0 || init.t > partners.len() {
            return Err(NodeError::invalid(format!(
                "threshold {} invalid for {} partners",
                init.t,
                partners.len()
            )));
        }
        if rounds.is_empty() {
            return Err(NodeError::invalid("mpc needs at least one round"));
        }

        let mut init = init;
        init.partners = partners.into_iter().collect();
        Ok(Arc::new(Self {
            init,
            self_id,
            rounds,
            phaser: Phaser::new(rounds.len() + 1),
            published: RwLock::new(vec![None; rounds.len()]),
        }))
    }

    pub fn id(&self) -> &str {
        &self.init.id
    }

    pub fn kind(&self) -> &str {
        &self.init.kind
    }

    pub fn self_id(&self) -> PartnerId {
        self.self_id
    }

    pub fn partners(&self) -> &[PartnerId] {
        &self.init.partners
    }

    pub fn threshold(&self) -> usize {
        self.init.t
    }

    pub fn init(&self) -> &MpcInit {
        &self.init
    }

    /// Serve this node's output of `round` to `requester` once it is published
    pub async fn round_data(&self, round: usize, requester: PartnerId) -> Result<RoundResponse> {
        if !self.init.partners.contains(&requester) {
            return Err(NodeError::NotQualified(format!(
                "partner {} is not part of mpc {}",
                requester, self.init.id
            )));
        }
        if round >= self.rounds.len() {
            return Err(NodeError::schema(format!(
                "mpc {} has no round {}",
                self.init.id, round
            )));
        }
        self.phaser.wait(round + 1).await?;

        let published = self
            .read_published(round)
            .ok_or_else(|| NodeError::SessionNotFound(format!("round {} not published", round)))?;
        Ok(RoundResponse {
            send: published.send.get(&requester).cloned(),
            broadcast: published.broadcast.clone(),
            qualifieds: Some(published.qualifieds.clone()),
        })
    }

    fn read_published(&self, round: usize) -> Option<Arc<PublishedRound>> {
        let guard = match self.published.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.get(round).cloned().flatten()
    }

    fn publish(&self, round: usize, data: PublishedRound) {
        let mut guard = match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(slot) = guard.get_mut(round) {
            *slot = Some(Arc::new(data));
        }
    }

    /// Abort the run: every pending and future round data request fails
    pub fn abort(&self, reason: impl Into<String>) {
        self.phaser.reject(reason);
    }

    /// Register with `network`, execute every round and finish the protocol
    pub async fn run<P: MpcProtocol>(
        self: &Arc<Self>,
        protocol: P,
        network: Arc<dyn MpcNetwork>,
        options: &MpcOptions,
    ) -> Result<P::Output> {
        let started = Instant::now();
        let span = tracing::info_span!(
            "mpc",
            mpc_id = %self.init.id,
            kind = %self.init.kind,
            node_id = self.self_id
        );
        let result = tokio::time::timeout(
            options.run_timeout,
            self.drive(protocol, network.as_ref(), options)
                .instrument(span),
        )
        .await
        .unwrap_or_else(|_| {
            Err(NodeError::Timeout(format!(
                "mpc {} exceeded {:?}",
                self.init.id, options.run_timeout
            )))
        });

        let elapsed = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => log_mpc_event(
                &self.init.kind,
                &self.init.id,
                true,
                elapsed,
                serde_json::json!({ "node_id": self.self_id }),
            ),
            Err(e) => {
                self.phaser.reject(e.to_string());
                log_mpc_event(
                    &self.init.kind,
                    &self.init.id,
                    false,
                    elapsed,
                    serde_json::json!({
                        "node_id": self.self_id,
                        "code": e.error_code(),
                        "error": e.to_string(),
                    }),
                );
            }
        }
        result
    }

    async fn drive<P: MpcProtocol>(
        self: &Arc<Self>,
        mut protocol: P,
        network: &dyn MpcNetwork,
        options: &MpcOptions,
    ) -> Result<P::Output> {
        if protocol.rounds().len() != self.rounds.len() {
            return Err(NodeError::invalid("protocol rounds do not match the instance"));
        }
        network.register_mpc(self.clone()).await?;
        self.phaser.resolve(0)?;

        let mut qualified = self.init.partners.clone();
        let mut messages: Vec<BTreeMap<PartnerId, PartnerMessage>> =
            Vec::with_capacity(self.rounds.len());

        for (round, name) in self.rounds.iter().enumerate() {
            let frozen = qualified.clone();
            let output = {
                let ctx = RoundContext {
                    mpc_id: &self.init.id,
                    self_id: self.self_id,
                    partners: &self.init.partners,
                    qualified: &frozen,
                    messages: &messages,
                };
                protocol.process_round(round, &ctx)?
            };

            let own_qualifieds: Vec<PartnerId> = match &output.qualifieds {
                Some(narrowed) => frozen
                    .iter()
                    .copied()
                    .filter(|p| *p == self.self_id || narrowed.contains(p))
                    .collect(),
                None => frozen.clone(),
            };
            let own_message = PartnerMessage {
                send: output.send.get(&self.self_id).cloned(),
                broadcast: output.broadcast.clone(),
            };
            self.publish(
                round,
                PublishedRound {
                    send: output.send,
                    broadcast: output.broadcast,
                    qualifieds: own_qualifieds.clone(),
                },
            );
            self.phaser.resolve(round + 1)?;
            tracing::debug!(round = %name, qualified = ?frozen, "Published round output");

            let responses = self.collect(round, &frozen, network, options).await;

            let mut arrived = BTreeMap::new();
            let mut reports = BTreeMap::new();
            arrived.insert(self.self_id, own_message);
            reports.insert(self.self_id, own_qualifieds);
            for (partner, response) in responses {
                reports.insert(
                    partner,
                    response.qualifieds.unwrap_or_else(|| frozen.clone()),
                );
                arrived.insert(
                    partner,
                    PartnerMessage {
                        send: response.send,
                        broadcast: response.broadcast,
                    },
                );
            }
            messages.push(arrived);

            let next = qualified_partners(&frozen, &reports);
            if !next.qualified.contains(&self.self_id) {
                return Err(NodeError::NotQualified(format!(
                    "node {} dropped after round {}",
                    self.self_id, name
                )));
            }
            if next.qualified.len() < self.init.t {
                return Err(NodeError::InsufficientPartners {
                    threshold: self.init.t,
                    qualified: next.qualified.len(),
                    graph: next.graph,
                });
            }
            if next.qualified.len() != frozen.len() {
                log_security_event(
                    "partners_excluded",
                    false,
                    serde_json::json!({
                        "round": name,
                        "node_id": self.self_id,
                        "removed": next.graph.removed,
                        "unreachable": next.graph.unreachable,
                    }),
                    Some(&self.init.id),
                );
            }
            qualified = next.qualified;
        }

        let ctx = RoundContext {
            mpc_id: &self.init.id,
            self_id: self.self_id,
            partners: &self.init.partners,
            qualified: &qualified,
            messages: &messages,
        };
        protocol.on_complete(&ctx)
    }

    async fn collect(
        &self,
        round: usize,
        targets: &[PartnerId],
        network: &dyn MpcNetwork,
        options: &MpcOptions,
    ) -> Vec<(PartnerId, RoundResponse)> {
        let asks = targets
            .iter()
            .copied()
            .filter(|partner| *partner != self.self_id)
            .map(|partner| async move {
                let request = RoundRequest {
                    mpc_id: self.init.id.clone(),
                    round,
                    from: self.self_id,
                    init: Some(self.init.clone()),
                };
                (partner, ask_with_retry(network, partner, request, options).await)
            });

        join_all(asks)
            .await
            .into_iter()
            .filter_map(|(partner, result)| match result {
                Ok(response) => Some((partner, response)),
                Err(e) => {
                    tracing::warn!(partner, round, error = %e, "Dropping partner for this round");
                    None
                }
            })
            .collect()
    }
}

/// One attempt plus a single retry after a fixed backoff for retryable errors
async fn ask_with_retry(
    network: &dyn MpcNetwork,
    partner: PartnerId,
    request: RoundRequest,
    options: &MpcOptions,
) -> Result<RoundResponse> {
    let mut retried = false;
    loop {
        let result = tokio::time::timeout(
            options.round_timeout,
            network.ask_round_data(partner, request.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(NodeError::Timeout(format!(
                "partner {} round {}",
                partner, request.round
            )))
        });
        match result {
            Err(e) if !retried && e.is_retryable() => {
                tracing::debug!(
                    partner,
                    round = request.round,
                    error = %e,
                    "Retrying round data request"
                );
                retried = true;
                tokio::time::sleep(options.retry_backoff).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::memory::MemoryHub;
    use serde_json::json;

    /// Every partner broadcasts its id, then the sum of what it heard
    struct SumProtocol {
        heard: u64,
    }

    impl MpcProtocol for SumProtocol {
        type Output = (u64, Vec<PartnerId>);

        fn rounds(&self) -> &'static [&'static str] {
            &["announce", "sum"]
        }

        fn process_round(&mut self, round: usize, ctx: &RoundContext<'_>) -> Result<RoundOutput> {
            match round {
                0 => Ok(RoundOutput::broadcast(json!({ "id": ctx.self_id }))),
                _ => {
                    let mut sum = 0;
                    for id in ctx.qualified {
                        let value: Value = ctx.broadcast(0, *id)?;
                        sum += value["id"].as_u64().unwrap_or(0);
                    }
                    self.heard = sum;
                    let send = ctx
                        .qualified
                        .iter()
                        .map(|id| (*id, json!(u64::from(ctx.self_id) * 10)))
                        .collect();
                    Ok(RoundOutput::broadcast(json!(sum)).with_send(send))
                }
            }
        }

        fn on_complete(&mut self, ctx: &RoundContext<'_>) -> Result<Self::Output> {
            for id in ctx.qualified {
                let sent: u64 = ctx.send(1, *id)?;
                assert_eq!(sent, u64::from(*id) * 10);
            }
            Ok((self.heard, ctx.qualified.to_vec()))
        }
    }

    fn init(partners: Vec<PartnerId>, t: usize) -> MpcInit {
        MpcInit {
            kind: "sum".into(),
            id: "sum-1".into(),
            starter: partners[0],
            partners,
            t,
            params: Value::Null,
        }
    }

    fn fast() -> MpcOptions {
        MpcOptions {
            run_timeout: Duration::from_secs(5),
            round_timeout: Duration::from_millis(300),
            retry_backoff: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_instance_validation() {
        let rounds: &'static [&'static str] = &["a"];
        assert!(MpcInstance::new(init(vec![1, 2, 3], 2), 4, rounds).is_err());
        assert!(MpcInstance::new(init(vec![1, 2, 3], 4), 1, rounds).is_err());
        assert!(MpcInstance::new(init(vec![1, 2, 2], 2), 1, rounds).is_err());
        assert!(MpcInstance::new(init(vec![1, 2, 3], 2), 2, &[]).is_err());
        assert!(MpcInstance::new(init(vec![3, 1, 2], 2), 2, rounds).is_ok());
    }

    #[tokio::test]
    async fn test_all_partners_complete() {
        let hub = MemoryHub::new();
        let ids = [1u16, 2, 3];
        let runs = ids.iter().map(|&id| {
            let network = hub.add_node(id);
            let instance =
                MpcInstance::new(init(ids.to_vec(), 2), id, &["announce", "sum"]).unwrap();
            async move { instance.run(SumProtocol { heard: 0 }, network, &fast()).await }
        });
        for result in join_all(runs).await {
            let (sum, qualified) = result.unwrap();
            assert_eq!(sum, 6);
            assert_eq!(qualified, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_offline_partner_dropped() {
        let hub = MemoryHub::new();
        let ids = [1u16, 2, 3, 4];
        for id in ids {
            hub.add_node(id);
        }
        hub.set_online(4, false);
        let runs = [1u16, 2, 3].map(|id| {
            let network = hub.network(id).unwrap();
            let instance =
                MpcInstance::new(init(ids.to_vec(), 3), id, &["announce", "sum"]).unwrap();
            async move { instance.run(SumProtocol { heard: 0 }, network, &fast()).await }
        });
        for result in join_all(runs).await {
            let (sum, qualified) = result.unwrap();
            assert_eq!(qualified, vec![1, 2, 3]);
            assert_eq!(sum, 6);
        }
    }

    #[tokio::test]
    async fn test_insufficient_partners_carries_graph() {
        let hub = MemoryHub::new();
        for id in [1u16, 2, 3] {
            hub.add_node(id);
        }
        hub.set_online(2, false);
        hub.set_online(3, false);
        let network = hub.network(1).unwrap();
        let instance = MpcInstance::new(init(vec![1, 2, 3], 2), 1, &["announce", "sum"]).unwrap();
        let err = instance
            .run(SumProtocol { heard: 0 }, network, &fast())
            .await
            .unwrap_err();
        match err {
            NodeError::InsufficientPartners { qualified, graph, .. } => {
                assert_eq!(qualified, 1);
                assert_eq!(graph.unreachable, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
        // the failed run no longer serves data
        assert!(instance.round_data(1, 2).await.is_err());
    }
}
