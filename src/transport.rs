//! HTTP transport between nodes
//!
//! Every partner exposes the routes in `server.rs`; this client calls them.
//! MPC runs register with the local registry, which the server consults when
//! a partner asks for round data.

use crate::confirmation::{Announcer, Availability, RemoteSigner};
use crate::error::{NodeError, Result};
use crate::mpc::{MpcInstance, MpcNetwork, MpcRegistry};
use crate::types::{
    ConfirmedAnnouncement, ErrorResponse, PartialSignature, PartnerId, RoundRequest,
    RoundResponse, SignRequest,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Rebuild a partner's error from its `ErrorResponse`
pub fn error_from_response(status: reqwest::StatusCode, body: &str) -> NodeError {
    let Ok(response) = serde_json::from_str::<ErrorResponse>(body) else {
        return NodeError::network(format!("partner answered {}: {}", status, body));
    };
    let message = response.message;
    match response.code.as_str() {
        "VERIFICATION_FAILURE" => NodeError::Verification(message),
        "TIMEOUT" => NodeError::Timeout(message),
        "REPLAY_OR_MISUSE" => NodeError::ReplayOrMisuse(message),
        "SCHEMA_VALIDATION" => NodeError::SchemaValidation(message),
        "NOT_QUALIFIED" => NodeError::NotQualified(message),
        "ABORTED" => NodeError::Aborted(message),
        "SESSION_NOT_FOUND" => NodeError::SessionNotFound(message),
        "INVALID_INPUT" => NodeError::InvalidInput(message),
        _ => NodeError::network(format!("partner answered {}: {}", status, message)),
    }
}

/// reqwest based client for every partner call
pub struct HttpTransport {
    self_id: PartnerId,
    client: Client,
    peers: BTreeMap<PartnerId, String>,
    registry: Arc<MpcRegistry>,
    health_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        self_id: PartnerId,
        peers: BTreeMap<PartnerId, String>,
        registry: Arc<MpcRegistry>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| NodeError::network(e.to_string()))?;
        Ok(Self {
            self_id,
            client,
            peers,
            registry,
            health_timeout: Duration::from_secs(2),
        })
    }

    fn url(&self, partner: PartnerId, path: &str) -> Result<String> {
        let base = self
            .peers
            .get(&partner)
            .ok_or_else(|| NodeError::network(format!("no address for partner {}", partner)))?;
        Ok(format!("{}{}", base, path))
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        partner: PartnerId,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.url(partner, path)?;
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NodeError::Timeout(format!("{}: {}", url, e))
                } else {
                    NodeError::network(format!("{}: {}", url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_response(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| NodeError::schema(format!("response from {}: {}", url, e)))
    }
}

#[async_trait]
impl MpcNetwork for HttpTransport {
    async fn register_mpc(&self, mpc: Arc<MpcInstance>) -> Result<()> {
        self.registry.register(mpc).await
    }

    async fn ask_round_data(
        &self,
        partner: PartnerId,
        request: RoundRequest,
    ) -> Result<RoundResponse> {
        self.post(partner, "/mpc/round", &request).await
    }
}

#[async_trait]
impl RemoteSigner for HttpTransport {
    async fn request_signature(
        &self,
        partner: PartnerId,
        request: &SignRequest,
    ) -> Result<PartialSignature> {
        self.post(partner, "/sign", request).await
    }
}

#[async_trait]
impl Announcer for HttpTransport {
    async fn announce(
        &self,
        partners: &[PartnerId],
        announcement: &ConfirmedAnnouncement,
    ) -> Result<()> {
        let deliveries = partners.iter().map(|&partner| async move {
            let delivered: Result<serde_json::Value> =
                self.post(partner, "/confirmed", announcement).await;
            (partner, delivered)
        });
        for (partner, delivered) in join_all(deliveries).await {
            if let Err(e) = delivered {
                tracing::warn!(partner, error = %e, "Announcement not delivered");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Availability for HttpTransport {
    async fn available(&self, partners: &[PartnerId]) -> Vec<PartnerId> {
        let probes = partners.iter().map(|&partner| async move {
            if partner == self.self_id {
                return Some(partner);
            }
            let url = self.url(partner, "/health").ok()?;
            let response = self
                .client
                .get(&url)
                .timeout(self.health_timeout)
                .send()
                .await
                .ok()?;
            response.status().is_success().then_some(partner)
        });
        join_all(probes).await.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_error_codes_map_back() {
        let body = serde_json::to_string(&ErrorResponse::new("SESSION_NOT_FOUND", "mpc x"))
            .unwrap();
        let err = error_from_response(StatusCode::NOT_FOUND, &body);
        assert!(matches!(err, NodeError::SessionNotFound(_)));
        assert!(err.is_retryable());

        let body = serde_json::to_string(&ErrorResponse::new("REPLAY_OR_MISUSE", "nonce")).unwrap();
        assert!(matches!(
            error_from_response(StatusCode::CONFLICT, &body),
            NodeError::ReplayOrMisuse(_)
        ));
    }

    #[test]
    fn test_unparseable_error_is_network() {
        let err = error_from_response(StatusCode::BAD_GATEWAY, "<html>");
        assert!(matches!(err, NodeError::Network(_)));
    }

    #[tokio::test]
    async fn test_unknown_partner_has_no_url() {
        let transport = HttpTransport::new(
            1,
            BTreeMap::from([(2, "http://127.0.0.1:9".to_string())]),
            Arc::new(MpcRegistry::new(Duration::from_secs(60))),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(transport.url(3, "/sign").is_err());
        assert_eq!(transport.url(2, "/sign").unwrap(), "http://127.0.0.1:9/sign");
        assert_eq!(transport.available(&[1]).await, vec![1]);
    }
}
