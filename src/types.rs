//! Request, response and data types shared across the node

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Partner identifier (1-indexed; 0 is the interpolation point)
pub type PartnerId = u16;

/// Membership of this node in the signing group.
///
/// Replaced wholesale on membership change, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    /// This node's partner id
    pub id: PartnerId,
    /// Signing threshold
    pub t: usize,
    /// Upper bound on the partner count
    pub max: usize,
    /// Current partner ids, sorted
    pub partners: Vec<PartnerId>,
}

impl Party {
    pub fn new(id: PartnerId, t: usize, max: usize, partners: Vec<PartnerId>) -> Result<Self> {
        let unique: BTreeSet<PartnerId> = partners.iter().copied().collect();
        if unique.len() != partners.len() {
            return Err(NodeError::invalid("duplicate partner id"));
        }
        if unique.contains(&0) {
            return Err(NodeError::invalid("partner id 0 is reserved"));
        }
        if t == 0 || t > unique.len() || unique.len() > max {
            return Err(NodeError::invalid(format!(
                "party requires 0 < t <= |partners| <= max (t={}, partners={}, max={})",
                t,
                unique.len(),
                max
            )));
        }
        if !unique.contains(&id) {
            return Err(NodeError::invalid(format!("node {} is not a partner", id)));
        }
        Ok(Self {
            id,
            t,
            max,
            partners: unique.into_iter().collect(),
        })
    }

    pub fn contains(&self, id: PartnerId) -> bool {
        self.partners.binary_search(&id).is_ok()
    }
}

// ============================================================================
// MPC round transport
// ============================================================================

/// Everything a partner needs to instantiate an MPC run it has not seen yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MpcInit {
    /// Protocol table key (`dkg`, `reshare`, `nonce-batch`)
    pub kind: String,
    /// MPC instance id
    pub id: String,
    pub starter: PartnerId,
    pub partners: Vec<PartnerId>,
    pub t: usize,
    /// Protocol specific parameters
    #[serde(default)]
    pub params: Value,
}

/// Ask a partner for its published output of one round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRequest {
    pub mpc_id: String,
    /// Zero-based round index
    pub round: usize,
    /// Requesting partner
    pub from: PartnerId,
    /// Present so the receiver can start the run lazily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<MpcInit>,
}

/// One partner's output of one round as seen by the requester
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundResponse {
    /// Point-to-point payload addressed to the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<Value>,
    /// Payload identical for every requester
    #[serde(default)]
    pub broadcast: Value,
    /// Partners the responder still considers qualified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualifieds: Option<Vec<PartnerId>>,
}

// ============================================================================
// Key and nonce serialization
// ============================================================================

/// Serialized public polynomial `{t, Fx[hex]}`
pub use crate::crypto::polynomial::CommitmentJson as PolynomialJson;

/// Serialized distributed key share
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistKeyJson {
    pub index: PartnerId,
    /// Secret share (hex)
    pub share: String,
    pub address: String,
    /// Compressed group public key (hex)
    pub public_key: String,
    pub partners: Vec<PartnerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polynomial: Option<PolynomialJson>,
}

/// Public commitment pair of one partner for one nonce index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceCommitmentJson {
    #[serde(rename = "D")]
    pub d: String,
    #[serde(rename = "E")]
    pub e: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceJson {
    /// Own hiding nonce (hex)
    pub d: String,
    /// Own binding nonce (hex)
    pub e: String,
    pub commitments: BTreeMap<PartnerId, NonceCommitmentJson>,
}

/// Serialized FROST nonce batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceBatchJson {
    pub n: usize,
    pub partners: Vec<PartnerId>,
    pub nonces: Vec<NonceJson>,
}

// ============================================================================
// Signing and confirmation
// ============================================================================

/// Which precomputed nonce a signer must use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum NonceRef {
    /// Nonce produced by a dedicated DKG run, stored under `nonce_id`
    Schnorr { nonce_id: String },
    /// Slot `index` of FROST batch `batch_id`, signed by exactly `signers`
    Frost {
        batch_id: String,
        index: usize,
        signers: Vec<PartnerId>,
    },
}

/// Partial signature request sent to each selected signer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub req_id: String,
    /// App that recomputes the result
    pub app: String,
    #[serde(default)]
    pub params: Value,
    /// keccak256 of the canonical result JSON (hex)
    pub result_hash: String,
    /// Unix seconds when the request was computed
    pub timestamp: i64,
    /// Compressed group public key the request is signed under (hex)
    pub public_key: String,
    pub nonce: NonceRef,
}

/// Partial signature returned by a signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialSignature {
    pub req_id: String,
    pub result_hash: String,
    pub signer_id: PartnerId,
    /// Partial signature scalar (hex)
    pub partial_signature: String,
}

/// Announcement broadcast after a request reached quorum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedAnnouncement {
    pub req_id: String,
    pub result_hash: String,
    /// Compressed group public key (hex)
    pub owner_pub_key: String,
    /// Schnorr `"s,e"` or packed FROST `(R, z)` hex
    pub aggregated_signature: String,
    /// RFC 3339
    pub timestamp: String,
}

/// Caller request to confirm an app computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub app: String,
    #[serde(default)]
    pub params: Value,
    /// Use a FROST batch slot instead of a fresh DKG nonce
    #[serde(default)]
    pub frost: bool,
}

// ============================================================================
// Admin API
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DkgStartRequest {
    /// Instance id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Defaults to the party threshold
    #[serde(default)]
    pub t: Option<usize>,
    /// Defaults to all party partners
    #[serde(default)]
    pub partners: Option<Vec<PartnerId>>,
    /// Known secret (hex) to seed the key with
    #[serde(default)]
    pub seed: Option<String>,
    /// Make the result the node's signing key and persist it
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshareStartRequest {
    #[serde(default)]
    pub id: Option<String>,
    /// Key being reshared
    pub key_id: String,
    pub t: usize,
    pub partners: Vec<PartnerId>,
    /// Defaults to every holder of the previous key
    #[serde(default)]
    pub dealers: Option<Vec<PartnerId>>,
    #[serde(default)]
    pub activate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceBatchStartRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub n: usize,
    #[serde(default)]
    pub t: Option<usize>,
    #[serde(default)]
    pub partners: Option<Vec<PartnerId>>,
    #[serde(default)]
    pub activate: bool,
}

/// Public summary of a finished key generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResponse {
    pub id: String,
    pub public_key: String,
    pub address: String,
    pub partners: Vec<PartnerId>,
    pub t: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceBatchResponse {
    pub id: String,
    pub n: usize,
    pub partners: Vec<PartnerId>,
}

/// Node information response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: PartnerId,
    pub t: usize,
    pub max: usize,
    pub partners: Vec<PartnerId>,
    /// Active group public key, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Unused slots left in the active nonce batch
    pub nonces_left: usize,
}

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl From<&NodeError> for ErrorResponse {
    fn from(err: &NodeError) -> Self {
        let response = ErrorResponse::new(err.error_code(), err.to_string());
        match err {
            NodeError::InsufficientPartners { graph, .. } => match serde_json::to_value(graph) {
                Ok(details) => response.with_details(details),
                Err(_) => response,
            },
            _ => response,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    pub node_id: PartnerId,
    /// Whether a signing key is active
    pub key_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionGraph;

    #[test]
    fn test_party_validation() {
        let party = Party::new(2, 2, 5, vec![3, 1, 2]).unwrap();
        assert_eq!(party.partners, vec![1, 2, 3]);
        assert!(party.contains(3));

        assert!(Party::new(4, 2, 5, vec![1, 2, 3]).is_err());
        assert!(Party::new(1, 4, 5, vec![1, 2, 3]).is_err());
        assert!(Party::new(1, 2, 2, vec![1, 2, 3]).is_err());
        assert!(Party::new(1, 2, 5, vec![1, 1, 2]).is_err());
        assert!(Party::new(0, 1, 5, vec![0, 1]).is_err());
    }

    #[test]
    fn test_dist_key_json_field_names() {
        let key = DistKeyJson {
            index: 1,
            share: "00".repeat(32),
            address: "0x00".into(),
            public_key: "02".into(),
            partners: vec![1, 2],
            polynomial: Some(PolynomialJson {
                t: 1,
                fx: vec!["02".into()],
            }),
        };
        let json = serde_json::to_value(&key).unwrap();
        assert!(json.get("publicKey").is_some());
        assert!(json["polynomial"].get("Fx").is_some());
    }

    #[test]
    fn test_nonce_ref_tagging() {
        let nonce = NonceRef::Frost {
            batch_id: "b1".into(),
            index: 3,
            signers: vec![1, 2],
        };
        let json = serde_json::to_value(&nonce).unwrap();
        assert_eq!(json["scheme"], "frost");
        let parsed: NonceRef = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, nonce);
    }

    #[test]
    fn test_round_request_without_init() {
        let parsed: RoundRequest =
            serde_json::from_str(r#"{"mpc_id":"m","round":0,"from":2}"#).unwrap();
        assert!(parsed.init.is_none());
    }

    #[test]
    fn test_error_response_carries_graph() {
        let err = NodeError::InsufficientPartners {
            threshold: 3,
            qualified: 1,
            graph: RejectionGraph {
                removed: vec![4],
                ..Default::default()
            },
        };
        let response = ErrorResponse::from(&err);
        assert_eq!(response.code, "INSUFFICIENT_PARTNERS");
        assert_eq!(response.details.unwrap()["removed"][0], 4);
    }
}
