//! Threshold Schnorr signatures over a DKG generated nonce
//!
//! The nonce `k` is itself a distributed key: every signer holds a share
//! `k_i` and the nonce public key `R = g^k` is known to all.
//!
//! - challenge `e = keccak(address(R) || m)`
//! - partial `s_i = k_i - x_i * e`
//! - aggregate `s = Σ λ_j * s_j`
//! - verify `keccak(address(g^s * Y^e) || m) == e`

use super::curve::{
    address_bytes, keccak_to_scalar, scalar_from_hex, scalar_to_hex, ProjectivePoint, Scalar,
};
use super::lagrange::lagrange_coefficient;
use crate::error::{NodeError, Result};
use crate::types::PartnerId;
use std::collections::BTreeMap;

/// Aggregated Schnorr signature `(s, e)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchnorrSignature {
    pub s: Scalar,
    pub e: Scalar,
}

impl SchnorrSignature {
    /// Wire form `"<s_hex>,<e_hex>"`
    pub fn to_wire(&self) -> String {
        format!("{},{}", scalar_to_hex(&self.s), scalar_to_hex(&self.e))
    }

    pub fn from_wire(value: &str) -> Result<Self> {
        let (s, e) = value
            .split_once(',')
            .ok_or_else(|| NodeError::schema("schnorr signature must be \"s,e\""))?;
        Ok(Self {
            s: scalar_from_hex(s.trim())?,
            e: scalar_from_hex(e.trim())?,
        })
    }
}

/// e = keccak(address(R) || m)
pub fn challenge(nonce_public: &ProjectivePoint, message: &[u8]) -> Scalar {
    keccak_to_scalar(&[&address_bytes(nonce_public), message])
}

/// Single signer signature, used for proofs of possession
pub fn sign(secret: &Scalar, nonce: &Scalar, message: &[u8]) -> SchnorrSignature {
    let nonce_public = ProjectivePoint::GENERATOR * nonce;
    let e = challenge(&nonce_public, message);
    SchnorrSignature {
        s: *nonce - *secret * e,
        e,
    }
}

/// s_i = k_i - x_i * e
pub fn partial_sign(
    share: &Scalar,
    nonce_share: &Scalar,
    nonce_public: &ProjectivePoint,
    message: &[u8],
) -> Scalar {
    let e = challenge(nonce_public, message);
    *nonce_share - *share * e
}

/// Checks g^{s_i} * Y_i^e == R_i for one signer
pub fn verify_partial(
    public_share: &ProjectivePoint,
    nonce_public_share: &ProjectivePoint,
    nonce_public: &ProjectivePoint,
    message: &[u8],
    partial: &Scalar,
) -> bool {
    let e = challenge(nonce_public, message);
    ProjectivePoint::GENERATOR * partial + *public_share * e == *nonce_public_share
}

/// s = Σ λ_j * s_j over the signer index set
pub fn aggregate(
    nonce_public: &ProjectivePoint,
    message: &[u8],
    partials: &BTreeMap<PartnerId, Scalar>,
) -> Result<SchnorrSignature> {
    if partials.is_empty() {
        return Err(NodeError::crypto("no partial signatures to aggregate"));
    }
    let indices: Vec<PartnerId> = partials.keys().copied().collect();
    let mut s = Scalar::ZERO;
    for (id, partial) in partials {
        s += lagrange_coefficient(*id, &indices)? * partial;
    }
    Ok(SchnorrSignature {
        s,
        e: challenge(nonce_public, message),
    })
}

pub fn verify(public_key: &ProjectivePoint, message: &[u8], signature: &SchnorrSignature) -> bool {
    if *public_key == ProjectivePoint::IDENTITY {
        return false;
    }
    let recovered = ProjectivePoint::GENERATOR * signature.s + *public_key * signature.e;
    challenge(&recovered, message) == signature.e
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::random_scalar;
    use crate::crypto::polynomial::Polynomial;

    #[test]
    fn test_single_signer() {
        let secret = random_scalar();
        let public = ProjectivePoint::GENERATOR * secret;
        let sig = sign(&secret, &random_scalar(), b"hello");
        assert!(verify(&public, b"hello", &sig));
        assert!(!verify(&public, b"hellp", &sig));
    }

    #[test]
    fn test_threshold_sign_and_aggregate() {
        let key = Polynomial::random(3);
        let nonce = Polynomial::random(3);
        let key_commitment = key.commitment();
        let nonce_commitment = nonce.commitment();
        let public_key = key_commitment.constant();
        let nonce_public = nonce_commitment.constant();
        let message = [0x42u8; 32];

        let mut partials = BTreeMap::new();
        for id in [2u16, 4, 5] {
            let s_i = partial_sign(
                &key.evaluate_at(id),
                &nonce.evaluate_at(id),
                &nonce_public,
                &message,
            );
            assert!(verify_partial(
                &key_commitment.public_share(id),
                &nonce_commitment.public_share(id),
                &nonce_public,
                &message,
                &s_i
            ));
            partials.insert(id, s_i);
        }

        let sig = aggregate(&nonce_public, &message, &partials).unwrap();
        assert!(verify(&public_key, &message, &sig));

        let mut mutated = message;
        mutated[31] ^= 1;
        assert!(!verify(&public_key, &mutated, &sig));

        let bad_sig = SchnorrSignature {
            s: sig.s + Scalar::ONE,
            e: sig.e,
        };
        assert!(!verify(&public_key, &message, &bad_sig));
    }

    #[test]
    fn test_wrong_partial_detected() {
        let key = Polynomial::random(2);
        let nonce = Polynomial::random(2);
        let nonce_public = nonce.commitment().constant();
        let s_1 = partial_sign(&key.evaluate_at(1), &nonce.evaluate_at(1), &nonce_public, b"m");
        assert!(!verify_partial(
            &key.commitment().public_share(1),
            &nonce.commitment().public_share(1),
            &nonce_public,
            b"m",
            &(s_1 + Scalar::ONE)
        ));
    }

    #[test]
    fn test_wire_format() {
        let sig = sign(&random_scalar(), &random_scalar(), b"wire");
        let wire = sig.to_wire();
        assert_eq!(wire.split(',').count(), 2);
        assert_eq!(SchnorrSignature::from_wire(&wire).unwrap(), sig);
        assert!(SchnorrSignature::from_wire("deadbeef").is_err());
    }

    #[test]
    fn test_flipped_wire_bytes_never_verify() {
        let secret = random_scalar();
        let public = ProjectivePoint::GENERATOR * secret;
        let sig = sign(&secret, &random_scalar(), b"flip");
        let mut raw = sig.s.to_bytes().to_vec();
        raw.extend_from_slice(&sig.e.to_bytes());

        for index in 0..raw.len() {
            for bit in [0x01u8, 0x80] {
                let mut flipped = raw.clone();
                flipped[index] ^= bit;
                let (s, e) = flipped.split_at(32);
                let wire = format!("{},{}", hex::encode(s), hex::encode(e));
                if let Ok(parsed) = SchnorrSignature::from_wire(&wire) {
                    assert!(!verify(&public, b"flip", &parsed), "byte {} bit {}", index, bit);
                }
            }
        }
    }
}
