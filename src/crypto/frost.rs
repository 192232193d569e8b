//! FROST threshold Schnorr signatures with precomputed nonce pairs
//!
//! Each signer i contributes a single-use pair (d_i, e_i) whose commitments
//! (D_i, E_i) were published during nonce-batch generation.
//!
//! - binding factor ρ_i = H("rho", i, m, B) where B is the full commitment list
//! - group commitment R = Σ (D_i + ρ_i * E_i)
//! - challenge c = H("chal", R, Y, m)
//! - partial z_i = d_i + ρ_i * e_i + λ_i * x_i * c
//! - verify g^z == R + c * Y

use super::curve::{
    hash_to_scalar, point_from_bytes, point_to_bytes, scalar_from_bytes, ProjectivePoint, Scalar,
};
use super::lagrange::lagrange_coefficient;
use crate::error::{NodeError, Result};
use crate::types::PartnerId;
use std::collections::BTreeMap;

const BINDING_DOMAIN: &[u8] = b"mpc-node/frost/rho";
const CHALLENGE_DOMAIN: &[u8] = b"mpc-node/frost/chal";

/// Public commitment pair (D, E) of one signer for one nonce index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceCommitment {
    pub hiding: ProjectivePoint,
    pub binding: ProjectivePoint,
}

/// Aggregated FROST signature (R, z)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrostSignature {
    pub r: ProjectivePoint,
    pub z: Scalar,
}

impl FrostSignature {
    /// Packed as 33-byte compressed R followed by 32-byte z
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = point_to_bytes(&self.r);
        bytes.extend_from_slice(&self.z.to_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(NodeError::schema(format!(
                "frost signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            r: point_from_bytes(&bytes[..33])?,
            z: scalar_from_bytes(&bytes[33..])?,
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim_start_matches("0x"))
            .map_err(|e| NodeError::schema(format!("invalid signature hex: {}", e)))?;
        Self::from_bytes(&bytes)
    }
}

fn encode_commitment_list(commitments: &BTreeMap<PartnerId, NonceCommitment>) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(commitments.len() * 68);
    for (id, commitment) in commitments {
        encoded.extend_from_slice(&id.to_be_bytes());
        encoded.extend_from_slice(&point_to_bytes(&commitment.hiding));
        encoded.extend_from_slice(&point_to_bytes(&commitment.binding));
    }
    encoded
}

/// ρ_i for every signer in the commitment set
pub fn binding_factors(
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    message: &[u8],
) -> BTreeMap<PartnerId, Scalar> {
    let encoded = encode_commitment_list(commitments);
    commitments
        .keys()
        .map(|id| {
            let rho = hash_to_scalar(BINDING_DOMAIN, &[&id.to_be_bytes(), message, &encoded]);
            (*id, rho)
        })
        .collect()
}

/// R = Σ (D_i + ρ_i * E_i)
pub fn group_commitment(
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    binding: &BTreeMap<PartnerId, Scalar>,
) -> Result<ProjectivePoint> {
    let mut r = ProjectivePoint::IDENTITY;
    for (id, commitment) in commitments {
        let rho = binding
            .get(id)
            .ok_or_else(|| NodeError::crypto(format!("missing binding factor for {}", id)))?;
        r += commitment.hiding + commitment.binding * rho;
    }
    Ok(r)
}

/// c = H(R, Y, m)
pub fn challenge(r: &ProjectivePoint, public_key: &ProjectivePoint, message: &[u8]) -> Scalar {
    hash_to_scalar(
        CHALLENGE_DOMAIN,
        &[&point_to_bytes(r), &point_to_bytes(public_key), message],
    )
}

struct SigningContext {
    binding: BTreeMap<PartnerId, Scalar>,
    challenge: Scalar,
    signers: Vec<PartnerId>,
}

fn signing_context(
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    public_key: &ProjectivePoint,
    message: &[u8],
) -> Result<SigningContext> {
    if commitments.is_empty() {
        return Err(NodeError::crypto("empty signer set"));
    }
    let binding = binding_factors(commitments, message);
    let r = group_commitment(commitments, &binding)?;
    Ok(SigningContext {
        challenge: challenge(&r, public_key, message),
        binding,
        signers: commitments.keys().copied().collect(),
    })
}

/// z_i = d_i + ρ_i * e_i + λ_i * x_i * c
pub fn partial_sign(
    id: PartnerId,
    share: &Scalar,
    nonce: (&Scalar, &Scalar),
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    public_key: &ProjectivePoint,
    message: &[u8],
) -> Result<Scalar> {
    let ctx = signing_context(commitments, public_key, message)?;
    let rho = ctx
        .binding
        .get(&id)
        .ok_or_else(|| NodeError::crypto(format!("signer {} not in commitment set", id)))?;
    let lambda = lagrange_coefficient(id, &ctx.signers)?;
    let (d, e) = nonce;
    Ok(*d + *e * rho + lambda * share * ctx.challenge)
}

/// Checks g^{z_i} == D_i + ρ_i * E_i + c * λ_i * Y_i
pub fn verify_partial(
    id: PartnerId,
    partial: &Scalar,
    public_share: &ProjectivePoint,
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    public_key: &ProjectivePoint,
    message: &[u8],
) -> Result<bool> {
    let ctx = signing_context(commitments, public_key, message)?;
    let commitment = commitments
        .get(&id)
        .ok_or_else(|| NodeError::crypto(format!("signer {} not in commitment set", id)))?;
    let rho = ctx
        .binding
        .get(&id)
        .ok_or_else(|| NodeError::crypto(format!("missing binding factor for {}", id)))?;
    let lambda = lagrange_coefficient(id, &ctx.signers)?;
    let expected =
        commitment.hiding + commitment.binding * rho + *public_share * (ctx.challenge * lambda);
    Ok(ProjectivePoint::GENERATOR * partial == expected)
}

/// z = Σ z_i; every signer of the commitment set must have contributed
pub fn aggregate(
    commitments: &BTreeMap<PartnerId, NonceCommitment>,
    message: &[u8],
    partials: &BTreeMap<PartnerId, Scalar>,
) -> Result<FrostSignature> {
    if commitments.keys().ne(partials.keys()) {
        return Err(NodeError::crypto(
            "partial signatures do not match the commitment set",
        ));
    }
    let binding = binding_factors(commitments, message);
    let r = group_commitment(commitments, &binding)?;
    let z = partials.values().fold(Scalar::ZERO, |acc, z_i| acc + z_i);
    Ok(FrostSignature { r, z })
}

pub fn verify(public_key: &ProjectivePoint, message: &[u8], signature: &FrostSignature) -> bool {
    if *public_key == ProjectivePoint::IDENTITY {
        return false;
    }
    let c = challenge(&signature.r, public_key, message);
    ProjectivePoint::GENERATOR * signature.z == signature.r + *public_key * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::curve::random_scalar;
    use crate::crypto::polynomial::Polynomial;

    struct Signer {
        id: PartnerId,
        share: Scalar,
        d: Scalar,
        e: Scalar,
    }

    fn setup(t: usize, ids: &[PartnerId]) -> (Polynomial, Vec<Signer>) {
        let key = Polynomial::random(t);
        let signers = ids
            .iter()
            .map(|&id| Signer {
                id,
                share: key.evaluate_at(id),
                d: random_scalar(),
                e: random_scalar(),
            })
            .collect();
        (key, signers)
    }

    fn commitments(signers: &[Signer]) -> BTreeMap<PartnerId, NonceCommitment> {
        signers
            .iter()
            .map(|s| {
                (
                    s.id,
                    NonceCommitment {
                        hiding: ProjectivePoint::GENERATOR * s.d,
                        binding: ProjectivePoint::GENERATOR * s.e,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_sign_verify() {
        let (key, signers) = setup(3, &[1, 3, 6]);
        let commitment = key.commitment();
        let public_key = commitment.constant();
        let set = commitments(&signers);
        let message = [7u8; 32];

        let mut partials = BTreeMap::new();
        for s in &signers {
            let z = partial_sign(s.id, &s.share, (&s.d, &s.e), &set, &public_key, &message)
                .unwrap();
            assert!(verify_partial(
                s.id,
                &z,
                &commitment.public_share(s.id),
                &set,
                &public_key,
                &message
            )
            .unwrap());
            partials.insert(s.id, z);
        }

        let sig = aggregate(&set, &message, &partials).unwrap();
        assert!(verify(&public_key, &message, &sig));

        let mut mutated = message;
        mutated[0] ^= 0x80;
        assert!(!verify(&public_key, &mutated, &sig));
    }

    #[test]
    fn test_flipped_partial_breaks_signature() {
        let (key, signers) = setup(2, &[2, 5]);
        let commitment = key.commitment();
        let public_key = commitment.constant();
        let set = commitments(&signers);

        let mut partials = BTreeMap::new();
        for s in &signers {
            let z = partial_sign(s.id, &s.share, (&s.d, &s.e), &set, &public_key, b"msg").unwrap();
            partials.insert(s.id, z);
        }
        let flipped = partials[&5] + Scalar::ONE;
        let share = commitment.public_share(5);
        assert!(!verify_partial(5, &flipped, &share, &set, &public_key, b"msg").unwrap());
        partials.insert(5, flipped);

        let sig = aggregate(&set, b"msg", &partials).unwrap();
        assert!(!verify(&public_key, b"msg", &sig));
    }

    #[test]
    fn test_aggregate_requires_full_set() {
        let (key, signers) = setup(2, &[1, 2]);
        let public_key = key.commitment().constant();
        let set = commitments(&signers);
        let s = &signers[0];
        let z = partial_sign(s.id, &s.share, (&s.d, &s.e), &set, &public_key, b"m").unwrap();
        let partials = BTreeMap::from([(s.id, z)]);
        assert!(aggregate(&set, b"m", &partials).is_err());
    }

    #[test]
    fn test_signature_bytes() {
        let sig = FrostSignature {
            r: ProjectivePoint::GENERATOR * random_scalar(),
            z: random_scalar(),
        };
        assert_eq!(sig.to_bytes().len(), 65);
        assert_eq!(FrostSignature::from_hex(&sig.to_hex()).unwrap(), sig);
        assert!(FrostSignature::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_flipped_signature_bytes_never_verify() {
        let (key, signers) = setup(2, &[1, 4]);
        let public_key = key.commitment().constant();
        let set = commitments(&signers);
        let partials = signers
            .iter()
            .map(|s| {
                let z = partial_sign(s.id, &s.share, (&s.d, &s.e), &set, &public_key, b"flip");
                z.map(|z| (s.id, z))
            })
            .collect::<Result<BTreeMap<_, _>>>()
            .unwrap();
        let sig = aggregate(&set, b"flip", &partials).unwrap();
        assert!(verify(&public_key, b"flip", &sig));

        let bytes = sig.to_bytes();
        for index in 0..bytes.len() {
            for bit in [0x01u8, 0x80] {
                let mut flipped = bytes.clone();
                flipped[index] ^= bit;
                if let Ok(parsed) = FrostSignature::from_bytes(&flipped) {
                    let verified = verify(&public_key, b"flip", &parsed);
                    assert!(!verified, "byte {} bit {}", index, bit);
                }
            }
        }
    }
}
