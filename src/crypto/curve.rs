//! secp256k1 helpers: encoding, validation, hashing to scalars and addresses

use crate::error::{NodeError, Result};
use crate::types::PartnerId;
use k256::elliptic_curve::{
    bigint::U256,
    ops::Reduce,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Field, PrimeField,
};
use k256::{AffinePoint, EncodedPoint, FieldBytes};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

pub use k256::{ProjectivePoint, Scalar};

/// Uniformly random scalar from the OS RNG
pub fn random_scalar() -> Scalar {
    Scalar::random(&mut OsRng)
}

/// x-coordinate a partner evaluates polynomials at
pub fn scalar_from_id(id: PartnerId) -> Scalar {
    Scalar::from(u64::from(id))
}

pub fn scalar_to_hex(scalar: &Scalar) -> String {
    hex::encode(scalar.to_bytes())
}

/// Parse a 32-byte big-endian scalar, rejecting values >= the group order
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    if bytes.len() != 32 {
        return Err(NodeError::schema(format!(
            "scalar must be 32 bytes, got {}",
            bytes.len()
        )));
    }
    let repr = *FieldBytes::from_slice(bytes);
    Option::<Scalar>::from(Scalar::from_repr(repr))
        .ok_or_else(|| NodeError::schema("scalar is not reduced modulo the group order"))
}

pub fn scalar_from_hex(value: &str) -> Result<Scalar> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| NodeError::schema(format!("invalid scalar hex: {}", e)))?;
    scalar_from_bytes(&bytes)
}

/// Compressed SEC1 encoding (33 bytes, or a single zero byte for the identity)
pub fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub fn point_to_hex(point: &ProjectivePoint) -> String {
    hex::encode(point_to_bytes(point))
}

/// Decode a SEC1 point and check curve membership. The identity is accepted.
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|e| NodeError::schema(format!("invalid point encoding: {}", e)))?;
    Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .map(ProjectivePoint::from)
        .ok_or_else(|| NodeError::schema("point is not on secp256k1"))
}

pub fn point_from_hex(value: &str) -> Result<ProjectivePoint> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| NodeError::schema(format!("invalid point hex: {}", e)))?;
    point_from_bytes(&bytes)
}

/// Decode a point that must be usable as a public key (not the identity)
pub fn public_key_from_hex(value: &str) -> Result<ProjectivePoint> {
    let point = point_from_hex(value)?;
    if point == ProjectivePoint::IDENTITY {
        return Err(NodeError::schema("public key is the point at infinity"));
    }
    Ok(point)
}

/// Domain separated SHA-256 over length-prefixed parts, reduced to a scalar
pub fn hash_to_scalar(domain: &[u8], parts: &[&[u8]]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update((domain.len() as u32).to_be_bytes());
    hasher.update(domain);
    for part in parts {
        hasher.update((part.len() as u32).to_be_bytes());
        hasher.update(part);
    }
    let digest: [u8; 32] = hasher.finalize().into();
    <Scalar as Reduce<U256>>::reduce_bytes(&digest.into())
}

/// Keccak-256 of the concatenated parts, reduced to a scalar
pub fn keccak_to_scalar(parts: &[&[u8]]) -> Scalar {
    let digest = keccak256(parts);
    <Scalar as Reduce<U256>>::reduce_bytes(&digest.into())
}

pub fn keccak256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Ethereum style address: last 20 bytes of keccak(uncompressed x || y)
pub fn address_bytes(point: &ProjectivePoint) -> [u8; 20] {
    let encoded = point.to_affine().to_encoded_point(false);
    let bytes = encoded.as_bytes();
    // identity encodes as a single byte; hash it as-is so callers still get a value
    let body = if bytes.len() == 65 { &bytes[1..] } else { bytes };
    let digest = keccak256(&[body]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

pub fn address(point: &ProjectivePoint) -> String {
    format!("0x{}", hex::encode(address_bytes(point)))
}

/// Parse a 32-byte message hash
pub fn hash32_from_hex(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| NodeError::schema(format!("invalid hash hex: {}", e)))?;
    bytes
        .try_into()
        .map_err(|_| NodeError::schema("hash must be 32 bytes"))
}
