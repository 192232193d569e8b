//! Secret polynomials and their Feldman / Pedersen commitments
//!
//! Every protocol run publishes Feldman commitments. [`PedersenCommitment`]
//! is a standalone primitive for hiding commitments; no protocol uses it yet.

use super::curve::{
    point_from_hex, point_to_bytes, point_to_hex, random_scalar, scalar_from_id, ProjectivePoint,
    Scalar,
};
use crate::error::{NodeError, Result};
use crate::types::PartnerId;
use k256::elliptic_curve::sec1::FromEncodedPoint;
use k256::{AffinePoint, EncodedPoint};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Polynomial of degree t-1 over the secp256k1 scalar field.
///
/// f(x) = a_0 + a_1*x + ... + a_{t-1}*x^{t-1}
#[derive(Clone)]
pub struct Polynomial {
    coefficients: Vec<Scalar>,
}

impl std::fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polynomial")
            .field("threshold", &self.coefficients.len())
            .finish_non_exhaustive()
    }
}

impl Polynomial {
    /// Random polynomial for threshold `t`
    pub fn random(t: usize) -> Self {
        Self::with_secret(t, random_scalar())
    }

    /// Random polynomial whose constant term is `secret`
    pub fn with_secret(t: usize, secret: Scalar) -> Self {
        let mut coefficients = Vec::with_capacity(t.max(1));
        coefficients.push(secret);
        for _ in 1..t {
            coefficients.push(random_scalar());
        }
        Self { coefficients }
    }

    pub fn from_coefficients(coefficients: Vec<Scalar>) -> Result<Self> {
        if coefficients.is_empty() {
            return Err(NodeError::crypto("polynomial needs at least one coefficient"));
        }
        Ok(Self { coefficients })
    }

    pub fn threshold(&self) -> usize {
        self.coefficients.len()
    }

    pub fn secret(&self) -> Scalar {
        self.coefficients[0]
    }

    pub fn coefficients(&self) -> &[Scalar] {
        &self.coefficients
    }

    /// Horner evaluation
    pub fn evaluate(&self, x: &Scalar) -> Scalar {
        self.coefficients
            .iter()
            .rev()
            .fold(Scalar::ZERO, |acc, coeff| acc * x + coeff)
    }

    /// Share for a partner (x = partner id)
    pub fn evaluate_at(&self, id: PartnerId) -> Scalar {
        self.evaluate(&scalar_from_id(id))
    }

    /// Feldman commitment Fx = [g^a_0, ..., g^a_{t-1}]
    pub fn commitment(&self) -> Commitment {
        Commitment(
            self.coefficients
                .iter()
                .map(|coeff| ProjectivePoint::GENERATOR * coeff)
                .collect(),
        )
    }
}

/// Feldman commitment to a polynomial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commitment(Vec<ProjectivePoint>);

impl Commitment {
    pub fn new(points: Vec<ProjectivePoint>) -> Result<Self> {
        if points.is_empty() {
            return Err(NodeError::schema("commitment needs at least one point"));
        }
        Ok(Self(points))
    }

    pub fn threshold(&self) -> usize {
        self.0.len()
    }

    pub fn points(&self) -> &[ProjectivePoint] {
        &self.0
    }

    /// g^{a_0}: the public value of the shared secret
    pub fn constant(&self) -> ProjectivePoint {
        self.0[0]
    }

    /// Σ Fx_k * x^k
    pub fn evaluate(&self, x: &Scalar) -> ProjectivePoint {
        self.0
            .iter()
            .rev()
            .fold(ProjectivePoint::IDENTITY, |acc, point| acc * x + point)
    }

    /// Public counterpart of the share held by partner `id`
    pub fn public_share(&self, id: PartnerId) -> ProjectivePoint {
        self.evaluate(&scalar_from_id(id))
    }

    /// Checks g^share == Σ Fx_k * id^k
    pub fn verify_share(&self, id: PartnerId, share: &Scalar) -> bool {
        ProjectivePoint::GENERATOR * share == self.public_share(id)
    }

    /// Coefficient-wise sum; commitments of different thresholds are rejected
    pub fn add(&self, other: &Commitment) -> Result<Commitment> {
        if self.threshold() != other.threshold() {
            return Err(NodeError::verification(format!(
                "commitment threshold mismatch: {} vs {}",
                self.threshold(),
                other.threshold()
            )));
        }
        Ok(Commitment(
            self.0.iter().zip(&other.0).map(|(a, b)| *a + b).collect(),
        ))
    }

    /// Multiply every coefficient point by `factor`
    pub fn scale(&self, factor: &Scalar) -> Commitment {
        Commitment(self.0.iter().map(|p| *p * factor).collect())
    }

    pub fn to_hex(&self) -> Vec<String> {
        self.0.iter().map(point_to_hex).collect()
    }

    pub fn from_hex(values: &[String]) -> Result<Self> {
        let points = values
            .iter()
            .map(|v| point_from_hex(v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(points)
    }

    /// Digest used to cross-check that partners saw the same commitments
    pub fn digest_into(&self, hasher: &mut Sha256) {
        for point in &self.0 {
            hasher.update(point_to_bytes(point));
        }
    }
}

/// Serialized form `{t, Fx[hex]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentJson {
    pub t: usize,
    #[serde(rename = "Fx")]
    pub fx: Vec<String>,
}

impl From<&Commitment> for CommitmentJson {
    fn from(commitment: &Commitment) -> Self {
        Self {
            t: commitment.threshold(),
            fx: commitment.to_hex(),
        }
    }
}

impl TryFrom<&CommitmentJson> for Commitment {
    type Error = NodeError;

    fn try_from(json: &CommitmentJson) -> Result<Self> {
        let commitment = Commitment::from_hex(&json.fx)?;
        if commitment.threshold() != json.t {
            return Err(NodeError::schema(format!(
                "polynomial t={} but {} commitments",
                json.t,
                commitment.threshold()
            )));
        }
        Ok(commitment)
    }
}

/// Second generator H for Pedersen commitments.
///
/// Found by try-and-increment on SHA-256 so nobody knows log_g(H).
pub fn pedersen_generator() -> ProjectivePoint {
    let mut counter: u32 = 0;
    loop {
        let mut hasher = Sha256::new();
        hasher.update(b"mpc-node/pedersen-h");
        hasher.update(counter.to_be_bytes());
        let x: [u8; 32] = hasher.finalize().into();

        let mut candidate = [0u8; 33];
        candidate[0] = 0x02;
        candidate[1..].copy_from_slice(&x);
        if let Ok(encoded) = EncodedPoint::from_bytes(candidate) {
            let decoded = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded));
            if let Some(point) = decoded {
                return ProjectivePoint::from(point);
            }
        }
        counter += 1;
    }
}

/// Pedersen commitment C_k = g^{a_k} * H^{b_k} for secret f and blinding h
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PedersenCommitment {
    points: Vec<ProjectivePoint>,
}

impl PedersenCommitment {
    pub fn new(secret: &Polynomial, blinding: &Polynomial) -> Result<Self> {
        if secret.threshold() != blinding.threshold() {
            return Err(NodeError::crypto("secret and blinding polynomial degree differ"));
        }
        let h = pedersen_generator();
        let points = secret
            .coefficients()
            .iter()
            .zip(blinding.coefficients())
            .map(|(a, b)| ProjectivePoint::GENERATOR * a + h * b)
            .collect();
        Ok(Self { points })
    }

    pub fn points(&self) -> &[ProjectivePoint] {
        &self.points
    }

    /// Checks g^{f(i)} * H^{h(i)} == Σ C_k * i^k without learning f(i) alone
    pub fn verify_share(&self, id: PartnerId, share: &Scalar, blinding_share: &Scalar) -> bool {
        let x = scalar_from_id(id);
        let expected = self
            .points
            .iter()
            .rev()
            .fold(ProjectivePoint::IDENTITY, |acc, point| acc * x + point);
        ProjectivePoint::GENERATOR * share + pedersen_generator() * blinding_share == expected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polynomial_evaluation() {
        // f(x) = 5 + 3x
        let poly =
            Polynomial::from_coefficients(vec![Scalar::from(5u64), Scalar::from(3u64)]).unwrap();
        assert_eq!(poly.evaluate_at(1), Scalar::from(8u64));
        assert_eq!(poly.evaluate_at(2), Scalar::from(11u64));
        assert_eq!(poly.evaluate_at(3), Scalar::from(14u64));
    }

    #[test]
    fn test_feldman_share_verification() {
        let poly = Polynomial::random(3);
        let commitment = poly.commitment();
        for id in 1..=5u16 {
            assert!(commitment.verify_share(id, &poly.evaluate_at(id)));
        }
        let wrong = poly.evaluate_at(2) + Scalar::ONE;
        assert!(!commitment.verify_share(2, &wrong));
    }

    #[test]
    fn test_commitment_sum_matches_polynomial_sum() {
        let a = Polynomial::random(2);
        let b = Polynomial::random(2);
        let sum = a.commitment().add(&b.commitment()).unwrap();
        let share = a.evaluate_at(4) + b.evaluate_at(4);
        assert!(sum.verify_share(4, &share));
        assert!(a.commitment().add(&Polynomial::random(3).commitment()).is_err());
    }

    #[test]
    fn test_seeded_constant_term() {
        let secret = Scalar::from(42u64);
        let poly = Polynomial::with_secret(3, secret);
        assert_eq!(poly.secret(), secret);
        assert_eq!(poly.evaluate(&Scalar::ZERO), secret);
        assert_eq!(
            poly.commitment().constant(),
            ProjectivePoint::GENERATOR * secret
        );
    }

    #[test]
    fn test_commitment_json() {
        let commitment = Polynomial::random(3).commitment();
        let json = CommitmentJson::from(&commitment);
        assert_eq!(json.t, 3);
        let parsed = Commitment::try_from(&json).unwrap();
        assert_eq!(parsed, commitment);

        let mut wrong_t = json.clone();
        wrong_t.t = 2;
        assert!(Commitment::try_from(&wrong_t).is_err());
    }

    #[test]
    fn test_pedersen_share_verification() {
        let f = Polynomial::random(3);
        let h = Polynomial::random(3);
        let commitment = PedersenCommitment::new(&f, &h).unwrap();
        assert!(commitment.verify_share(2, &f.evaluate_at(2), &h.evaluate_at(2)));
        assert!(!commitment.verify_share(2, &f.evaluate_at(3), &h.evaluate_at(2)));
        assert_ne!(pedersen_generator(), ProjectivePoint::GENERATOR);
    }
}
