//! Curve arithmetic, secret sharing and signature schemes

pub mod curve;
pub mod frost;
pub mod lagrange;
pub mod polynomial;
pub mod schnorr;

pub use curve::{ProjectivePoint, Scalar};
