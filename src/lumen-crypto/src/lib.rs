//! # lumen-crypto
//!
//! Signature primitives for the Lumen alert-signing core.
//!
//! Two detached-signature algorithms are supported, matching the two
//! key-store backends:
//! - **Ed25519** - software key store, operator authorization signatures
//! - **ECDSA P-256** - isolated (HSM-class) key store
//!
//! All verification in the system funnels through a single primitive,
//! [`verify_detached`], with a different public key substituted per
//! trust domain (tier key, peer jurisdiction key, or trust anchor).

#![warn(missing_docs)]
#![warn(clippy::all)]

mod ecdsa;
mod ed25519;
mod error;
mod sign;
mod types;

pub use ecdsa::{P256Signer, P256Verifier};
pub use ed25519::{Ed25519Signer, Ed25519Verifier};
pub use error::CryptoError;
pub use sign::{verify_detached, AlertSigner, AlertVerifier};
pub use types::SignatureAlgorithm;

/// Constant-time byte comparison.
///
/// Compares two byte slices in constant time to prevent timing attacks.
/// Returns `true` if the slices are equal, `false` otherwise.
///
/// # Security
///
/// This function MUST be used for all cryptographic comparisons
/// (signatures, hashes, key identifiers derived from secrets).
///
/// Uses the `subtle` crate's `ConstantTimeEq` trait for the comparison.
/// The length check still returns early, but length is typically not secret.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;

    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
