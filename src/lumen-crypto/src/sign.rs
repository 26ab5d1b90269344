//! Signer and verifier traits plus the shared verification dispatch.
//!
//! [`verify_detached`] is the single verification primitive in Lumen.
//! The edge verifier, the mutual-aid relay, and the external alert gate
//! all call it with a different key substituted in: a tier key, a peer
//! jurisdiction key, or a trust-anchor key.

use crate::error::CryptoError;
use crate::types::SignatureAlgorithm;

/// Trait for detached-signature creation.
pub trait AlertSigner {
    /// Get the algorithm used by this signer.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Get the public key.
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Sign data and return the detached signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Trait for detached-signature verification.
///
/// `Ok(false)` means a well-formed signature that does not verify;
/// `Err(_)` means the key or signature could not even be parsed. Callers
/// enforcing a reject-don't-throw contract must treat both as rejection.
pub trait AlertVerifier {
    /// Verify a signature against a public key.
    fn verify(&self, public_key: &[u8], data: &[u8], signature: &[u8])
        -> Result<bool, CryptoError>;
}

/// Verify a detached signature under the named algorithm.
///
/// Dispatches to the matching [`AlertVerifier`] implementation.
///
/// # Errors
///
/// Returns error only for malformed key or signature encodings; a
/// signature that simply does not verify yields `Ok(false)`.
pub fn verify_detached(
    algorithm: SignatureAlgorithm,
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<bool, CryptoError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            crate::ed25519::Ed25519Verifier::new().verify(public_key, data, signature)
        }
        SignatureAlgorithm::EcdsaP256 => {
            crate::ecdsa::P256Verifier::new().verify(public_key, data, signature)
        }
    }
}
