//! Algorithm identification for Lumen signatures.
//!
//! Every signature and key record in the system is tagged with its
//! algorithm so control-point and field-device software can coexist
//! across key rotations that change the algorithm.

use serde::{Deserialize, Serialize};

/// Signature algorithm for alert signing.
///
/// The software key store signs with Ed25519. The isolated (HSM-class)
/// store signs with ECDSA P-256, the algorithm that secure elements
/// actually implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SignatureAlgorithm {
    /// Ed25519 Edwards curve signatures.
    #[default]
    Ed25519 = 1,

    /// ECDSA with NIST P-256 (secp256r1), fixed-size R || S signatures.
    EcdsaP256 = 2,
}

impl SignatureAlgorithm {
    /// Signature size in bytes.
    #[must_use]
    pub const fn signature_size(&self) -> usize {
        match self {
            Self::Ed25519 => 64,
            Self::EcdsaP256 => 64, // R (32) + S (32)
        }
    }

    /// Public key size in bytes.
    #[must_use]
    pub const fn public_key_size(&self) -> usize {
        match self {
            Self::Ed25519 => 32,
            Self::EcdsaP256 => 65, // Uncompressed: 0x04 || X (32) || Y (32)
        }
    }
}
