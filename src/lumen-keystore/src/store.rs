//! Key-store capability trait and configuration.
//!
//! This module defines the [`KeyStore`] trait that both backends
//! implement. The signing core depends only on this trait, never on a
//! concrete backend, so backend swapping requires no core changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use lumen_crypto::{verify_detached, SignatureAlgorithm};

use crate::error::KeystoreError;

/// Opaque identifier for a key held by a store.
///
/// All operations are performed by reference to this identifier; no API
/// ever moves private material across the store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyId(String);

impl KeyId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Which backend a store runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Passphrase-protected software store. Private material is
    /// encrypted at rest but extractable by an attacker with the
    /// passphrase and system access.
    Software,

    /// Isolated store. Private material never leaves the boundary;
    /// operations go through opaque key identifiers only.
    Isolated,
}

/// A generated key as seen from outside the store: identifier, algorithm
/// and public half only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyHandle {
    /// Opaque identifier for subsequent operations.
    pub key_id: KeyId,
    /// Signature algorithm the key uses.
    pub algorithm: SignatureAlgorithm,
    /// Public key bytes.
    pub public_key: Vec<u8>,
    /// Creation time (unix seconds).
    pub created_at: i64,
}

/// Configuration for key generation.
#[derive(Debug, Clone)]
pub struct KeyGenConfig {
    /// Label prefixed to the generated key identifier.
    pub label: String,

    /// Explicit key identifier. When `None` the store derives one from
    /// the label and random suffix.
    pub key_id: Option<KeyId>,
}

impl Default for KeyGenConfig {
    fn default() -> Self {
        Self {
            label: "lumen_signing_key".to_string(),
            key_id: None,
        }
    }
}

impl KeyGenConfig {
    /// Create a new configuration with the given label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    /// Pin the generated key to an explicit identifier.
    #[must_use]
    pub fn with_key_id(mut self, key_id: KeyId) -> Self {
        self.key_id = Some(key_id);
        self
    }
}

/// One approver's signature over a pending key destruction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestructionSignature {
    /// Identifier of the approving operator.
    pub approver_id: String,
    /// Ed25519 signature over the destruction payload for the key.
    pub signature: Vec<u8>,
}

/// Quorum approval required to destroy a key.
///
/// Distinct from message-level authorizations, but validated the same
/// way: each approver signs the destruction payload with their own
/// registered key.
#[derive(Debug, Clone, Default)]
pub struct DestructionApproval {
    /// Approver signatures, one per distinct approver.
    pub approvals: Vec<DestructionSignature>,
}

impl DestructionApproval {
    /// The canonical payload an approver signs to endorse destroying `key_id`.
    #[must_use]
    pub fn payload(key_id: &KeyId) -> Vec<u8> {
        format!("lumen-destroy-key:{key_id}").into_bytes()
    }
}

/// Policy governing authorized key destruction.
#[derive(Debug, Clone, Default)]
pub struct DestructionPolicy {
    /// Number of distinct approvers required.
    pub required: usize,
    /// Registered approver Ed25519 public keys, by approver identifier.
    pub approver_keys: HashMap<String, Vec<u8>>,
}

impl DestructionPolicy {
    /// Validate a destruction approval against this policy.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::AuthorizationDenied`] when the approval
    /// has too few distinct approvers, an unregistered approver, or a
    /// signature that does not verify.
    pub fn validate(
        &self,
        key_id: &KeyId,
        approval: &DestructionApproval,
    ) -> Result<(), KeystoreError> {
        let payload = DestructionApproval::payload(key_id);
        let mut seen = std::collections::HashSet::new();

        for entry in &approval.approvals {
            if !seen.insert(entry.approver_id.as_str()) {
                return Err(KeystoreError::denied(format!(
                    "duplicate destruction approver '{}'",
                    entry.approver_id
                )));
            }

            let public_key = self.approver_keys.get(&entry.approver_id).ok_or_else(|| {
                KeystoreError::denied(format!(
                    "approver '{}' not registered for key destruction",
                    entry.approver_id
                ))
            })?;

            let valid = verify_detached(
                SignatureAlgorithm::Ed25519,
                public_key,
                &payload,
                &entry.signature,
            )
            .unwrap_or(false);

            if !valid {
                return Err(KeystoreError::denied(format!(
                    "destruction signature from '{}' did not verify",
                    entry.approver_id
                )));
            }
        }

        if seen.len() < self.required {
            return Err(KeystoreError::denied(format!(
                "key destruction requires {} distinct approvers, got {}",
                self.required,
                seen.len()
            )));
        }

        Ok(())
    }
}

/// Capability interface over signing-key custody.
///
/// ## Security Properties
///
/// - `sign()` never returns or logs private key material
/// - `generate_key()` returns only a public key and an identifier
/// - `destroy()` fails unless presented with a valid quorum approval
/// - backend faults surface as [`KeystoreError::BackendFailure`]; a
///   store never silently substitutes a weaker backend
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Which backend this store runs on.
    fn backend(&self) -> BackendKind;

    /// Generate a new signing key.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::KeyAlreadyExists`] when an explicit
    /// identifier collides, or a backend/storage error.
    async fn generate_key(&self, config: &KeyGenConfig) -> Result<KeyHandle, KeystoreError>;

    /// Sign data with the named key.
    ///
    /// The private key never crosses the store boundary.
    async fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, KeystoreError>;

    /// Export the public key for the named key.
    async fn public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeystoreError>;

    /// Check whether a key exists.
    async fn contains(&self, key_id: &KeyId) -> Result<bool, KeystoreError>;

    /// List handles for every key in the store.
    async fn list_keys(&self) -> Result<Vec<KeyHandle>, KeystoreError>;

    /// Destroy a key, gated on a destruction quorum.
    ///
    /// # Errors
    ///
    /// Returns [`KeystoreError::AuthorizationDenied`] when the approval
    /// fails policy validation, [`KeystoreError::KeyNotFound`] when the
    /// key does not exist.
    async fn destroy(
        &self,
        key_id: &KeyId,
        approval: &DestructionApproval,
    ) -> Result<(), KeystoreError>;
}
