//! Error types for key-store operations.

use thiserror::Error;

/// Errors that can occur during key-store operations.
#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Key with the specified identifier not found.
    #[error("Key not found: {key_id}")]
    KeyNotFound {
        /// The key identifier that was not found.
        key_id: String,
    },

    /// Key already exists with this identifier.
    #[error("Key already exists: {key_id}")]
    KeyAlreadyExists {
        /// The key identifier that already exists.
        key_id: String,
    },

    /// Destruction (or another privileged operation) lacked a valid quorum.
    #[error("Authorization denied: {reason}")]
    AuthorizationDenied {
        /// Reason the authorization was rejected.
        reason: String,
    },

    /// Backend fault: hardware unreachable, sealed storage corrupt.
    ///
    /// Callers must surface this as a signing-backend error; they must
    /// never fall back to a weaker backend on their own.
    #[error("Key-store backend failure: {reason}")]
    BackendFailure {
        /// Reason for the failure.
        reason: String,
    },

    /// Persistent storage operation failed.
    #[error("Storage failed: {reason}")]
    StorageFailed {
        /// Reason for the failure.
        reason: String,
    },

    /// Invalid key material or encoding.
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// Reason the key is invalid.
        reason: String,
    },

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] lumen_crypto::CryptoError),
}

impl KeystoreError {
    /// Create a backend failure from a reason.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::BackendFailure {
            reason: reason.into(),
        }
    }

    /// Create an authorization-denied error from a reason.
    #[must_use]
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::AuthorizationDenied {
            reason: reason.into(),
        }
    }

    /// Create a storage failure from a reason.
    #[must_use]
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageFailed {
            reason: reason.into(),
        }
    }
}
