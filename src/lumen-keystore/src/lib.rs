//! # lumen-keystore
//!
//! Key custody for the Lumen alert-signing core.
//!
//! The [`KeyStore`] trait is a capability interface over signing-key
//! custody: generate, sign by reference, export the public half, and
//! quorum-gated destruction. Two conforming backends exist:
//!
//! | Backend | Algorithm | Isolation |
//! |---------|-----------|-----------|
//! | [`SoftwareKeyStore`] | Ed25519 | Passphrase-encrypted at rest |
//! | [`IsolatedKeyStore`] | ECDSA P-256 | Keys never leave the boundary |
//!
//! The signing core depends only on the trait. Backend selection is an
//! explicit deployment decision made once at open time - a fault in one
//! backend never silently falls back to the other.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod isolated;
mod software;
mod store;

pub use error::KeystoreError;
pub use isolated::IsolatedKeyStore;
pub use software::SoftwareKeyStore;
pub use store::{
    BackendKind, DestructionApproval, DestructionPolicy, DestructionSignature, KeyGenConfig,
    KeyHandle, KeyId, KeyStore,
};

use std::path::PathBuf;
use std::sync::Arc;

/// Deployment selection of a key-store backend.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    /// Passphrase-protected software store, optionally persisted.
    Software {
        /// Passphrase protecting seeds at rest.
        passphrase: String,
        /// Directory for persistence; memory-only when `None`.
        storage_dir: Option<PathBuf>,
    },
    /// Isolated (HSM-class) store.
    Isolated,
}

/// Open the configured key-store backend.
///
/// The choice is logged so a deployment without isolation is visible in
/// the operational record.
///
/// # Errors
///
/// Returns storage errors from opening a persisted software store.
pub fn open_key_store(
    config: BackendConfig,
    destruction: DestructionPolicy,
) -> Result<Arc<dyn KeyStore>, KeystoreError> {
    match config {
        BackendConfig::Software {
            passphrase,
            storage_dir,
        } => {
            tracing::warn!("Key store backend: software (no hardware isolation)");
            Ok(Arc::new(SoftwareKeyStore::open(
                &passphrase,
                storage_dir,
                destruction,
            )?))
        }
        BackendConfig::Isolated => {
            tracing::info!("Key store backend: isolated");
            Ok(Arc::new(IsolatedKeyStore::open(destruction)))
        }
    }
}
