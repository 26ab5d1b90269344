//! Isolated key store.
//!
//! Models an HSM-class boundary: private material lives inside the
//! [`SealedBoundary`] and is only ever used by reference to an opaque
//! [`KeyId`]. The public API has no export path for private keys, and
//! the boundary type never leaves this module.
//!
//! Signing uses ECDSA P-256, the algorithm secure elements implement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use rand::RngCore;

use lumen_crypto::{AlertSigner, P256Signer, SignatureAlgorithm};

use crate::error::KeystoreError;
use crate::store::{
    BackendKind, DestructionApproval, DestructionPolicy, KeyGenConfig, KeyHandle, KeyId, KeyStore,
};

/// Private material held inside the boundary. Not `Clone`, never
/// returned by any public method.
struct SealedEntry {
    signer: P256Signer,
    public_key: Vec<u8>,
    created_at: i64,
}

/// The sealed region. Only [`IsolatedKeyStore`] methods touch it.
struct SealedBoundary {
    entries: HashMap<KeyId, SealedEntry>,
}

/// Isolated key store backend.
///
/// All operations go through opaque key identifiers; private material
/// never crosses the store boundary. When the backing module is
/// unreachable, every operation fails with
/// [`KeystoreError::BackendFailure`] - there is no fallback to a weaker
/// backend.
pub struct IsolatedKeyStore {
    boundary: RwLock<SealedBoundary>,
    destruction: DestructionPolicy,
    /// Models the secure element being unreachable (unplugged module,
    /// bus fault). Set by maintenance tooling and fault-injection tests.
    offline: AtomicBool,
}

impl IsolatedKeyStore {
    /// Open an isolated key store.
    #[must_use]
    pub fn open(destruction: DestructionPolicy) -> Self {
        tracing::info!("IsolatedKeyStore: opened (ECDSA P-256, keys non-exportable)");
        Self {
            boundary: RwLock::new(SealedBoundary {
                entries: HashMap::new(),
            }),
            destruction,
            offline: AtomicBool::new(false),
        }
    }

    /// Mark the backing module reachable or unreachable.
    ///
    /// While unreachable, all operations fail with
    /// [`KeystoreError::BackendFailure`].
    pub fn set_offline(&self, offline: bool) {
        if offline {
            tracing::error!("IsolatedKeyStore: backing module unreachable");
        } else {
            tracing::info!("IsolatedKeyStore: backing module reachable");
        }
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_reachable(&self) -> Result<(), KeystoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KeystoreError::backend("secure element unreachable"));
        }
        Ok(())
    }

    fn derive_key_id(config: &KeyGenConfig) -> KeyId {
        if let Some(key_id) = &config.key_id {
            return key_id.clone();
        }

        let mut suffix = [0u8; 6];
        rand::thread_rng().fill_bytes(&mut suffix);
        KeyId::new(format!("{}-{}", config.label, hex::encode(suffix)))
    }
}

#[async_trait]
impl KeyStore for IsolatedKeyStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Isolated
    }

    async fn generate_key(&self, config: &KeyGenConfig) -> Result<KeyHandle, KeystoreError> {
        self.check_reachable()?;

        let key_id = Self::derive_key_id(config);
        let signer = P256Signer::random();
        let public_key = signer.public_key()?;
        let created_at = chrono::Utc::now().timestamp();

        {
            let mut boundary = self
                .boundary
                .write()
                .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;

            if boundary.entries.contains_key(&key_id) {
                return Err(KeystoreError::KeyAlreadyExists {
                    key_id: key_id.to_string(),
                });
            }

            boundary.entries.insert(
                key_id.clone(),
                SealedEntry {
                    signer,
                    public_key: public_key.clone(),
                    created_at,
                },
            );
        }

        tracing::info!(key_id = %key_id, "IsolatedKeyStore: generated P-256 key inside boundary");

        Ok(KeyHandle {
            key_id,
            algorithm: SignatureAlgorithm::EcdsaP256,
            public_key,
            created_at,
        })
    }

    async fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        self.check_reachable()?;

        let boundary = self
            .boundary
            .read()
            .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;

        let entry = boundary
            .entries
            .get(key_id)
            .ok_or_else(|| KeystoreError::KeyNotFound {
                key_id: key_id.to_string(),
            })?;

        Ok(entry.signer.sign(data)?)
    }

    async fn public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeystoreError> {
        self.check_reachable()?;

        let boundary = self
            .boundary
            .read()
            .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;

        boundary
            .entries
            .get(key_id)
            .map(|e| e.public_key.clone())
            .ok_or_else(|| KeystoreError::KeyNotFound {
                key_id: key_id.to_string(),
            })
    }

    async fn contains(&self, key_id: &KeyId) -> Result<bool, KeystoreError> {
        self.check_reachable()?;

        let boundary = self
            .boundary
            .read()
            .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;
        Ok(boundary.entries.contains_key(key_id))
    }

    async fn list_keys(&self) -> Result<Vec<KeyHandle>, KeystoreError> {
        self.check_reachable()?;

        let boundary = self
            .boundary
            .read()
            .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;

        Ok(boundary
            .entries
            .iter()
            .map(|(key_id, entry)| KeyHandle {
                key_id: key_id.clone(),
                algorithm: SignatureAlgorithm::EcdsaP256,
                public_key: entry.public_key.clone(),
                created_at: entry.created_at,
            })
            .collect())
    }

    async fn destroy(
        &self,
        key_id: &KeyId,
        approval: &DestructionApproval,
    ) -> Result<(), KeystoreError> {
        self.check_reachable()?;
        self.destruction.validate(key_id, approval)?;

        let mut boundary = self
            .boundary
            .write()
            .map_err(|_| KeystoreError::backend("boundary lock poisoned"))?;

        if boundary.entries.remove(key_id).is_none() {
            return Err(KeystoreError::KeyNotFound {
                key_id: key_id.to_string(),
            });
        }

        tracing::warn!(key_id = %key_id, "IsolatedKeyStore: key destroyed under quorum approval");
        Ok(())
    }
}
