//! Passphrase-protected software key store.
//!
//! WARNING: This backend provides NO hardware isolation. Seeds are
//! encrypted at rest under a passphrase-derived key, but an attacker
//! with the passphrase and system access can extract them.
//!
//! Use for development, simulators, and control points that have not
//! yet been provisioned with an isolated store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use lumen_crypto::{AlertSigner, Ed25519Signer, SignatureAlgorithm};

use crate::error::KeystoreError;
use crate::store::{
    BackendKind, DestructionApproval, DestructionPolicy, KeyGenConfig, KeyHandle, KeyId, KeyStore,
};

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

/// Salt file name inside the storage directory.
const SALT_FILE: &str = ".salt";

/// A key at rest: public half in the clear, seed sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedKey {
    algorithm: SignatureAlgorithm,
    public_key: Vec<u8>,
    /// nonce || ciphertext of the 32-byte Ed25519 seed.
    sealed_seed: Vec<u8>,
    created_at: i64,
}

/// Passphrase-protected software key store.
///
/// Ed25519 seeds are encrypted at rest with XChaCha20-Poly1305 under a
/// key derived from the passphrase and a per-store salt. With a storage
/// directory configured, keys persist across restarts; otherwise the
/// store is memory-only.
pub struct SoftwareKeyStore {
    keys: RwLock<HashMap<KeyId, SealedKey>>,
    encryption_key: Zeroizing<[u8; 32]>,
    storage_dir: Option<PathBuf>,
    destruction: DestructionPolicy,
}

impl SoftwareKeyStore {
    /// Open (or create) a software key store.
    ///
    /// # Arguments
    ///
    /// * `passphrase` - Passphrase protecting seeds at rest
    /// * `storage_dir` - Optional directory for persistence
    /// * `destruction` - Quorum policy for key destruction
    ///
    /// # Errors
    ///
    /// Returns a storage error when the directory or an existing key
    /// file cannot be read, or when a persisted seed fails to decrypt
    /// (wrong passphrase or tampered file).
    pub fn open(
        passphrase: &str,
        storage_dir: Option<PathBuf>,
        destruction: DestructionPolicy,
    ) -> Result<Self, KeystoreError> {
        let salt = Self::load_or_create_salt(storage_dir.as_deref())?;

        let mut hasher = Sha256::new();
        hasher.update(b"lumen-keystore-seal:");
        hasher.update(&salt);
        hasher.update(passphrase.as_bytes());
        let encryption_key: Zeroizing<[u8; 32]> = Zeroizing::new(hasher.finalize().into());

        let store = Self {
            keys: RwLock::new(HashMap::new()),
            encryption_key,
            storage_dir,
            destruction,
        };

        store.load_existing()?;

        tracing::warn!(
            persistent = store.storage_dir.is_some(),
            "SoftwareKeyStore: NO HARDWARE ISOLATION - seeds are extractable with the passphrase"
        );

        Ok(store)
    }

    fn load_or_create_salt(storage_dir: Option<&std::path::Path>) -> Result<[u8; 16], KeystoreError> {
        let mut salt = [0u8; 16];

        let Some(dir) = storage_dir else {
            // Memory-only store: ephemeral salt.
            rand::thread_rng().fill_bytes(&mut salt);
            return Ok(salt);
        };

        std::fs::create_dir_all(dir)
            .map_err(|e| KeystoreError::storage(format!("create store dir: {e}")))?;

        let salt_path = dir.join(SALT_FILE);
        if salt_path.exists() {
            let bytes = std::fs::read(&salt_path)
                .map_err(|e| KeystoreError::storage(format!("read salt: {e}")))?;
            if bytes.len() != 16 {
                return Err(KeystoreError::storage("salt file corrupt"));
            }
            salt.copy_from_slice(&bytes);
        } else {
            rand::thread_rng().fill_bytes(&mut salt);
            std::fs::write(&salt_path, salt)
                .map_err(|e| KeystoreError::storage(format!("write salt: {e}")))?;
        }

        Ok(salt)
    }

    /// Load persisted keys from the storage directory.
    fn load_existing(&self) -> Result<(), KeystoreError> {
        let Some(dir) = &self.storage_dir else {
            return Ok(());
        };

        let entries = std::fs::read_dir(dir)
            .map_err(|e| KeystoreError::storage(format!("read store dir: {e}")))?;

        let mut keys = self
            .keys
            .write()
            .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("key") {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let data = std::fs::read(&path)
                .map_err(|e| KeystoreError::storage(format!("read key file: {e}")))?;
            let sealed: SealedKey = serde_json::from_slice(&data)
                .map_err(|e| KeystoreError::storage(format!("parse key file: {e}")))?;

            // Fail loudly on an undecryptable seed rather than carrying a
            // key the store can never sign with.
            self.unseal_seed(&sealed.sealed_seed)?;

            tracing::debug!(key_id = %stem, "SoftwareKeyStore: loaded key");
            keys.insert(KeyId::new(stem), sealed);
        }

        tracing::info!(count = keys.len(), "SoftwareKeyStore: loaded persisted keys");
        Ok(())
    }

    fn persist(&self, key_id: &KeyId, sealed: &SealedKey) -> Result<(), KeystoreError> {
        let Some(dir) = &self.storage_dir else {
            return Ok(());
        };

        let data = serde_json::to_vec(sealed)
            .map_err(|e| KeystoreError::storage(format!("serialize key: {e}")))?;
        let path = dir.join(format!("{key_id}.key"));
        std::fs::write(&path, data)
            .map_err(|e| KeystoreError::storage(format!("write key file: {e}")))
    }

    /// Encrypt a seed: random nonce prepended to the ciphertext.
    fn seal_seed(&self, seed: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(self.encryption_key.as_ref())
            .map_err(|e| KeystoreError::backend(format!("cipher init: {e}")))?;

        let ciphertext = cipher
            .encrypt(nonce, seed)
            .map_err(|e| KeystoreError::backend(format!("seal seed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal_seed(&self, sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
        if sealed.len() < NONCE_SIZE {
            return Err(KeystoreError::storage("sealed seed too short"));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(self.encryption_key.as_ref())
            .map_err(|e| KeystoreError::backend(format!("cipher init: {e}")))?;

        let seed = cipher.decrypt(nonce, ciphertext).map_err(|_| {
            KeystoreError::storage("seed decryption failed (wrong passphrase or tampered file)")
        })?;

        Ok(Zeroizing::new(seed))
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
impl KeyStore for SoftwareKeyStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Software
    }

    async fn generate_key(&self, config: &KeyGenConfig) -> Result<KeyHandle, KeystoreError> {
        let key_id = Self::derive_key_id(config);

        let signer = Ed25519Signer::random();
        let public_key = signer.public_key()?;
        let sealed_seed = self.seal_seed(signer.seed().as_ref())?;

        let sealed = SealedKey {
            algorithm: SignatureAlgorithm::Ed25519,
            public_key: public_key.clone(),
            sealed_seed,
            created_at: chrono::Utc::now().timestamp(),
        };

        {
            let mut keys = self
                .keys
                .write()
                .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;

            if keys.contains_key(&key_id) {
                return Err(KeystoreError::KeyAlreadyExists {
                    key_id: key_id.to_string(),
                });
            }

            keys.insert(key_id.clone(), sealed.clone());
        }

        self.persist(&key_id, &sealed)?;

        tracing::info!(key_id = %key_id, "SoftwareKeyStore: generated Ed25519 key");

        Ok(KeyHandle {
            key_id,
            algorithm: sealed.algorithm,
            public_key,
            created_at: sealed.created_at,
        })
    }

    async fn sign(&self, key_id: &KeyId, data: &[u8]) -> Result<Vec<u8>, KeystoreError> {
        let sealed = {
            let keys = self
                .keys
                .read()
                .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;
            keys.get(key_id)
                .cloned()
                .ok_or_else(|| KeystoreError::KeyNotFound {
                    key_id: key_id.to_string(),
                })?
        };

        let seed = self.unseal_seed(&sealed.sealed_seed)?;
        let signer = Ed25519Signer::from_seed(&seed)?;

        Ok(signer.sign(data)?)
    }

    async fn public_key(&self, key_id: &KeyId) -> Result<Vec<u8>, KeystoreError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;

        keys.get(key_id)
            .map(|k| k.public_key.clone())
            .ok_or_else(|| KeystoreError::KeyNotFound {
                key_id: key_id.to_string(),
            })
    }

    async fn contains(&self, key_id: &KeyId) -> Result<bool, KeystoreError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;
        Ok(keys.contains_key(key_id))
    }

    async fn list_keys(&self) -> Result<Vec<KeyHandle>, KeystoreError> {
        let keys = self
            .keys
            .read()
            .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;

        Ok(keys
            .iter()
            .map(|(key_id, sealed)| KeyHandle {
                key_id: key_id.clone(),
                algorithm: sealed.algorithm,
                public_key: sealed.public_key.clone(),
                created_at: sealed.created_at,
            })
            .collect())
    }

    async fn destroy(
        &self,
        key_id: &KeyId,
        approval: &DestructionApproval,
    ) -> Result<(), KeystoreError> {
        self.destruction.validate(key_id, approval)?;

        {
            let mut keys = self
                .keys
                .write()
                .map_err(|_| KeystoreError::backend("key map lock poisoned"))?;

            if keys.remove(key_id).is_none() {
                return Err(KeystoreError::KeyNotFound {
                    key_id: key_id.to_string(),
                });
            }
        }

        if let Some(dir) = &self.storage_dir {
            let path = dir.join(format!("{key_id}.key"));
            let _ = std::fs::remove_file(path);
        }

        tracing::warn!(key_id = %key_id, "SoftwareKeyStore: key destroyed under quorum approval");
        Ok(())
    }
}
