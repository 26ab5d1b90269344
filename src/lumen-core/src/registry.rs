//! Tier signing-key records and lifecycle.
//!
//! Keys are never deleted from the record, only status-transitioned
//! forward: `Active -> Rotated -> Revoked` (revocation may also hit an
//! active key directly). Verifiers accept the active key plus a bounded
//! window of recently rotated keys, so delivery keeps working across
//! rotation lag; revoked keys are never accepted regardless of recency.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lumen_crypto::SignatureAlgorithm;
use lumen_keystore::{KeyGenConfig, KeyId, KeyStore};

use crate::audit::{Actor, AuditEvent, AuditEventType, AuditLog};
use crate::error::CoreError;
use crate::tier::AlertTier;

/// Lifecycle status of a signing key. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The key currently signing for its tier.
    Active,
    /// Superseded by rotation; still trusted within the window.
    Rotated,
    /// Compromised or retired; never trusted again.
    Revoked,
}

/// Record of a tier signing key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Opaque key identifier in the key store.
    pub key_id: KeyId,
    /// The tier this key signs for.
    pub tier: AlertTier,
    /// Signature algorithm.
    pub algorithm: SignatureAlgorithm,
    /// Public key bytes.
    pub public_key: Vec<u8>,
    /// Lifecycle status.
    pub status: KeyStatus,
    /// Creation time (unix seconds).
    pub created_at: i64,
    /// When the key left Active (unix seconds).
    pub rotated_at: Option<i64>,
}

struct RegistryState {
    records: HashMap<KeyId, KeyRecord>,
    active: HashMap<AlertTier, KeyId>,
    /// Rotated key ids per tier, most recent last.
    rotated: HashMap<AlertTier, Vec<KeyId>>,
}

/// Control-point registry of tier signing keys.
///
/// Wraps the key store for generation and maintains the lifecycle
/// records verifiers trust.
pub struct KeyRegistry {
    keystore: Arc<dyn KeyStore>,
    audit: Arc<AuditLog>,
    rotation_window: usize,
    state: RwLock<RegistryState>,
}

impl KeyRegistry {
    /// Create a registry over a key store.
    ///
    /// `rotation_window` bounds how many rotated keys per tier remain
    /// trusted.
    #[must_use]
    pub fn new(keystore: Arc<dyn KeyStore>, audit: Arc<AuditLog>, rotation_window: usize) -> Self {
        Self {
            keystore,
            audit,
            rotation_window,
            state: RwLock::new(RegistryState {
                records: HashMap::new(),
                active: HashMap::new(),
                rotated: HashMap::new(),
            }),
        }
    }

    /// Generate and activate a new signing key for a tier.
    ///
    /// Any previous active key transitions to Rotated. The first call
    /// for a tier is its provisioning ceremony.
    ///
    /// # Errors
    ///
    /// Propagates key-store and audit failures.
    pub async fn rotate(&self, tier: AlertTier) -> Result<KeyRecord, CoreError> {
        let config = KeyGenConfig::new(format!("tier-{}", tier.label()));
        let handle = self.keystore.generate_key(&config).await?;

        let record = KeyRecord {
            key_id: handle.key_id.clone(),
            tier,
            algorithm: handle.algorithm,
            public_key: handle.public_key,
            status: KeyStatus::Active,
            created_at: handle.created_at,
            rotated_at: None,
        };

        let displaced = {
            let mut state = self.state.write().map_err(|_| CoreError::Audit {
                reason: "registry lock poisoned".to_string(),
            })?;

            let displaced = state.active.insert(tier, record.key_id.clone());
            if let Some(old_id) = &displaced {
                if let Some(old) = state.records.get_mut(old_id) {
                    old.status = KeyStatus::Rotated;
                    old.rotated_at = Some(chrono::Utc::now().timestamp());
                }
                state.rotated.entry(tier).or_default().push(old_id.clone());
            }
            state.records.insert(record.key_id.clone(), record.clone());
            displaced
        };

        self.audit.append(AuditEvent {
            event_type: AuditEventType::KeyGenerated,
            actor: Actor::control_point(),
            target: record.key_id.to_string(),
            success: true,
            details: serde_json::json!({"tier": tier.label()}),
        })?;

        if let Some(old_id) = displaced {
            info!(tier = tier.label(), old = %old_id, new = %record.key_id, "Tier key rotated");
            self.audit.append(AuditEvent {
                event_type: AuditEventType::KeyRotated,
                actor: Actor::control_point(),
                target: old_id.to_string(),
                success: true,
                details: serde_json::json!({
                    "tier": tier.label(),
                    "successor": record.key_id.to_string(),
                }),
            })?;
        } else {
            info!(tier = tier.label(), key_id = %record.key_id, "Tier key provisioned");
        }

        Ok(record)
    }

    /// Revoke a key. Forward-only; a revoked key never signs or
    /// verifies again. Revoking a tier's active key leaves the tier
    /// without a signing key until the next rotation.
    ///
    /// # Errors
    ///
    /// Returns a key-not-found error for an unknown key id; revoking an
    /// already-revoked key is an idempotent no-op.
    pub fn revoke(&self, key_id: &KeyId) -> Result<(), CoreError> {
        let tier = {
            let mut state = self.state.write().map_err(|_| CoreError::Audit {
                reason: "registry lock poisoned".to_string(),
            })?;

            let record = state.records.get_mut(key_id).ok_or_else(|| {
                CoreError::Keystore(lumen_keystore::KeystoreError::KeyNotFound {
                    key_id: key_id.to_string(),
                })
            })?;

            if record.status == KeyStatus::Revoked {
                return Ok(()); // idempotent
            }

            record.status = KeyStatus::Revoked;
            record.rotated_at.get_or_insert(chrono::Utc::now().timestamp());
            let tier = record.tier;

            if state.active.get(&tier) == Some(key_id) {
                state.active.remove(&tier);
                warn!(tier = tier.label(), key_id = %key_id, "Active tier key revoked; tier has no signing key");
            }
            tier
        };

        self.audit.append(AuditEvent {
            event_type: AuditEventType::KeyRevoked,
            actor: Actor::control_point(),
            target: key_id.to_string(),
            success: true,
            details: serde_json::json!({"tier": tier.label()}),
        })?;

        Ok(())
    }

    /// The active signing key for a tier, if any.
    #[must_use]
    pub fn active_key(&self, tier: AlertTier) -> Option<KeyRecord> {
        let state = self.state.read().ok()?;
        let key_id = state.active.get(&tier)?;
        state.records.get(key_id).cloned()
    }

    /// Look up a key record.
    #[must_use]
    pub fn get(&self, key_id: &KeyId) -> Option<KeyRecord> {
        self.state
            .read()
            .ok()
            .and_then(|state| state.records.get(key_id).cloned())
    }

    /// Currently-trusted keys for a tier: the active key plus the most
    /// recently rotated non-revoked keys, bounded by the rotation
    /// window.
    #[must_use]
    pub fn trusted_keys(&self, tier: AlertTier) -> Vec<KeyRecord> {
        let Ok(state) = self.state.read() else {
            return Vec::new();
        };

        let mut trusted = Vec::new();

        if let Some(key_id) = state.active.get(&tier) {
            if let Some(record) = state.records.get(key_id) {
                trusted.push(record.clone());
            }
        }

        if let Some(rotated) = state.rotated.get(&tier) {
            for key_id in rotated.iter().rev().take(self.rotation_window) {
                if let Some(record) = state.records.get(key_id) {
                    if record.status == KeyStatus::Rotated {
                        trusted.push(record.clone());
                    }
                }
            }
        }

        trusted
    }

    /// Trusted keys across every tier, for distribution to devices.
    #[must_use]
    pub fn export_trust(&self) -> Vec<KeyRecord> {
        AlertTier::ALL
            .iter()
            .flat_map(|tier| self.trusted_keys(*tier))
            .collect()
    }
}
