//! Edge-side message verification.
//!
//! This is the last line of defense: a field device acts on a message
//! only after [`EdgeVerifier::verify`] returns [`Verdict::Accept`], and
//! re-verifies on every delivery, including content it has rendered
//! before. Verification never panics on malformed input - anything
//! undecodable is a signature-class rejection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use lumen_crypto::verify_detached;
use lumen_keystore::KeyId;

use crate::audit::{Actor, AuditEvent, AuditEventType, AuditLog};
use crate::canonical;
use crate::config::CoreConfig;
use crate::message::SignedMessage;
use crate::registry::{KeyRecord, KeyStatus};
use crate::replay::NonceCache;

/// Why a message was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The message does not address this device.
    WrongDevice,
    /// `now` precedes the issue time beyond clock-skew tolerance.
    NotYetValid,
    /// The message expired.
    Expired,
    /// The message was explicitly revoked.
    Revoked,
    /// The nonce was already accepted on this device.
    ReplayDetected,
    /// The signature (or the message encoding itself) is invalid.
    SignatureInvalid,
}

impl RejectReason {
    /// Stable label for audit records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WrongDevice => "wrong_device",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::ReplayDetected => "replay_detected",
            Self::SignatureInvalid => "signature_invalid",
        }
    }
}

/// Outcome of verifying one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// All checks passed; the device may act on the message.
    Accept,
    /// The message must not be acted on.
    Reject(RejectReason),
}

impl Verdict {
    /// Whether the delivery was accepted.
    #[must_use]
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Per-device verifier with trust store and replay cache.
pub struct EdgeVerifier {
    device_id: String,
    clock_skew_tolerance: Duration,
    /// Key records distributed from the control point.
    trusted: RwLock<HashMap<KeyId, KeyRecord>>,
    /// Message ids revoked after signing.
    revoked_messages: RwLock<HashSet<String>>,
    /// Replay cache; the mutex makes check-then-insert atomic.
    replay: Mutex<NonceCache>,
    audit: Arc<AuditLog>,
    tamper_hook: Option<Box<dyn Fn(&SignedMessage) + Send + Sync>>,
}

impl EdgeVerifier {
    /// Create a verifier for a device.
    #[must_use]
    pub fn new(device_id: impl Into<String>, config: &CoreConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            device_id: device_id.into(),
            clock_skew_tolerance: config.clock_skew_tolerance,
            trusted: RwLock::new(HashMap::new()),
            revoked_messages: RwLock::new(HashSet::new()),
            replay: Mutex::new(NonceCache::new(config.replay_capacity, config.replay_ttl)),
            audit,
            tamper_hook: None,
        }
    }

    /// Install an operator-visible hook fired on every
    /// signature-invalid rejection.
    #[must_use]
    pub fn with_tamper_hook(
        mut self,
        hook: impl Fn(&SignedMessage) + Send + Sync + 'static,
    ) -> Self {
        self.tamper_hook = Some(Box::new(hook));
        self
    }

    /// Replace the trust store with key records distributed from the
    /// control point.
    pub fn install_keys(&self, records: Vec<KeyRecord>) {
        let mut trusted = match self.trusted.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        trusted.clear();
        for record in records {
            trusted.insert(record.key_id.clone(), record);
        }
        debug!(device_id = %self.device_id, keys = trusted.len(), "Trust store updated");
    }

    /// Record a post-signing revocation received from the control point.
    pub fn revoke_message(&self, message_id: &str) {
        let mut revoked = match self.revoked_messages.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        revoked.insert(message_id.to_string());
    }

    /// The device this verifier protects.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Verify one delivery of a signed message.
    ///
    /// Checks run in fixed order: device targeting, validity window,
    /// revocation, replay, signature. On Accept the nonce is in the
    /// replay cache before this function returns; the cache lock is
    /// held from the replay check through insertion so two concurrent
    /// deliveries of the same message cannot both pass.
    ///
    /// Every rejection is written to the audit log; a signature failure
    /// additionally raises the tamper-suspected signal.
    pub fn verify(&self, message: &SignedMessage) -> Verdict {
        let verdict = self.evaluate(message);
        self.record(message, verdict);
        verdict
    }

    /// Verify a raw wire payload.
    ///
    /// Malformed input is itself a signature-class rejection, never a
    /// panic or error.
    pub fn verify_wire(&self, bytes: &[u8]) -> Verdict {
        match serde_json::from_slice::<SignedMessage>(bytes) {
            Ok(message) => self.verify(&message),
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "Undecodable message rejected");
                let verdict = Verdict::Reject(RejectReason::SignatureInvalid);
                if let Err(audit_err) = self.audit.record_rejected(
                    &self.device_id,
                    "<undecodable>",
                    RejectReason::SignatureInvalid.as_str(),
                ) {
                    error!(error = %audit_err, "Failed to audit rejection");
                }
                verdict
            }
        }
    }

    fn evaluate(&self, message: &SignedMessage) -> Verdict {
        // 1. Device targeting
        if !message.target_devices.targets(&self.device_id) {
            return Verdict::Reject(RejectReason::WrongDevice);
        }

        // 2. Validity window, with skew tolerance on the near edge
        let now = chrono::Utc::now().timestamp();
        let skew = self.clock_skew_tolerance.as_secs() as i64;
        if now < message.issued_at - skew {
            return Verdict::Reject(RejectReason::NotYetValid);
        }
        if now > message.expires_at {
            return Verdict::Reject(RejectReason::Expired);
        }

        // 3. Explicit revocation
        {
            let revoked = match self.revoked_messages.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if revoked.contains(&message.message_id) {
                return Verdict::Reject(RejectReason::Revoked);
            }
        }

        // 4+5. Replay then signature, under one lock so the
        // check-then-insert sequence is atomic per device.
        let mut replay = match self.replay.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if replay.contains(&message.nonce) {
            return Verdict::Reject(RejectReason::ReplayDetected);
        }

        if !self.signature_is_trusted(message) {
            return Verdict::Reject(RejectReason::SignatureInvalid);
        }

        // Insert before returning Accept.
        replay.check_and_insert(&message.nonce);
        Verdict::Accept
    }

    /// Validate the signature against the currently-trusted key set:
    /// the active key or a rotated key still inside the window, never a
    /// revoked key.
    fn signature_is_trusted(&self, message: &SignedMessage) -> bool {
        let trusted = match self.trusted.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(record) = trusted.get(&message.signing_key_id) else {
            return false;
        };

        if record.status == KeyStatus::Revoked || record.tier != message.tier {
            return false;
        }

        let Ok(payload) = canonical::signing_payload_for(message) else {
            return false;
        };

        verify_detached(
            record.algorithm,
            &record.public_key,
            &payload,
            &message.signature,
        )
        .unwrap_or(false)
    }

    fn record(&self, message: &SignedMessage, verdict: Verdict) {
        let result = match verdict {
            Verdict::Accept => self.audit.append(AuditEvent {
                event_type: AuditEventType::VerificationAccepted,
                actor: Actor::device(&self.device_id),
                target: message.message_id.clone(),
                success: true,
                details: serde_json::json!({"tier": message.tier.label()}),
            }),
            Verdict::Reject(RejectReason::ReplayDetected) => self.audit.append(AuditEvent {
                event_type: AuditEventType::ReplayDetected,
                actor: Actor::device(&self.device_id),
                target: message.message_id.clone(),
                success: false,
                details: serde_json::json!({"nonce": hex::encode(&message.nonce)}),
            }),
            Verdict::Reject(RejectReason::SignatureInvalid) => {
                error!(
                    device_id = %self.device_id,
                    message_id = %message.message_id,
                    "SECURITY: invalid signature - raising tamper signal"
                );
                if let Some(hook) = &self.tamper_hook {
                    hook(message);
                }
                self.audit
                    .record_rejected(
                        &self.device_id,
                        &message.message_id,
                        RejectReason::SignatureInvalid.as_str(),
                    )
                    .and_then(|_| {
                        self.audit
                            .record_tamper_suspected(&self.device_id, &message.message_id)
                    })
            }
            Verdict::Reject(reason) => {
                self.audit
                    .record_rejected(&self.device_id, &message.message_id, reason.as_str())
            }
        };

        if let Err(e) = result {
            // Verification stays infallible; the audit failure is
            // surfaced operationally instead.
            error!(error = %e, "Failed to audit verification outcome");
        }
    }
}
