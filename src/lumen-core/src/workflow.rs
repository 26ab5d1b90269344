//! Authorization workflow and message signer.
//!
//! Each message moves through a per-message state machine:
//!
//! ```text
//! Draft -> AwaitingAuthorization -> Authorized -> Signed -> Queued
//!                                                  -> {Delivered | Expired | Revoked}
//! ```
//!
//! Zero-authorization tiers skip straight from Draft to Authorized on
//! submission. Authorizations accumulate as an idempotent set keyed by
//! approver identity; the Authorized transition fires exactly once, the
//! instant the distinct-operator count reaches the tier minimum. A
//! per-message async mutex serializes quorum detection and signing, so
//! only one caller ever observes the threshold crossing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use lumen_crypto::{verify_detached, SignatureAlgorithm};
use lumen_keystore::{KeyId, KeyStore, KeystoreError};

use crate::audit::{Actor, AuditEvent, AuditEventType, AuditLog};
use crate::canonical;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::message::{
    authorization_payload, generate_message_id, generate_nonce, Authorization, AuthorizationKind,
    SignedMessage, TargetDevices,
};
use crate::registry::KeyRegistry;
use crate::tier::{AlertTier, ApproverPool};

/// Lifecycle state of a pending message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Just constructed from a tier-policy decision.
    Draft,
    /// Accumulating operator authorizations.
    AwaitingAuthorization,
    /// Quorum met; eligible for signing.
    Authorized,
    /// Canonical payload signed; the message is now immutable.
    Signed,
    /// Handed to the delivery collaborator.
    Queued,
    /// A device confirmed delivery.
    Delivered,
    /// TTL elapsed before delivery.
    Expired,
    /// Explicitly withdrawn after signing.
    Revoked,
}

impl MessageState {
    /// Whether the cryptographic operation already happened.
    #[must_use]
    pub fn is_signed_or_later(&self) -> bool {
        !matches!(
            self,
            Self::Draft | Self::AwaitingAuthorization | Self::Authorized
        )
    }
}

/// A message while it moves through the workflow.
struct Pending {
    tier: AlertTier,
    content: serde_json::Value,
    target_devices: TargetDevices,
    issued_at: i64,
    expires_at: i64,
    nonce: Vec<u8>,
    authorizations: Vec<Authorization>,
    state: MessageState,
    signature: Option<Vec<u8>>,
    signing_key_id: Option<KeyId>,
}

impl Pending {
    fn operator_approvals(&self) -> usize {
        self.authorizations
            .iter()
            .filter(|a| a.kind == AuthorizationKind::Operator)
            .count()
    }

    fn has_approver(&self, approver_id: &str) -> bool {
        self.authorizations
            .iter()
            .any(|a| a.approver_id == approver_id)
    }
}

/// Accumulates authorizations per message and signs at quorum.
pub struct AuthorizationWorkflow {
    messages: RwLock<HashMap<String, Arc<tokio::sync::Mutex<Pending>>>>,
    pool: ApproverPool,
    registry: Arc<KeyRegistry>,
    keystore: Arc<dyn KeyStore>,
    audit: Arc<AuditLog>,
    signing_timeout: Duration,
}

impl AuthorizationWorkflow {
    /// Create a workflow over the approver pool, key registry and store.
    #[must_use]
    pub fn new(
        pool: ApproverPool,
        registry: Arc<KeyRegistry>,
        keystore: Arc<dyn KeyStore>,
        audit: Arc<AuditLog>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            pool,
            registry,
            keystore,
            audit,
            signing_timeout: config.signing_timeout,
        }
    }

    fn entry(&self, message_id: &str) -> Result<Arc<tokio::sync::Mutex<Pending>>, CoreError> {
        let messages = match self.messages.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownMessage {
                message_id: message_id.to_string(),
            })
    }

    /// Submit a new message from a tier-policy decision.
    ///
    /// The draft advances immediately: to AwaitingAuthorization for
    /// operator tiers, or straight to Authorized for zero-authorization
    /// tiers (still signed and audited through the same path).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidMessage`] when a multi-party tier is
    /// configured with an approver pool smaller than three.
    #[instrument(skip(self, content, target_devices), fields(tier = tier.label()))]
    pub fn submit(
        &self,
        tier: AlertTier,
        content: serde_json::Value,
        target_devices: TargetDevices,
    ) -> Result<String, CoreError> {
        if tier.requires_multiparty() && self.pool.len() < 3 {
            return Err(CoreError::InvalidMessage {
                reason: format!(
                    "{} tier requires an approver pool of at least 3, have {}",
                    tier.label(),
                    self.pool.len()
                ),
            });
        }

        let message_id = generate_message_id();
        let now = chrono::Utc::now().timestamp();
        let ttl = tier.ttl().as_secs() as i64;

        let state = if tier.requires_operator() {
            MessageState::AwaitingAuthorization
        } else {
            MessageState::Authorized
        };

        let pending = Pending {
            tier,
            content,
            target_devices,
            issued_at: now,
            expires_at: now + ttl,
            nonce: generate_nonce(),
            authorizations: Vec::new(),
            state,
            signature: None,
            signing_key_id: None,
        };

        {
            let mut messages = match self.messages.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            messages.insert(
                message_id.clone(),
                Arc::new(tokio::sync::Mutex::new(pending)),
            );
        }

        if tier.requires_operator() {
            self.audit.append(AuditEvent {
                event_type: AuditEventType::AuthorizationRequested,
                actor: Actor::control_point(),
                target: message_id.clone(),
                success: true,
                details: serde_json::json!({
                    "tier": tier.label(),
                    "required": tier.min_authorizations(),
                }),
            })?;
        }

        info!(message_id = %message_id, state = ?state, "Message submitted");
        Ok(message_id)
    }

    /// Submit an operator authorization for a pending message.
    ///
    /// The approver must be in the configured pool, must not have
    /// approved this message before, and must present a valid Ed25519
    /// signature over the pending message identifier. Returns the
    /// message state after the authorization; the caller that receives
    /// [`MessageState::Authorized`] is the one that observed the quorum
    /// crossing.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadySigned`] once signed,
    /// [`CoreError::DuplicateApprover`] on a repeat approver,
    /// [`CoreError::ApproverNotEligible`] /
    /// [`CoreError::InvalidApproverSignature`] on pool or signature
    /// failures.
    #[instrument(skip(self, authorization), fields(approver = %authorization.approver_id))]
    pub async fn authorize(
        &self,
        message_id: &str,
        authorization: Authorization,
    ) -> Result<MessageState, CoreError> {
        let entry = self.entry(message_id)?;
        let mut pending = entry.lock().await;

        if pending.state.is_signed_or_later() {
            return Err(CoreError::AlreadySigned {
                message_id: message_id.to_string(),
            });
        }
        if pending.state == MessageState::Authorized {
            return Err(CoreError::InvalidState {
                message_id: message_id.to_string(),
                reason: "quorum already met".to_string(),
            });
        }

        if authorization.kind != AuthorizationKind::Operator {
            return Err(CoreError::InvalidMessage {
                reason: "only operator authorizations count toward quorum".to_string(),
            });
        }

        let approver_id = authorization.approver_id.clone();

        let Some(public_key) = self.pool.public_key(&approver_id) else {
            self.record_denied(message_id, &approver_id, "not_eligible")?;
            return Err(CoreError::ApproverNotEligible { approver_id });
        };

        let payload = authorization_payload(message_id);
        let valid = verify_detached(
            SignatureAlgorithm::Ed25519,
            public_key,
            &payload,
            &authorization.signature,
        )
        .unwrap_or(false);
        if !valid {
            self.record_denied(message_id, &approver_id, "bad_signature")?;
            return Err(CoreError::InvalidApproverSignature { approver_id });
        }

        if pending.has_approver(&approver_id) {
            self.record_denied(message_id, &approver_id, "duplicate")?;
            return Err(CoreError::DuplicateApprover {
                approver_id,
                message_id: message_id.to_string(),
            });
        }

        pending.authorizations.push(authorization);

        let granted = pending.operator_approvals();
        let required = pending.tier.min_authorizations();
        let quorum_met = granted >= required;
        if quorum_met {
            // Exactly one caller sees this transition; the per-message
            // mutex serializes concurrent authorizations.
            pending.state = MessageState::Authorized;
        }

        self.audit.append(AuditEvent {
            event_type: AuditEventType::AuthorizationGranted,
            actor: Actor::operator(&approver_id),
            target: message_id.to_string(),
            success: true,
            details: serde_json::json!({
                "granted": granted,
                "required": required,
                "quorum_met": quorum_met,
            }),
        })?;

        info!(message_id, granted, required, quorum_met, "Authorization accepted");
        Ok(pending.state)
    }

    /// Attach a peer's original signature to a relayed message as
    /// supporting evidence. Evidence never counts toward quorum.
    ///
    /// # Errors
    ///
    /// [`CoreError::AlreadySigned`] once signed;
    /// [`CoreError::DuplicateApprover`] when the same evidence source
    /// appears twice.
    pub async fn attach_evidence(
        &self,
        message_id: &str,
        evidence: Authorization,
    ) -> Result<(), CoreError> {
        if evidence.kind != AuthorizationKind::PeerEvidence {
            return Err(CoreError::InvalidMessage {
                reason: "attach_evidence only accepts peer evidence".to_string(),
            });
        }

        let entry = self.entry(message_id)?;
        let mut pending = entry.lock().await;

        if pending.state.is_signed_or_later() {
            return Err(CoreError::AlreadySigned {
                message_id: message_id.to_string(),
            });
        }
        if pending.has_approver(&evidence.approver_id) {
            return Err(CoreError::DuplicateApprover {
                approver_id: evidence.approver_id,
                message_id: message_id.to_string(),
            });
        }

        pending.authorizations.push(evidence);
        Ok(())
    }

    /// Sign an authorized message with its tier's active key.
    ///
    /// Builds the canonical payload, invokes the key store under a
    /// bounded timeout, stores the signature and key identifier, writes
    /// the audit entry and returns the now-immutable message.
    ///
    /// A backend fault or timeout leaves the message Authorized: the
    /// caller may retry signing without re-authorization, and there is
    /// no implicit internal retry.
    ///
    /// # Errors
    ///
    /// [`CoreError::InsufficientAuthorization`] before quorum,
    /// [`CoreError::AlreadySigned`] on a repeat attempt,
    /// [`CoreError::UnknownTierKey`] with no active tier key,
    /// [`CoreError::SigningBackend`] on fault or timeout,
    /// [`CoreError::ChainIntegrity`] while the audit chain is tainted.
    #[instrument(skip(self))]
    pub async fn sign(&self, message_id: &str) -> Result<SignedMessage, CoreError> {
        // A broken audit chain halts automated trust decisions.
        self.audit.require_integrity()?;

        let entry = self.entry(message_id)?;
        let mut pending = entry.lock().await;

        match pending.state {
            MessageState::Authorized => {}
            MessageState::Draft | MessageState::AwaitingAuthorization => {
                return Err(CoreError::InsufficientAuthorization {
                    required: pending.tier.min_authorizations(),
                    granted: pending.operator_approvals(),
                });
            }
            // Idempotency guard: a caller retry must not re-trigger the
            // cryptographic operation.
            _ => {
                return Err(CoreError::AlreadySigned {
                    message_id: message_id.to_string(),
                });
            }
        }

        let key = self
            .registry
            .active_key(pending.tier)
            .ok_or(CoreError::UnknownTierKey { tier: pending.tier })?;

        let payload = canonical::signing_payload(
            message_id,
            pending.tier,
            &pending.content,
            &pending.target_devices,
            pending.issued_at,
            pending.expires_at,
            &pending.nonce,
        )?;

        let signature =
            match tokio::time::timeout(self.signing_timeout, self.keystore.sign(&key.key_id, &payload))
                .await
            {
                Err(_elapsed) => {
                    warn!(message_id, "Signing timed out; message stays Authorized");
                    return Err(CoreError::SigningBackend {
                        reason: format!(
                            "signing timed out after {}s",
                            self.signing_timeout.as_secs()
                        ),
                    });
                }
                Ok(Err(e)) => {
                    warn!(message_id, error = %e, "Signing backend fault; message stays Authorized");
                    return Err(map_signing_fault(e));
                }
                Ok(Ok(signature)) => signature,
            };

        pending.signature = Some(signature.clone());
        pending.signing_key_id = Some(key.key_id.clone());
        pending.state = MessageState::Signed;

        self.audit
            .record_signed(message_id, pending.tier.label(), key.key_id.as_str())?;

        info!(message_id, key_id = %key.key_id, "Message signed");

        Ok(SignedMessage {
            message_id: message_id.to_string(),
            tier: pending.tier,
            content: pending.content.clone(),
            target_devices: pending.target_devices.clone(),
            issued_at: pending.issued_at,
            expires_at: pending.expires_at,
            nonce: pending.nonce.clone(),
            authorizations: pending.authorizations.clone(),
            signature,
            signing_key_id: key.key_id,
        })
    }

    /// Hand a signed message to the delivery collaborator.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidState`] unless the message is Signed.
    pub async fn mark_queued(&self, message_id: &str) -> Result<(), CoreError> {
        self.transition(
            message_id,
            &[MessageState::Signed],
            MessageState::Queued,
            AuditEventType::MessageQueued,
        )
        .await
    }

    /// Record delivery confirmation from a device.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidState`] unless the message is Queued.
    pub async fn mark_delivered(&self, message_id: &str) -> Result<(), CoreError> {
        self.transition(
            message_id,
            &[MessageState::Queued],
            MessageState::Delivered,
            AuditEventType::MessageDelivered,
        )
        .await
    }

    /// Record that the TTL elapsed before delivery.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidState`] unless the message is Signed or
    /// Queued.
    pub async fn mark_expired(&self, message_id: &str) -> Result<(), CoreError> {
        self.transition(
            message_id,
            &[MessageState::Signed, MessageState::Queued],
            MessageState::Expired,
            AuditEventType::MessageExpired,
        )
        .await
    }

    /// Explicitly withdraw a signed message.
    ///
    /// The revocation is recorded in the audit log; distribution of the
    /// revoked id to device verifiers is the delivery collaborator's
    /// responsibility.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidState`] unless the message is Signed or
    /// Queued.
    pub async fn revoke(&self, message_id: &str, operator_id: &str) -> Result<(), CoreError> {
        let entry = self.entry(message_id)?;
        let mut pending = entry.lock().await;

        match pending.state {
            MessageState::Signed | MessageState::Queued => {}
            state => {
                return Err(CoreError::InvalidState {
                    message_id: message_id.to_string(),
                    reason: format!("cannot revoke from {state:?}"),
                });
            }
        }

        pending.state = MessageState::Revoked;
        self.audit.append(AuditEvent {
            event_type: AuditEventType::MessageRevoked,
            actor: Actor::operator(operator_id),
            target: message_id.to_string(),
            success: true,
            details: serde_json::json!({"tier": pending.tier.label()}),
        })?;

        warn!(message_id, operator_id, "Message revoked");
        Ok(())
    }

    /// Current state of a pending message.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownMessage`] for an unknown identifier.
    pub async fn state_of(&self, message_id: &str) -> Result<MessageState, CoreError> {
        let entry = self.entry(message_id)?;
        let pending = entry.lock().await;
        Ok(pending.state)
    }

    /// The immutable signed form of a message, once it exists.
    ///
    /// Returns `None` before the Signed transition.
    ///
    /// # Errors
    ///
    /// [`CoreError::UnknownMessage`] for an unknown identifier.
    pub async fn signed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<SignedMessage>, CoreError> {
        let entry = self.entry(message_id)?;
        let pending = entry.lock().await;

        let (Some(signature), Some(signing_key_id)) =
            (pending.signature.clone(), pending.signing_key_id.clone())
        else {
            return Ok(None);
        };

        Ok(Some(SignedMessage {
            message_id: message_id.to_string(),
            tier: pending.tier,
            content: pending.content.clone(),
            target_devices: pending.target_devices.clone(),
            issued_at: pending.issued_at,
            expires_at: pending.expires_at,
            nonce: pending.nonce.clone(),
            authorizations: pending.authorizations.clone(),
            signature,
            signing_key_id,
        }))
    }

    async fn transition(
        &self,
        message_id: &str,
        from: &[MessageState],
        to: MessageState,
        event_type: AuditEventType,
    ) -> Result<(), CoreError> {
        let entry = self.entry(message_id)?;
        let mut pending = entry.lock().await;

        if !from.contains(&pending.state) {
            return Err(CoreError::InvalidState {
                message_id: message_id.to_string(),
                reason: format!("cannot move from {:?} to {to:?}", pending.state),
            });
        }

        pending.state = to;
        self.audit.append(AuditEvent {
            event_type,
            actor: Actor::control_point(),
            target: message_id.to_string(),
            success: true,
            details: serde_json::json!({"tier": pending.tier.label()}),
        })?;
        Ok(())
    }

    fn record_denied(
        &self,
        message_id: &str,
        approver_id: &str,
        reason: &str,
    ) -> Result<(), CoreError> {
        self.audit.append(AuditEvent {
            event_type: AuditEventType::AuthorizationDenied,
            actor: Actor::operator(approver_id),
            target: message_id.to_string(),
            success: false,
            details: serde_json::json!({"reason": reason}),
        })?;
        Ok(())
    }
}

fn map_signing_fault(error: KeystoreError) -> CoreError {
    CoreError::SigningBackend {
        reason: error.to_string(),
    }
}

/// Build an operator authorization for a pending message.
///
/// Convenience for dashboards and tests: signs the authorization
/// payload with the operator's own key.
///
/// # Errors
///
/// Propagates signing failures from the operator's signer.
pub fn operator_authorization(
    message_id: &str,
    approver_id: &str,
    signer: &dyn lumen_crypto::AlertSigner,
) -> Result<Authorization, CoreError> {
    let signature = signer.sign(&authorization_payload(message_id))?;
    Ok(Authorization {
        approver_id: approver_id.to_string(),
        timestamp: chrono::Utc::now().timestamp(),
        kind: AuthorizationKind::Operator,
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_crypto::{AlertSigner, Ed25519Signer};
    use lumen_keystore::{BackendConfig, DestructionPolicy, IsolatedKeyStore};
    use serde_json::json;

    struct Harness {
        workflow: AuthorizationWorkflow,
        operators: HashMap<String, Ed25519Signer>,
        audit: Arc<AuditLog>,
    }

    fn harness_with(keystore: Arc<dyn KeyStore>, operator_ids: &[&str]) -> Harness {
        let mut pool = ApproverPool::default();
        let mut operators = HashMap::new();
        for id in operator_ids {
            let signer = Ed25519Signer::random();
            pool.register(*id, signer.public_key().unwrap());
            operators.insert((*id).to_string(), signer);
        }

        let audit = Arc::new(AuditLog::in_memory());
        let registry = Arc::new(KeyRegistry::new(
            Arc::clone(&keystore),
            Arc::clone(&audit),
            2,
        ));

        Harness {
            workflow: AuthorizationWorkflow::new(
                pool,
                registry,
                keystore,
                Arc::clone(&audit),
                &CoreConfig::default(),
            ),
            operators,
            audit,
        }
    }

    fn software_keystore() -> Arc<dyn KeyStore> {
        lumen_keystore::open_key_store(
            BackendConfig::Software {
                passphrase: "test".into(),
                storage_dir: None,
            },
            DestructionPolicy::default(),
        )
        .unwrap()
    }

    fn harness(operator_ids: &[&str]) -> Harness {
        harness_with(software_keystore(), operator_ids)
    }

    impl Harness {
        fn registry(&self) -> Arc<KeyRegistry> {
            Arc::clone(&self.workflow.registry)
        }

        fn auth(&self, message_id: &str, operator: &str) -> Authorization {
            operator_authorization(message_id, operator, &self.operators[operator]).unwrap()
        }
    }

    #[tokio::test]
    async fn test_warning_single_authorization_flow() {
        let h = harness(&["op-1", "op-2", "op-3"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(
                AlertTier::Warning,
                json!({"template": "smoke"}),
                TargetDevices::devices(["sign-07"]),
            )
            .unwrap();

        assert_eq!(
            h.workflow.state_of(&id).await.unwrap(),
            MessageState::AwaitingAuthorization
        );

        let state = h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();
        assert_eq!(state, MessageState::Authorized);

        let message = h.workflow.sign(&id).await.unwrap();
        assert_eq!(message.operator_approvals(), 1);
        assert_eq!(h.workflow.state_of(&id).await.unwrap(), MessageState::Signed);
    }

    #[tokio::test]
    async fn test_zero_authorization_tier_authorized_on_submit() {
        let h = harness(&[]);
        h.registry().rotate(AlertTier::Informational).await.unwrap();

        let id = h
            .workflow
            .submit(
                AlertTier::Informational,
                json!({"template": "crowd-count"}),
                TargetDevices::Wildcard,
            )
            .unwrap();

        assert_eq!(
            h.workflow.state_of(&id).await.unwrap(),
            MessageState::Authorized
        );
        h.workflow.sign(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_emergency_requires_two_distinct_approvers() {
        let h = harness(&["op-1", "op-2", "op-3"]);
        h.registry().rotate(AlertTier::Emergency).await.unwrap();

        let id = h
            .workflow
            .submit(
                AlertTier::Emergency,
                json!({"template": "evacuate"}),
                TargetDevices::Wildcard,
            )
            .unwrap();

        let state = h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();
        assert_eq!(state, MessageState::AwaitingAuthorization);

        // Signing before quorum fails.
        let result = h.workflow.sign(&id).await;
        assert!(matches!(
            result,
            Err(CoreError::InsufficientAuthorization {
                required: 2,
                granted: 1
            })
        ));

        // The same approver submitting twice never satisfies quorum.
        let result = h.workflow.authorize(&id, h.auth(&id, "op-1")).await;
        assert!(matches!(result, Err(CoreError::DuplicateApprover { .. })));

        let state = h.workflow.authorize(&id, h.auth(&id, "op-2")).await.unwrap();
        assert_eq!(state, MessageState::Authorized);

        h.workflow.sign(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_emergency_rejects_small_pool() {
        let h = harness(&["op-1", "op-2"]);
        let result = h.workflow.submit(
            AlertTier::Emergency,
            json!({}),
            TargetDevices::Wildcard,
        );
        assert!(matches!(result, Err(CoreError::InvalidMessage { .. })));
    }

    #[tokio::test]
    async fn test_ineligible_and_forged_approvers_rejected() {
        let h = harness(&["op-1"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();

        // Not in the pool.
        let outsider = Ed25519Signer::random();
        let auth = operator_authorization(&id, "op-9", &outsider).unwrap();
        let result = h.workflow.authorize(&id, auth).await;
        assert!(matches!(result, Err(CoreError::ApproverNotEligible { .. })));

        // In the pool, but signature from the wrong key.
        let forged = operator_authorization(&id, "op-1", &outsider).unwrap();
        let result = h.workflow.authorize(&id, forged).await;
        assert!(matches!(
            result,
            Err(CoreError::InvalidApproverSignature { .. })
        ));

        let denied = h.audit.entries_of_type(AuditEventType::AuthorizationDenied);
        assert_eq!(denied.len(), 2);
    }

    #[tokio::test]
    async fn test_signed_message_rejects_late_authorization_and_resigning() {
        let h = harness(&["op-1", "op-2", "op-3"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();
        h.workflow.sign(&id).await.unwrap();

        let result = h.workflow.authorize(&id, h.auth(&id, "op-2")).await;
        assert!(matches!(result, Err(CoreError::AlreadySigned { .. })));

        let result = h.workflow.sign(&id).await;
        assert!(matches!(result, Err(CoreError::AlreadySigned { .. })));
    }

    #[tokio::test]
    async fn test_unknown_tier_key() {
        let h = harness(&["op-1"]);
        // No key provisioned for warning.
        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();

        let result = h.workflow.sign(&id).await;
        assert!(matches!(result, Err(CoreError::UnknownTierKey { .. })));
    }

    #[tokio::test]
    async fn test_backend_fault_is_retryable_without_reauthorization() {
        let isolated = Arc::new(IsolatedKeyStore::open(DestructionPolicy::default()));
        let h = harness_with(Arc::clone(&isolated) as Arc<dyn KeyStore>, &["op-1"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();

        isolated.set_offline(true);
        let result = h.workflow.sign(&id).await;
        match result {
            Err(e) => assert!(e.is_retryable()),
            Ok(_) => panic!("signing should fail while backend is offline"),
        }
        assert_eq!(
            h.workflow.state_of(&id).await.unwrap(),
            MessageState::Authorized
        );

        // Fresh attempt succeeds with no new authorization round.
        isolated.set_offline(false);
        h.workflow.sign(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_authorizations_cross_quorum_once() {
        let h = Arc::new(harness(&["op-1", "op-2", "op-3", "op-4"]));
        h.registry().rotate(AlertTier::Emergency).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Emergency, json!({}), TargetDevices::Wildcard)
            .unwrap();

        let mut handles = Vec::new();
        for op in ["op-1", "op-2", "op-3", "op-4"] {
            let h = Arc::clone(&h);
            let id = id.clone();
            let auth = h.auth(&id, op);
            handles.push(tokio::spawn(async move {
                h.workflow.authorize(&id, auth).await
            }));
        }

        let mut crossings = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(MessageState::Authorized) => crossings += 1,
                Ok(MessageState::AwaitingAuthorization) => {}
                Ok(state) => panic!("unexpected state {state:?}"),
                // Authorizations arriving after quorum are refused.
                Err(CoreError::InvalidState { .. }) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }

        assert_eq!(crossings, 1, "exactly one caller observes the threshold");
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let h = harness(&["op-1"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();
        assert!(h.workflow.signed_message(&id).await.unwrap().is_none());

        let message = h.workflow.sign(&id).await.unwrap();
        let stored = h.workflow.signed_message(&id).await.unwrap().unwrap();
        assert_eq!(stored.signature, message.signature);

        h.workflow.mark_queued(&id).await.unwrap();
        assert_eq!(h.workflow.state_of(&id).await.unwrap(), MessageState::Queued);

        h.workflow.mark_delivered(&id).await.unwrap();
        assert_eq!(
            h.workflow.state_of(&id).await.unwrap(),
            MessageState::Delivered
        );

        // Delivered is terminal.
        let result = h.workflow.revoke(&id, "op-1").await;
        assert!(matches!(result, Err(CoreError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_revocation_recorded() {
        let h = harness(&["op-1"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();
        h.workflow.sign(&id).await.unwrap();

        h.workflow.revoke(&id, "op-1").await.unwrap();
        assert_eq!(
            h.workflow.state_of(&id).await.unwrap(),
            MessageState::Revoked
        );

        let revoked = h.audit.entries_of_type(AuditEventType::MessageRevoked);
        assert_eq!(revoked.len(), 1);
    }

    #[tokio::test]
    async fn test_tainted_chain_halts_signing() {
        let h = harness(&["op-1"]);
        h.registry().rotate(AlertTier::Warning).await.unwrap();

        let id = h
            .workflow
            .submit(AlertTier::Warning, json!({}), TargetDevices::Wildcard)
            .unwrap();
        h.workflow.authorize(&id, h.auth(&id, "op-1")).await.unwrap();

        // Corrupt the audit log, then detect it.
        h.audit.tamper_details_for_test(0, json!({"forged": true}));
        assert!(!h.audit.verify_chain().valid);

        let result = h.workflow.sign(&id).await;
        assert!(matches!(result, Err(CoreError::ChainIntegrity { .. })));

        // Operator acknowledgment restores automated decisions.
        h.audit.acknowledge_tamper("op-1");
        h.workflow.sign(&id).await.unwrap();
    }
}
