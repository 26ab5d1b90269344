//! Mutual-aid relay and external alert gate.
//!
//! Both consume alerts signed outside the local trust domain and verify
//! them with the same primitive the edge verifier uses, just with a
//! different key substituted in: a peer jurisdiction's registered key,
//! or a trust-anchor key for the pre-authorized government feed.
//!
//! A peer's signature is never forwarded as if it were a local
//! signature. The relay constructs a brand-new message, carries the
//! peer's signature only as supporting evidence, and routes it through
//! the normal authorization workflow - local tier policy applies in
//! full, and the only message a local device will ever accept is the
//! one re-signed under local authority.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lumen_crypto::{verify_detached, SignatureAlgorithm};

use crate::audit::{Actor, AuditEvent, AuditEventType, AuditLog};
use crate::canonical;
use crate::error::CoreError;
use crate::message::{Authorization, AuthorizationKind, SignedMessage, TargetDevices};
use crate::tier::{classify, AlertTier, EventContext};
use crate::workflow::AuthorizationWorkflow;

/// A parsed alert signed by an external authority.
///
/// Raw feed parsing (CAP, proprietary peer formats) is a collaborator
/// responsibility; the core only sees this shape. The signature covers
/// [`canonical::external_alert_payload`] over (alert_id, category,
/// content).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalAlert {
    /// The authority's identifier for the alert.
    pub alert_id: String,
    /// Alert category; doubles as the event kind for local tier policy.
    pub category: String,
    /// Source confidence, used by local classification.
    pub confidence: f64,
    /// Alert content, carried into the local message unaltered.
    pub content: serde_json::Value,
    /// Algorithm of the external signature.
    pub algorithm: SignatureAlgorithm,
    /// The authority's detached signature.
    pub signature: Vec<u8>,
}

/// One peer jurisdiction's standing in the mutual-aid agreement.
#[derive(Debug, Clone, Default)]
struct PeerEntry {
    /// Registered verification keys (rotation keeps several live).
    keys: Vec<(SignatureAlgorithm, Vec<u8>)>,
    /// Alert categories this peer may relay to us.
    allowed_categories: HashSet<String>,
}

/// The configured mutual-aid agreement table.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verification key for a peer.
    pub fn register_key(
        &mut self,
        peer_id: impl Into<String>,
        algorithm: SignatureAlgorithm,
        public_key: Vec<u8>,
    ) {
        self.peers
            .entry(peer_id.into())
            .or_default()
            .keys
            .push((algorithm, public_key));
    }

    /// Permit a peer to relay an alert category.
    pub fn allow_category(&mut self, peer_id: impl Into<String>, category: impl Into<String>) {
        self.peers
            .entry(peer_id.into())
            .or_default()
            .allowed_categories
            .insert(category.into());
    }

    fn get(&self, peer_id: &str) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }
}

/// Consumes peer-signed alerts and re-authorizes them locally.
pub struct MutualAidRelay {
    peers: RwLock<PeerRegistry>,
    workflow: Arc<AuthorizationWorkflow>,
    audit: Arc<AuditLog>,
}

impl MutualAidRelay {
    /// Create a relay over the agreement table and local workflow.
    #[must_use]
    pub fn new(
        peers: PeerRegistry,
        workflow: Arc<AuthorizationWorkflow>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            peers: RwLock::new(peers),
            workflow,
            audit,
        }
    }

    /// Ingest a peer-signed alert.
    ///
    /// Verifies the peer's signature, checks the agreement table,
    /// classifies the alert under local tier policy (an unknown
    /// category classifies conservatively, as emergency) and submits a
    /// brand-new message through the authorization workflow with the
    /// peer's signature attached as evidence. Returns the new local
    /// message id and its tier; operator authorization proceeds from
    /// there exactly as for a locally originated alert.
    ///
    /// # Errors
    ///
    /// [`CoreError::PeerTrust`] for an unknown peer or failed
    /// signature, [`CoreError::RelayNotPermitted`] when the agreement
    /// does not cover the category.
    pub async fn ingest(
        &self,
        peer_id: &str,
        alert: &ExternalAlert,
        target_devices: TargetDevices,
    ) -> Result<(String, AlertTier), CoreError> {
        if let Err(e) = self.validate(peer_id, alert) {
            self.record_rejected(peer_id, alert, &e)?;
            return Err(e);
        }

        // Local tier policy applies in full; an unknown category gets
        // the most conservative treatment, never the most permissive.
        let tier = match classify(&alert.category, alert.confidence, &EventContext::default()) {
            Ok(tier) => tier,
            Err(CoreError::UnknownEventKind { kind }) => {
                warn!(peer_id, category = %kind, "Unknown relay category; escalating to emergency");
                AlertTier::Emergency
            }
            Err(e) => return Err(e),
        };

        let message_id = self
            .workflow
            .submit(tier, alert.content.clone(), target_devices)?;

        self.workflow
            .attach_evidence(
                &message_id,
                Authorization {
                    approver_id: format!("peer:{peer_id}"),
                    timestamp: chrono::Utc::now().timestamp(),
                    kind: AuthorizationKind::PeerEvidence,
                    signature: alert.signature.clone(),
                },
            )
            .await?;

        self.audit.append(AuditEvent {
            event_type: AuditEventType::RelayAccepted,
            actor: Actor::peer(peer_id),
            target: message_id.clone(),
            success: true,
            details: serde_json::json!({
                "alert_id": alert.alert_id,
                "category": alert.category,
                "tier": tier.label(),
            }),
        })?;

        info!(peer_id, message_id, tier = tier.label(), "Peer alert accepted for local authorization");
        Ok((message_id, tier))
    }

    fn validate(&self, peer_id: &str, alert: &ExternalAlert) -> Result<(), CoreError> {
        let peers = match self.peers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let Some(entry) = peers.get(peer_id) else {
            return Err(CoreError::PeerTrust {
                peer_id: peer_id.to_string(),
                reason: "peer not registered".to_string(),
            });
        };

        let payload =
            canonical::external_alert_payload(&alert.alert_id, &alert.category, &alert.content)?;

        let verified = entry.keys.iter().any(|(algorithm, public_key)| {
            *algorithm == alert.algorithm
                && verify_detached(*algorithm, public_key, &payload, &alert.signature)
                    .unwrap_or(false)
        });
        if !verified {
            return Err(CoreError::PeerTrust {
                peer_id: peer_id.to_string(),
                reason: "signature did not verify under any registered key".to_string(),
            });
        }

        if !entry.allowed_categories.contains(&alert.category) {
            return Err(CoreError::RelayNotPermitted {
                peer_id: peer_id.to_string(),
                category: alert.category.clone(),
            });
        }

        Ok(())
    }

    fn record_rejected(
        &self,
        peer_id: &str,
        alert: &ExternalAlert,
        error: &CoreError,
    ) -> Result<(), CoreError> {
        warn!(peer_id, alert_id = %alert.alert_id, error = %error, "Peer alert rejected");
        self.audit.append(AuditEvent {
            event_type: AuditEventType::RelayRejected,
            actor: Actor::peer(peer_id),
            target: alert.alert_id.clone(),
            success: false,
            details: serde_json::json!({
                "category": alert.category,
                "reason": error.to_string(),
            }),
        })?;
        Ok(())
    }
}

/// A named trust-anchor key for the pre-authorized external feed.
#[derive(Debug, Clone)]
pub struct TrustAnchor {
    /// Label identifying the anchor generation.
    pub label: String,
    /// Signature algorithm.
    pub algorithm: SignatureAlgorithm,
    /// Public key bytes.
    pub public_key: Vec<u8>,
}

/// Rotating set of trust-anchor keys.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchorSet {
    anchors: Vec<TrustAnchor>,
}

impl TrustAnchorSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an anchor key.
    pub fn add(&mut self, anchor: TrustAnchor) {
        self.anchors.push(anchor);
    }

    /// Retire an anchor generation by label.
    pub fn retire(&mut self, label: &str) {
        self.anchors.retain(|a| a.label != label);
    }

    /// Find the anchor whose key verifies the payload, if any.
    #[must_use]
    fn verifying_anchor(
        &self,
        algorithm: SignatureAlgorithm,
        payload: &[u8],
        signature: &[u8],
    ) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|anchor| {
            anchor.algorithm == algorithm
                && verify_detached(algorithm, &anchor.public_key, payload, signature)
                    .unwrap_or(false)
        })
    }
}

/// Accepts pre-authorized external alerts onto the pass-through tier.
///
/// Content is carried through unaltered; pass-through skips local
/// authorization but not signing, verification or audit.
pub struct ExternalAlertGate {
    anchors: RwLock<TrustAnchorSet>,
    workflow: Arc<AuthorizationWorkflow>,
    audit: Arc<AuditLog>,
}

impl ExternalAlertGate {
    /// Create a gate over the trust anchors and local workflow.
    #[must_use]
    pub fn new(
        anchors: TrustAnchorSet,
        workflow: Arc<AuthorizationWorkflow>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            anchors: RwLock::new(anchors),
            workflow,
            audit,
        }
    }

    /// Replace the anchor set after an upstream rotation.
    pub fn rotate_anchors(&self, anchors: TrustAnchorSet) {
        let mut current = match self.anchors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *current = anchors;
    }

    /// Ingest a pre-authorized alert: verify it against the anchor set,
    /// assign the pass-through tier, re-sign under local authority and
    /// queue it for delivery.
    ///
    /// # Errors
    ///
    /// [`CoreError::PeerTrust`] when no anchor verifies the signature;
    /// signing-path errors propagate unchanged.
    pub async fn ingest(
        &self,
        alert: &ExternalAlert,
        target_devices: TargetDevices,
    ) -> Result<SignedMessage, CoreError> {
        let payload =
            canonical::external_alert_payload(&alert.alert_id, &alert.category, &alert.content)?;

        let anchor_label = {
            let anchors = match self.anchors.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match anchors.verifying_anchor(alert.algorithm, &payload, &alert.signature) {
                Some(anchor) => anchor.label.clone(),
                None => {
                    let error = CoreError::PeerTrust {
                        peer_id: "trust-anchor".to_string(),
                        reason: "no anchor key verifies the alert".to_string(),
                    };
                    warn!(alert_id = %alert.alert_id, "External alert rejected: {error}");
                    self.audit.append(AuditEvent {
                        event_type: AuditEventType::RelayRejected,
                        actor: Actor::peer("external-feed"),
                        target: alert.alert_id.clone(),
                        success: false,
                        details: serde_json::json!({"reason": error.to_string()}),
                    })?;
                    return Err(error);
                }
            }
        };

        // Pass-through: zero local authorizations, content unaltered,
        // same signing and audit discipline as every other tier.
        let message_id =
            self.workflow
                .submit(AlertTier::PassThrough, alert.content.clone(), target_devices)?;

        self.workflow
            .attach_evidence(
                &message_id,
                Authorization {
                    approver_id: format!("anchor:{anchor_label}"),
                    timestamp: chrono::Utc::now().timestamp(),
                    kind: AuthorizationKind::PeerEvidence,
                    signature: alert.signature.clone(),
                },
            )
            .await?;

        let message = self.workflow.sign(&message_id).await?;
        self.workflow.mark_queued(&message_id).await?;

        self.audit.append(AuditEvent {
            event_type: AuditEventType::ExternalAlertAccepted,
            actor: Actor::peer("external-feed"),
            target: message_id.clone(),
            success: true,
            details: serde_json::json!({
                "alert_id": alert.alert_id,
                "anchor": anchor_label,
            }),
        })?;

        info!(alert_id = %alert.alert_id, message_id, "External alert queued on pass-through tier");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_crypto::{AlertSigner, Ed25519Signer};
    use lumen_keystore::{BackendConfig, DestructionPolicy, KeyStore};
    use serde_json::json;

    use crate::config::CoreConfig;
    use crate::registry::KeyRegistry;
    use crate::tier::ApproverPool;
    use crate::workflow::MessageState;

    struct RelayHarness {
        workflow: Arc<AuthorizationWorkflow>,
        audit: Arc<AuditLog>,
        registry: Arc<KeyRegistry>,
    }

    fn relay_harness(pool: ApproverPool) -> RelayHarness {
        let keystore: Arc<dyn KeyStore> = lumen_keystore::open_key_store(
            BackendConfig::Software {
                passphrase: "test".into(),
                storage_dir: None,
            },
            DestructionPolicy::default(),
        )
        .unwrap();
        let audit = Arc::new(AuditLog::in_memory());
        let registry = Arc::new(KeyRegistry::new(
            Arc::clone(&keystore),
            Arc::clone(&audit),
            2,
        ));
        let workflow = Arc::new(AuthorizationWorkflow::new(
            pool,
            Arc::clone(&registry),
            keystore,
            Arc::clone(&audit),
            &CoreConfig::default(),
        ));
        RelayHarness {
            workflow,
            audit,
            registry,
        }
    }

    fn peer_signed_alert(signer: &Ed25519Signer, category: &str, confidence: f64) -> ExternalAlert {
        let alert_id = "peer-alert-1".to_string();
        let content = json!({"template": "smoke", "location": "shared_border"});
        let payload =
            canonical::external_alert_payload(&alert_id, category, &content).unwrap();
        ExternalAlert {
            alert_id,
            category: category.to_string(),
            confidence,
            content,
            algorithm: lumen_crypto::SignatureAlgorithm::Ed25519,
            signature: signer.sign(&payload).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_relay_routes_through_local_authorization() {
        let peer_signer = Ed25519Signer::random();
        let mut peers = PeerRegistry::new();
        peers.register_key(
            "county-north",
            lumen_crypto::SignatureAlgorithm::Ed25519,
            peer_signer.public_key().unwrap(),
        );
        peers.allow_category("county-north", "smoke");

        let h = relay_harness(ApproverPool::default());
        let relay = MutualAidRelay::new(peers, Arc::clone(&h.workflow), Arc::clone(&h.audit));

        let alert = peer_signed_alert(&peer_signer, "smoke", 0.9);
        let (message_id, tier) = relay
            .ingest("county-north", &alert, TargetDevices::Wildcard)
            .await
            .unwrap();

        // smoke @ 0.9 classifies as warning: local operator approval is
        // still required despite the peer's signature.
        assert_eq!(tier, AlertTier::Warning);
        assert_eq!(
            h.workflow.state_of(&message_id).await.unwrap(),
            MessageState::AwaitingAuthorization
        );

        let accepted = h.audit.entries_of_type(AuditEventType::RelayAccepted);
        assert_eq!(accepted.len(), 1);
    }

    #[tokio::test]
    async fn test_relay_rejects_unknown_peer_and_forged_signature() {
        let peer_signer = Ed25519Signer::random();
        let imposter = Ed25519Signer::random();

        let mut peers = PeerRegistry::new();
        peers.register_key(
            "county-north",
            lumen_crypto::SignatureAlgorithm::Ed25519,
            peer_signer.public_key().unwrap(),
        );
        peers.allow_category("county-north", "smoke");

        let h = relay_harness(ApproverPool::default());
        let relay = MutualAidRelay::new(peers, Arc::clone(&h.workflow), Arc::clone(&h.audit));

        let alert = peer_signed_alert(&peer_signer, "smoke", 0.9);
        let result = relay
            .ingest("county-unknown", &alert, TargetDevices::Wildcard)
            .await;
        assert!(matches!(result, Err(CoreError::PeerTrust { .. })));

        let forged = peer_signed_alert(&imposter, "smoke", 0.9);
        let result = relay
            .ingest("county-north", &forged, TargetDevices::Wildcard)
            .await;
        assert!(matches!(result, Err(CoreError::PeerTrust { .. })));

        let rejected = h.audit.entries_of_type(AuditEventType::RelayRejected);
        assert_eq!(rejected.len(), 2);
    }

    #[tokio::test]
    async fn test_relay_honors_agreement_table() {
        let peer_signer = Ed25519Signer::random();
        let mut peers = PeerRegistry::new();
        peers.register_key(
            "county-north",
            lumen_crypto::SignatureAlgorithm::Ed25519,
            peer_signer.public_key().unwrap(),
        );
        peers.allow_category("county-north", "weather");

        let h = relay_harness(ApproverPool::default());
        let relay = MutualAidRelay::new(peers, Arc::clone(&h.workflow), Arc::clone(&h.audit));

        let alert = peer_signed_alert(&peer_signer, "smoke", 0.9);
        let result = relay
            .ingest("county-north", &alert, TargetDevices::Wildcard)
            .await;
        assert!(matches!(result, Err(CoreError::RelayNotPermitted { .. })));
    }

    #[tokio::test]
    async fn test_unknown_relay_category_escalates_conservatively() {
        let peer_signer = Ed25519Signer::random();
        let mut peers = PeerRegistry::new();
        peers.register_key(
            "county-north",
            lumen_crypto::SignatureAlgorithm::Ed25519,
            peer_signer.public_key().unwrap(),
        );
        peers.allow_category("county-north", "volcanic_ash");

        // Emergency tier demands a pool of at least three approvers.
        let mut pool = ApproverPool::default();
        for id in ["op-1", "op-2", "op-3"] {
            pool.register(id, Ed25519Signer::random().public_key().unwrap());
        }

        let h = relay_harness(pool);
        let relay = MutualAidRelay::new(peers, Arc::clone(&h.workflow), Arc::clone(&h.audit));

        let alert = peer_signed_alert(&peer_signer, "volcanic_ash", 0.5);
        let (_, tier) = relay
            .ingest("county-north", &alert, TargetDevices::Wildcard)
            .await
            .unwrap();

        assert_eq!(tier, AlertTier::Emergency);
    }

    #[tokio::test]
    async fn test_external_gate_signs_locally_and_queues() {
        let anchor_signer = Ed25519Signer::random();
        let mut anchors = TrustAnchorSet::new();
        anchors.add(TrustAnchor {
            label: "fed-2026a".to_string(),
            algorithm: lumen_crypto::SignatureAlgorithm::Ed25519,
            public_key: anchor_signer.public_key().unwrap(),
        });

        let h = relay_harness(ApproverPool::default());
        h.registry.rotate(AlertTier::PassThrough).await.unwrap();

        let gate = ExternalAlertGate::new(anchors, Arc::clone(&h.workflow), Arc::clone(&h.audit));

        let alert = peer_signed_alert(&anchor_signer, "weather", 1.0);
        let message = gate.ingest(&alert, TargetDevices::Wildcard).await.unwrap();

        assert_eq!(message.tier, AlertTier::PassThrough);
        // Content carried through unaltered.
        assert_eq!(message.content, alert.content);
        // The signature is local: it traces to the pass-through tier
        // key, not the anchor's key.
        let local_key = h.registry.active_key(AlertTier::PassThrough).unwrap();
        assert_eq!(message.signing_key_id, local_key.key_id);

        assert_eq!(
            h.workflow.state_of(&message.message_id).await.unwrap(),
            MessageState::Queued
        );
        assert_eq!(
            h.audit
                .entries_of_type(AuditEventType::ExternalAlertAccepted)
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_external_gate_rejects_after_anchor_retired() {
        let anchor_signer = Ed25519Signer::random();
        let mut anchors = TrustAnchorSet::new();
        anchors.add(TrustAnchor {
            label: "fed-2026a".to_string(),
            algorithm: lumen_crypto::SignatureAlgorithm::Ed25519,
            public_key: anchor_signer.public_key().unwrap(),
        });

        let h = relay_harness(ApproverPool::default());
        h.registry.rotate(AlertTier::PassThrough).await.unwrap();

        let gate = ExternalAlertGate::new(
            anchors.clone(),
            Arc::clone(&h.workflow),
            Arc::clone(&h.audit),
        );

        let alert = peer_signed_alert(&anchor_signer, "weather", 1.0);
        assert!(gate.ingest(&alert, TargetDevices::Wildcard).await.is_ok());

        // Rotate the anchor generation out.
        let mut rotated = anchors;
        rotated.retire("fed-2026a");
        gate.rotate_anchors(rotated);

        let alert = peer_signed_alert(&anchor_signer, "weather", 1.0);
        let result = gate.ingest(&alert, TargetDevices::Wildcard).await;
        assert!(matches!(result, Err(CoreError::PeerTrust { .. })));
    }
}
