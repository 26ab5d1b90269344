//! Control-point composition root.
//!
//! Wires the key store, key registry, audit log and authorization
//! workflow together for the trusted control point. Field devices use
//! [`crate::verifier::EdgeVerifier`] instead; delivery between the two
//! is an external collaborator.

use std::sync::Arc;

use tracing::warn;

use lumen_keystore::{BackendConfig, DestructionPolicy, KeyStore};

use crate::audit::{Actor, AuditEvent, AuditEventType, AuditLog};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::message::TargetDevices;
use crate::registry::KeyRegistry;
use crate::tier::{classify, AlertTier, ApproverPool, EventContext};
use crate::workflow::AuthorizationWorkflow;

/// The trusted control point: classification, authorization, signing
/// and key management behind one handle.
pub struct ControlPoint {
    keystore: Arc<dyn KeyStore>,
    registry: Arc<KeyRegistry>,
    workflow: Arc<AuthorizationWorkflow>,
    audit: Arc<AuditLog>,
}

impl ControlPoint {
    /// Open a control point over the configured key-store backend.
    ///
    /// The audit log is file-backed when `config.audit_path` is set,
    /// memory-only otherwise; a boot entry is appended either way.
    ///
    /// # Errors
    ///
    /// Propagates key-store and audit-log open failures.
    pub fn open(
        config: &CoreConfig,
        pool: ApproverPool,
        backend: BackendConfig,
        destruction: DestructionPolicy,
    ) -> Result<Self, CoreError> {
        let keystore = lumen_keystore::open_key_store(backend, destruction)?;

        let audit = Arc::new(match &config.audit_path {
            Some(path) => AuditLog::open(path)?,
            None => AuditLog::in_memory(),
        });
        audit.append(AuditEvent {
            event_type: AuditEventType::SystemBoot,
            actor: Actor::control_point(),
            target: "control-point".to_string(),
            success: true,
            details: serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "backend": format!("{:?}", keystore.backend()),
            }),
        })?;

        let registry = Arc::new(KeyRegistry::new(
            Arc::clone(&keystore),
            Arc::clone(&audit),
            config.rotation_window,
        ));

        let workflow = Arc::new(AuthorizationWorkflow::new(
            pool,
            Arc::clone(&registry),
            Arc::clone(&keystore),
            Arc::clone(&audit),
            config,
        ));

        Ok(Self {
            keystore,
            registry,
            workflow,
            audit,
        })
    }

    /// Classify a detection event and submit the resulting message.
    ///
    /// An event kind the policy does not cover is escalated to the most
    /// conservative tier (emergency), never the most permissive.
    /// Returns the message id and the tier it was filed under.
    ///
    /// # Errors
    ///
    /// Propagates submission failures from the workflow.
    pub fn dispatch_event(
        &self,
        event_kind: &str,
        confidence: f64,
        context: &EventContext,
        content: serde_json::Value,
        target_devices: TargetDevices,
    ) -> Result<(String, AlertTier), CoreError> {
        let tier = match classify(event_kind, confidence, context) {
            Ok(tier) => tier,
            Err(CoreError::UnknownEventKind { kind }) => {
                warn!(event_kind = %kind, "Unclassifiable event; escalating to emergency");
                AlertTier::Emergency
            }
            Err(e) => return Err(e),
        };

        let message_id = self.workflow.submit(tier, content, target_devices)?;
        Ok((message_id, tier))
    }

    /// The authorization workflow.
    #[must_use]
    pub fn workflow(&self) -> &Arc<AuthorizationWorkflow> {
        &self.workflow
    }

    /// The tier key registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// The audit log.
    #[must_use]
    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// The key store backing this control point.
    #[must_use]
    pub fn keystore(&self) -> &Arc<dyn KeyStore> {
        &self.keystore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::MessageState;
    use serde_json::json;

    fn open_control_point(config: &CoreConfig) -> ControlPoint {
        ControlPoint::open(
            config,
            ApproverPool::default(),
            BackendConfig::Software {
                passphrase: "test".into(),
                storage_dir: None,
            },
            DestructionPolicy::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_classifies_and_submits() {
        let cp = open_control_point(&CoreConfig::default());
        cp.registry().rotate(AlertTier::Informational).await.unwrap();

        let (id, tier) = cp
            .dispatch_event(
                "crowd",
                0.99,
                &EventContext::default(),
                json!({"template": "crowd-count", "count": 413}),
                TargetDevices::Wildcard,
            )
            .unwrap();

        assert_eq!(tier, AlertTier::Informational);
        assert_eq!(
            cp.workflow().state_of(&id).await.unwrap(),
            MessageState::Authorized
        );
    }

    #[tokio::test]
    async fn test_unknown_event_escalates_to_emergency() {
        let mut pool = ApproverPool::default();
        for id in ["op-1", "op-2", "op-3"] {
            use lumen_crypto::AlertSigner;
            pool.register(id, lumen_crypto::Ed25519Signer::random().public_key().unwrap());
        }

        let cp = ControlPoint::open(
            &CoreConfig::default(),
            pool,
            BackendConfig::Software {
                passphrase: "test".into(),
                storage_dir: None,
            },
            DestructionPolicy::default(),
        )
        .unwrap();

        let (id, tier) = cp
            .dispatch_event(
                "meteor_strike",
                0.4,
                &EventContext::default(),
                json!({"template": "evacuate"}),
                TargetDevices::Wildcard,
            )
            .unwrap();

        assert_eq!(tier, AlertTier::Emergency);
        assert_eq!(
            cp.workflow().state_of(&id).await.unwrap(),
            MessageState::AwaitingAuthorization
        );
    }

    #[tokio::test]
    async fn test_file_backed_audit_records_boot() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig {
            audit_path: Some(dir.path().join("audit.log")),
            ..CoreConfig::default()
        };

        let cp = open_control_point(&config);
        let boots = cp.audit().entries_of_type(AuditEventType::SystemBoot);
        assert_eq!(boots.len(), 1);
        assert!(cp.audit().verify_chain().valid);
    }
}
