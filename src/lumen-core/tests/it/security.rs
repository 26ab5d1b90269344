//! End-to-end security scenarios across the full pipeline:
//! classification -> authorization -> signing -> delivery -> verification.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use lumen_core::audit::{AuditEventType, AuditLog};
use lumen_core::config::CoreConfig;
use lumen_core::message::{generate_nonce, TargetDevices};
use lumen_core::registry::KeyRegistry;
use lumen_core::relay::{ExternalAlert, MutualAidRelay, PeerRegistry};
use lumen_core::tier::{classify, AlertTier, ApproverPool, EventContext};
use lumen_core::verifier::{EdgeVerifier, RejectReason, Verdict};
use lumen_core::workflow::{operator_authorization, AuthorizationWorkflow, MessageState};
use lumen_core::{canonical, CoreError, SignedMessage};
use lumen_crypto::{AlertSigner, Ed25519Signer, SignatureAlgorithm};
use lumen_keystore::{BackendConfig, DestructionPolicy, KeyStore};

/// A control point with three registered operators.
struct ControlHarness {
    keystore: Arc<dyn KeyStore>,
    registry: Arc<KeyRegistry>,
    workflow: Arc<AuthorizationWorkflow>,
    audit: Arc<AuditLog>,
    operators: HashMap<String, Ed25519Signer>,
}

fn control_point() -> ControlHarness {
    let keystore: Arc<dyn KeyStore> = lumen_keystore::open_key_store(
        BackendConfig::Software {
            passphrase: "integration-test".into(),
            storage_dir: None,
        },
        DestructionPolicy::default(),
    )
    .unwrap();

    let mut pool = ApproverPool::default();
    let mut operators = HashMap::new();
    for id in ["op-1", "op-2", "op-3"] {
        let signer = Ed25519Signer::random();
        pool.register(id, signer.public_key().unwrap());
        operators.insert(id.to_string(), signer);
    }

    let audit = Arc::new(AuditLog::in_memory());
    let registry = Arc::new(KeyRegistry::new(
        Arc::clone(&keystore),
        Arc::clone(&audit),
        2,
    ));
    let workflow = Arc::new(AuthorizationWorkflow::new(
        pool,
        Arc::clone(&registry),
        Arc::clone(&keystore),
        Arc::clone(&audit),
        &CoreConfig::default(),
    ));

    ControlHarness {
        keystore,
        registry,
        workflow,
        audit,
        operators,
    }
}

impl ControlHarness {
    fn authorize(&self, message_id: &str, operator: &str) -> lumen_core::Authorization {
        operator_authorization(message_id, operator, &self.operators[operator]).unwrap()
    }

    fn device(&self, device_id: &str, audit: Arc<AuditLog>) -> EdgeVerifier {
        let verifier = EdgeVerifier::new(device_id, &CoreConfig::default(), audit);
        verifier.install_keys(self.registry.export_trust());
        verifier
    }
}

/// The concrete spec scenario: a smoke warning for sign-07, one
/// operator approval, first delivery accepted, replay rejected, late
/// delivery rejected.
#[tokio::test]
async fn warning_smoke_scenario() {
    let cp = control_point();
    cp.registry.rotate(AlertTier::Warning).await.unwrap();

    // Classification drives the tier.
    let tier = classify("smoke", 0.9, &EventContext::default()).unwrap();
    assert_eq!(tier, AlertTier::Warning);

    let message_id = cp
        .workflow
        .submit(
            tier,
            json!({"template": "smoke", "location": "north_exit"}),
            TargetDevices::devices(["sign-07"]),
        )
        .unwrap();

    // One distinct authorization reaches Authorized.
    let state = cp
        .workflow
        .authorize(&message_id, cp.authorize(&message_id, "op-1"))
        .await
        .unwrap();
    assert_eq!(state, MessageState::Authorized);

    let message = cp.workflow.sign(&message_id).await.unwrap();
    cp.workflow.mark_queued(&message_id).await.unwrap();

    // First delivery within the window: accepted.
    let device_audit = Arc::new(AuditLog::in_memory());
    let device = cp.device("sign-07", Arc::clone(&device_audit));
    assert_eq!(device.verify(&message), Verdict::Accept);

    // Identical re-delivery one moment later: replay.
    assert_eq!(
        device.verify(&message),
        Verdict::Reject(RejectReason::ReplayDetected)
    );

    // Both outcomes are in the device audit log, chain intact.
    assert_eq!(
        device_audit
            .entries_of_type(AuditEventType::VerificationAccepted)
            .len(),
        1
    );
    assert_eq!(
        device_audit
            .entries_of_type(AuditEventType::ReplayDetected)
            .len(),
        1
    );
    assert!(device_audit.verify_chain().valid);
}

/// A message whose TTL has fully elapsed is rejected as expired, even
/// with a genuine signature from the active tier key.
#[tokio::test]
async fn late_delivery_rejected() {
    let cp = control_point();
    let key = cp.registry.rotate(AlertTier::Warning).await.unwrap();

    let now = chrono::Utc::now().timestamp();
    let mut stale = SignedMessage {
        message_id: "m-late".to_string(),
        tier: AlertTier::Warning,
        content: json!({"template": "smoke", "location": "north_exit"}),
        target_devices: TargetDevices::devices(["sign-07"]),
        issued_at: now - 120,
        expires_at: now - 60, // 60s past expiry
        nonce: generate_nonce(),
        authorizations: Vec::new(),
        signature: Vec::new(),
        signing_key_id: key.key_id.clone(),
    };
    let payload = canonical::signing_payload_for(&stale).unwrap();
    stale.signature = cp.keystore.sign(&key.key_id, &payload).await.unwrap();

    let device = cp.device("sign-07", Arc::new(AuditLog::in_memory()));
    assert_eq!(
        device.verify(&stale),
        Verdict::Reject(RejectReason::Expired)
    );
}

/// Messages signed before a rotation keep verifying while the old key
/// is in the retention window; explicit revocation ends that.
#[tokio::test]
async fn rotation_window_then_revocation() {
    let cp = control_point();
    let v1 = cp.registry.rotate(AlertTier::Warning).await.unwrap();

    // Two messages signed under v1.
    let mut signed = Vec::new();
    for _ in 0..2 {
        let id = cp
            .workflow
            .submit(
                AlertTier::Warning,
                json!({"template": "smoke"}),
                TargetDevices::Wildcard,
            )
            .unwrap();
        cp.workflow
            .authorize(&id, cp.authorize(&id, "op-1"))
            .await
            .unwrap();
        signed.push(cp.workflow.sign(&id).await.unwrap());
    }
    assert!(signed.iter().all(|m| m.signing_key_id == v1.key_id));

    // Rotate to v2; v1 is still inside the retention window.
    cp.registry.rotate(AlertTier::Warning).await.unwrap();
    let device = cp.device("sign-01", Arc::new(AuditLog::in_memory()));
    assert_eq!(device.verify(&signed[0]), Verdict::Accept);

    // Revoke v1: verification of v1-signed messages fails from then on.
    cp.registry.revoke(&v1.key_id).unwrap();
    let device = cp.device("sign-02", Arc::new(AuditLog::in_memory()));
    assert_eq!(
        device.verify(&signed[1]),
        Verdict::Reject(RejectReason::SignatureInvalid)
    );
}

/// A mutual-aid relay's output always traces to the local domain's
/// active key, never to the peer's key.
#[tokio::test]
async fn relay_output_signed_by_local_key() {
    let cp = control_point();
    cp.registry.rotate(AlertTier::Warning).await.unwrap();

    let peer_signer = Ed25519Signer::random();
    let mut peers = PeerRegistry::new();
    peers.register_key(
        "county-north",
        SignatureAlgorithm::Ed25519,
        peer_signer.public_key().unwrap(),
    );
    peers.allow_category("county-north", "smoke");

    let relay = MutualAidRelay::new(peers, Arc::clone(&cp.workflow), Arc::clone(&cp.audit));

    let alert_id = "peer-alert-7".to_string();
    let content = json!({"template": "smoke", "location": "border_zone"});
    let payload = canonical::external_alert_payload(&alert_id, "smoke", &content).unwrap();
    let alert = ExternalAlert {
        alert_id,
        category: "smoke".to_string(),
        confidence: 0.92,
        content,
        algorithm: SignatureAlgorithm::Ed25519,
        signature: peer_signer.sign(&payload).unwrap(),
    };

    let (message_id, tier) = relay
        .ingest("county-north", &alert, TargetDevices::Wildcard)
        .await
        .unwrap();
    assert_eq!(tier, AlertTier::Warning);

    // Local tier policy applies in full: the peer's signature did not
    // substitute for the operator approval.
    let result = cp.workflow.sign(&message_id).await;
    assert!(matches!(
        result,
        Err(CoreError::InsufficientAuthorization { .. })
    ));

    cp.workflow
        .authorize(&message_id, cp.authorize(&message_id, "op-2"))
        .await
        .unwrap();
    let message = cp.workflow.sign(&message_id).await.unwrap();

    // Signed by the local warning key; peer evidence rides along.
    let local_key = cp.registry.active_key(AlertTier::Warning).unwrap();
    assert_eq!(message.signing_key_id, local_key.key_id);
    assert_ne!(message.signature, alert.signature);
    assert!(message
        .authorizations
        .iter()
        .any(|a| a.approver_id == "peer:county-north"));

    // And a local device accepts it.
    let device = cp.device("sign-03", Arc::new(AuditLog::in_memory()));
    assert_eq!(device.verify(&message), Verdict::Accept);
}

/// A persisted audit chain that is edited on disk halts signing when
/// reopened, until an operator acknowledges.
#[tokio::test]
async fn tampered_audit_file_halts_signing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.log");

    // First session: provision and sign one message against the
    // file-backed log.
    {
        let keystore: Arc<dyn KeyStore> = lumen_keystore::open_key_store(
            BackendConfig::Software {
                passphrase: "integration-test".into(),
                storage_dir: None,
            },
            DestructionPolicy::default(),
        )
        .unwrap();
        let audit = Arc::new(AuditLog::open(&path).unwrap());
        let registry = Arc::new(KeyRegistry::new(
            Arc::clone(&keystore),
            Arc::clone(&audit),
            2,
        ));
        registry.rotate(AlertTier::Informational).await.unwrap();

        let workflow = AuthorizationWorkflow::new(
            ApproverPool::default(),
            registry,
            keystore,
            Arc::clone(&audit),
            &CoreConfig::default(),
        );
        let id = workflow
            .submit(
                AlertTier::Informational,
                json!({"template": "crowd-count"}),
                TargetDevices::Wildcard,
            )
            .unwrap();
        workflow.sign(&id).await.unwrap();
    }

    // Edit the first line in place without recomputing hashes.
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = text.lines().map(String::from).collect();
    lines[0] = lines[0].replace("informational", "emergency");
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    // Second session: the reopened chain is tainted and signing halts.
    let cp = {
        let mut cp = control_point();
        cp.audit = Arc::new(AuditLog::open(&path).unwrap());
        cp.registry = Arc::new(KeyRegistry::new(
            Arc::clone(&cp.keystore),
            Arc::clone(&cp.audit),
            2,
        ));
        cp.workflow = Arc::new(AuthorizationWorkflow::new(
            {
                let mut pool = ApproverPool::default();
                for (id, signer) in &cp.operators {
                    pool.register(id.clone(), signer.public_key().unwrap());
                }
                pool
            },
            Arc::clone(&cp.registry),
            Arc::clone(&cp.keystore),
            Arc::clone(&cp.audit),
            &CoreConfig::default(),
        ));
        cp
    };

    let verification = cp.audit.verify_chain();
    assert!(!verification.valid);
    let (first, last) = verification.broken_ranges[0];
    assert_eq!(first, 1);
    assert!(last >= first);

    cp.registry.rotate(AlertTier::Warning).await.unwrap();
    let id = cp
        .workflow
        .submit(
            AlertTier::Warning,
            json!({"template": "smoke"}),
            TargetDevices::Wildcard,
        )
        .unwrap();
    cp.workflow
        .authorize(&id, cp.authorize(&id, "op-1"))
        .await
        .unwrap();

    let result = cp.workflow.sign(&id).await;
    match result {
        Err(e) => assert!(e.is_fatal_to_trust()),
        Ok(_) => panic!("signing must halt on a tainted chain"),
    }

    cp.audit.acknowledge_tamper("op-1");
    cp.workflow.sign(&id).await.unwrap();
}

/// Two concurrent deliveries of the same message to one device: only
/// one passes the replay gate.
#[tokio::test]
async fn concurrent_duplicate_deliveries() {
    let cp = control_point();
    cp.registry.rotate(AlertTier::Advisory).await.unwrap();

    let id = cp
        .workflow
        .submit(
            AlertTier::Advisory,
            json!({"template": "area-congested"}),
            TargetDevices::Wildcard,
        )
        .unwrap();
    let message = cp.workflow.sign(&id).await.unwrap();

    let device = Arc::new(cp.device("sign-07", Arc::new(AuditLog::in_memory())));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let device = Arc::clone(&device);
        let message = message.clone();
        handles.push(tokio::task::spawn_blocking(move || device.verify(&message)));
    }

    let mut accepts = 0;
    for handle in handles {
        if handle.await.unwrap().is_accept() {
            accepts += 1;
        }
    }
    assert_eq!(accepts, 1, "exactly one concurrent delivery may pass");
}
