//! Signed display messages and their authorizations.
//!
//! [`SignedMessage`] is the immutable artifact the workflow produces
//! once a message reaches the Signed state. Its serde form is the wire
//! shape a transport or storage collaborator persists; the
//! canonicalization order for signing is fixed independently in
//! [`crate::canonical`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use lumen_keystore::KeyId;

use crate::tier::AlertTier;

/// Length of the single-use nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// The device set a message addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TargetDevicesWire", into = "TargetDevicesWire")]
pub enum TargetDevices {
    /// Every device in the deployment.
    Wildcard,
    /// An explicit device set.
    Devices(BTreeSet<String>),
}

impl TargetDevices {
    /// Build an explicit target set.
    pub fn devices<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Devices(ids.into_iter().map(Into::into).collect())
    }

    /// Whether the set addresses the given device.
    #[must_use]
    pub fn targets(&self, device_id: &str) -> bool {
        match self {
            Self::Wildcard => true,
            Self::Devices(ids) => ids.contains(device_id),
        }
    }
}

/// Wire form: `"*"` for wildcard, otherwise a device list.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum TargetDevicesWire {
    All(String),
    Devices(BTreeSet<String>),
}

impl From<TargetDevicesWire> for TargetDevices {
    fn from(wire: TargetDevicesWire) -> Self {
        match wire {
            TargetDevicesWire::All(s) if s == "*" => Self::Wildcard,
            TargetDevicesWire::All(s) => Self::Devices(BTreeSet::from([s])),
            TargetDevicesWire::Devices(ids) => Self::Devices(ids),
        }
    }
}

impl From<TargetDevices> for TargetDevicesWire {
    fn from(targets: TargetDevices) -> Self {
        match targets {
            TargetDevices::Wildcard => Self::All("*".to_string()),
            TargetDevices::Devices(ids) => Self::Devices(ids),
        }
    }
}

/// How an authorization entry was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationKind {
    /// A local operator approved the message. Counts toward quorum.
    Operator,
    /// A peer jurisdiction's original signature, carried as supporting
    /// evidence on a relayed message. Never counts toward quorum.
    PeerEvidence,
}

/// Record of one authorization on a message.
///
/// No two authorizations on the same message share an `approver_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authorization {
    /// Identifier of the approver (or `peer:<id>` for evidence).
    pub approver_id: String,
    /// When the authorization was granted (unix seconds).
    pub timestamp: i64,
    /// Operator approval or peer evidence.
    pub kind: AuthorizationKind,
    /// The approver's own Ed25519 signature over the pending message id.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// The payload an approver signs to authorize a pending message.
#[must_use]
pub fn authorization_payload(message_id: &str) -> Vec<u8> {
    format!("lumen-authorize:{message_id}").into_bytes()
}

/// A cryptographically signed display message.
///
/// Immutable once constructed; produced only by the authorization
/// workflow after quorum and signing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMessage {
    /// Unique message identifier.
    pub message_id: String,
    /// Alert tier governing authorization and TTL.
    pub tier: AlertTier,
    /// Opaque structured content (template id, parameters, text).
    pub content: serde_json::Value,
    /// Devices the message addresses.
    pub target_devices: TargetDevices,
    /// Issue time (unix seconds).
    pub issued_at: i64,
    /// Expiry (unix seconds); always greater than `issued_at`.
    pub expires_at: i64,
    /// Single-use nonce for replay detection.
    #[serde(with = "hexstr")]
    pub nonce: Vec<u8>,
    /// Authorizations granted before signing, in grant order.
    pub authorizations: Vec<Authorization>,
    /// Detached signature over the canonical payload.
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    /// The key that produced the signature.
    pub signing_key_id: KeyId,
}

impl SignedMessage {
    /// Distinct operator approvals carried by this message.
    #[must_use]
    pub fn operator_approvals(&self) -> usize {
        self.authorizations
            .iter()
            .filter(|a| a.kind == AuthorizationKind::Operator)
            .count()
    }
}

/// Generate a fresh random message identifier.
#[must_use]
pub fn generate_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    hex::encode(bytes)
}

/// Generate a fresh single-use nonce.
#[must_use]
pub fn generate_nonce() -> Vec<u8> {
    let mut bytes = [0u8; NONCE_LEN];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    bytes.to_vec()
}

/// Serde adapter: bytes as base64 text.
mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: bytes as lowercase hex text.
mod hexstr {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
