//! Canonical byte encoding of the signed payload.
//!
//! The signature covers a fixed field order and a fixed binary layout,
//! independently reproducible by any verifier:
//!
//! ```text
//! LMN1                                    4-byte domain tag
//! u32be len || message_id                 UTF-8 bytes
//! tier code                               1 byte
//! u32be len || content                    canonical JSON (sorted keys, compact)
//! u32be count || (u32be len || device)*   targets, sorted; wildcard = single "*"
//! i64be issued_at                         unix seconds
//! i64be expires_at                        unix seconds
//! u32be len || nonce                      raw nonce bytes
//! ```
//!
//! Authorizations and the signature itself are never part of the signed
//! payload, so the wire/storage field order is free to differ.

use serde_json::Value;

use crate::error::CoreError;
use crate::message::{SignedMessage, TargetDevices};
use crate::tier::AlertTier;

/// Domain tag binding signatures to the Lumen message layout, v1.
pub const DOMAIN_TAG: [u8; 4] = *b"LMN1";

/// Domain tag for externally sourced alerts (peer relay, trust-anchor feed).
pub const EXTERNAL_TAG: [u8; 4] = *b"LMNX";

/// Canonical JSON bytes for a content value.
///
/// `serde_json` maps are ordered (BTreeMap-backed), so object keys come
/// out sorted at every nesting level; `to_vec` emits the compact form.
///
/// # Errors
///
/// Returns [`CoreError::InvalidMessage`] when the value cannot be
/// serialized (non-string map keys, non-finite floats).
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, CoreError> {
    serde_json::to_vec(value).map_err(|e| CoreError::InvalidMessage {
        reason: format!("content not canonicalizable: {e}"),
    })
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Build the canonical signing payload from message fields.
///
/// # Errors
///
/// Returns [`CoreError::InvalidMessage`] when `expires_at <= issued_at`
/// or the content cannot be canonicalized.
pub fn signing_payload(
    message_id: &str,
    tier: AlertTier,
    content: &Value,
    target_devices: &TargetDevices,
    issued_at: i64,
    expires_at: i64,
    nonce: &[u8],
) -> Result<Vec<u8>, CoreError> {
    if expires_at <= issued_at {
        return Err(CoreError::InvalidMessage {
            reason: format!("expires_at ({expires_at}) must be after issued_at ({issued_at})"),
        });
    }

    let content_bytes = canonical_json(content)?;

    let mut out = Vec::with_capacity(64 + message_id.len() + content_bytes.len());
    out.extend_from_slice(&DOMAIN_TAG);
    put_bytes(&mut out, message_id.as_bytes());
    out.push(tier.code());
    put_bytes(&mut out, &content_bytes);

    match target_devices {
        TargetDevices::Wildcard => {
            out.extend_from_slice(&1u32.to_be_bytes());
            put_bytes(&mut out, b"*");
        }
        TargetDevices::Devices(ids) => {
            out.extend_from_slice(&(ids.len() as u32).to_be_bytes());
            // BTreeSet iterates in sorted order
            for id in ids {
                put_bytes(&mut out, id.as_bytes());
            }
        }
    }

    out.extend_from_slice(&issued_at.to_be_bytes());
    out.extend_from_slice(&expires_at.to_be_bytes());
    put_bytes(&mut out, nonce);

    Ok(out)
}

/// Canonical signing payload for an already-assembled message.
///
/// # Errors
///
/// Same as [`signing_payload`].
pub fn signing_payload_for(message: &SignedMessage) -> Result<Vec<u8>, CoreError> {
    signing_payload(
        &message.message_id,
        message.tier,
        &message.content,
        &message.target_devices,
        message.issued_at,
        message.expires_at,
        &message.nonce,
    )
}

/// Canonical payload an external authority signs over an alert.
///
/// Layout: `LMNX`, then alert id, category and canonical-JSON content,
/// each u32be length-prefixed.
///
/// # Errors
///
/// Returns [`CoreError::InvalidMessage`] when the content cannot be
/// canonicalized.
pub fn external_alert_payload(
    alert_id: &str,
    category: &str,
    content: &Value,
) -> Result<Vec<u8>, CoreError> {
    let content_bytes = canonical_json(content)?;

    let mut out = Vec::with_capacity(16 + alert_id.len() + category.len() + content_bytes.len());
    out.extend_from_slice(&EXTERNAL_TAG);
    put_bytes(&mut out, alert_id.as_bytes());
    put_bytes(&mut out, category.as_bytes());
    put_bytes(&mut out, &content_bytes);

    Ok(out)
}
