//! Error types for the authorization core.

use thiserror::Error;

use crate::tier::AlertTier;

/// Errors that can occur in the authorization, signing and audit core.
///
/// Verification outcomes are NOT errors - a rejected message is a
/// [`crate::verifier::Verdict::Reject`], never an `Err`.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Classification rules do not cover this event kind.
    ///
    /// Callers must treat this as the most conservative (emergency)
    /// tier, never the most permissive.
    #[error("Unknown event kind: {kind}")]
    UnknownEventKind {
        /// The event kind that could not be classified.
        kind: String,
    },

    /// The same approver already authorized this message.
    #[error("Duplicate authorization from '{approver_id}' on message {message_id}")]
    DuplicateApprover {
        /// The approver submitting twice.
        approver_id: String,
        /// The message in question.
        message_id: String,
    },

    /// The approver is not in the configured pool.
    #[error("Approver '{approver_id}' is not eligible")]
    ApproverNotEligible {
        /// The unrecognized approver.
        approver_id: String,
    },

    /// The approver's signature over the message id did not verify.
    #[error("Authorization signature from '{approver_id}' did not verify")]
    InvalidApproverSignature {
        /// The approver whose signature failed.
        approver_id: String,
    },

    /// Signing was attempted before quorum.
    #[error("Insufficient authorization: need {required} distinct approvers, have {granted}")]
    InsufficientAuthorization {
        /// Approvals required by the tier.
        required: usize,
        /// Distinct approvals granted so far.
        granted: usize,
    },

    /// The message is already signed; re-signing and late authorization
    /// are rejected.
    #[error("Message {message_id} is already signed")]
    AlreadySigned {
        /// The message in question.
        message_id: String,
    },

    /// The operation is not valid in the message's current state.
    #[error("Message {message_id}: {reason}")]
    InvalidState {
        /// The message in question.
        message_id: String,
        /// Why the operation was refused.
        reason: String,
    },

    /// No message with this identifier is pending.
    #[error("Unknown message: {message_id}")]
    UnknownMessage {
        /// The unrecognized message identifier.
        message_id: String,
    },

    /// No active signing key is bound to the tier.
    #[error("No active signing key for tier {tier:?}")]
    UnknownTierKey {
        /// The tier lacking a key.
        tier: AlertTier,
    },

    /// Key-store fault or timeout during signing.
    ///
    /// Retryable: the message remains Authorized and the caller may
    /// issue a fresh signing attempt without re-authorization.
    #[error("Signing backend failure: {reason}")]
    SigningBackend {
        /// Reason for the failure.
        reason: String,
    },

    /// Message construction violated an invariant.
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        /// The violated invariant.
        reason: String,
    },

    /// The audit chain failed integrity verification.
    ///
    /// Fatal to automated trust decisions: quorum and signing refuse to
    /// proceed until an operator intervenes. The chain is never
    /// repaired automatically.
    #[error("Audit chain integrity failure at sequence {first_broken}")]
    ChainIntegrity {
        /// First sequence whose hash diverged.
        first_broken: u64,
    },

    /// The peer's signature or identity could not be trusted.
    #[error("Peer trust failure for '{peer_id}': {reason}")]
    PeerTrust {
        /// The peer jurisdiction.
        peer_id: String,
        /// Why trust failed.
        reason: String,
    },

    /// The mutual-aid agreement does not permit this relay.
    #[error("Peer '{peer_id}' is not permitted to relay '{category}' alerts")]
    RelayNotPermitted {
        /// The peer jurisdiction.
        peer_id: String,
        /// The alert category refused.
        category: String,
    },

    /// Audit log I/O failure.
    #[error("Audit log failure: {reason}")]
    Audit {
        /// Reason for the failure.
        reason: String,
    },

    /// Key-store error outside the signing path.
    #[error("Keystore error: {0}")]
    Keystore(#[from] lumen_keystore::KeystoreError),

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] lumen_crypto::CryptoError),
}

impl CoreError {
    /// Whether a fresh attempt at the same operation may succeed.
    ///
    /// Only signing-backend faults are retryable; authorization and
    /// tier-key errors require a new authorization round or operator
    /// action.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SigningBackend { .. })
    }

    /// Whether this error must halt automated trust decisions.
    #[must_use]
    pub fn is_fatal_to_trust(&self) -> bool {
        matches!(self, Self::ChainIntegrity { .. })
    }
}
