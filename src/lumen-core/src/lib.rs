//! # lumen-core
//!
//! Trust-no-edge message authorization for city alert-sign networks: a
//! trusted control point issues cryptographically signed, tier-gated
//! commands; untrusted field devices verify and audit every command
//! before acting on it.
//!
//! ## Architecture
//!
//! ```text
//! event ──> tier policy ──> AuthorizationWorkflow ──> sign (KeyStore)
//!              (pure)        quorum per message         │
//!                                                       ▼
//!                                                   AuditLog ── hash chain
//!                                                       │
//!              delivery (external collaborator)         │
//!                            │                          │
//!                            ▼                          ▼
//!                      EdgeVerifier ──────────> device audit + render
//!                      replay cache,
//!                      key trust window
//!
//!   MutualAidRelay / ExternalAlertGate sit beside the workflow,
//!   consuming externally signed alerts and re-signing them locally.
//! ```
//!
//! ## Security Properties
//!
//! - **Quorum before signing**: warning needs one operator, emergency
//!   two distinct operators from a pool of at least three
//! - **Deterministic canonicalization**: signatures cover a fixed-order
//!   binary payload any verifier can reproduce
//! - **Replay protection**: bounded per-device nonce cache, atomic
//!   check-then-insert
//! - **Tamper-evident audit**: hash-chained append-only ledger; a
//!   broken chain halts automated trust decisions
//! - **Local authority only**: relayed and pass-through alerts are
//!   re-signed under local tier keys before any device accepts them

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod canonical;
pub mod config;
pub mod control;
pub mod error;
pub mod message;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod tier;
pub mod verifier;
pub mod workflow;

pub use audit::{
    Actor, ActorKind, AuditEntry, AuditEvent, AuditEventType, AuditLog, ChainVerification,
    GENESIS_HASH,
};
pub use canonical::{external_alert_payload, signing_payload, signing_payload_for, DOMAIN_TAG};
pub use config::CoreConfig;
pub use control::ControlPoint;
pub use error::CoreError;
pub use message::{
    authorization_payload, Authorization, AuthorizationKind, SignedMessage, TargetDevices,
};
pub use registry::{KeyRecord, KeyRegistry, KeyStatus};
pub use relay::{ExternalAlert, ExternalAlertGate, MutualAidRelay, PeerRegistry, TrustAnchor, TrustAnchorSet};
pub use replay::NonceCache;
pub use tier::{classify, is_template_autonomous, AlertTier, ApproverPool, EventContext};
pub use verifier::{EdgeVerifier, RejectReason, Verdict};
pub use workflow::{operator_authorization, AuthorizationWorkflow, MessageState};
