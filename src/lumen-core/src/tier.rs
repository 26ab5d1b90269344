//! Alert tier classification and per-tier authorization policy.
//!
//! Classification is a pure function from a detection event to a tier;
//! each tier carries its static policy: minimum distinct authorizations,
//! message time-to-live, and an advisory latency bound. The policy
//! tables are immutable configuration, read concurrently without
//! locking.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Alert severity tiers with increasing authorization requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertTier {
    /// Crowd counts, weather, wayfinding. Autonomous.
    Informational,
    /// Congestion, weather advisories. Autonomous.
    Advisory,
    /// Smoke detected, situation under investigation. One operator.
    Warning,
    /// Confirmed fire, evacuation. Two of a pool of at least three.
    Emergency,
    /// Externally pre-authorized alerts (government feed). Zero local
    /// authorizations, but the same signing, verification and audit
    /// discipline as every other tier.
    PassThrough,
}

impl AlertTier {
    /// All tiers, in escalation order.
    pub const ALL: [AlertTier; 5] = [
        AlertTier::Informational,
        AlertTier::Advisory,
        AlertTier::Warning,
        AlertTier::Emergency,
        AlertTier::PassThrough,
    ];

    /// Stable one-byte code used in the canonical signing payload.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::Informational => 1,
            Self::Advisory => 2,
            Self::Warning => 3,
            Self::Emergency => 4,
            Self::PassThrough => 5,
        }
    }

    /// Wire label for the tier.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::Advisory => "advisory",
            Self::Warning => "warning",
            Self::Emergency => "emergency",
            Self::PassThrough => "pass-through",
        }
    }

    /// Minimum number of distinct approver authorizations required
    /// before a message of this tier may be signed.
    #[must_use]
    pub const fn min_authorizations(&self) -> usize {
        match self {
            Self::Emergency => 2, // 2 of a pool of >= 3
            Self::Warning => 1,
            _ => 0, // Autonomous or externally pre-authorized
        }
    }

    /// Whether an operator must approve messages of this tier.
    #[must_use]
    pub const fn requires_operator(&self) -> bool {
        self.min_authorizations() > 0
    }

    /// Whether this tier requires multi-party authorization.
    #[must_use]
    pub const fn requires_multiparty(&self) -> bool {
        self.min_authorizations() > 1
    }

    /// Default time-to-live for messages of this tier.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        match self {
            Self::Informational => Duration::from_secs(300),
            Self::Advisory => Duration::from_secs(600),
            Self::Warning => Duration::from_secs(900),
            Self::Emergency => Duration::from_secs(1800),
            Self::PassThrough => Duration::from_secs(3600), // defer to feed expiry
        }
    }

    /// Longest TTL across all tiers. Sizes the replay-cache entry lifetime.
    #[must_use]
    pub const fn max_ttl() -> Duration {
        Duration::from_secs(3600)
    }

    /// Maximum acceptable end-to-end latency for this tier.
    ///
    /// Advisory to delivery collaborators only; the core does not
    /// enforce it.
    #[must_use]
    pub const fn max_latency(&self) -> Duration {
        match self {
            Self::Informational => Duration::from_secs(1),
            Self::Advisory => Duration::from_secs(2),
            Self::Warning => Duration::from_secs(60),
            Self::Emergency => Duration::from_secs(120),
            Self::PassThrough => Duration::from_secs(5),
        }
    }
}

/// Context accompanying a detection event into classification.
#[derive(Debug, Clone, Default)]
pub struct EventContext {
    /// Where the event was detected.
    pub location: Option<String>,
    /// Which collaborator produced the event.
    pub source: Option<String>,
    /// The event arrived pre-authorized from an external authority.
    pub pre_authorized: bool,
}

/// Classify a detection event into an alert tier.
///
/// Pure function, no side effects. Thresholds by event severity:
///
/// | Event kinds | >= 0.9 | >= 0.85 | >= 0.7 | below |
/// |---|---|---|---|---|
/// | fire, active_shooter, explosion | Emergency | - | Warning | Advisory |
/// | smoke, fight, medical_emergency | - | Warning | - | Advisory |
/// | crowd, congestion, weather | Informational | | | |
///
/// # Errors
///
/// Returns [`CoreError::UnknownEventKind`] when the rules do not cover
/// `event_kind`. The caller must treat that as the most conservative
/// (emergency) tier, never the most permissive.
pub fn classify(
    event_kind: &str,
    confidence: f64,
    context: &EventContext,
) -> Result<AlertTier, CoreError> {
    if context.pre_authorized {
        return Ok(AlertTier::PassThrough);
    }

    match event_kind {
        "fire" | "active_shooter" | "explosion" => {
            if confidence >= 0.9 {
                Ok(AlertTier::Emergency)
            } else if confidence >= 0.7 {
                Ok(AlertTier::Warning)
            } else {
                Ok(AlertTier::Advisory)
            }
        }
        "smoke" | "fight" | "medical_emergency" => {
            if confidence >= 0.85 {
                Ok(AlertTier::Warning)
            } else {
                Ok(AlertTier::Advisory)
            }
        }
        "crowd" | "congestion" | "weather" => Ok(AlertTier::Informational),
        other => Err(CoreError::UnknownEventKind {
            kind: other.to_string(),
        }),
    }
}

/// Pre-approved templates the autonomous tiers may display without an
/// operator in the loop.
const INFORMATIONAL_TEMPLATES: &[&str] = &[
    "crowd-count",
    "weather-current",
    "time-display",
    "event-info",
    "wayfinding",
];

const ADVISORY_TEMPLATES: &[&str] = &[
    "area-congested",
    "weather-advisory",
    "event-starting",
    "event-ending",
    "alternate-route",
];

/// Check whether a template may be displayed autonomously at this tier.
///
/// Operator tiers never have autonomous templates.
#[must_use]
pub fn is_template_autonomous(tier: AlertTier, template_id: &str) -> bool {
    if tier.requires_operator() {
        return false;
    }

    match tier {
        AlertTier::Informational => INFORMATIONAL_TEMPLATES.contains(&template_id),
        AlertTier::Advisory => ADVISORY_TEMPLATES.contains(&template_id),
        _ => false,
    }
}

/// The configured pool of approvers eligible to authorize messages.
///
/// Approver authorization signatures are Ed25519 over the pending
/// message identifier.
#[derive(Debug, Clone, Default)]
pub struct ApproverPool {
    keys: HashMap<String, Vec<u8>>,
}

impl ApproverPool {
    /// Build a pool from (approver id, Ed25519 public key) pairs.
    #[must_use]
    pub fn new(keys: HashMap<String, Vec<u8>>) -> Self {
        Self { keys }
    }

    /// Register an approver.
    pub fn register(&mut self, approver_id: impl Into<String>, public_key: Vec<u8>) {
        self.keys.insert(approver_id.into(), public_key);
    }

    /// Look up an approver's public key.
    #[must_use]
    pub fn public_key(&self, approver_id: &str) -> Option<&[u8]> {
        self.keys.get(approver_id).map(Vec::as_slice)
    }

    /// Number of eligible approvers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
