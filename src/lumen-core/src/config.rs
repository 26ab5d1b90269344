//! Configuration for the authorization core.

use std::path::PathBuf;
use std::time::Duration;

use crate::tier::AlertTier;

/// Configuration shared by the workflow, verifier and audit log.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Tolerated clock skew between control point and devices.
    pub clock_skew_tolerance: Duration,
    /// Per-device replay cache capacity (nonces).
    pub replay_capacity: usize,
    /// Replay cache entry lifetime; at least the longest tier TTL.
    pub replay_ttl: Duration,
    /// How many rotated keys per tier stay trusted.
    pub rotation_window: usize,
    /// Bound on a single key-store signing round-trip.
    pub signing_timeout: Duration,
    /// Audit log file; memory-only when `None`.
    pub audit_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            clock_skew_tolerance: Duration::from_secs(30),
            // ~4 deliveries/second sustained across the longest tier TTL
            replay_capacity: 8192,
            replay_ttl: AlertTier::max_ttl(),
            rotation_window: 2,
            signing_timeout: Duration::from_secs(10),
            audit_path: None,
        }
    }
}
