//! Tamper-evident audit logging.
//!
//! Every security-relevant action lands in an append-only, hash-chained
//! ledger. Each entry's hash covers the previous entry's hash, so
//! deleting or editing any entry breaks the chain from that sequence
//! onward. The chain cannot, by itself, defeat an attacker who controls
//! the entire log and recomputes every downstream hash; periodic
//! checkpointing of the latest hash to an external notary is a
//! collaborator responsibility.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{error, info, instrument, warn};

use crate::error::CoreError;

/// Previous-hash value of the genesis entry.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Types of auditable events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A message reached the Signed state.
    MessageSigned,
    /// A signed message was queued for delivery.
    MessageQueued,
    /// A device confirmed delivery.
    MessageDelivered,
    /// A signed message was explicitly revoked.
    MessageRevoked,
    /// A message expired before delivery.
    MessageExpired,
    /// A message entered the workflow awaiting authorization.
    AuthorizationRequested,
    /// An operator authorization was accepted.
    AuthorizationGranted,
    /// An operator authorization was refused.
    AuthorizationDenied,
    /// A device verified and accepted a message.
    VerificationAccepted,
    /// A device rejected a message.
    MessageRejected,
    /// A replayed nonce was detected.
    ReplayDetected,
    /// A signature failure raised the tamper-suspected signal.
    TamperSuspected,
    /// A signing key was generated.
    KeyGenerated,
    /// A tier's signing key was rotated.
    KeyRotated,
    /// A signing key was revoked.
    KeyRevoked,
    /// A signing key was destroyed under quorum approval.
    KeyDestroyed,
    /// A peer alert was accepted for local re-authorization.
    RelayAccepted,
    /// A peer alert was refused.
    RelayRejected,
    /// A pre-authorized external alert was accepted.
    ExternalAlertAccepted,
    /// The control point or a device booted.
    SystemBoot,
}

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    /// A human operator.
    Operator,
    /// The control point itself.
    ControlPoint,
    /// A field device.
    Device,
    /// A peer jurisdiction.
    Peer,
    /// Automated system activity.
    System,
}

/// Actor identifier and kind for an audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    /// Actor kind.
    pub kind: ActorKind,
    /// Actor identifier.
    pub id: String,
}

impl Actor {
    /// An operator actor.
    #[must_use]
    pub fn operator(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Operator,
            id: id.into(),
        }
    }

    /// The control point actor.
    #[must_use]
    pub fn control_point() -> Self {
        Self {
            kind: ActorKind::ControlPoint,
            id: "control-point".to_string(),
        }
    }

    /// A field-device actor.
    #[must_use]
    pub fn device(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Device,
            id: id.into(),
        }
    }

    /// A peer-jurisdiction actor.
    #[must_use]
    pub fn peer(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Peer,
            id: id.into(),
        }
    }

    /// The system actor.
    #[must_use]
    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: "system".to_string(),
        }
    }
}

/// An event submitted for appending.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    /// Event type.
    pub event_type: AuditEventType,
    /// Who performed the action.
    pub actor: Actor,
    /// What the action was performed on (message id, key id, device id).
    pub target: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Free-form structured detail.
    pub details: Value,
}

/// A single committed audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonically increasing sequence number, starting at 1.
    pub sequence: u64,
    /// Unique entry identifier.
    pub entry_id: String,
    /// Commit time (unix seconds).
    pub timestamp: i64,
    /// Hash of the previous entry ([`GENESIS_HASH`] for the first).
    pub previous_hash: String,
    /// Hash of this entry.
    pub entry_hash: String,
    /// Event type.
    pub event_type: AuditEventType,
    /// Who performed the action.
    pub actor: Actor,
    /// What the action targeted.
    pub target: String,
    /// Whether the action succeeded.
    pub success: bool,
    /// Free-form structured detail.
    pub details: Value,
}

impl AuditEntry {
    /// Compute the expected hash for this entry.
    ///
    /// `entry_hash = SHA-256(previous_hash_utf8 || canonical_json(fields
    /// except entry_hash))`; the canonical JSON has sorted keys and
    /// compact separators.
    #[must_use]
    pub fn compute_hash(&self) -> String {
        let canonical = serde_json::json!({
            "sequence": self.sequence,
            "entry_id": self.entry_id,
            "timestamp": self.timestamp,
            "previous_hash": self.previous_hash,
            "event_type": self.event_type,
            "actor": self.actor,
            "target": self.target,
            "success": self.success,
            "details": self.details,
        });
        let canonical_json = serde_json::to_string(&canonical).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(canonical_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Verify this entry's stored hash against a recomputation.
    #[must_use]
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.entry_hash
    }
}

/// Result of a full chain verification walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Whether every entry verified.
    pub valid: bool,
    /// Inclusive sequence ranges invalidated by a divergence. A break
    /// at sequence N invalidates every entry from N to the end, since
    /// each hash depends on all prior entries.
    pub broken_ranges: Vec<(u64, u64)>,
}

struct WriterState {
    next_sequence: u64,
    last_hash: String,
    sink: Option<std::fs::File>,
    sink_path: Option<PathBuf>,
}

/// Append-only, hash-chained audit log.
///
/// Writers are serialized through a single writer lock (one global
/// append order); readers run concurrently and always observe a
/// consistent prefix. With a file sink configured, the entry line is
/// written and flushed before the append is acknowledged.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    writer: Mutex<WriterState>,
    tainted: AtomicBool,
}

impl AuditLog {
    /// Create a memory-only audit log.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            writer: Mutex::new(WriterState {
                next_sequence: 1,
                last_hash: GENESIS_HASH.to_string(),
                sink: None,
                sink_path: None,
            }),
            tainted: AtomicBool::new(false),
        }
    }

    /// Open a file-backed audit log, loading and checking any existing
    /// chain.
    ///
    /// A broken chain on disk is loaded anyway so the evidence is
    /// preserved, but the log starts tainted and
    /// [`AuditLog::require_integrity`] fails until an operator
    /// intervenes.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Audit`] when the file cannot be opened or a
    /// line cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();
        let mut entries = Vec::new();

        if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| CoreError::Audit {
                reason: format!("read audit log: {e}"),
            })?;

            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let entry: AuditEntry =
                    serde_json::from_str(line).map_err(|e| CoreError::Audit {
                        reason: format!("parse audit entry: {e}"),
                    })?;
                entries.push(entry);
            }
        }

        let (next_sequence, last_hash) = match entries.last() {
            Some(last) => (last.sequence + 1, last.entry_hash.clone()),
            None => (1, GENESIS_HASH.to_string()),
        };

        let sink = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| CoreError::Audit {
                reason: format!("open audit log: {e}"),
            })?;

        let log = Self {
            entries: RwLock::new(entries),
            writer: Mutex::new(WriterState {
                next_sequence,
                last_hash,
                sink: Some(sink),
                sink_path: Some(path.to_path_buf()),
            }),
            tainted: AtomicBool::new(false),
        };

        let verification = log.verify_chain();
        if verification.valid {
            info!(
                entries = log.len(),
                path = %path.display(),
                "Audit log opened, chain intact"
            );
        } else {
            error!(
                path = %path.display(),
                broken = ?verification.broken_ranges,
                "AUDIT CHAIN BROKEN on load"
            );
        }

        Ok(log)
    }

    /// Append an event to the chain.
    ///
    /// The entry is hashed against the previous entry, persisted to the
    /// sink (when configured) and only then acknowledged. Partial
    /// writes are not observable: in-memory state changes only after
    /// the sink accepts the line.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Audit`] when the sink write fails; the
    /// in-memory chain is unchanged in that case.
    pub fn append(&self, event: AuditEvent) -> Result<AuditEntry, CoreError> {
        let mut writer = self.writer.lock().map_err(|_| CoreError::Audit {
            reason: "writer lock poisoned".to_string(),
        })?;

        let mut entry_id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut entry_id_bytes);

        let mut entry = AuditEntry {
            sequence: writer.next_sequence,
            entry_id: format!("evt-{}", hex::encode(entry_id_bytes)),
            timestamp: chrono::Utc::now().timestamp(),
            previous_hash: writer.last_hash.clone(),
            entry_hash: String::new(),
            event_type: event.event_type,
            actor: event.actor,
            target: event.target,
            success: event.success,
            details: event.details,
        };
        entry.entry_hash = entry.compute_hash();

        if let Some(sink) = writer.sink.as_mut() {
            let line = serde_json::to_string(&entry).map_err(|e| CoreError::Audit {
                reason: format!("serialize audit entry: {e}"),
            })?;
            sink.write_all(line.as_bytes())
                .and_then(|()| sink.write_all(b"\n"))
                .and_then(|()| sink.flush())
                .map_err(|e| CoreError::Audit {
                    reason: format!("write audit entry: {e}"),
                })?;
        }

        writer.next_sequence += 1;
        writer.last_hash = entry.entry_hash.clone();

        {
            let mut entries = match self.entries.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            entries.push(entry.clone());
        }

        Ok(entry)
    }

    /// Number of committed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the log has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all committed entries (a consistent prefix).
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Entries matching an event type, oldest first.
    #[must_use]
    pub fn entries_of_type(&self, event_type: AuditEventType) -> Vec<AuditEntry> {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.event_type == event_type)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Walk the chain from genesis, recomputing every hash.
    ///
    /// On divergence the log is marked tainted and
    /// [`AuditLog::require_integrity`] fails until an operator clears
    /// the taint. The chain itself is never modified.
    #[instrument(skip(self))]
    pub fn verify_chain(&self) -> ChainVerification {
        let entries = match self.entries.read() {
            Ok(entries) => entries,
            Err(_) => {
                self.tainted.store(true, Ordering::SeqCst);
                return ChainVerification {
                    valid: false,
                    broken_ranges: vec![(0, 0)],
                };
            }
        };

        let mut first_broken: Option<u64> = None;
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_seq = 1u64;

        for entry in entries.iter() {
            let gap = entry.sequence != expected_seq;
            let bad_link = entry.previous_hash != expected_prev;
            let bad_hash = !entry.verify_hash();

            if (gap || bad_link || bad_hash) && first_broken.is_none() {
                first_broken = Some(entry.sequence);
            }

            expected_prev = entry.entry_hash.clone();
            expected_seq = entry.sequence + 1;
        }

        let last_sequence = entries.last().map_or(0, |e| e.sequence);
        drop(entries);

        match first_broken {
            None => ChainVerification {
                valid: true,
                broken_ranges: Vec::new(),
            },
            Some(first) => {
                self.tainted.store(true, Ordering::SeqCst);
                warn!(
                    first_broken = first,
                    last_sequence, "Audit chain verification FAILED"
                );
                ChainVerification {
                    valid: false,
                    broken_ranges: vec![(first, last_sequence)],
                }
            }
        }
    }

    /// Fail when the chain is known-broken.
    ///
    /// Called before quorum and signing decisions that depend on
    /// historical entries.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ChainIntegrity`] while the log is tainted.
    pub fn require_integrity(&self) -> Result<(), CoreError> {
        if self.tainted.load(Ordering::SeqCst) {
            let first_broken = self
                .verify_chain_quiet_first_broken()
                .unwrap_or_default();
            return Err(CoreError::ChainIntegrity { first_broken });
        }
        Ok(())
    }

    fn verify_chain_quiet_first_broken(&self) -> Option<u64> {
        let entries = self.entries.read().ok()?;
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut expected_seq = 1u64;
        for entry in entries.iter() {
            if entry.sequence != expected_seq
                || entry.previous_hash != expected_prev
                || !entry.verify_hash()
            {
                return Some(entry.sequence);
            }
            expected_prev = entry.entry_hash.clone();
            expected_seq = entry.sequence + 1;
        }
        None
    }

    /// Operator acknowledgment after out-of-band investigation.
    ///
    /// Clears the taint latch so automated decisions resume. Does NOT
    /// repair the chain; the broken evidence stays on disk and in
    /// memory, and the acknowledgment itself is appended to the log.
    pub fn acknowledge_tamper(&self, operator_id: &str) {
        warn!(operator_id, "Audit taint cleared by operator acknowledgment");
        self.tainted.store(false, Ordering::SeqCst);
        let _ = self.append(AuditEvent {
            event_type: AuditEventType::TamperSuspected,
            actor: Actor::operator(operator_id),
            target: "audit-chain".to_string(),
            success: true,
            details: serde_json::json!({"action": "taint_acknowledged"}),
        });
    }

    /// Path of the file sink, when configured.
    #[must_use]
    pub fn sink_path(&self) -> Option<PathBuf> {
        self.writer
            .lock()
            .ok()
            .and_then(|w| w.sink_path.clone())
    }

    /// Overwrite a committed entry's details without recomputing its
    /// hash. Test-only: simulates retroactive tampering.
    #[cfg(test)]
    pub(crate) fn tamper_details_for_test(&self, index: usize, details: Value) {
        if let Ok(mut entries) = self.entries.write() {
            if let Some(entry) = entries.get_mut(index) {
                entry.details = details;
            }
        }
    }

    // Convenience emitters for the common events.

    /// Record a successful signing.
    pub fn record_signed(
        &self,
        message_id: &str,
        tier: &str,
        key_id: &str,
    ) -> Result<AuditEntry, CoreError> {
        self.append(AuditEvent {
            event_type: AuditEventType::MessageSigned,
            actor: Actor::control_point(),
            target: message_id.to_string(),
            success: true,
            details: serde_json::json!({"tier": tier, "signing_key_id": key_id}),
        })
    }

    /// Record a device-side rejection.
    pub fn record_rejected(
        &self,
        device_id: &str,
        message_id: &str,
        reason: &str,
    ) -> Result<AuditEntry, CoreError> {
        self.append(AuditEvent {
            event_type: AuditEventType::MessageRejected,
            actor: Actor::device(device_id),
            target: message_id.to_string(),
            success: false,
            details: serde_json::json!({"reason": reason}),
        })
    }

    /// Record the tamper-suspected signal.
    pub fn record_tamper_suspected(
        &self,
        device_id: &str,
        message_id: &str,
    ) -> Result<AuditEntry, CoreError> {
        self.append(AuditEvent {
            event_type: AuditEventType::TamperSuspected,
            actor: Actor::device(device_id),
            target: message_id.to_string(),
            success: false,
            details: serde_json::json!({"reason": "signature_invalid"}),
        })
    }
}

/// Bounded in-memory view of recent entries, oldest evicted first.
///
/// Operator dashboards poll this instead of walking the full chain.
#[derive(Debug, Default)]
pub struct RecentEvents {
    capacity: usize,
    events: VecDeque<AuditEntry>,
}

impl RecentEvents {
    /// Create a view holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Push an entry, evicting the oldest at capacity.
    pub fn push(&mut self, entry: AuditEntry) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(entry);
    }

    /// Entries currently held, oldest first.
    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.events.iter()
    }
}
