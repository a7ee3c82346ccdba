// ABOUTME: Access grant ledger — the per-mode grant state machine and its expiry rules.
// ABOUTME: Issue, supersede, expire, and revoke transitions, each linearized under a per-mode lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{error, info};

use super::types::{AccessGrant, GrantMode, GrantStatus, GrantVia, RevokeReason};
use crate::audit::{AuditError, AuditEventKind, AuditLog, AuditOutcome, AuditRecord};
use crate::clock::Clock;

/// Actor recorded for transitions the ledger performs on its own.
pub const LEDGER_ACTOR: &str = "ledger";
/// Actor recorded for expiries found by the background sweep.
pub const SWEEP_ACTOR: &str = "sweep";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("grant duration must be positive (got {0}s)")]
    InvalidDuration(i64),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

/// Result of an atomic privilege check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantCheck {
    Active(AccessGrant),
    /// The most recent grant for the mode ran out.
    Expired,
    /// Nothing issued, or the last grant was revoked.
    NoGrant,
}

/// Point-in-time view of one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeSnapshot {
    pub mode: GrantMode,
    pub active: Option<AccessGrant>,
    pub last_terminal: Option<AccessGrant>,
}

#[derive(Debug, Default)]
struct ModeSlot {
    active: Option<AccessGrant>,
    last_terminal: Option<AccessGrant>,
}

/// Owns the active-grant slot for each mode.
///
/// Every transition for a mode happens while that mode's lock is held, and the
/// matching audit entry is appended before the lock is released, so audit order
/// always agrees with transition order. Expiry is checked inside the same
/// critical section as every read, so a query can never observe a grant whose
/// window has closed.
#[derive(Debug)]
pub struct AccessGrantLedger {
    slots: [Mutex<ModeSlot>; 2],
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl AccessGrantLedger {
    pub fn new(clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            slots: [Mutex::new(ModeSlot::default()), Mutex::new(ModeSlot::default())],
            next_id: AtomicU64::new(1),
            clock,
            audit,
        }
    }

    fn slot(&self, mode: GrantMode) -> MutexGuard<'_, ModeSlot> {
        self.slots[mode.index()]
            .lock()
            .expect("ledger slot lock poisoned")
    }

    /// Expire the active grant in `slot` if its window has closed. Idempotent.
    fn expire_locked(&self, slot: &mut ModeSlot, now: DateTime<Utc>, actor: &str) -> Option<AccessGrant> {
        let due = slot.active.as_ref().is_some_and(|g| g.is_past_expiry(now));
        if !due {
            return None;
        }
        let mut grant = slot.active.take()?;
        grant.status = GrantStatus::Expired;
        info!(mode = %grant.mode, grant_id = grant.id, actor, "grant expired");
        let record = AuditRecord::new(AuditEventKind::GrantExpired, actor, AuditOutcome::Success)
            .mode(grant.mode)
            .grant(grant.id)
            .detail(format!("expired at {}", grant.expires_at.to_rfc3339()));
        if let Err(e) = self.audit.record(record) {
            // The transition stands regardless; losing the record must not keep privilege alive.
            error!(grant_id = grant.id, error = %e, "failed to audit grant expiry");
        }
        slot.last_terminal = Some(grant.clone());
        Some(grant)
    }

    /// Revoke the active grant in `slot`, auditing first so a failed write leaves state untouched.
    fn revoke_locked(
        &self,
        slot: &mut ModeSlot,
        reason: RevokeReason,
        actor: &str,
    ) -> Result<Option<AccessGrant>, AuditError> {
        let Some(active) = slot.active.as_ref() else {
            return Ok(None);
        };
        self.audit.record(
            AuditRecord::new(AuditEventKind::GrantRevoked, actor, AuditOutcome::Success)
                .mode(active.mode)
                .grant(active.id)
                .detail(format!("revoked: {reason}")),
        )?;
        let Some(mut grant) = slot.active.take() else {
            return Ok(None);
        };
        grant.status = GrantStatus::Revoked(reason);
        info!(mode = %grant.mode, grant_id = grant.id, %reason, "grant revoked");
        slot.last_terminal = Some(grant.clone());
        Ok(Some(grant))
    }

    /// Issue a fresh grant for `mode`, superseding any active one.
    ///
    /// The superseded grant is recorded Revoked(Superseded) before the new grant
    /// becomes visible; a concurrent check sees either the old grant or the new
    /// one, never both and never neither-then-both.
    pub fn issue(
        &self,
        mode: GrantMode,
        duration: Duration,
        via: GrantVia,
        actor: &str,
    ) -> Result<AccessGrant, LedgerError> {
        if duration <= Duration::zero() {
            return Err(LedgerError::InvalidDuration(duration.num_seconds()));
        }

        let mut slot = self.slot(mode);
        let now = self.clock.now();
        self.expire_locked(&mut slot, now, LEDGER_ACTOR);
        self.revoke_locked(&mut slot, RevokeReason::Superseded, LEDGER_ACTOR)?;

        let grant = AccessGrant {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            mode,
            granted_at: now,
            expires_at: now + duration,
            granted_via: via,
            status: GrantStatus::Active,
        };
        let via_str = match via {
            GrantVia::Keyword => "keyword",
            GrantVia::Voice => "voice",
        };
        self.audit.record(
            AuditRecord::new(AuditEventKind::GrantIssued, actor, AuditOutcome::Success)
                .mode(mode)
                .grant(grant.id)
                .detail(format!(
                    "via {via_str} for {}s until {}",
                    duration.num_seconds(),
                    grant.expires_at.to_rfc3339()
                )),
        )?;
        info!(%mode, grant_id = grant.id, seconds = duration.num_seconds(), via = via_str, "grant issued");
        slot.active = Some(grant.clone());
        Ok(grant)
    }

    /// The active grant for `mode`, expiring it first if its window has closed.
    pub fn current_grant(&self, mode: GrantMode) -> Option<AccessGrant> {
        let mut slot = self.slot(mode);
        let now = self.clock.now();
        self.expire_locked(&mut slot, now, LEDGER_ACTOR);
        slot.active.clone()
    }

    /// Check-and-expire in one critical section, distinguishing expired from never granted.
    pub fn check(&self, mode: GrantMode) -> GrantCheck {
        let mut slot = self.slot(mode);
        let now = self.clock.now();
        self.expire_locked(&mut slot, now, LEDGER_ACTOR);
        match (&slot.active, &slot.last_terminal) {
            (Some(grant), _) => GrantCheck::Active(grant.clone()),
            (None, Some(last)) if last.status == GrantStatus::Expired => GrantCheck::Expired,
            _ => GrantCheck::NoGrant,
        }
    }

    /// End the active grant for `mode` early. Returns the revoked grant, if any.
    pub fn revoke(
        &self,
        mode: GrantMode,
        reason: RevokeReason,
        actor: &str,
    ) -> Result<Option<AccessGrant>, LedgerError> {
        let mut slot = self.slot(mode);
        let now = self.clock.now();
        self.expire_locked(&mut slot, now, LEDGER_ACTOR);
        Ok(self.revoke_locked(&mut slot, reason, actor)?)
    }

    /// Revoke every active grant issued via `via`.
    pub fn revoke_issued_via(
        &self,
        via: GrantVia,
        reason: RevokeReason,
        actor: &str,
    ) -> Result<Vec<AccessGrant>, LedgerError> {
        let mut revoked = Vec::new();
        for mode in GrantMode::ALL {
            let mut slot = self.slot(mode);
            let now = self.clock.now();
            self.expire_locked(&mut slot, now, LEDGER_ACTOR);
            if slot.active.as_ref().is_some_and(|g| g.granted_via == via) {
                revoked.extend(self.revoke_locked(&mut slot, reason, actor)?);
            }
        }
        Ok(revoked)
    }

    /// Expire every grant whose window has closed. Returns what was expired.
    pub fn sweep(&self) -> Vec<AccessGrant> {
        let mut expired = Vec::new();
        for mode in GrantMode::ALL {
            let mut slot = self.slot(mode);
            let now = self.clock.now();
            expired.extend(self.expire_locked(&mut slot, now, SWEEP_ACTOR));
        }
        expired
    }

    /// Current view of every mode, with lazy expiry applied.
    pub fn snapshot(&self) -> Vec<ModeSnapshot> {
        GrantMode::ALL
            .iter()
            .map(|&mode| {
                let mut slot = self.slot(mode);
                let now = self.clock.now();
                self.expire_locked(&mut slot, now, LEDGER_ACTOR);
                ModeSnapshot {
                    mode,
                    active: slot.active.clone(),
                    last_terminal: slot.last_terminal.clone(),
                }
            })
            .collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}
