// ABOUTME: Core types for privilege grants — modes, grant records, and decision outcomes.
// ABOUTME: GrantMode, GrantVia, GrantStatus, AccessGrant, DenyReason, and CommandDecision.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The privilege track a grant elevates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantMode {
    /// Execute elevated commands.
    Sudo,
    /// Access administrative and portal functions.
    Debug,
}

impl GrantMode {
    /// Every mode, in a stable order.
    pub const ALL: [GrantMode; 2] = [GrantMode::Sudo, GrantMode::Debug];

    /// Stable slot index used by the ledger.
    pub fn index(self) -> usize {
        match self {
            GrantMode::Sudo => 0,
            GrantMode::Debug => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GrantMode::Sudo => "sudo",
            GrantMode::Debug => "debug",
        }
    }
}

impl fmt::Display for GrantMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GrantMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sudo" => Ok(GrantMode::Sudo),
            "debug" | "debugmode" => Ok(GrantMode::Debug),
            other => Err(format!("unknown mode '{other}' (expected sudo or debug)")),
        }
    }
}

/// How the operator proved who they are when the grant was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantVia {
    Keyword,
    Voice,
}

/// Why a grant was revoked before it expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RevokeReason {
    /// A newer grant for the same mode replaced this one.
    Superseded,
    /// The operator ended the grant explicitly.
    Operator,
    /// The system ended the grant (e.g. suspicious activity).
    System,
    /// The voice profile the grant was issued under was replaced.
    ProfileReplaced,
}

impl fmt::Display for RevokeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RevokeReason::Superseded => "superseded",
            RevokeReason::Operator => "operator",
            RevokeReason::System => "system",
            RevokeReason::ProfileReplaced => "profile-replaced",
        };
        f.write_str(s)
    }
}

/// Lifecycle state of a single grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "state", content = "reason")]
pub enum GrantStatus {
    Active,
    Expired,
    Revoked(RevokeReason),
}

impl GrantStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GrantStatus::Active)
    }
}

/// A time-bounded elevation of privilege for one mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    /// Monotonic identifier assigned by the ledger.
    pub id: u64,
    pub mode: GrantMode,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub granted_via: GrantVia,
    pub status: GrantStatus,
}

impl AccessGrant {
    /// Whether this grant's window has closed at `now`.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, or zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }
}

/// Why an authentication or authorization request was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "detail")]
pub enum DenyReason {
    /// No grant has ever been issued (or the last one was revoked) for the mode.
    NoGrant,
    /// The most recent grant for the mode has expired.
    Expired,
    /// The command matched a dangerous pattern.
    DangerousCommand(String),
    /// The utterance did not match any configured phrase.
    NoMatch,
    /// The utterance matched a phrase but the duration code was garbage.
    InvalidDurationCode(String),
    /// No voice profile is enrolled for the operator.
    NoProfile,
    /// The voice sample did not match the enrolled profile.
    NotMatched,
    /// This mode requires a voice match alongside the keyword.
    VoiceRequired,
    /// An unexpected fault occurred; the request fails closed.
    Fault(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::NoGrant => f.write_str("no active grant"),
            DenyReason::Expired => f.write_str("grant expired"),
            DenyReason::DangerousCommand(category) => write!(f, "dangerous command ({category})"),
            DenyReason::NoMatch => f.write_str("no keyword matched"),
            DenyReason::InvalidDurationCode(token) => {
                write!(f, "invalid duration code '{token}'")
            }
            DenyReason::NoProfile => f.write_str("no voice profile enrolled"),
            DenyReason::NotMatched => f.write_str("voice did not match"),
            DenyReason::VoiceRequired => f.write_str("voice verification required"),
            DenyReason::Fault(detail) => write!(f, "fault: {detail}"),
        }
    }
}

/// Result of checking a command against the privilege state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandDecision {
    Allow,
    Deny(DenyReason),
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    GrantIssued(AccessGrant),
    Denied(DenyReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_mode_serde_roundtrip() {
        let json = serde_json::to_string(&GrantMode::Debug).unwrap();
        assert_eq!(json, "\"debug\"");
        let parsed: GrantMode = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, GrantMode::Debug);
    }

    #[test]
    fn grant_mode_from_str_accepts_aliases() {
        assert_eq!("SUDO".parse::<GrantMode>().unwrap(), GrantMode::Sudo);
        assert_eq!("debugmode".parse::<GrantMode>().unwrap(), GrantMode::Debug);
        assert!("root".parse::<GrantMode>().is_err());
    }

    #[test]
    fn revoked_status_serializes_reason() {
        let json = serde_json::to_string(&GrantStatus::Revoked(RevokeReason::Superseded)).unwrap();
        assert_eq!(json, r#"{"state":"revoked","reason":"superseded"}"#);
        assert!(GrantStatus::Expired.is_terminal());
        assert!(!GrantStatus::Active.is_terminal());
    }

    #[test]
    fn remaining_never_negative() {
        let t0 = Utc::now();
        let grant = AccessGrant {
            id: 1,
            mode: GrantMode::Sudo,
            granted_at: t0,
            expires_at: t0 + Duration::seconds(10),
            granted_via: GrantVia::Keyword,
            status: GrantStatus::Active,
        };
        assert_eq!(grant.remaining(t0), Duration::seconds(10));
        assert_eq!(grant.remaining(t0 + Duration::seconds(60)), Duration::zero());
        assert!(grant.is_past_expiry(t0 + Duration::seconds(10)));
        assert!(!grant.is_past_expiry(t0 + Duration::seconds(9)));
    }
}
