// ABOUTME: Access control engine — routes authentication events and command checks through the policies.
// ABOUTME: Owns the ledger, voice store, keyword policy, filter, and audit log; fails closed on every fault.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::filter::{Classification, DangerousCommandFilter, PolicyError};
use super::keyword::{KeywordError, KeywordPolicy, KeywordsFile, Resolution};
use super::ledger::{AccessGrantLedger, GrantCheck, LedgerError};
use super::sweep::{SweepHandle, spawn_expiry_sweep};
use super::types::{
    AccessGrant, AuthOutcome, CommandDecision, DenyReason, GrantMode, GrantStatus, GrantVia,
    RevokeReason,
};
use crate::audit::{AuditError, AuditEventKind, AuditLog, AuditLogEntry, AuditOutcome, AuditRecord};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StatePaths};
use crate::voice::{AudioSample, Committed, EnrollmentSession, VerifyOutcome, VoiceBiometricStore, VoiceError};

/// Longest command excerpt kept in an audit entry.
const COMMAND_EXCERPT_CHARS: usize = 160;

/// An authentication attempt delivered by the speech pipeline or the portal.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// A transcribed utterance such as `"sudo code 0"`.
    Keyword(String),
    /// A voice sample claiming the operator's identity for `mode`.
    Voice { mode: GrantMode, sample: AudioSample },
    /// Keyword and voice together; the keyword picks the mode and duration.
    KeywordWithVoice {
        utterance: String,
        sample: AudioSample,
    },
}

impl AuthEvent {
    fn channel(&self) -> &'static str {
        match self {
            AuthEvent::Keyword(_) => "keyword",
            AuthEvent::Voice { .. } => "voice",
            AuthEvent::KeywordWithVoice { .. } => "keyword+voice",
        }
    }
}

/// Failures of administrative operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Keyword(#[from] KeywordError),
    #[error(transparent)]
    Voice(#[from] VoiceError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result of a stand-alone voice check. The similarity score is never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceCheck {
    Matched,
    NotMatched,
    NoProfile,
}

impl fmt::Display for VoiceCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VoiceCheck::Matched => "matched",
            VoiceCheck::NotMatched => "not matched",
            VoiceCheck::NoProfile => "no voice profile enrolled",
        })
    }
}

/// Whether a mode currently holds privilege.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeState {
    Inactive,
    Active {
        remaining: Duration,
        via: GrantVia,
        expires_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeStatus {
    pub mode: GrantMode,
    pub state: ModeState,
    /// How the most recent finished grant ended.
    pub last_terminal: Option<GrantStatus>,
}

impl fmt::Display for ModeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ModeState::Active { remaining, via, .. } => {
                let via = match via {
                    GrantVia::Keyword => "keyword",
                    GrantVia::Voice => "voice",
                };
                write!(
                    f,
                    "{}: ACTIVE ({} remaining, via {via})",
                    self.mode,
                    format_remaining(*remaining)
                )
            }
            ModeState::Inactive => write!(f, "{}: INACTIVE", self.mode),
        }
    }
}

/// Snapshot of privilege state for dashboards and the CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub modes: Vec<ModeStatus>,
    pub voice_enrolled: bool,
}

impl StatusReport {
    pub fn mode(&self, mode: GrantMode) -> Option<&ModeStatus> {
        self.modes.iter().find(|m| m.mode == mode)
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for status in &self.modes {
            writeln!(f, "{status}")?;
        }
        let voice = if self.voice_enrolled {
            "enrolled"
        } else {
            "not enrolled"
        };
        write!(f, "voice profile: {voice}")
    }
}

/// Seconds under a minute, minutes under an hour, hours otherwise.
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.num_seconds().max(0);
    if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m", secs / 60)
    } else {
        format!("{}h", secs / 3600)
    }
}

/// Char-safe prefix of a command for audit details.
fn excerpt(command: &str) -> String {
    let mut chars = command.chars();
    let head: String = chars.by_ref().take(COMMAND_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// The single access-control authority for one operator.
#[derive(Debug)]
pub struct AccessControlEngine {
    config: Config,
    paths: Option<StatePaths>,
    keywords: RwLock<KeywordPolicy>,
    filter: RwLock<DangerousCommandFilter>,
    voice: VoiceBiometricStore,
    ledger: Arc<AccessGrantLedger>,
    audit: Arc<AuditLog>,
}

impl AccessControlEngine {
    /// Open the engine over the persisted state in `paths`, using the system clock.
    pub fn open(config: Config, paths: StatePaths) -> anyhow::Result<Self> {
        Self::open_with_clock(config, paths, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        config: Config,
        paths: StatePaths,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let audit = Arc::new(AuditLog::open(&paths.audit_log(), clock.clone())?);
        let keywords = KeywordsFile::load(&paths.keywords())?;
        let filter = DangerousCommandFilter::load(&paths.dangerous_patterns())?;
        let voice =
            VoiceBiometricStore::open(&paths.voice_profiles(), config.voice.clone(), clock.clone())?;
        info!(
            root = %paths.root().display(),
            patterns = filter.pattern_count(),
            history = audit.len(),
            "access control engine opened"
        );
        Ok(Self {
            keywords: RwLock::new(KeywordPolicy::new(keywords, config.grants.clone())),
            filter: RwLock::new(filter),
            voice,
            ledger: Arc::new(AccessGrantLedger::new(clock, audit.clone())),
            audit,
            config,
            paths: Some(paths),
        })
    }

    /// An engine with no persistence, for tests and embedding.
    pub fn in_memory(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        config.validate()?;
        let audit = Arc::new(AuditLog::in_memory(clock.clone()));
        Ok(Self {
            keywords: RwLock::new(KeywordPolicy::new(
                KeywordsFile::default(),
                config.grants.clone(),
            )),
            filter: RwLock::new(DangerousCommandFilter::default()),
            voice: VoiceBiometricStore::in_memory(config.voice.clone(), clock.clone()),
            ledger: Arc::new(AccessGrantLedger::new(clock, audit.clone())),
            audit,
            config,
            paths: None,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn operator(&self) -> &str {
        &self.config.operator_id
    }

    fn voice_required(&self, mode: GrantMode) -> bool {
        match mode {
            GrantMode::Sudo => self.config.voice.require_voice_for_sudo,
            GrantMode::Debug => self.config.voice.require_voice_for_debug,
        }
    }

    // ---- authentication ----

    /// Turn an authentication event into a grant or a denial.
    ///
    /// A success is recorded by the ledger's GrantIssued entry; every denial
    /// writes one AuthAttempt entry. The utterance itself is never logged.
    pub fn authenticate(&self, event: &AuthEvent) -> AuthOutcome {
        let channel = event.channel();
        let attempt = match event {
            AuthEvent::Keyword(utterance) => self.resolve_keyword(utterance).and_then(|(mode, secs)| {
                if self.voice_required(mode) {
                    Err(Denial::new(Some(mode), DenyReason::VoiceRequired, "keyword alone is not enough"))
                } else {
                    Ok((mode, secs, GrantVia::Keyword))
                }
            }),
            AuthEvent::Voice { mode, sample } => self
                .verify_operator(Some(*mode), sample)
                .map(|()| (*mode, self.config.grants.voice_grant_seconds, GrantVia::Voice)),
            AuthEvent::KeywordWithVoice { utterance, sample } => self
                .resolve_keyword(utterance)
                .and_then(|(mode, secs)| {
                    self.verify_operator(Some(mode), sample)
                        .map(|()| (mode, secs, GrantVia::Voice))
                }),
        };

        let (mode, secs, via) = match attempt {
            Ok(granted) => granted,
            Err(denial) => return AuthOutcome::Denied(self.deny(channel, denial)),
        };
        // Bounded by config validation.
        let duration = Duration::seconds(secs as i64);
        match self.ledger.issue(mode, duration, via, self.operator()) {
            Ok(grant) => AuthOutcome::GrantIssued(grant),
            Err(e) => {
                error!(%mode, error = %e, "failed to issue grant");
                AuthOutcome::Denied(self.deny(
                    channel,
                    Denial::new(Some(mode), DenyReason::Fault(e.to_string()), "grant not issued"),
                ))
            }
        }
    }

    fn resolve_keyword(&self, utterance: &str) -> Result<(GrantMode, u64), Denial> {
        let resolution = self
            .keywords
            .read()
            .expect("keyword policy lock poisoned")
            .resolve(utterance);
        match resolution {
            Ok(Resolution::Grant(req)) => Ok((req.mode, req.duration_seconds)),
            Ok(Resolution::NoMatch) => Err(Denial::new(None, DenyReason::NoMatch, "no phrase matched")),
            Err(KeywordError::InvalidDurationCode(token)) => Err(Denial::new(
                None,
                DenyReason::InvalidDurationCode(token),
                "phrase matched with a malformed code",
            )),
            Err(e) => Err(Denial::new(None, DenyReason::Fault(e.to_string()), "keyword policy error")),
        }
    }

    fn verify_operator(&self, mode: Option<GrantMode>, sample: &AudioSample) -> Result<(), Denial> {
        match self.voice.verify(self.operator(), sample) {
            Ok(VerifyOutcome::Matched { .. }) => {
                debug!(?mode, "voice verified");
                Ok(())
            }
            Ok(VerifyOutcome::NotMatched { .. }) => {
                Err(Denial::new(mode, DenyReason::NotMatched, "below match threshold"))
            }
            Ok(VerifyOutcome::NoProfile) => {
                Err(Denial::new(mode, DenyReason::NoProfile, "nothing enrolled"))
            }
            Err(VoiceError::SampleRejected(reason)) => Err(Denial::new(
                mode,
                DenyReason::NotMatched,
                format!("sample rejected: {reason}"),
            )),
            Err(e) => Err(Denial::new(mode, DenyReason::Fault(e.to_string()), "voice store fault")),
        }
    }

    /// Check a sample against the operator's profile without issuing a grant.
    ///
    /// Audited like an authentication attempt: one AuthAttempt entry per call.
    /// A store fault is audited and then returned as an error.
    pub fn verify_voice(&self, sample: &AudioSample) -> Result<VoiceCheck, EngineError> {
        let denial = match self.verify_operator(None, sample) {
            Ok(()) => {
                self.audit.record(
                    AuditRecord::new(AuditEventKind::AuthAttempt, self.operator(), AuditOutcome::Success)
                        .detail("voice-check: matched, no grant issued"),
                )?;
                return Ok(VoiceCheck::Matched);
            }
            Err(denial) => denial,
        };
        match self.deny("voice-check", denial) {
            DenyReason::NoProfile => Ok(VoiceCheck::NoProfile),
            DenyReason::Fault(detail) => Err(anyhow::anyhow!("voice check failed: {detail}").into()),
            _ => Ok(VoiceCheck::NotMatched),
        }
    }

    /// Audit a refused attempt and hand back its reason.
    fn deny(&self, channel: &str, denial: Denial) -> DenyReason {
        let outcome = match denial.reason {
            DenyReason::Fault(_) => AuditOutcome::Fault,
            _ => AuditOutcome::Failure,
        };
        warn!(channel, mode = ?denial.mode, reason = %denial.reason, "authentication denied");
        let mut record = AuditRecord::new(AuditEventKind::AuthAttempt, self.operator(), outcome)
            .detail(format!("{channel}: {} ({})", denial.reason, denial.detail));
        if let Some(mode) = denial.mode {
            record = record.mode(mode);
        }
        if let Err(e) = self.audit.record(record) {
            error!(error = %e, "failed to audit authentication attempt");
        }
        denial.reason
    }

    // ---- authorization ----

    /// Decide whether `command` may run under `mode`. Dangerous commands are refused
    /// regardless of grants; an allow that cannot be audited becomes a deny.
    pub fn check_command(&self, mode: GrantMode, command: &str) -> CommandDecision {
        let classification = self
            .filter
            .read()
            .expect("command filter lock poisoned")
            .classify(command);

        let (decision, grant_id, detail) = match classification {
            Classification::Dangerous(hit) => (
                CommandDecision::Deny(DenyReason::DangerousCommand(hit.category.to_string())),
                None,
                format!("{} matched {}", hit.category, hit.signature),
            ),
            Classification::Safe => match self.ledger.check(mode) {
                GrantCheck::Active(grant) => (CommandDecision::Allow, Some(grant.id), String::new()),
                GrantCheck::Expired => (
                    CommandDecision::Deny(DenyReason::Expired),
                    None,
                    "grant expired".to_string(),
                ),
                GrantCheck::NoGrant => (
                    CommandDecision::Deny(DenyReason::NoGrant),
                    None,
                    "no active grant".to_string(),
                ),
            },
        };

        let (kind, outcome) = match decision {
            CommandDecision::Allow => (AuditEventKind::CommandAllowed, AuditOutcome::Success),
            CommandDecision::Deny(_) => (AuditEventKind::CommandBlocked, AuditOutcome::Failure),
        };
        let detail = if detail.is_empty() {
            excerpt(command)
        } else {
            format!("{detail}: {}", excerpt(command))
        };
        let mut record = AuditRecord::new(kind, self.operator(), outcome)
            .mode(mode)
            .detail(detail);
        if let Some(id) = grant_id {
            record = record.grant(id);
        }

        match self.audit.record(record) {
            Ok(_) => {
                if let CommandDecision::Deny(reason) = &decision {
                    warn!(%mode, %reason, "command blocked");
                }
                decision
            }
            Err(e) => {
                error!(%mode, error = %e, "failed to audit command decision");
                CommandDecision::Deny(DenyReason::Fault(format!("audit unavailable: {e}")))
            }
        }
    }

    // ---- status ----

    pub fn current_grant(&self, mode: GrantMode) -> Option<AccessGrant> {
        self.ledger.current_grant(mode)
    }

    pub fn status(&self) -> StatusReport {
        let now = self.ledger.now();
        let modes = self
            .ledger
            .snapshot()
            .into_iter()
            .map(|snap| ModeStatus {
                mode: snap.mode,
                state: match snap.active {
                    Some(grant) => ModeState::Active {
                        remaining: grant.remaining(now),
                        via: grant.granted_via,
                        expires_at: grant.expires_at,
                    },
                    None => ModeState::Inactive,
                },
                last_terminal: snap.last_terminal.map(|g| g.status),
            })
            .collect();
        StatusReport {
            modes,
            voice_enrolled: self.voice.is_enrolled(self.operator()),
        }
    }

    pub fn history(&self, limit: usize) -> Result<Vec<AuditLogEntry>, EngineError> {
        Ok(self.audit.history(limit)?)
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn ledger(&self) -> &Arc<AccessGrantLedger> {
        &self.ledger
    }

    pub fn keywords(&self) -> KeywordsFile {
        self.keywords
            .read()
            .expect("keyword policy lock poisoned")
            .keywords()
            .clone()
    }

    // ---- administration ----

    /// End the active grant for `mode` on the operator's request.
    pub fn revoke(&self, mode: GrantMode, actor: &str) -> Result<Option<AccessGrant>, EngineError> {
        Ok(self.ledger.revoke(mode, RevokeReason::Operator, actor)?)
    }

    /// Change the phrase for `mode`, persisting it before it takes effect.
    pub fn set_keyword(&self, mode: GrantMode, phrase: &str, actor: &str) -> Result<(), EngineError> {
        let mut policy = self.keywords.write().expect("keyword policy lock poisoned");
        let mut next = policy.clone();
        let applied = next
            .set_phrase(mode, phrase)
            .map_err(EngineError::from)
            .and_then(|_| {
                if let Some(paths) = &self.paths {
                    next.keywords().save(&paths.keywords())?;
                }
                Ok(())
            });

        let record = AuditRecord::new(AuditEventKind::PolicyChanged, actor, AuditOutcome::Success)
            .mode(mode);
        match applied {
            Ok(()) => {
                *policy = next;
                info!(%mode, "keyword phrase changed");
                self.audit.record(record.detail("keyword phrase changed"))?;
                Ok(())
            }
            Err(e) => {
                let mut record = record.detail(format!("keyword change rejected: {e}"));
                record.outcome = AuditOutcome::Failure;
                if let Err(audit_err) = self.audit.record(record) {
                    error!(error = %audit_err, "failed to audit keyword change");
                }
                Err(e)
            }
        }
    }

    /// Start a three-sample enrollment for the operator.
    pub fn begin_enrollment(&self) -> EnrollmentSession {
        self.voice.begin_enrollment(self.operator())
    }

    /// Commit a finished enrollment session.
    pub fn commit_enrollment(&self, session: EnrollmentSession, actor: &str) -> Result<Committed, EngineError> {
        let result = self.voice.commit(session);
        self.finish_enrollment(result, actor)
    }

    /// Enroll from three samples in one call.
    pub fn enroll(&self, samples: &[AudioSample], actor: &str) -> Result<Committed, EngineError> {
        let result = self.voice.enroll(self.operator(), samples);
        self.finish_enrollment(result, actor)
    }

    fn finish_enrollment(
        &self,
        result: Result<Committed, VoiceError>,
        actor: &str,
    ) -> Result<Committed, EngineError> {
        let committed = match result {
            Ok(committed) => committed,
            Err(e) => {
                let outcome = match e {
                    VoiceError::EnrollmentFailed(_) => AuditOutcome::Failure,
                    _ => AuditOutcome::Fault,
                };
                let record = AuditRecord::new(AuditEventKind::Enrollment, actor, outcome)
                    .detail(format!("enrollment failed: {e}"));
                if let Err(audit_err) = self.audit.record(record) {
                    error!(error = %audit_err, "failed to audit enrollment");
                }
                return Err(e.into());
            }
        };

        let detail = if committed.replaced {
            "voice profile replaced"
        } else {
            "voice profile enrolled"
        };
        self.audit.record(
            AuditRecord::new(AuditEventKind::Enrollment, actor, AuditOutcome::Success).detail(detail),
        )?;
        if committed.replaced {
            let revoked =
                self.ledger
                    .revoke_issued_via(GrantVia::Voice, RevokeReason::ProfileReplaced, actor)?;
            if !revoked.is_empty() {
                info!(count = revoked.len(), "voice grants revoked after re-enrollment");
            }
        }
        Ok(committed)
    }

    /// Rebuild the filter from the built-ins plus the pattern file. On error the
    /// previous set stays in force. Returns the number of active patterns.
    pub fn reload_dangerous_patterns(&self, actor: &str) -> Result<usize, EngineError> {
        let loaded = match &self.paths {
            Some(paths) => DangerousCommandFilter::load(&paths.dangerous_patterns()),
            None => Ok(DangerousCommandFilter::default()),
        };
        match loaded {
            Ok(filter) => {
                let count = filter.pattern_count();
                *self.filter.write().expect("command filter lock poisoned") = filter;
                info!(count, "dangerous patterns reloaded");
                self.audit.record(
                    AuditRecord::new(AuditEventKind::PolicyChanged, actor, AuditOutcome::Success)
                        .detail(format!("dangerous patterns reloaded ({count} active)")),
                )?;
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, "dangerous pattern reload rejected");
                let record =
                    AuditRecord::new(AuditEventKind::PolicyChanged, actor, AuditOutcome::Failure)
                        .detail(format!("dangerous pattern reload rejected: {e}"));
                if let Err(audit_err) = self.audit.record(record) {
                    error!(error = %audit_err, "failed to audit pattern reload");
                }
                Err(e.into())
            }
        }
    }

    /// Start the background expiry sweep at the configured interval.
    pub fn spawn_sweep(&self) -> SweepHandle {
        spawn_expiry_sweep(self.ledger.clone(), self.config.sweep.interval())
    }
}

/// A refused authentication, before it is audited.
struct Denial {
    mode: Option<GrantMode>,
    reason: DenyReason,
    detail: String,
}

impl Denial {
    fn new(mode: Option<GrantMode>, reason: DenyReason, detail: impl Into<String>) -> Self {
        Self {
            mode,
            reason,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::voice::features::synth_voice;

    fn engine_with(config: Config) -> (Arc<ManualClock>, AccessControlEngine) {
        let clock = Arc::new(ManualClock::default());
        let engine = AccessControlEngine::in_memory(config, clock.clone()).unwrap();
        (clock, engine)
    }

    fn engine() -> (Arc<ManualClock>, AccessControlEngine) {
        engine_with(Config::default())
    }

    fn keyword(utterance: &str) -> AuthEvent {
        AuthEvent::Keyword(utterance.to_string())
    }

    fn enroll(engine: &AccessControlEngine, f0: f32) {
        let samples: Vec<_> = (1..=3).map(|seed| synth_voice(f0, 1.0, seed)).collect();
        engine.enroll(&samples, "operator").unwrap();
    }

    #[test]
    fn default_code_grant_then_expiry_then_long_grant() {
        let (clock, engine) = engine();
        let outcome = engine.authenticate(&keyword("sudo code 0"));
        assert!(matches!(outcome, AuthOutcome::GrantIssued(_)));
        assert_eq!(engine.check_command(GrantMode::Sudo, "ls /root"), CommandDecision::Allow);

        clock.advance(Duration::seconds(300));
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "ls /root"),
            CommandDecision::Deny(DenyReason::Expired)
        );

        engine.authenticate(&keyword("sudo code 1800"));
        clock.advance(Duration::seconds(1799));
        assert_eq!(engine.check_command(GrantMode::Sudo, "ls /root"), CommandDecision::Allow);
        clock.advance(Duration::seconds(2));
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "ls /root"),
            CommandDecision::Deny(DenyReason::Expired)
        );
    }

    #[test]
    fn dangerous_command_denied_even_with_grant() {
        let (_, engine) = engine();
        engine.authenticate(&keyword("sudo code 0"));
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "sudo rm -rf /"),
            CommandDecision::Deny(DenyReason::DangerousCommand("destructive-filesystem".into()))
        );
        let blocked = engine.audit().entries_for(AuditEventKind::CommandBlocked).unwrap();
        assert_eq!(blocked.len(), 1);
        assert!(blocked[0].detail.contains("rm -rf /"));
    }

    #[test]
    fn dangerous_command_inside_shell_is_denied_with_grant() {
        let (_, engine) = engine();
        engine.authenticate(&keyword("sudo code 0"));
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "bash -c 'rm -rf /'"),
            CommandDecision::Deny(DenyReason::DangerousCommand("destructive-filesystem".into()))
        );
        assert!(matches!(
            engine.check_command(GrantMode::Sudo, "find / -name x | xargs rm -rf"),
            CommandDecision::Deny(DenyReason::DangerousCommand(_))
        ));
    }

    #[test]
    fn voice_check_is_audited_without_score() {
        let (_, engine) = engine();
        assert_eq!(
            engine.verify_voice(&synth_voice(120.0, 1.0, 1)).unwrap(),
            VoiceCheck::NoProfile
        );
        enroll(&engine, 120.0);
        assert_eq!(
            engine.verify_voice(&synth_voice(120.0, 0.8, 21)).unwrap(),
            VoiceCheck::Matched
        );
        assert_eq!(
            engine.verify_voice(&synth_voice(700.0, 1.0, 22)).unwrap(),
            VoiceCheck::NotMatched
        );

        let attempts = engine.audit().entries_for(AuditEventKind::AuthAttempt).unwrap();
        let outcomes: Vec<_> = attempts.iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AuditOutcome::Failure, AuditOutcome::Success, AuditOutcome::Failure]
        );
        assert!(attempts.iter().all(|e| e.detail.starts_with("voice-check")));
        assert!(attempts.iter().all(|e| !e.detail.contains("similarity")));
        assert!(engine.current_grant(GrantMode::Sudo).is_none());
        assert!(engine.current_grant(GrantMode::Debug).is_none());
    }

    #[test]
    fn no_grant_is_denied() {
        let (_, engine) = engine();
        assert_eq!(
            engine.check_command(GrantMode::Debug, "cat /var/log/syslog"),
            CommandDecision::Deny(DenyReason::NoGrant)
        );
    }

    #[test]
    fn modes_do_not_cross() {
        let (_, engine) = engine();
        engine.authenticate(&keyword("debugmode code 600"));
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "ls"),
            CommandDecision::Deny(DenyReason::NoGrant)
        );
        assert_eq!(engine.check_command(GrantMode::Debug, "ls"), CommandDecision::Allow);
    }

    #[test]
    fn every_call_is_audited_once() {
        let (_, engine) = engine();
        engine.authenticate(&keyword("open sesame"));
        assert_eq!(engine.audit().len(), 1);
        engine.authenticate(&keyword("sudo code banana"));
        assert_eq!(engine.audit().len(), 2);
        engine.authenticate(&keyword("sudo code 60"));
        assert_eq!(engine.audit().len(), 3);
        engine.check_command(GrantMode::Sudo, "ls");
        assert_eq!(engine.audit().len(), 4);
        engine.check_command(GrantMode::Debug, "ls");
        assert_eq!(engine.audit().len(), 5);

        let attempts = engine.audit().entries_for(AuditEventKind::AuthAttempt).unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.iter().all(|e| e.outcome == AuditOutcome::Failure));
        assert!(attempts.iter().all(|e| !e.detail.contains("sesame")));
    }

    #[test]
    fn malformed_code_is_rejected_not_clamped() {
        let (_, engine) = engine();
        assert_eq!(
            engine.authenticate(&keyword("sudo code -5")),
            AuthOutcome::Denied(DenyReason::InvalidDurationCode("-5".into()))
        );
        assert!(engine.current_grant(GrantMode::Sudo).is_none());
    }

    #[test]
    fn voice_mismatch_is_denied_and_audited() {
        let (_, engine) = engine();
        enroll(&engine, 110.0);
        let outcome = engine.authenticate(&AuthEvent::Voice {
            mode: GrantMode::Sudo,
            sample: synth_voice(700.0, 1.0, 9),
        });
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::NotMatched));
        assert!(engine.current_grant(GrantMode::Sudo).is_none());
        let attempts = engine.audit().entries_for(AuditEventKind::AuthAttempt).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].mode, Some(GrantMode::Sudo));
    }

    #[test]
    fn voice_match_issues_voice_grant() {
        let (_, engine) = engine();
        enroll(&engine, 120.0);
        let outcome = engine.authenticate(&AuthEvent::Voice {
            mode: GrantMode::Debug,
            sample: synth_voice(120.0, 0.9, 11),
        });
        let AuthOutcome::GrantIssued(grant) = outcome else {
            panic!("expected a grant, got {outcome:?}");
        };
        assert_eq!(grant.granted_via, GrantVia::Voice);
        assert_eq!(grant.expires_at - grant.granted_at, Duration::seconds(300));
    }

    #[test]
    fn voice_without_profile() {
        let (_, engine) = engine();
        let outcome = engine.authenticate(&AuthEvent::Voice {
            mode: GrantMode::Sudo,
            sample: synth_voice(120.0, 1.0, 1),
        });
        assert_eq!(outcome, AuthOutcome::Denied(DenyReason::NoProfile));
    }

    #[test]
    fn two_factor_requires_voice() {
        let mut config = Config::default();
        config.voice.require_voice_for_debug = true;
        let (_, engine) = engine_with(config);
        enroll(&engine, 120.0);

        assert_eq!(
            engine.authenticate(&keyword("debugmode code 600")),
            AuthOutcome::Denied(DenyReason::VoiceRequired)
        );
        let outcome = engine.authenticate(&AuthEvent::KeywordWithVoice {
            utterance: "debugmode code 600".into(),
            sample: synth_voice(120.0, 1.0, 4),
        });
        let AuthOutcome::GrantIssued(grant) = outcome else {
            panic!("expected a grant, got {outcome:?}");
        };
        assert_eq!(grant.mode, GrantMode::Debug);
        assert_eq!(grant.expires_at - grant.granted_at, Duration::seconds(600));

        // Sudo is not gated.
        assert!(matches!(
            engine.authenticate(&keyword("sudo code 0")),
            AuthOutcome::GrantIssued(_)
        ));
    }

    #[test]
    fn reenrollment_revokes_voice_grants_only() {
        let (_, engine) = engine();
        enroll(&engine, 120.0);
        engine.authenticate(&keyword("sudo code 0"));
        engine.authenticate(&AuthEvent::Voice {
            mode: GrantMode::Debug,
            sample: synth_voice(120.0, 1.0, 8),
        });
        assert!(engine.current_grant(GrantMode::Debug).is_some());

        enroll(&engine, 300.0);
        assert!(engine.current_grant(GrantMode::Sudo).is_some());
        assert!(engine.current_grant(GrantMode::Debug).is_none());
        assert_eq!(
            engine.status().mode(GrantMode::Debug).unwrap().last_terminal,
            Some(GrantStatus::Revoked(RevokeReason::ProfileReplaced))
        );
        assert_eq!(engine.audit().entries_for(AuditEventKind::Enrollment).unwrap().len(), 2);
    }

    #[test]
    fn failed_enrollment_is_audited() {
        let (_, engine) = engine();
        let result = engine.enroll(&[synth_voice(120.0, 1.0, 1)], "operator");
        assert!(matches!(result, Err(EngineError::Voice(VoiceError::EnrollmentFailed(_)))));
        let entries = engine.audit().entries_for(AuditEventKind::Enrollment).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn set_keyword_changes_matching() {
        let (_, engine) = engine();
        engine
            .set_keyword(GrantMode::Sudo, "  Open   Sesame ", "operator")
            .unwrap();
        assert_eq!(
            engine.authenticate(&keyword("sudo code 0")),
            AuthOutcome::Denied(DenyReason::NoMatch)
        );
        assert!(matches!(
            engine.authenticate(&keyword("open sesame code 0")),
            AuthOutcome::GrantIssued(_)
        ));
        assert!(engine.set_keyword(GrantMode::Debug, "open sesame", "operator").is_err());
        let changes = engine.audit().entries_for(AuditEventKind::PolicyChanged).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].outcome, AuditOutcome::Failure);
    }

    #[test]
    fn status_reports_remaining_time() {
        let (clock, engine) = engine();
        engine.authenticate(&keyword("sudo code 300"));
        clock.advance(Duration::seconds(50));
        let report = engine.status();
        assert_eq!(
            report.mode(GrantMode::Sudo).unwrap().to_string(),
            "sudo: ACTIVE (4m remaining, via keyword)"
        );
        assert_eq!(report.mode(GrantMode::Debug).unwrap().to_string(), "debug: INACTIVE");
        assert!(!report.voice_enrolled);

        clock.advance(Duration::seconds(300));
        let report = engine.status();
        assert_eq!(report.mode(GrantMode::Sudo).unwrap().state, ModeState::Inactive);
        assert_eq!(
            report.mode(GrantMode::Sudo).unwrap().last_terminal,
            Some(GrantStatus::Expired)
        );
    }

    #[test]
    fn remaining_formatting() {
        assert_eq!(format_remaining(Duration::seconds(45)), "45s");
        assert_eq!(format_remaining(Duration::seconds(240)), "4m");
        assert_eq!(format_remaining(Duration::seconds(7300)), "2h");
        assert_eq!(format_remaining(Duration::seconds(-5)), "0s");
    }

    #[test]
    fn revoke_then_check_reports_no_grant() {
        let (_, engine) = engine();
        engine.authenticate(&keyword("sudo code 0"));
        assert!(engine.revoke(GrantMode::Sudo, "operator").unwrap().is_some());
        assert_eq!(
            engine.check_command(GrantMode::Sudo, "ls"),
            CommandDecision::Deny(DenyReason::NoGrant)
        );
    }

    #[test]
    fn long_commands_are_truncated_in_audit() {
        let (_, engine) = engine();
        let command = format!("echo {}", "é".repeat(400));
        engine.check_command(GrantMode::Sudo, &command);
        let entry = &engine.audit().entries().unwrap()[0];
        assert!(entry.detail.ends_with("..."));
        assert!(entry.detail.chars().count() < 220);
    }
}
