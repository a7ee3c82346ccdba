// ABOUTME: Integration tests for the access control engine over persisted state.
// ABOUTME: Covers restarts, policy reloads, audit durability, and concurrent callers.

use std::sync::Arc;

use chrono::Duration;
use tempfile::TempDir;

use voicegate::access::{
    AccessControlEngine, AuthEvent, AuthOutcome, CommandDecision, DenyReason, GrantMode,
};
use voicegate::audit::{AuditEventKind, AuditOutcome};
use voicegate::clock::ManualClock;
use voicegate::config::{Config, StatePaths};

fn open(dir: &TempDir, clock: Arc<ManualClock>) -> AccessControlEngine {
    AccessControlEngine::open_with_clock(Config::default(), StatePaths::new(dir.path()), clock)
        .unwrap()
}

fn keyword(utterance: &str) -> AuthEvent {
    AuthEvent::Keyword(utterance.to_string())
}

#[test]
fn grants_do_not_survive_restart_but_history_does() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());

    let engine = open(&dir, clock.clone());
    assert!(matches!(
        engine.authenticate(&keyword("sudo code 0")),
        AuthOutcome::GrantIssued(_)
    ));
    assert_eq!(engine.check_command(GrantMode::Sudo, "systemctl restart nginx"), CommandDecision::Allow);
    let before = engine.history(100).unwrap();
    drop(engine);

    let engine = open(&dir, clock);
    assert_eq!(
        engine.check_command(GrantMode::Sudo, "systemctl restart nginx"),
        CommandDecision::Deny(DenyReason::NoGrant)
    );
    let after = engine.history(100).unwrap();
    assert_eq!(after.len(), before.len() + 1);
    assert_eq!(&after[..before.len()], &before[..]);
    assert!(after.windows(2).all(|w| w[0].seq < w[1].seq));
}

#[test]
fn keyword_change_persists() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());

    let engine = open(&dir, clock.clone());
    engine
        .set_keyword(GrantMode::Debug, "show me the logs", "operator")
        .unwrap();
    drop(engine);

    let engine = open(&dir, clock);
    assert_eq!(engine.keywords().phrase(GrantMode::Debug), Some("show me the logs"));
    assert!(matches!(
        engine.authenticate(&keyword("Show me the   LOGS code 120")),
        AuthOutcome::GrantIssued(_)
    ));
    assert_eq!(
        engine.authenticate(&keyword("debugmode code 0")),
        AuthOutcome::Denied(DenyReason::NoMatch)
    );
}

#[test]
fn custom_patterns_reload_and_bad_files_keep_previous_set() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(ManualClock::default()));
    engine.authenticate(&keyword("sudo code 0"));
    assert_eq!(engine.check_command(GrantMode::Sudo, "terraform destroy"), CommandDecision::Allow);

    let patterns = StatePaths::new(dir.path()).dangerous_patterns();
    std::fs::write(
        &patterns,
        r#"{"version":1,"patterns":[
            {"category":"destructive-filesystem","kind":"segment","executable":"terraform","arg":"destroy"}
        ]}"#,
    )
    .unwrap();
    let count = engine.reload_dangerous_patterns("operator").unwrap();
    assert!(count > 1);
    assert_eq!(
        engine.check_command(GrantMode::Sudo, "terraform destroy"),
        CommandDecision::Deny(DenyReason::DangerousCommand("destructive-filesystem".into()))
    );

    std::fs::write(&patterns, "{ not json").unwrap();
    assert!(engine.reload_dangerous_patterns("operator").is_err());
    assert!(matches!(
        engine.check_command(GrantMode::Sudo, "terraform destroy"),
        CommandDecision::Deny(DenyReason::DangerousCommand(_))
    ));
    // Built-ins are always present.
    assert!(matches!(
        engine.check_command(GrantMode::Sudo, "shutdown -h now"),
        CommandDecision::Deny(DenyReason::DangerousCommand(_))
    ));

    let changes = engine.audit().entries_for(AuditEventKind::PolicyChanged).unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[0].outcome, AuditOutcome::Success);
    assert_eq!(changes[1].outcome, AuditOutcome::Failure);
}

#[test]
fn corrupted_audit_log_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::new(dir.path());
    std::fs::write(paths.audit_log(), "this is not an audit entry\n").unwrap();
    let result = AccessControlEngine::open_with_clock(
        Config::default(),
        paths,
        Arc::new(ManualClock::default()),
    );
    assert!(result.is_err());
}

#[test]
fn conflicting_keyword_file_refuses_to_open() {
    let dir = TempDir::new().unwrap();
    let paths = StatePaths::new(dir.path());
    std::fs::write(
        paths.keywords(),
        r#"{"version":1,"keywords":[{"mode":"debug","phrase":"sudo"},{"mode":"sudo","phrase":"sudo"}]}"#,
    )
    .unwrap();
    let result = AccessControlEngine::open_with_clock(
        Config::default(),
        paths,
        Arc::new(ManualClock::default()),
    );
    assert!(result.is_err());
}

#[test]
fn grant_does_not_cover_dangerous_commands_behind_runners() {
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(ManualClock::default()));
    assert!(matches!(
        engine.authenticate(&keyword("sudo code 0")),
        AuthOutcome::GrantIssued(_)
    ));
    for command in [
        "bash -c 'rm -rf /'",
        "sudo sh -c \"shutdown -h now\"",
        "eval rm -rf /",
        "find / -exec rm -rf {} \\;",
        "echo $(rm -rf /)",
    ] {
        assert!(
            matches!(
                engine.check_command(GrantMode::Sudo, command),
                CommandDecision::Deny(DenyReason::DangerousCommand(_))
            ),
            "{command:?} should be blocked"
        );
    }
    assert_eq!(engine.check_command(GrantMode::Sudo, "bash -c 'ls -la'"), CommandDecision::Allow);
}

#[test]
fn expiry_boundary_is_exact() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = open(&dir, clock.clone());

    engine.authenticate(&keyword("debugmode code 120"));
    clock.advance(Duration::seconds(119));
    assert_eq!(engine.check_command(GrantMode::Debug, "journalctl"), CommandDecision::Allow);
    clock.advance(Duration::seconds(1));
    assert_eq!(
        engine.check_command(GrantMode::Debug, "journalctl"),
        CommandDecision::Deny(DenyReason::Expired)
    );
    assert_eq!(engine.audit().entries_for(AuditEventKind::GrantExpired).unwrap().len(), 1);
}

#[test]
fn concurrent_callers_never_see_a_stale_grant() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let engine = Arc::new(open(&dir, clock.clone()));

    let writer = {
        let engine = engine.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                assert!(matches!(
                    engine.authenticate(&keyword("sudo code 600")),
                    AuthOutcome::GrantIssued(_)
                ));
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    if let Some(grant) = engine.current_grant(GrantMode::Sudo) {
                        assert!(grant.expires_at > engine.ledger().now());
                    }
                    engine.check_command(GrantMode::Sudo, "uptime");
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }

    let issued = engine.audit().entries_for(AuditEventKind::GrantIssued).unwrap();
    assert_eq!(issued.len(), 50);
    assert_eq!(engine.audit().entries_for(AuditEventKind::GrantRevoked).unwrap().len(), 49);
    let checks = engine.audit().entries_for(AuditEventKind::CommandAllowed).unwrap().len()
        + engine.audit().entries_for(AuditEventKind::CommandBlocked).unwrap().len();
    assert_eq!(checks, 200);
}

#[tokio::test]
async fn background_sweep_expires_idle_grants() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::default());
    let mut config = Config::default();
    config.sweep.interval_seconds = 1;
    let engine = AccessControlEngine::open_with_clock(config, StatePaths::new(dir.path()), clock.clone())
        .unwrap();

    engine.authenticate(&keyword("sudo code 60"));
    let sweep = engine.spawn_sweep();
    clock.advance(Duration::seconds(61));

    let mut expired = Vec::new();
    for _ in 0..40 {
        expired = engine.audit().entries_for(AuditEventKind::GrantExpired).unwrap();
        if !expired.is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    sweep.stop().await;
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].actor, "sweep");
}
