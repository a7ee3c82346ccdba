// ABOUTME: Interactive operator loop — reads requests from stdin and answers through the engine.
// ABOUTME: Owns the expiry sweep for the lifetime of the session and stops it on exit.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use crate::access::{AccessControlEngine, AuthEvent, AuthOutcome, CommandDecision, GrantMode};

const DEFAULT_HISTORY: usize = 20;

/// One line typed at the operator prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    Auth(String),
    Check { mode: GrantMode, command: String },
    Status,
    Revoke(GrantMode),
    History(usize),
    Help,
    Quit,
}

impl OperatorCommand {
    /// Parse a prompt line. Returns an error message suitable for echoing back.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        match verb.to_lowercase().as_str() {
            "auth" if !rest.is_empty() => Ok(Self::Auth(rest.to_string())),
            "check" => {
                let (mode, command) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "usage: check <sudo|debug> <command>".to_string())?;
                Ok(Self::Check {
                    mode: mode.parse()?,
                    command: command.trim().to_string(),
                })
            }
            "status" => Ok(Self::Status),
            "revoke" => Ok(Self::Revoke(rest.parse()?)),
            "history" if rest.is_empty() => Ok(Self::History(DEFAULT_HISTORY)),
            "history" => rest
                .parse()
                .map(Self::History)
                .map_err(|_| format!("history expects a number, got '{rest}'")),
            "help" | "?" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            "auth" => Err("usage: auth <utterance>".to_string()),
            other => Err(format!("unknown command '{other}' (try 'help')")),
        }
    }
}

const HELP: &str = "\
commands:
  auth <utterance>              e.g. auth sudo code 0
  check <sudo|debug> <command>  ask whether a command may run
  status                        show grant state
  revoke <sudo|debug>           end a grant early
  history [n]                   show recent audit entries
  quit";

/// The interactive session.
pub struct App {
    engine: AccessControlEngine,
}

impl App {
    pub fn new(engine: AccessControlEngine) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &AccessControlEngine {
        &self.engine
    }

    /// Answer one command. Returns `None` when the session should end.
    pub fn handle(&self, command: OperatorCommand) -> Option<String> {
        let actor = self.engine.config().operator_id.as_str();
        let reply = match command {
            OperatorCommand::Auth(utterance) => {
                match self.engine.authenticate(&AuthEvent::Keyword(utterance)) {
                    AuthOutcome::GrantIssued(grant) => format!(
                        "{} granted until {} (grant #{})",
                        grant.mode,
                        grant.expires_at.format("%H:%M:%S"),
                        grant.id
                    ),
                    AuthOutcome::Denied(reason) => format!("denied: {reason}"),
                }
            }
            OperatorCommand::Check { mode, command } => {
                match self.engine.check_command(mode, &command) {
                    CommandDecision::Allow => "allow".to_string(),
                    CommandDecision::Deny(reason) => format!("deny: {reason}"),
                }
            }
            OperatorCommand::Status => self.engine.status().to_string(),
            OperatorCommand::Revoke(mode) => match self.engine.revoke(mode, actor) {
                Ok(Some(grant)) => format!("{mode} grant #{} revoked", grant.id),
                Ok(None) => format!("{mode} has no active grant"),
                Err(e) => format!("error: {e}"),
            },
            OperatorCommand::History(limit) => match self.engine.history(limit) {
                Ok(entries) if entries.is_empty() => "no audit entries".to_string(),
                Ok(entries) => entries
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(e) => format!("error: {e}"),
            },
            OperatorCommand::Help => HELP.to_string(),
            OperatorCommand::Quit => return None,
        };
        Some(reply)
    }

    /// Run until stdin closes or the operator quits.
    pub async fn run(self) -> anyhow::Result<()> {
        let sweep = self.engine.spawn_sweep();
        info!("operator session started");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        stdout.write_all(b"voicegate ready (type 'help')\n> ").await?;
        stdout.flush().await?;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                stdout.write_all(b"> ").await?;
                stdout.flush().await?;
                continue;
            }
            let reply = match OperatorCommand::parse(&line) {
                Ok(command) => match self.handle(command) {
                    Some(reply) => reply,
                    None => break,
                },
                Err(message) => message,
            };
            stdout.write_all(format!("{reply}\n> ").as_bytes()).await?;
            stdout.flush().await?;
        }

        debug!("operator session ending");
        sweep.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::ManualClock;
    use crate::config::Config;

    fn app() -> App {
        let engine =
            AccessControlEngine::in_memory(Config::default(), Arc::new(ManualClock::default()))
                .unwrap();
        App::new(engine)
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            OperatorCommand::parse("auth sudo code 0"),
            Ok(OperatorCommand::Auth("sudo code 0".into()))
        );
        assert_eq!(
            OperatorCommand::parse("check debug tail -f /var/log/syslog"),
            Ok(OperatorCommand::Check {
                mode: GrantMode::Debug,
                command: "tail -f /var/log/syslog".into()
            })
        );
        assert_eq!(OperatorCommand::parse("STATUS"), Ok(OperatorCommand::Status));
        assert_eq!(
            OperatorCommand::parse("revoke sudo"),
            Ok(OperatorCommand::Revoke(GrantMode::Sudo))
        );
        assert_eq!(OperatorCommand::parse("history"), Ok(OperatorCommand::History(20)));
        assert_eq!(OperatorCommand::parse("history 5"), Ok(OperatorCommand::History(5)));
        assert_eq!(OperatorCommand::parse("quit"), Ok(OperatorCommand::Quit));
    }

    #[test]
    fn parse_errors() {
        assert!(OperatorCommand::parse("auth").is_err());
        assert!(OperatorCommand::parse("check sudo").is_err());
        assert!(OperatorCommand::parse("revoke root").is_err());
        assert!(OperatorCommand::parse("history lots").is_err());
        assert!(OperatorCommand::parse("dance").is_err());
    }

    #[test]
    fn session_flow() {
        let app = app();
        let reply = app.handle(OperatorCommand::Auth("sudo code 0".into())).unwrap();
        assert!(reply.starts_with("sudo granted until"));
        assert_eq!(
            app.handle(OperatorCommand::Check {
                mode: GrantMode::Sudo,
                command: "apt update".into()
            }),
            Some("allow".to_string())
        );
        let status = app.handle(OperatorCommand::Status).unwrap();
        assert!(status.contains("sudo: ACTIVE"));
        let revoked = app.handle(OperatorCommand::Revoke(GrantMode::Sudo)).unwrap();
        assert!(revoked.contains("revoked"));
        assert_eq!(
            app.handle(OperatorCommand::Check {
                mode: GrantMode::Sudo,
                command: "apt update".into()
            }),
            Some("deny: no active grant".to_string())
        );
        assert!(app.handle(OperatorCommand::Quit).is_none());
    }
}
