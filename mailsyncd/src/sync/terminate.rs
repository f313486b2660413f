use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("force-terminate command is empty")]
    EmptyCommand,
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} failed with status {status}")]
    Failed { command: String, status: String },
    #[error("{command} did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

/// Deployment-supplied way to kill the ingestion process when asking it
/// nicely is not enough.
#[async_trait]
pub trait ForceTerminate: Send + Sync {
    async fn terminate(&self) -> Result<(), TerminateError>;

    fn describe(&self) -> String;
}

/// Runs an external command, either `systemctl --user restart <unit>` or a
/// configured command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTerminator {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandTerminator {
    pub fn systemd_restart(unit: &str) -> Self {
        Self {
            program: "systemctl".to_string(),
            args: vec!["--user".to_string(), "restart".to_string(), unit.to_string()],
            timeout: DEFAULT_TERMINATE_TIMEOUT,
        }
    }

    /// Splits on whitespace; no shell quoting is interpreted.
    pub fn from_command_line(line: &str) -> Result<Self, TerminateError> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(TerminateError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout: DEFAULT_TERMINATE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl ForceTerminate for CommandTerminator {
    async fn terminate(&self) -> Result<(), TerminateError> {
        let command = self.command_line();
        let mut child = Command::new(&self.program);
        child.args(&self.args).kill_on_drop(true);

        let status = match tokio::time::timeout(self.timeout, child.status()).await {
            Ok(result) => result.map_err(|source| TerminateError::Spawn {
                command: command.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TerminateError::TimedOut {
                    command,
                    timeout: self.timeout,
                });
            }
        };
        if status.success() {
            return Ok(());
        }
        Err(TerminateError::Failed {
            command,
            status: status.to_string(),
        })
    }

    fn describe(&self) -> String {
        self.command_line()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn systemd_restart_targets_user_unit() {
        let terminator = CommandTerminator::systemd_restart("mail-ingest.service");
        assert_eq!(
            terminator.describe(),
            "systemctl --user restart mail-ingest.service"
        );
    }

    #[test]
    fn empty_command_line_is_rejected() {
        assert!(matches!(
            CommandTerminator::from_command_line("   "),
            Err(TerminateError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn successful_command_terminates() {
        let terminator = CommandTerminator::from_command_line("true").unwrap();
        terminator.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn failing_command_reports_status() {
        let terminator = CommandTerminator::from_command_line("false").unwrap();
        let err = terminator.terminate().await.unwrap_err();
        assert!(matches!(err, TerminateError::Failed { .. }));
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let terminator =
            CommandTerminator::from_command_line("mailsync-no-such-binary --now").unwrap();
        let err = terminator.terminate().await.unwrap_err();
        assert!(matches!(err, TerminateError::Spawn { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let terminator = CommandTerminator::from_command_line("sleep 5")
            .unwrap()
            .with_timeout(Duration::from_millis(100));
        let err = terminator.terminate().await.unwrap_err();
        assert!(matches!(err, TerminateError::TimedOut { .. }));
    }
}
