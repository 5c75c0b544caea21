//! External command execution port.
//!
//! Every interaction with the storage and export engines goes through the
//! [`CommandRunner`] trait so the domain layers can be exercised against a
//! scripted implementation in tests. The production implementation spawns the
//! process with a fixed deadline; the deadline surfaces as
//! [`Error::TimedOut`] and is never retried here. Caller cancellation does
//! not kill an already-started command: the child runs to completion or its
//! own timeout.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Synchronous-per-call execution of a privileged OS command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `argv`, optionally prefixed with the privilege escalation method.
    ///
    /// Returns [`Error::CommandFailed`] on non-zero exit (carrying stderr)
    /// and [`Error::TimedOut`] when the deadline elapses.
    async fn run(&self, argv: &[String], elevate: bool) -> Result<CommandOutput>;
}

/// Production [`CommandRunner`] backed by `tokio::process`.
pub struct SystemCommandRunner {
    become_method: String,
    timeout: Duration,
}

impl SystemCommandRunner {
    pub fn new(become_method: impl Into<String>, timeout: Duration) -> Self {
        Self {
            become_method: become_method.into(),
            timeout,
        }
    }

    fn elevated(&self, argv: &[String]) -> Vec<String> {
        match self.become_method.to_lowercase().as_str() {
            "none" | "false" | "" => argv.to_vec(),
            "su" => vec![
                "su".to_string(),
                "-c".to_string(),
                shell_join(argv),
            ],
            _ => {
                let mut cmd: Vec<String> = self
                    .become_method
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                cmd.extend(argv.iter().cloned());
                cmd
            }
        }
    }
}

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, argv: &[String], elevate: bool) -> Result<CommandOutput> {
        let cmd = if elevate {
            self.elevated(argv)
        } else {
            argv.to_vec()
        };
        info!(command = %shell_join(&cmd), elevate, "run");
        let (program, args) = cmd
            .split_first()
            .ok_or_else(|| Error::InvalidArgument("empty command".to_string()))?;

        let child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| Error::Internal(format!("spawn {program}: {e}")))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|e| Error::Internal(format!("wait {program}: {e}")))?,
            Err(_) => {
                return Err(Error::TimedOut(format!(
                    "{} after {:?}",
                    shell_join(&cmd),
                    self.timeout
                )))
            }
        };

        let result = CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(
            code = result.code,
            stdout = %result.stdout,
            stderr = %result.stderr,
            "finished"
        );
        if result.code != 0 {
            return Err(Error::CommandFailed {
                command: shell_join(&cmd),
                code: result.code,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}

/// Join an argv for display or for `su -c`, quoting words that need it.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty()
                || a.chars()
                    .any(|c| c.is_whitespace() || "'\"\\$`;|&<>(){}*?!".contains(c))
            {
                format!("'{}'", a.replace('\'', r"'\''"))
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_join_plain() {
        let argv = vec!["lvs".to_string(), "--reportformat".to_string()];
        assert_eq!(shell_join(&argv), "lvs --reportformat");
    }

    #[test]
    fn test_shell_join_quotes_spaces() {
        let argv = vec!["echo".to_string(), "a b".to_string()];
        assert_eq!(shell_join(&argv), "echo 'a b'");
    }

    #[test]
    fn test_elevation_prefix() {
        let runner = SystemCommandRunner::new("sudo", Duration::from_secs(10));
        let cmd = runner.elevated(&["lvs".to_string()]);
        assert_eq!(cmd, vec!["sudo".to_string(), "lvs".to_string()]);

        let runner = SystemCommandRunner::new("none", Duration::from_secs(10));
        let cmd = runner.elevated(&["lvs".to_string()]);
        assert_eq!(cmd, vec!["lvs".to_string()]);

        let runner = SystemCommandRunner::new("su", Duration::from_secs(10));
        let cmd = runner.elevated(&["lvs".to_string(), "-a".to_string()]);
        assert_eq!(
            cmd,
            vec!["su".to_string(), "-c".to_string(), "lvs -a".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let runner = SystemCommandRunner::new("none", Duration::from_secs(10));
        let out = runner
            .run(&["echo".to_string(), "hello".to_string()], false)
            .await
            .unwrap();
        assert_eq!(out.code, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_nonzero_is_command_failed() {
        let runner = SystemCommandRunner::new("none", Duration::from_secs(10));
        let err = runner
            .run(&["false".to_string()], false)
            .await
            .unwrap_err();
        match err {
            crate::error::Error::CommandFailed { code, .. } => assert_ne!(code, 0),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
