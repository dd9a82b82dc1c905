//! Script dispatch
//!
//! drnet does not talk SSH itself. A rendered script is piped into the
//! standard input of a configured command (by default `ssh ... sudo bash -s`)
//! and the command's output is handed back with the script's own pass/fail
//! summary parsed out of it.
//!
//! The command template is split on whitespace and executed directly, never
//! through a shell. `{host}` and `{port}` are substituted per argument.
//!
//! # Example
//!
//! ```no_run
//! use drnet::transport::{CommandTransport, Target, Transport};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = CommandTransport::new("bash -s")?;
//! let target = Target::new("web1", "web1.office.example.org", 22);
//! let out = transport.execute(&target, "echo \"passed=1 failed=0\"".to_string()).await?;
//! assert_eq!(out.passed, Some(1));
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error, info};

pub const DEFAULT_COMMAND: &str = "ssh -p {port} {host} sudo bash -s";

/// Error type for script dispatch
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The command template has no program to run
    #[error("Transport command is empty")]
    EmptyCommand,

    /// The template names a placeholder other than `{host}` and `{port}`
    #[error("Unknown placeholder '{0}' in transport command")]
    UnknownPlaceholder(String),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The command ran but exited unsuccessfully
    #[error("Transport exited with status {exit_code:?}: {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Where a script goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Machine label, for logs and errors
    pub machine: String,
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(machine: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            machine: machine.into(),
            host: host.into(),
            port,
        }
    }
}

/// What came back from running a script
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Unit counts from the script's `passed=N failed=M` summary, if printed
    pub passed: Option<u32>,
    pub failed: Option<u32>,
}

impl ExecOutput {
    pub fn new(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        let (passed, failed) = parse_summary(&stdout).unzip();
        Self {
            stdout,
            stderr,
            exit_code,
            passed,
            failed,
        }
    }

    /// `true` if the script reported no failed unit.
    pub fn all_passed(&self) -> bool {
        self.failed == Some(0)
    }
}

/// Finds the last `passed=N failed=M` line of a script's output.
pub fn parse_summary(stdout: &str) -> Option<(u32, u32)> {
    stdout.lines().rev().find_map(|line| {
        let mut passed = None;
        let mut failed = None;
        for word in line.split_whitespace() {
            if let Some(n) = word.strip_prefix("passed=") {
                passed = n.parse().ok();
            } else if let Some(n) = word.strip_prefix("failed=") {
                failed = n.parse().ok();
            }
        }
        passed.zip(failed)
    })
}

/// Runs a rendered script somewhere
pub trait Transport: Send + Sync + 'static {
    fn execute(
        &self,
        target: &Target,
        script: String,
    ) -> impl Future<Output = Result<ExecOutput, TransportError>> + Send;
}

/// Pipes the script into a local command built from a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTransport {
    template: Vec<String>,
}

impl CommandTransport {
    /// # Errors
    ///
    /// Returns `Err` if the template is empty or uses an unknown placeholder.
    pub fn new(template: &str) -> Result<Self, TransportError> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return Err(TransportError::EmptyCommand);
        }
        for arg in &template {
            let mut rest = arg.as_str();
            while let Some(start) = rest.find('{') {
                let Some(end) = rest[start..].find('}') else {
                    break;
                };
                let name = &rest[start..=start + end];
                if name != "{host}" && name != "{port}" {
                    return Err(TransportError::UnknownPlaceholder(name.to_string()));
                }
                rest = &rest[start + end + 1..];
            }
        }
        Ok(Self { template })
    }

    /// Program and arguments for one target
    pub fn command_line(&self, target: &Target) -> Vec<String> {
        let port = target.port.to_string();
        self.template
            .iter()
            .map(|arg| arg.replace("{host}", &target.host).replace("{port}", &port))
            .collect()
    }
}

impl Default for CommandTransport {
    fn default() -> Self {
        Self {
            template: DEFAULT_COMMAND.split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl Transport for CommandTransport {
    async fn execute(&self, target: &Target, script: String) -> Result<ExecOutput, TransportError> {
        let argv = self.command_line(target);
        let (program, args) = argv.split_first().ok_or(TransportError::EmptyCommand)?;
        info!("Dispatching script to {} via {}", target.machine, program);
        debug!("Transport command line: {:?}", argv);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| {
                error!("Failed to spawn {program}: {source}");
                TransportError::Spawn {
                    program: program.clone(),
                    source,
                }
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        // Failed units never make the script exit non-zero
        if !output.status.success() {
            error!("Script for {} exited with {}", target.machine, output.status);
            return Err(TransportError::Failed {
                exit_code: output.status.code(),
                stderr,
            });
        }

        let out = ExecOutput::new(stdout, stderr, output.status.code());
        info!(
            "Script for {} finished: passed={:?} failed={:?}",
            target.machine, out.passed, out.failed
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new("web1", "web1.example.org", 2222)
    }

    #[test]
    fn test_default_command_line() {
        let transport = CommandTransport::default();
        assert_eq!(
            transport.command_line(&target()),
            vec!["ssh", "-p", "2222", "web1.example.org", "sudo", "bash", "-s"]
        );
    }

    #[test]
    fn test_template_validation() {
        assert!(matches!(CommandTransport::new("   "), Err(TransportError::EmptyCommand)));
        assert!(matches!(
            CommandTransport::new("ssh {user}@{host}"),
            Err(TransportError::UnknownPlaceholder(ref p)) if p == "{user}"
        ));
        let t = CommandTransport::new("ssh root@{host}:{port}").unwrap();
        assert_eq!(t.command_line(&target()), vec!["ssh", "root@web1.example.org:2222"]);
    }

    #[test]
    fn test_parse_summary_takes_last_line() {
        let stdout = "passed=0 failed=0\nsshd_installed ✓\npassed=3 failed=1\nfailed:\nsomething\n";
        assert_eq!(parse_summary(stdout), Some((3, 1)));
        assert_eq!(parse_summary("no summary here"), None);
    }

    #[tokio::test]
    async fn test_execute_pipes_script() {
        let transport = CommandTransport::new("bash -s").unwrap();
        let out = transport
            .execute(&target(), "echo hello\necho \"passed=2 failed=0\"".to_string())
            .await
            .unwrap();
        assert!(out.stdout.starts_with("hello\n"));
        assert_eq!(out.passed, Some(2));
        assert!(out.all_passed());
    }

    #[tokio::test]
    async fn test_execute_non_zero_exit() {
        let transport = CommandTransport::new("bash -s").unwrap();
        let err = transport
            .execute(&target(), "echo oops >&2; exit 3".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_execute_missing_program() {
        let transport = CommandTransport::new("drnet-no-such-program-xyz").unwrap();
        let err = transport.execute(&target(), String::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
    }
}
