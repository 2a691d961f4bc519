/*!
 * Command Execution
 * Thin async wrapper around the system tools the daemon drives (ip, netplan, ss)
 */

use async_trait::async_trait;
use nix::unistd::Uid;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    /// Run with root privileges (through `sudo -n` when the daemon is unprivileged)
    pub elevate: bool,
    pub timeout: Option<Duration>,
}

impl ExecOptions {
    pub fn elevated() -> Self {
        Self {
            elevate: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Empty command line")]
    Empty,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}: {}", stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("{program} did not finish within {}s", after.as_secs())]
    TimedOut { program: String, after: Duration },
}

impl ExecError {
    /// Everything the tool printed, for hint classification
    pub fn output_text(&self) -> String {
        match self {
            ExecError::Failed { stdout, stderr, .. } => format!("{stderr}\n{stdout}"),
            other => other.to_string(),
        }
    }
}

/// The command execution sidecar. Output parsing belongs to the callers.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, argv: &[&str], options: ExecOptions) -> Result<String, ExecError>;
}

pub struct SystemExecutor {
    use_sudo: bool,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self {
            use_sudo: !Uid::effective().is_root(),
        }
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for SystemExecutor {
    async fn execute(&self, argv: &[&str], options: ExecOptions) -> Result<String, ExecError> {
        let (program, args) = argv.split_first().ok_or(ExecError::Empty)?;

        let mut command = if options.elevate && self.use_sudo {
            let mut sudo = Command::new("sudo");
            sudo.arg("-n").arg(program);
            sudo
        } else {
            Command::new(program)
        };
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("exec: {}", argv.join(" "));

        let output = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| ExecError::TimedOut {
                    program: program.to_string(),
                    after: limit,
                })?,
            None => command.output().await,
        }
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            Ok(stdout)
        } else {
            Err(ExecError::Failed {
                program: program.to_string(),
                code: output.status.code(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }
}
