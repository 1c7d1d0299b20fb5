// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The narrow interface through which every stage runs host commands.
//!
//! Stages never build a `std::process::Command` themselves. They describe the
//! invocation as a [`HostCommand`] and hand it to a [`CommandRunner`], which
//! lets tests substitute a scripted runner for the real host.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

/// A single invocation of a host program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,

    /// Extra environment variables for the child, on top of the inherited
    /// environment.
    pub env: Vec<(String, String)>,

    /// If set, the command is killed and reported as an error once this much
    /// time has passed.
    pub timeout: Option<Duration>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// The result of a command that ran to completion (successfully or not).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, or `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim_end().to_owned()
    }
}

/// Runs host commands on behalf of the provisioning stages.
///
/// An `Err` means the command could not be run at all (spawn failure,
/// deadline exceeded). A command that ran and exited nonzero is an `Ok` with
/// a failing [`CommandOutput::status`]; callers decide what that means.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: HostCommand) -> anyhow::Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: HostCommand) -> anyhow::Result<CommandOutput> {
        debug!(%cmd, timeout = ?cmd.timeout, "executing host command");

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("spawning `{}`", cmd.program))?;

        let output = match cmd.timeout {
            Some(deadline) => {
                tokio::time::timeout(deadline, child.wait_with_output())
                    .await
                    .with_context(|| {
                        format!("`{}` timed out after {deadline:?}", cmd.program)
                    })?
            }
            None => child.wait_with_output().await,
        }
        .with_context(|| format!("waiting for `{}`", cmd.program))?;

        let output = CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        };

        if !output.success() {
            debug!(
                %cmd,
                status = ?output.status,
                stderr = %output.stderr_lossy(),
                "host command failed"
            );
        }

        Ok(output)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let cmd = HostCommand::new("virsh").args(["net-info", "integration"]);
        assert_eq!(cmd.to_string(), "virsh net-info integration");
    }

    #[tokio::test]
    async fn system_runner_captures_output_and_status() {
        let out = SystemRunner
            .run(HostCommand::new("sh").args(["-c", "printf hi; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.stdout, b"hi");
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn system_runner_enforces_deadline() {
        let res = SystemRunner
            .run(
                HostCommand::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
            )
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn system_runner_reports_spawn_failure() {
        let res = SystemRunner
            .run(HostCommand::new("/nonexistent/ksbed-test-binary"))
            .await;
        assert!(res.is_err());
    }
}
