// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Waiting for a booted guest to accept SSH connections.
//!
//! The probe connects, runs `echo -n` with a fixed sentinel, and checks that
//! exactly the sentinel came back. Attempts start on a fixed schedule (one
//! every [`RETRY_INTERVAL`]) and each is cut off after [`ATTEMPT_TIMEOUT`].
//! Because the timeout is shorter than the interval, an attempt always
//! finishes before the next one is due, and the whole probe is bounded by
//! `(MAX_ATTEMPTS - 1) * RETRY_INTERVAL + ATTEMPT_TIMEOUT`.
//!
//! The interval is measured from the start of one attempt to the start of
//! the next, not as a pause after an attempt ends. A failed attempt that took
//! three seconds is followed by seven idle seconds, not ten, so the overall
//! bound holds however long failures take to arrive.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::time::MissedTickBehavior;

use crate::host::{CommandRunner, HostCommand};
use crate::ProvisionError;

/// The string the guest must echo back.
pub const SENTINEL: &str = "ksbed-ready";

pub const MAX_ATTEMPTS: u32 = 31;

/// Time between the starts of consecutive attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Deadline for a single connect-and-run attempt.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            interval: RETRY_INTERVAL,
            attempt_timeout: ATTEMPT_TIMEOUT,
        }
    }
}

impl ReadinessPolicy {
    pub fn new(
        max_attempts: u32,
        interval: Duration,
        attempt_timeout: Duration,
    ) -> Result<Self, ProvisionError> {
        if max_attempts == 0 {
            return Err(ProvisionError::InvalidConfiguration(
                "readiness probe needs at least one attempt".to_owned(),
            ));
        }
        if attempt_timeout.is_zero() {
            return Err(ProvisionError::InvalidConfiguration(
                "readiness attempt timeout must be nonzero".to_owned(),
            ));
        }
        if attempt_timeout >= interval {
            return Err(ProvisionError::InvalidConfiguration(format!(
                "readiness attempt timeout ({attempt_timeout:?}) must be \
                 shorter than the retry interval ({interval:?})"
            )));
        }

        Ok(Self { max_attempts, interval, attempt_timeout })
    }

    /// The longest a probe under this policy can take.
    pub fn worst_case(&self) -> Duration {
        self.interval * (self.max_attempts - 1) + self.attempt_timeout
    }
}

/// Who and where to connect to.
#[derive(Clone, Debug)]
pub struct SshTarget {
    pub user: String,
    pub address: Ipv4Addr,
    pub key: Utf8PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadinessResult {
    pub ready: bool,
    pub attempts: u32,
}

enum ProbeState {
    Probing { attempt: u32 },
    Ready { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Why a single attempt didn't count.
enum AttemptFailure {
    TimedOut,
    CouldNotRun(anyhow::Error),
    Mismatch { status: Option<i32>, stdout: String, stderr: String },
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::TimedOut => write!(f, "timed out"),
            AttemptFailure::CouldNotRun(e) => write!(f, "could not run ssh: {e:#}"),
            AttemptFailure::Mismatch { status, stdout, stderr } => write!(
                f,
                "unexpected reply (status {status:?}, stdout {stdout:?}, stderr {stderr:?})"
            ),
        }
    }
}

pub struct ReadinessProbe<'a> {
    runner: &'a dyn CommandRunner,
    policy: ReadinessPolicy,
}

impl<'a> ReadinessProbe<'a> {
    pub fn new(runner: &'a dyn CommandRunner, policy: ReadinessPolicy) -> Self {
        Self { runner, policy }
    }

    /// Probes `target` until it answers with the sentinel or the attempt
    /// budget runs out. Stops at the first success.
    pub async fn wait_until_ready(&self, target: &SshTarget) -> ReadinessResult {
        info!(
            address = %target.address,
            max_attempts = self.policy.max_attempts,
            interval = ?self.policy.interval,
            "waiting for guest to answer over SSH"
        );

        // The first tick completes immediately; later ones are spaced one
        // interval apart from the first.
        let mut schedule = tokio::time::interval(self.policy.interval);
        schedule.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut state = ProbeState::Probing { attempt: 1 };
        loop {
            state = match state {
                ProbeState::Probing { attempt } => {
                    schedule.tick().await;
                    match self.attempt(target).await {
                        Ok(()) => ProbeState::Ready { attempts: attempt },
                        Err(failure) => {
                            debug!(attempt, %failure, "guest not ready yet");
                            if attempt >= self.policy.max_attempts {
                                ProbeState::Exhausted { attempts: attempt }
                            } else {
                                ProbeState::Probing { attempt: attempt + 1 }
                            }
                        }
                    }
                }
                ProbeState::Ready { attempts } => {
                    info!(attempts, address = %target.address, "guest is ready");
                    return ReadinessResult { ready: true, attempts };
                }
                ProbeState::Exhausted { attempts } => {
                    warn!(attempts, address = %target.address, "guest never answered");
                    return ReadinessResult { ready: false, attempts };
                }
            }
        }
    }

    async fn attempt(&self, target: &SshTarget) -> Result<(), AttemptFailure> {
        let cmd = ssh_command(target, self.policy.attempt_timeout);
        let output = tokio::time::timeout(self.policy.attempt_timeout, self.runner.run(cmd))
            .await
            .map_err(|_| AttemptFailure::TimedOut)?
            .map_err(AttemptFailure::CouldNotRun)?;

        if output.stdout == SENTINEL.as_bytes() {
            Ok(())
        } else {
            Err(AttemptFailure::Mismatch {
                status: output.status,
                stdout: output.stdout_lossy(),
                stderr: output.stderr_lossy(),
            })
        }
    }
}

fn ssh_command(target: &SshTarget, timeout: Duration) -> HostCommand {
    // ssh only takes whole seconds; round up so it never gives up before the
    // attempt deadline would.
    let connect_secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    HostCommand::new("ssh")
        .args(["-i", target.key.as_str()])
        .args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
        ])
        .args(["-o".to_owned(), format!("ConnectTimeout={}", connect_secs.max(1))])
        .arg(format!("{}@{}", target.user, target.address))
        .arg(format!("echo -n {SENTINEL}"))
        .timeout(timeout)
}
