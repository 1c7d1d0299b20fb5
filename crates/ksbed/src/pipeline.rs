// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs every stage of a provisioning run in order.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::Instrument;

use crate::artifacts::{ImageAcquirer, InstallationImage};
use crate::config::RunConfig;
use crate::customize::{CustomizedImage, ImageCustomizer};
use crate::host::{CommandRunner, HostCommand};
use crate::kickstart::CustomizationPatch;
use crate::network::{NetworkOutcome, NetworkProvisioner};
use crate::readiness::{ReadinessProbe, SshTarget};
use crate::vm::{GuestPlacement, TestGuest};
use crate::{ProvisionError, Stage};

/// A provisioning failure and the stage it happened in.
#[derive(Debug, Error)]
#[error("[{stage}] {error}")]
pub struct PipelineError {
    pub stage: Stage,
    pub error: ProvisionError,
}

fn in_stage(stage: Stage) -> impl FnOnce(ProvisionError) -> PipelineError {
    move |error| PipelineError { stage, error }
}

/// What a successful run produced.
#[derive(Clone, Debug)]
pub struct PipelineReport {
    pub vm_name: String,
    pub address: Ipv4Addr,
    pub missing_host_packages: Vec<String>,
    pub image: InstallationImage,
    pub customized: CustomizedImage,
    pub network: NetworkOutcome,
    pub readiness_attempts: u32,

    /// Time from the guest being started to it answering.
    pub readiness_elapsed: Duration,

    /// Time for the whole run.
    pub elapsed: Duration,
}

pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a RunConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a RunConfig) -> Self {
        Self { runner, config }
    }

    /// Runs the stages in order and stops at the first failure. Nothing done
    /// by an earlier stage is undone when a later one fails.
    pub async fn run(&self) -> Result<PipelineReport, PipelineError> {
        let cfg = self.config;
        let start = Instant::now();
        info!(os = %cfg.os, compose = cfg.compose, arch = cfg.arch, "starting provisioning run");

        let missing_host_packages =
            missing_host_packages(self.runner, cfg.profile.host_packages)
                .instrument(info_span!("preflight"))
                .await;

        let image = ImageAcquirer::new(self.runner)
            .acquire(&cfg.image_url, &cfg.image_path())
            .instrument(info_span!("acquire_image", url = cfg.image_url))
            .await
            .map_err(in_stage(Stage::AcquireImage))?;

        let patch = CustomizationPatch::new(
            &cfg.accounts,
            &cfg.ssh_public_key,
            cfg.profile.boot_args,
        );
        let customized = ImageCustomizer::new(self.runner, &cfg.work_dir)
            .customize(
                &image,
                &cfg.customized_image_path(),
                &patch,
                cfg.profile.boot_args,
            )
            .instrument(info_span!("customize_image"))
            .await
            .map_err(in_stage(Stage::CustomizeImage))?;

        let network = NetworkProvisioner::new(self.runner, &cfg.libvirt_uri)
            .ensure(&cfg.network, &cfg.work_dir)
            .instrument(info_span!("provision_network", network = cfg.network.name))
            .await
            .map_err(in_stage(Stage::ProvisionNetwork))?;

        let mut guest = TestGuest::new(
            self.runner,
            cfg.guest.clone(),
            GuestPlacement {
                libvirt_uri: cfg.libvirt_uri.clone(),
                network: cfg.network.name.clone(),
                os_variant: cfg.profile.os_variant.to_owned(),
                disk_path: cfg.disk_path(),
            },
        );
        async {
            guest.allocate_disk().await?;
            guest.install(&customized.path).await?;
            guest.start().await
        }
        .instrument(info_span!("install_guest", vm = cfg.guest.name))
        .await
        .map_err(in_stage(Stage::InstallGuest))?;

        let started = Instant::now();
        let target = SshTarget {
            user: cfg.ssh_user.clone(),
            address: cfg.guest.address,
            key: cfg.ssh_key.clone(),
        };
        let readiness = ReadinessProbe::new(self.runner, cfg.readiness)
            .wait_until_ready(&target)
            .instrument(info_span!("await_readiness", address = %target.address))
            .await;
        if !readiness.ready {
            return Err(PipelineError {
                stage: Stage::AwaitReadiness,
                error: ProvisionError::ReadinessTimeout {
                    address: target.address.to_string(),
                    attempts: readiness.attempts,
                },
            });
        }

        let report = PipelineReport {
            vm_name: cfg.guest.name.clone(),
            address: cfg.guest.address,
            missing_host_packages,
            image,
            customized,
            network,
            readiness_attempts: readiness.attempts,
            readiness_elapsed: started.elapsed(),
            elapsed: start.elapsed(),
        };
        info!(vm = report.vm_name, elapsed = ?report.elapsed, "provisioning run finished");
        Ok(report)
    }
}

/// Returns which of `packages` aren't installed on the host.
///
/// This is advisory: a missing package is only logged, and if `rpm` itself
/// can't be run the check is skipped.
pub async fn missing_host_packages(
    runner: &dyn CommandRunner,
    packages: &[&str],
) -> Vec<String> {
    if packages.is_empty() {
        return Vec::new();
    }

    let cmd = HostCommand::new("rpm").arg("-q").args(packages.iter().copied());
    let output = match runner.run(cmd).await {
        Ok(output) => output,
        Err(e) => {
            warn!(error = %e, "couldn't query host packages, skipping check");
            return Vec::new();
        }
    };

    // `rpm -q` prints one line per queried package, in order, and reports a
    // missing one as "package <name> is not installed".
    let stdout = output.stdout_lossy();
    let missing: Vec<String> = packages
        .iter()
        .filter(|pkg| {
            let line = format!("package {pkg} is not installed");
            stdout.lines().any(|l| l.trim() == line)
        })
        .map(|pkg| pkg.to_string())
        .collect();

    if missing.is_empty() {
        debug!(?packages, "all host packages present");
    } else {
        warn!(?missing, "host packages are missing; later stages may fail");
    }

    missing
}
