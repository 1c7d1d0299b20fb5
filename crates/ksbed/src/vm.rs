// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creating, installing and booting the test guest.
//!
//! A [`TestGuest`] moves through [`GuestState`]s in one direction only:
//!
//! ```text
//! NoDisk -> DiskAllocated -> Installing -> Installed -> Running
//! ```
//!
//! Each transition is a single host command and none is retried. The
//! installer powers the guest off when it finishes, and `virt-install` is told
//! not to reboot it, so the guest sits powered off in `Installed` until
//! [`TestGuest::start`] boots it from its disk.

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

use crate::config::GuestConfig;
use crate::host::{CommandRunner, HostCommand};
use crate::ProvisionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum GuestState {
    NoDisk,
    DiskAllocated,
    Installing,
    /// The installer has finished and powered the guest off.
    Installed,
    Running,
}

#[derive(Debug, Error)]
pub enum VmStateError {
    #[error("guest {vm} can't {operation} while in state {state}")]
    InvalidTransition {
        vm: String,
        operation: &'static str,
        state: GuestState,
    },
}

/// The hypervisor-side settings a guest needs beyond its [`GuestConfig`].
#[derive(Clone, Debug)]
pub struct GuestPlacement {
    pub libvirt_uri: String,
    pub network: String,
    pub os_variant: String,
    pub disk_path: Utf8PathBuf,
}

pub struct TestGuest<'a> {
    runner: &'a dyn CommandRunner,
    config: GuestConfig,
    placement: GuestPlacement,
    state: GuestState,
}

impl<'a> TestGuest<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        config: GuestConfig,
        placement: GuestPlacement,
    ) -> Self {
        Self { runner, config, placement, state: GuestState::NoDisk }
    }

    pub fn state(&self) -> GuestState {
        self.state
    }

    fn expect_state(
        &self,
        expected: GuestState,
        operation: &'static str,
    ) -> Result<(), VmStateError> {
        if self.state != expected {
            return Err(VmStateError::InvalidTransition {
                vm: self.config.name.clone(),
                operation,
                state: self.state,
            });
        }

        Ok(())
    }

    /// Creates the guest's qcow2 disk.
    pub async fn allocate_disk(&mut self) -> Result<(), ProvisionError> {
        self.expect_state(GuestState::NoDisk, "allocate a disk")?;

        let path = self.placement.disk_path.clone();
        info!(vm = self.config.name, %path, gib = self.config.disk_gib, "allocating disk");
        let cmd = HostCommand::new("qemu-img").args([
            "create".to_owned(),
            "-f".to_owned(),
            "qcow2".to_owned(),
            path.to_string(),
            format!("{}G", self.config.disk_gib),
        ]);
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            return Err(ProvisionError::DiskAllocationFailure {
                path,
                stderr: output.stderr_lossy(),
            });
        }

        self.state = GuestState::DiskAllocated;
        Ok(())
    }

    /// Installs the guest from `install_media` and waits for the installer to
    /// power it off. A failed install leaves the guest in `Installing` and its
    /// disk in place.
    pub async fn install(&mut self, install_media: &Utf8Path) -> Result<(), ProvisionError> {
        self.expect_state(GuestState::DiskAllocated, "install")?;
        self.state = GuestState::Installing;

        info!(
            vm = self.config.name,
            %install_media,
            memory_mib = self.config.memory_mib,
            vcpus = self.config.vcpus,
            mac = self.config.mac,
            "installing guest"
        );

        let output = self.runner.run(self.install_command(install_media)).await?;
        if !output.success() {
            error!(vm = self.config.name, status = ?output.status, "guest install failed");
            return Err(ProvisionError::InstallFailure {
                vm: self.config.name.clone(),
                status: output.status,
                stderr: output.stderr_lossy(),
            });
        }

        info!(vm = self.config.name, "guest installed and powered off");
        self.state = GuestState::Installed;
        Ok(())
    }

    fn install_command(&self, install_media: &Utf8Path) -> HostCommand {
        let cfg = &self.config;
        let placement = &self.placement;
        HostCommand::new("virt-install").args([
            "--connect".to_owned(),
            placement.libvirt_uri.clone(),
            "--name".to_owned(),
            cfg.name.clone(),
            "--memory".to_owned(),
            cfg.memory_mib.to_string(),
            "--vcpus".to_owned(),
            cfg.vcpus.to_string(),
            "--os-variant".to_owned(),
            placement.os_variant.clone(),
            "--cdrom".to_owned(),
            install_media.to_string(),
            "--disk".to_owned(),
            format!("path={},format=qcow2,bus=virtio", placement.disk_path),
            "--network".to_owned(),
            format!("network={},mac={},model=virtio", placement.network, cfg.mac),
            "--boot".to_owned(),
            "uefi,firmware.feature0.name=secure-boot,firmware.feature0.enabled=no"
                .to_owned(),
            "--graphics".to_owned(),
            "none".to_owned(),
            "--noautoconsole".to_owned(),
            "--noreboot".to_owned(),
            "--wait".to_owned(),
            cfg.install_wait_minutes.to_string(),
        ])
    }

    /// Boots the installed guest.
    pub async fn start(&mut self) -> Result<(), ProvisionError> {
        self.expect_state(GuestState::Installed, "start")?;

        let cmd = HostCommand::new("virsh").args([
            "--connect",
            self.placement.libvirt_uri.as_str(),
            "start",
            self.config.name.as_str(),
        ]);
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            return Err(ProvisionError::StartFailure {
                vm: self.config.name.clone(),
                stderr: output.stderr_lossy(),
            });
        }

        info!(vm = self.config.name, "guest started");
        self.state = GuestState::Running;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::testutil::{ok, status, ScriptedRunner};

    fn guest_config() -> GuestConfig {
        GuestConfig {
            name: "integration-0badf00d".to_owned(),
            memory_mib: 4096,
            vcpus: 2,
            disk_gib: 10,
            install_wait_minutes: 60,
            mac: "34:49:22:B0:83:30".to_owned(),
            address: Ipv4Addr::new(192, 168, 100, 50),
        }
    }

    fn placement() -> GuestPlacement {
        GuestPlacement {
            libvirt_uri: "qemu:///system".to_owned(),
            network: "integration".to_owned(),
            os_variant: "rhel9-unknown".to_owned(),
            disk_path: "/var/lib/libvirt/images/integration-0badf00d.qcow2".into(),
        }
    }

    fn has_pair(cmd: &HostCommand, flag: &str, value: &str) -> bool {
        cmd.args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[tokio::test]
    async fn full_lifecycle_issues_expected_commands() {
        let runner = ScriptedRunner::new(|_| Ok(ok("")));
        let mut guest = TestGuest::new(&runner, guest_config(), placement());
        assert_eq!(guest.state(), GuestState::NoDisk);

        guest.allocate_disk().await.unwrap();
        assert_eq!(guest.state(), GuestState::DiskAllocated);
        guest.install(Utf8Path::new("/images/c-ks.iso")).await.unwrap();
        assert_eq!(guest.state(), GuestState::Installed);
        guest.start().await.unwrap();
        assert_eq!(guest.state(), GuestState::Running);

        let cmds = runner.commands();
        assert_eq!(cmds.len(), 3);

        assert_eq!(cmds[0].program, "qemu-img");
        assert_eq!(
            cmds[0].args,
            [
                "create",
                "-f",
                "qcow2",
                "/var/lib/libvirt/images/integration-0badf00d.qcow2",
                "10G"
            ]
        );

        let install = &cmds[1];
        assert_eq!(install.program, "virt-install");
        assert!(has_pair(install, "--name", "integration-0badf00d"));
        assert!(has_pair(install, "--memory", "4096"));
        assert!(has_pair(install, "--vcpus", "2"));
        assert!(has_pair(install, "--cdrom", "/images/c-ks.iso"));
        assert!(has_pair(
            install,
            "--network",
            "network=integration,mac=34:49:22:B0:83:30,model=virtio"
        ));
        assert!(install.args.iter().any(|a| a.starts_with("uefi,")
            && a.contains("secure-boot")
            && a.ends_with("enabled=no")));
        assert!(install.args.iter().any(|a| a == "--noreboot"));

        assert_eq!(
            cmds[2].args,
            ["--connect", "qemu:///system", "start", "integration-0badf00d"]
        );
    }

    #[tokio::test]
    async fn install_failure_is_fatal_and_keeps_state() {
        let runner = ScriptedRunner::new(|cmd| match cmd.program.as_str() {
            "virt-install" => Ok(status(1)),
            _ => Ok(ok("")),
        });
        let mut guest = TestGuest::new(&runner, guest_config(), placement());

        guest.allocate_disk().await.unwrap();
        let err = guest.install(Utf8Path::new("/images/c-ks.iso")).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InstallFailure { status: Some(1), .. }));
        assert_eq!(guest.state(), GuestState::Installing);

        // Nothing is retried and the guest can't be started.
        let err = guest.start().await.unwrap_err();
        assert!(matches!(err, ProvisionError::VmState(_)));
        assert_eq!(runner.commands().len(), 2);
    }

    #[tokio::test]
    async fn transitions_out_of_order_are_rejected() {
        let runner = ScriptedRunner::new(|_| Ok(ok("")));
        let mut guest = TestGuest::new(&runner, guest_config(), placement());

        assert!(matches!(
            guest.install(Utf8Path::new("/images/c-ks.iso")).await,
            Err(ProvisionError::VmState(VmStateError::InvalidTransition {
                state: GuestState::NoDisk,
                ..
            }))
        ));
        assert!(guest.start().await.is_err());
        assert!(runner.commands().is_empty());

        guest.allocate_disk().await.unwrap();
        assert!(guest.allocate_disk().await.is_err());
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn disk_allocation_failure_is_reported() {
        let runner = ScriptedRunner::new(|_| Ok(status(1)));
        let mut guest = TestGuest::new(&runner, guest_config(), placement());
        assert!(matches!(
            guest.allocate_disk().await,
            Err(ProvisionError::DiskAllocationFailure { .. })
        ));
        assert_eq!(guest.state(), GuestState::NoDisk);
    }
}
