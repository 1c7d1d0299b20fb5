// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The isolated libvirt network guests attach to.

use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use crate::host::{CommandRunner, HostCommand};
use crate::ProvisionError;

/// A static DHCP lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostReservation {
    pub mac: String,
    pub name: String,
    pub address: Ipv4Addr,
}

/// The definition of a NAT network with fixed reservations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    pub uuid: String,
    pub bridge: String,

    /// Source ports NAT may use for outbound connections.
    pub nat_ports: RangeInclusive<u16>,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub dhcp_range: RangeInclusive<Ipv4Addr>,
    pub reservations: Vec<HostReservation>,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        let reservation = |last: u8, octet: u8| HostReservation {
            mac: format!("34:49:22:B0:83:{last:02X}"),
            name: format!("guest{octet}"),
            address: Ipv4Addr::new(192, 168, 100, octet),
        };

        Self {
            name: "integration".to_owned(),
            uuid: "8c6d3a4e-1f0b-4f43-9d2e-6b1f2a9c7e51".to_owned(),
            bridge: "virbr-integ".to_owned(),
            nat_ports: 1024..=65535,
            gateway: Ipv4Addr::new(192, 168, 100, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            dhcp_range: Ipv4Addr::new(192, 168, 100, 100)
                ..=Ipv4Addr::new(192, 168, 100, 254),
            reservations: vec![
                reservation(0x30, 50),
                reservation(0x31, 51),
                reservation(0x32, 52),
            ],
        }
    }
}

impl NetworkSpec {
    pub fn reservation_for(&self, address: Ipv4Addr) -> Option<&HostReservation> {
        self.reservations.iter().find(|r| r.address == address)
    }

    /// Renders this network as libvirt XML.
    pub fn to_xml(&self) -> String {
        let hosts: String = self
            .reservations
            .iter()
            .map(|r| {
                format!(
                    "      <host mac='{}' name='{}' ip='{}'/>\n",
                    r.mac, r.name, r.address
                )
            })
            .collect();

        format!(
            r#"<network>
  <name>{name}</name>
  <uuid>{uuid}</uuid>
  <forward mode='nat'>
    <nat>
      <port start='{port_start}' end='{port_end}'/>
    </nat>
  </forward>
  <bridge name='{bridge}' stp='on' delay='0'/>
  <ip address='{gateway}' netmask='{netmask}'>
    <dhcp>
      <range start='{dhcp_start}' end='{dhcp_end}'/>
{hosts}    </dhcp>
  </ip>
</network>
"#,
            name = self.name,
            uuid = self.uuid,
            port_start = self.nat_ports.start(),
            port_end = self.nat_ports.end(),
            bridge = self.bridge,
            gateway = self.gateway,
            netmask = self.netmask,
            dhcp_start = self.dhcp_range.start(),
            dhcp_end = self.dhcp_range.end(),
        )
    }
}

/// What [`NetworkProvisioner::ensure`] had to do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkOutcome {
    pub defined: bool,
    pub started: bool,
}

/// Makes sure a network is defined and active, touching it only when it
/// isn't.
pub struct NetworkProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    uri: &'a str,
}

impl<'a> NetworkProvisioner<'a> {
    pub fn new(runner: &'a dyn CommandRunner, uri: &'a str) -> Self {
        Self { runner, uri }
    }

    pub async fn ensure(
        &self,
        spec: &NetworkSpec,
        scratch_dir: &camino::Utf8Path,
    ) -> Result<NetworkOutcome, ProvisionError> {
        let mut outcome = NetworkOutcome::default();

        if self.is_defined(&spec.name).await? {
            info!(network = spec.name, "network already defined");
        } else {
            self.define(spec, scratch_dir).await?;
            outcome.defined = true;
        }

        if self.is_active(&spec.name).await? {
            info!(network = spec.name, "network already active");
        } else {
            self.virsh(&spec.name, &["net-start", &spec.name]).await?;
            info!(network = spec.name, "started network");
            outcome.started = true;
        }

        Ok(outcome)
    }

    async fn is_defined(&self, name: &str) -> Result<bool, ProvisionError> {
        let listing = self.virsh(name, &["net-list", "--all", "--name"]).await?;
        Ok(listing.lines().any(|l| l.trim() == name))
    }

    async fn is_active(&self, name: &str) -> Result<bool, ProvisionError> {
        let info = self.virsh(name, &["net-info", name]).await?;
        let active = info
            .lines()
            .filter_map(|l| l.split_once(':'))
            .find(|(key, _)| key.trim() == "Active")
            .map(|(_, value)| value.trim().to_owned())
            .ok_or_else(|| ProvisionError::NetworkFailure {
                network: name.to_owned(),
                message: "`virsh net-info` did not report an Active field".to_owned(),
            })?;

        Ok(active == "yes")
    }

    async fn define(
        &self,
        spec: &NetworkSpec,
        scratch_dir: &camino::Utf8Path,
    ) -> Result<(), ProvisionError> {
        std::fs::create_dir_all(scratch_dir)?;
        let xml = tempfile::Builder::new()
            .prefix(&format!("{}-", spec.name))
            .suffix(".xml")
            .tempfile_in(scratch_dir)?;
        std::fs::write(xml.path(), spec.to_xml())?;

        let xml_path = xml.path().to_string_lossy().into_owned();
        self.virsh(&spec.name, &["net-define", &xml_path]).await?;
        info!(network = spec.name, uuid = spec.uuid, "defined network");
        Ok(())
    }

    /// Runs `virsh <args>` against the configured connection and returns its
    /// stdout.
    async fn virsh(&self, network: &str, args: &[&str]) -> Result<String, ProvisionError> {
        let cmd = HostCommand::new("virsh")
            .args(["--connect", self.uri])
            .args(args.iter().copied());
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            return Err(ProvisionError::NetworkFailure {
                network: network.to_owned(),
                message: format!(
                    "`virsh {}` failed: {}",
                    args.join(" "),
                    output.stderr_lossy()
                ),
            });
        }

        Ok(output.stdout_lossy())
    }
}
