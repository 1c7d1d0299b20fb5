// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run configuration.
//!
//! A [`RunConfig`] is built exactly once, from the caller's [`RunInputs`] and
//! an optional TOML [`Settings`] file, and then passed by reference to every
//! stage. All validation happens here so that later stages can trust it.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kickstart::GuestAccounts;
use crate::network::NetworkSpec;
use crate::platform::{self, OsIdentity, PlatformProfile};
use crate::readiness::ReadinessPolicy;
use crate::ProvisionError;

/// Values that identify what to build. These normally come from the command
/// line.
#[derive(Clone, Debug)]
pub struct RunInputs {
    /// `<distro>-<version>`, e.g. `rhel-9.8`.
    pub os: String,
    pub compose: String,
    pub download_node: String,
    pub arch: String,

    /// Path to the SSH private key used to reach the guest. The public half is
    /// expected next to it with a `.pub` suffix.
    pub ssh_key: Utf8PathBuf,

    /// The guest's address. Must be one of the network's reservations; if
    /// absent, the first reservation is used.
    pub guest_address: Option<Ipv4Addr>,
}

/// Tunables read from an optional TOML file. Every field has a default.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub paths: PathSettings,
    pub guest: GuestSettings,
    pub libvirt: LibvirtSettings,
    pub readiness: ReadinessSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    /// Where downloaded and remastered ISOs and guest disks are kept.
    pub image_dir: Utf8PathBuf,

    /// Parent directory for the customizer's ephemeral work directories.
    pub work_dir: Utf8PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            image_dir: "/var/lib/libvirt/images".into(),
            work_dir: "/var/tmp".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GuestSettings {
    pub name_prefix: String,
    pub memory_mib: u64,
    pub vcpus: u8,
    pub disk_gib: u64,
    pub install_wait_minutes: u32,
    pub accounts: [String; 2],
    pub ssh_user: String,
}

impl Default for GuestSettings {
    fn default() -> Self {
        Self {
            name_prefix: "integration".to_owned(),
            memory_mib: 4096,
            vcpus: 2,
            disk_gib: 10,
            install_wait_minutes: 60,
            accounts: ["admin".to_owned(), "tester".to_owned()],
            ssh_user: "root".to_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LibvirtSettings {
    pub uri: String,
}

impl Default for LibvirtSettings {
    fn default() -> Self {
        Self { uri: "qemu:///system".to_owned() }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReadinessSettings {
    pub max_attempts: u32,
    pub interval_secs: u64,
    pub attempt_timeout_secs: u64,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        let policy = ReadinessPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            interval_secs: policy.interval.as_secs(),
            attempt_timeout_secs: policy.attempt_timeout.as_secs(),
        }
    }
}

impl Settings {
    pub fn from_toml_path(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings file {path}"))?;
        toml::from_str(&contents)
            .with_context(|| format!("parsing settings file {path}"))
    }
}

/// Resources and identity of the guest this run creates.
#[derive(Clone, Debug)]
pub struct GuestConfig {
    /// Unique per run, so that disks and domains left behind by earlier runs
    /// don't collide with this one.
    pub name: String,
    pub memory_mib: u64,
    pub vcpus: u8,
    pub disk_gib: u64,
    pub install_wait_minutes: u32,
    pub mac: String,
    pub address: Ipv4Addr,
}

/// Everything a provisioning run needs, validated.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub os: OsIdentity,
    pub profile: &'static PlatformProfile,
    pub arch: String,
    pub compose: String,
    pub image_url: String,
    pub image_dir: Utf8PathBuf,
    pub work_dir: Utf8PathBuf,
    pub ssh_key: Utf8PathBuf,
    pub ssh_public_key: String,
    pub ssh_user: String,
    pub accounts: GuestAccounts,
    pub libvirt_uri: String,
    pub network: NetworkSpec,
    pub guest: GuestConfig,
    pub readiness: ReadinessPolicy,
}

impl RunConfig {
    pub fn build(
        inputs: RunInputs,
        settings: Settings,
    ) -> Result<Self, ProvisionError> {
        let os: OsIdentity = inputs.os.parse()?;
        let profile = platform::lookup(&os)?;

        let image_filename = image_filename(&inputs.compose, &inputs.arch);
        let image_url = platform::source_url(
            profile,
            &inputs.download_node,
            &inputs.compose,
            &inputs.arch,
            &image_filename,
        )?;

        let ssh_public_key = read_public_key(&inputs.ssh_key)?;

        let network = NetworkSpec::default();
        let address = inputs
            .guest_address
            .unwrap_or_else(|| network.reservations[0].address);
        let mac = network
            .reservation_for(address)
            .ok_or_else(|| {
                ProvisionError::InvalidConfiguration(format!(
                    "guest address {address} has no reservation in network {}",
                    network.name
                ))
            })?
            .mac
            .clone();

        let Settings { paths, guest, libvirt, readiness } = settings;
        let readiness = ReadinessPolicy::new(
            readiness.max_attempts,
            Duration::from_secs(readiness.interval_secs),
            Duration::from_secs(readiness.attempt_timeout_secs),
        )?;

        if guest.name_prefix.is_empty() {
            return Err(ProvisionError::InvalidConfiguration(
                "guest name prefix is empty".to_owned(),
            ));
        }
        if guest.accounts[0] == guest.accounts[1] {
            return Err(ProvisionError::InvalidConfiguration(format!(
                "guest accounts must be distinct (both are '{}')",
                guest.accounts[0]
            )));
        }

        let name = format!(
            "{}-{}",
            guest.name_prefix,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        Ok(Self {
            os,
            profile,
            arch: inputs.arch,
            compose: inputs.compose,
            image_url,
            image_dir: paths.image_dir,
            work_dir: paths.work_dir,
            ssh_key: inputs.ssh_key,
            ssh_public_key,
            ssh_user: guest.ssh_user,
            accounts: GuestAccounts::new(guest.accounts),
            libvirt_uri: libvirt.uri,
            network,
            guest: GuestConfig {
                name,
                memory_mib: guest.memory_mib,
                vcpus: guest.vcpus,
                disk_gib: guest.disk_gib,
                install_wait_minutes: guest.install_wait_minutes,
                mac,
                address,
            },
            readiness,
        })
    }

    pub fn image_filename(&self) -> String {
        image_filename(&self.compose, &self.arch)
    }

    /// Where the pristine installation ISO is cached.
    pub fn image_path(&self) -> Utf8PathBuf {
        self.image_dir.join(self.image_filename())
    }

    /// Where the kickstart-injected ISO is written.
    pub fn customized_image_path(&self) -> Utf8PathBuf {
        self.image_dir.join(format!("{}-{}-dvd1-ks.iso", self.compose, self.arch))
    }

    pub fn disk_path(&self) -> Utf8PathBuf {
        self.image_dir.join(format!("{}.qcow2", self.guest.name))
    }
}

fn image_filename(compose: &str, arch: &str) -> String {
    format!("{compose}-{arch}-dvd1.iso")
}

/// Reads the public half of `private_key` from `<private_key>.pub`.
pub fn read_public_key(private_key: &Utf8Path) -> Result<String, ProvisionError> {
    let public_key = format!("{private_key}.pub");
    if !Path::new(&public_key).is_file() {
        return Err(ProvisionError::ConfigurationMissing(format!(
            "SSH public key {public_key} does not exist"
        )));
    }

    let key = std::fs::read_to_string(&public_key)
        .with_context(|| format!("reading SSH public key {public_key}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ProvisionError::ConfigurationMissing(format!(
            "SSH public key {public_key} is empty"
        )));
    }

    Ok(key.to_owned())
}
