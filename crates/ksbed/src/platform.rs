// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The table of operating system releases ksbed knows how to install, and the
//! per-release settings that differ between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProvisionError;

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Distro {
    Rhel,
    Centos,
}

/// A distribution and release, written `<distro>-<version>` (e.g. `rhel-9.8`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsIdentity {
    pub distro: Distro,
    pub version: String,
}

impl FromStr for OsIdentity {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unrecognized =
            || ProvisionError::UnsupportedPlatform { identity: s.to_owned() };
        let (distro, version) = s.trim().split_once('-').ok_or_else(unrecognized)?;
        if version.is_empty() {
            return Err(unrecognized());
        }

        let distro = distro
            .to_ascii_lowercase()
            .parse::<Distro>()
            .map_err(|_| unrecognized())?;

        Ok(Self { distro, version: version.to_owned() })
    }
}

impl fmt::Display for OsIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.distro, self.version)
    }
}

/// Release-specific settings.
#[derive(Debug, PartialEq, Eq)]
pub struct PlatformProfile {
    /// Kernel arguments appended to the installer's boot entries when the ISO
    /// is remastered.
    pub boot_args: &'static [&'static str],

    /// Where to find the installation ISO. `{download_node}`, `{compose}`,
    /// `{arch}` and `{filename}` are substituted.
    pub url_template: &'static str,

    /// The value passed to `virt-install --os-variant`.
    pub os_variant: &'static str,

    /// Host packages the pipeline's tools come from.
    pub host_packages: &'static [&'static str],
}

const SERIAL_BOOT_ARGS: &[&str] = &["console=ttyS0,115200n8", "quiet"];

const RHEL8_PACKAGES: &[&str] =
    &["lorax", "virt-install", "libvirt", "qemu-kvm", "edk2-ovmf"];

const RHEL9_PACKAGES: &[&str] = &[
    "lorax",
    "xorriso",
    "virt-install",
    "libvirt-daemon-kvm",
    "qemu-kvm",
    "edk2-ovmf",
];

const RHEL8_URL: &str = "{download_node}/rhel-8/nightly/RHEL-8/{compose}/compose/BaseOS/{arch}/iso/{filename}";
const RHEL9_URL: &str = "{download_node}/rhel-9/nightly/RHEL-9/{compose}/compose/BaseOS/{arch}/iso/{filename}";
const RHEL10_URL: &str = "{download_node}/rhel-10/nightly/RHEL-10/{compose}/compose/BaseOS/{arch}/iso/{filename}";
const CENTOS_URL: &str =
    "{download_node}/{compose}/compose/BaseOS/{arch}/iso/{filename}";

static PLATFORMS: &[(Distro, &str, PlatformProfile)] = &[
    (
        Distro::Rhel,
        "8.10",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL8_URL,
            os_variant: "rhel8.10",
            host_packages: RHEL8_PACKAGES,
        },
    ),
    (
        Distro::Rhel,
        "9.6",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL9_URL,
            os_variant: "rhel9-unknown",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Rhel,
        "9.7",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL9_URL,
            os_variant: "rhel9-unknown",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Rhel,
        "9.8",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL9_URL,
            os_variant: "rhel9-unknown",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Rhel,
        "10.0",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL10_URL,
            os_variant: "rhel10-unknown",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Rhel,
        "10.1",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: RHEL10_URL,
            os_variant: "rhel10-unknown",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Centos,
        "9",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: CENTOS_URL,
            os_variant: "centos-stream9",
            host_packages: RHEL9_PACKAGES,
        },
    ),
    (
        Distro::Centos,
        "10",
        PlatformProfile {
            boot_args: SERIAL_BOOT_ARGS,
            url_template: CENTOS_URL,
            os_variant: "centos-stream10",
            host_packages: RHEL9_PACKAGES,
        },
    ),
];

/// Looks up the profile for `os`. Releases that aren't in the table are
/// rejected rather than guessed at.
pub fn lookup(os: &OsIdentity) -> Result<&'static PlatformProfile, ProvisionError> {
    PLATFORMS
        .iter()
        .find(|(distro, version, _)| *distro == os.distro && *version == os.version)
        .map(|(_, _, profile)| profile)
        .ok_or_else(|| ProvisionError::UnsupportedPlatform {
            identity: os.to_string(),
        })
}

/// Yields every supported release and its profile, in table order.
pub fn supported() -> impl Iterator<Item = (OsIdentity, &'static PlatformProfile)> {
    PLATFORMS.iter().map(|(distro, version, profile)| {
        (OsIdentity { distro: *distro, version: (*version).to_owned() }, profile)
    })
}

/// Fills in a profile's URL template. Fails if any input is blank, since an
/// empty component yields a URL that points somewhere unintended.
pub fn source_url(
    profile: &PlatformProfile,
    download_node: &str,
    compose: &str,
    arch: &str,
    filename: &str,
) -> Result<String, ProvisionError> {
    for (name, value) in [
        ("download node", download_node),
        ("compose id", compose),
        ("architecture", arch),
    ] {
        if value.trim().is_empty() {
            return Err(ProvisionError::ConfigurationMissing(format!(
                "{name} is empty, cannot build the image URL"
            )));
        }
    }

    let url = profile
        .url_template
        .replace("{download_node}", download_node.trim_end_matches('/'))
        .replace("{compose}", compose)
        .replace("{arch}", arch)
        .replace("{filename}", filename);

    if url.is_empty() {
        return Err(ProvisionError::ConfigurationMissing(
            "derived image URL is empty".to_owned(),
        ));
    }

    Ok(url)
}
