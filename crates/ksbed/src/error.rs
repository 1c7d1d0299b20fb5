// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use thiserror::Error;

/// The stages of a provisioning run, in the order they execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Stage {
    Preflight,
    AcquireImage,
    CustomizeImage,
    ProvisionNetwork,
    InstallGuest,
    AwaitReadiness,
}

/// Errors that can end a provisioning run. None of them are retried.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unsupported platform '{identity}'")]
    UnsupportedPlatform { identity: String },

    #[error("required configuration is missing: {0}")]
    ConfigurationMissing(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("downloading {url} failed with status {status:?}: {stderr}")]
    DownloadFailure { url: String, status: Option<i32>, stderr: String },

    #[error("expected artifact {0} is missing")]
    MissingArtifact(Utf8PathBuf),

    #[error("no kickstart descriptor found at the top level of {image}")]
    MissingKickstartDescriptor { image: Utf8PathBuf },

    #[error("remastering {source_image} failed with status {status:?}: {stderr}")]
    RemasterFailure {
        source_image: Utf8PathBuf,
        status: Option<i32>,
        stderr: String,
    },

    #[error("network {network}: {message}")]
    NetworkFailure { network: String, message: String },

    #[error("allocating disk {path} failed: {stderr}")]
    DiskAllocationFailure { path: Utf8PathBuf, stderr: String },

    #[error("installing guest {vm} failed with status {status:?}: {stderr}")]
    InstallFailure { vm: String, status: Option<i32>, stderr: String },

    #[error("starting guest {vm} failed: {stderr}")]
    StartFailure { vm: String, stderr: String },

    #[error("guest at {address} did not answer after {attempts} attempts")]
    ReadinessTimeout { address: String, attempts: u32 },

    #[error(transparent)]
    VmState(#[from] crate::vm::VmStateError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
