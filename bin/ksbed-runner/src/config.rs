// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::Ipv4Addr;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Provision a guest end to end and wait for it to answer over SSH.
    Run(RunOptions),

    /// Only wait for an existing guest to answer over SSH.
    Probe(ProbeOptions),

    /// Print the kickstart that would be injected into an image, given that
    /// image's own kickstart.
    Kickstart(KickstartOptions),

    /// List the supported platforms.
    Platforms,
}

/// Builds a kickstart-installed test VM under libvirt.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in the runner's log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct RunOptions {
    /// The guest OS to install, as `<distro>-<version>` (e.g. `rhel-9.8`).
    #[clap(long)]
    pub os: String,

    /// The compose whose installation image to use.
    #[clap(long)]
    pub compose: String,

    /// Base URL of the server the installation image is downloaded from.
    #[clap(long)]
    pub download_node: String,

    #[clap(long, default_value = "x86_64")]
    pub arch: String,

    /// SSH private key used to reach the guest. The matching public key must
    /// be next to it with a `.pub` suffix.
    #[clap(long, value_parser)]
    pub ssh_key: Utf8PathBuf,

    /// The address the guest is given. Must be one of the network's
    /// reservations; defaults to the first one.
    #[clap(long)]
    pub guest_address: Option<Ipv4Addr>,

    /// A TOML file overriding paths, guest resources and the readiness
    /// policy.
    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ProbeOptions {
    /// The guest's address.
    #[clap(long)]
    pub address: Ipv4Addr,

    #[clap(long, value_parser)]
    pub ssh_key: Utf8PathBuf,

    #[clap(long, default_value = "root")]
    pub user: String,

    /// A TOML file whose `[readiness]` table overrides the retry policy.
    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct KickstartOptions {
    /// The kickstart descriptor to extend.
    #[clap(value_parser)]
    pub descriptor: Utf8PathBuf,

    /// The platform whose boot arguments to use.
    #[clap(long, default_value = "rhel-9.8")]
    pub os: String,

    /// The SSH private key whose public half gets authorized in the guest.
    #[clap(long, value_parser)]
    pub ssh_key: Utf8PathBuf,

    #[clap(long, value_parser)]
    pub config: Option<Utf8PathBuf>,
}
