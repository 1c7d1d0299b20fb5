// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ksbed: builds a disposable, kickstart-installed test VM and waits for it
//! to answer over SSH.
//!
//! The work is split into stages that run strictly one after another:
//!
//! 1. [`artifacts`] fetches (or reuses) the installation ISO for a compose.
//! 2. [`customize`] remasters the ISO with a composed kickstart
//!    ([`kickstart`]) so that it installs without interaction.
//! 3. [`network`] makes sure the libvirt network the guest attaches to exists
//!    and is running.
//! 4. [`vm`] allocates a disk, installs the guest and boots it.
//! 5. [`readiness`] polls the guest over SSH until it answers.
//!
//! [`pipeline`] strings the stages together. Every interaction with the host
//! goes through a [`host::CommandRunner`].

#[macro_use]
extern crate tracing;

pub mod artifacts;
pub mod config;
pub mod customize;
mod error;
pub mod host;
pub mod kickstart;
pub mod network;
pub mod pipeline;
pub mod platform;
pub mod readiness;
pub mod vm;

#[cfg(test)]
mod testutil;

pub use error::{ProvisionError, Stage};
pub use pipeline::{Pipeline, PipelineError, PipelineReport};
