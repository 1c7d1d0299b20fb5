// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// The workspace containing the manifest this xtask was built from.
pub(crate) fn workspace_root() -> Result<Utf8PathBuf> {
    let manifest = Utf8Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let meta = cargo_metadata::MetadataCommand::new()
        .manifest_path(manifest.as_std_path())
        .no_deps()
        .exec()
        .with_context(|| format!("running cargo metadata for {manifest}"))?;
    Ok(meta.workspace_root)
}

/// Runs `cargo` with `args` in `root`, passing its output straight through.
/// Returns whether it exited successfully.
pub(crate) fn run_cargo(root: &Utf8Path, args: &[String]) -> Result<bool> {
    let cargo = std::env::var("CARGO").unwrap_or_else(|_| "cargo".to_owned());
    let status = Command::new(&cargo)
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawning {cargo} {}", args.join(" ")))?;
    Ok(status.success())
}
