// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use anyhow::{bail, Result};
use camino::Utf8Path;

use crate::util::run_cargo;

/// Package sets clippy is run over, one invocation each.
const TARGETS: &[(&str, &[&str])] = &[
    ("workspace", &["--workspace", "--all-targets"]),
    ("library", &["-p", "ksbed", "--lib"]),
    ("runner", &["-p", "ksbed-runner", "--bins"]),
];

fn clippy_args(selection: &[&str], strict: bool) -> Vec<String> {
    let mut args: Vec<String> =
        ["clippy", "--no-deps"].iter().chain(selection).map(|a| a.to_string()).collect();
    if strict {
        args.extend(["--".to_owned(), "-Dwarnings".to_owned()]);
    }
    args
}

pub(crate) fn cmd_clippy(root: &Utf8Path, strict: bool) -> Result<()> {
    let mut failures = Vec::new();
    for (label, selection) in TARGETS {
        if !run_cargo(root, &clippy_args(selection, strict))? {
            failures.push(*label);
        }
    }

    if !failures.is_empty() {
        bail!("clippy failed for: {}", failures.join(", "))
    }
    Ok(())
}
