// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `cargo xtask`: checks run before pushing ksbed changes.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod task_clippy;
mod task_license;
mod util;

#[derive(Parser)]
#[command(name = "cargo xtask", about = "Pre-push checks for the ksbed workspace")]
struct Xtask {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Lint the library, the runner and the test targets with clippy
    Clippy {
        /// Fail on any clippy warning, not only on errors
        #[arg(short, long)]
        strict: bool,
    },
    /// Verify every source file opens with the MPL-2.0 header
    License,
    /// Run the license check, then clippy in strict mode
    Ci,
}

impl Task {
    fn run(self) -> Result<()> {
        let root = util::workspace_root()?;
        match self {
            Task::Clippy { strict } => task_clippy::cmd_clippy(&root, strict),
            Task::License => task_license::cmd_license(&root),
            Task::Ci => {
                task_license::cmd_license(&root)?;
                task_clippy::cmd_clippy(&root, true)
            }
        }
    }
}

fn main() -> Result<()> {
    Xtask::parse().task.run()
}
