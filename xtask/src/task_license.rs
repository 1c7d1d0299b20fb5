// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fs::File;
use std::io::{BufRead, BufReader};

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;

/// The subset of `.licenserc.yaml` this task understands.
#[derive(Deserialize, Debug)]
struct LicenseRc {
    header: HeaderRule,
}

#[derive(Deserialize, Debug)]
struct HeaderRule {
    license: LicenseText,
    paths: Vec<String>,
    #[serde(rename = "paths-ignore", default)]
    paths_ignore: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct LicenseText {
    content: String,
}

impl HeaderRule {
    fn expected_lines(&self) -> Vec<String> {
        self.license.content.lines().map(|l| format!("// {l}")).collect()
    }

    fn ignore_set(&self) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.paths_ignore {
            builder.add(
                Glob::new(pattern)
                    .with_context(|| format!("bad paths-ignore glob '{pattern}'"))?,
            );
        }
        Ok(builder.build()?)
    }
}

/// Returns the 1-based line at which `path` stops matching `expected`.
fn first_mismatch(path: &Utf8Path, expected: &[String]) -> Result<Option<usize>> {
    let file = File::open(path).with_context(|| format!("opening {path}"))?;
    let mut actual = BufReader::new(file).lines();
    for (idx, want) in expected.iter().enumerate() {
        match actual.next().transpose()? {
            Some(got) if &got == want => {}
            _ => return Ok(Some(idx + 1)),
        }
    }
    Ok(None)
}

pub(crate) fn cmd_license(ws_root: &Utf8Path) -> Result<()> {
    let rc_path = ws_root.join(".licenserc.yaml");
    let rc_file = File::open(&rc_path)
        .with_context(|| format!("cannot open {rc_path}"))?;
    let rc: LicenseRc = serde_yaml::from_reader(rc_file)
        .context("could not parse licenserc file")?;

    let rule = rc.header;
    if rule.paths.is_empty() {
        bail!("No file paths configured")
    }
    let ignore = rule.ignore_set()?;
    let expected = rule.expected_lines();

    let mut checked = 0;
    let mut bad = Vec::new();
    for pattern in &rule.paths {
        let full = ws_root.join(pattern);
        for entry in glob::glob(full.as_str())? {
            let path = Utf8PathBuf::try_from(entry?)?;
            let short = path.strip_prefix(ws_root)?;
            if ignore.is_match(short) {
                continue;
            }

            checked += 1;
            if let Some(line) = first_mismatch(&path, &expected)? {
                eprintln!("{short}: license header does not match at line {line}");
                bad.push(short.to_owned());
            }
        }
    }

    if !bad.is_empty() {
        bail!("{} of {checked} files lack the license header", bad.len())
    }

    println!("License headers present in all {checked} files");
    Ok(())
}
