// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Acquisition and caching of installation images.

use camino::{Utf8Path, Utf8PathBuf};

use crate::host::{CommandRunner, HostCommand};
use crate::ProvisionError;

/// A pristine installation image in the local cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallationImage {
    pub path: Utf8PathBuf,

    /// True if the image was already cached and nothing was transferred.
    pub cached: bool,
}

/// Fetches installation images into a local directory, reusing any image
/// that's already there.
pub struct ImageAcquirer<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ImageAcquirer<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }

    /// Ensures `url` is available at `target`.
    ///
    /// An existing file at `target` is trusted as-is: the transfer writes to a
    /// `.part` sibling and only renames it into place once the transfer
    /// succeeds, so a file at `target` always comes from a complete download.
    pub async fn acquire(
        &self,
        url: &str,
        target: &Utf8Path,
    ) -> Result<InstallationImage, ProvisionError> {
        if target.is_file() {
            info!(%target, "installation image already cached");
            return Ok(InstallationImage { path: target.to_owned(), cached: true });
        } else if target.exists() {
            return Err(anyhow::anyhow!(
                "image path {target} already exists but isn't a file"
            )
            .into());
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let partial = partial_path(target);
        info!(url, %partial, "downloading installation image");

        let cmd = HostCommand::new("curl").args([
            "--fail",
            "--location",
            "--silent",
            "--show-error",
            "--output",
            partial.as_str(),
            url,
        ]);
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            let _ = std::fs::remove_file(&partial);
            return Err(ProvisionError::DownloadFailure {
                url: url.to_owned(),
                status: output.status,
                stderr: output.stderr_lossy(),
            });
        }

        if partial.is_file() {
            std::fs::rename(&partial, target)?;
        }

        if !target.is_file() {
            error!(%target, "transfer reported success but produced no file");
            return Err(ProvisionError::MissingArtifact(target.to_owned()));
        }

        info!(%target, "installation image downloaded");
        Ok(InstallationImage { path: target.to_owned(), cached: false })
    }
}

/// The sibling path a file is staged at before being renamed into place.
pub(crate) fn partial_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push_str(".part");
    path.with_file_name(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::CommandOutput;
    use crate::testutil::{ok, status, utf8_tempdir, ScriptedRunner};

    const URL: &str = "http://download.example.com/c/x86_64/c-x86_64-dvd1.iso";

    /// Pulls the `--output` argument out of a curl invocation.
    fn curl_output(cmd: &HostCommand) -> Utf8PathBuf {
        let idx = cmd.args.iter().position(|a| a == "--output").unwrap();
        cmd.args[idx + 1].clone().into()
    }

    #[tokio::test]
    async fn cached_image_is_not_transferred() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("c-x86_64-dvd1.iso");
        std::fs::write(&target, b"iso").unwrap();

        let runner = ScriptedRunner::new(|_| panic!("nothing should run"));
        let image = ImageAcquirer::new(&runner).acquire(URL, &target).await.unwrap();

        assert!(image.cached);
        assert_eq!(image.path, target);
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn successful_transfer_is_moved_into_place() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("images/c-x86_64-dvd1.iso");

        let runner = ScriptedRunner::new(|cmd| {
            assert_eq!(cmd.program, "curl");
            assert_eq!(cmd.args.last().unwrap(), URL);
            std::fs::write(curl_output(cmd), b"iso bytes").unwrap();
            Ok(ok(""))
        });
        let image = ImageAcquirer::new(&runner).acquire(URL, &target).await.unwrap();

        assert!(!image.cached);
        assert_eq!(std::fs::read(&target).unwrap(), b"iso bytes");
        assert!(!partial_path(&target).exists());
        assert_eq!(runner.commands().len(), 1);
    }

    #[tokio::test]
    async fn failed_transfer_leaves_nothing_cached() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("c-x86_64-dvd1.iso");

        let runner = ScriptedRunner::new(|cmd| {
            // Simulate a transfer that died halfway through.
            std::fs::write(curl_output(cmd), b"is").unwrap();
            Ok(CommandOutput {
                stderr: b"curl: (22) The requested URL returned error: 404".to_vec(),
                ..status(22)
            })
        });
        let err = ImageAcquirer::new(&runner).acquire(URL, &target).await.unwrap_err();

        match err {
            ProvisionError::DownloadFailure { url, status, stderr } => {
                assert_eq!(url, URL);
                assert_eq!(status, Some(22));
                assert!(stderr.contains("404"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!target.exists());
        assert!(!partial_path(&target).exists());
    }

    #[tokio::test]
    async fn success_without_file_is_missing_artifact() {
        let (_dir, root) = utf8_tempdir();
        let target = root.join("c-x86_64-dvd1.iso");

        let runner = ScriptedRunner::new(|_| Ok(ok("")));
        let err = ImageAcquirer::new(&runner).acquire(URL, &target).await.unwrap_err();
        assert!(matches!(err, ProvisionError::MissingArtifact(p) if p == target));
    }

    #[test]
    fn partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Utf8Path::new("/images/a.iso")),
            Utf8PathBuf::from("/images/a.iso.part")
        );
    }
}
