// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remastering installation images with a composed kickstart.
//!
//! The source image is loop-mounted read-only inside an ephemeral work
//! directory so its descriptor can be read, and `mkksiso` then writes a copy
//! with the composed descriptor embedded and the boot arguments adjusted.
//! The mount and the work directory are torn down whether or not remastering
//! succeeds.

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use crate::artifacts::{partial_path, InstallationImage};
use crate::host::{CommandRunner, HostCommand};
use crate::kickstart::CustomizationPatch;
use crate::ProvisionError;

/// A remastered image that installs unattended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CustomizedImage {
    pub path: Utf8PathBuf,

    /// True if the image already existed and was used without remastering.
    pub reused: bool,

    /// The descriptor in the source image that was embedded, if this call did
    /// the remastering.
    pub descriptor: Option<String>,
}

pub struct ImageCustomizer<'a> {
    runner: &'a dyn CommandRunner,
    work_root: &'a Utf8Path,
}

impl<'a> ImageCustomizer<'a> {
    /// Creates a customizer whose ephemeral directories are created under
    /// `work_root`.
    pub fn new(runner: &'a dyn CommandRunner, work_root: &'a Utf8Path) -> Self {
        Self { runner, work_root }
    }

    /// Produces `destination` from `source`, unless `destination` already
    /// exists, in which case it's assumed to be a previous run's output and is
    /// returned untouched.
    pub async fn customize(
        &self,
        source: &InstallationImage,
        destination: &Utf8Path,
        patch: &CustomizationPatch,
        boot_args: &[&str],
    ) -> Result<CustomizedImage, ProvisionError> {
        if destination.exists() {
            info!(%destination, "customized image already exists, reusing it");
            return Ok(CustomizedImage {
                path: destination.to_owned(),
                reused: true,
                descriptor: None,
            });
        }

        let work_dir = WorkDir::create(self.work_root)?;
        let mount =
            ImageMount::acquire(self.runner, &source.path, work_dir.mount_point())
                .await?;

        let outcome = self
            .remaster(&mount, &work_dir, source, destination, patch, boot_args)
            .await;

        mount.release(self.runner).await;
        work_dir.remove();

        outcome
    }

    async fn remaster(
        &self,
        mount: &ImageMount,
        work_dir: &WorkDir,
        source: &InstallationImage,
        destination: &Utf8Path,
        patch: &CustomizationPatch,
        boot_args: &[&str],
    ) -> Result<CustomizedImage, ProvisionError> {
        let descriptor = self.find_descriptor(mount, &source.path).await?;
        let original = self.read_file(&descriptor).await?;
        info!(%descriptor, bytes = original.len(), "embedding kickstart");

        let kickstart = work_dir.kickstart_path();
        std::fs::write(&kickstart, patch.compose(&original))?;

        let partial = partial_path(destination);
        if partial.exists() {
            warn!(%partial, "removing stale partial image");
            std::fs::remove_file(&partial)?;
        }

        let cmd = HostCommand::new("mkksiso")
            .args(["--ks", kickstart.as_str()])
            .args(["--cmdline".to_owned(), boot_args.join(" ")])
            .args([source.path.as_str(), partial.as_str()])
            .env("TMPDIR", work_dir.tmp_dir().as_str());

        let output = self.runner.run(cmd).await?;
        if !output.success() {
            let _ = std::fs::remove_file(&partial);
            return Err(ProvisionError::RemasterFailure {
                source_image: source.path.clone(),
                status: output.status,
                stderr: output.stderr_lossy(),
            });
        }

        if !partial.is_file() {
            return Err(ProvisionError::MissingArtifact(destination.to_owned()));
        }
        std::fs::rename(&partial, destination)?;

        info!(%destination, "customized image written");
        Ok(CustomizedImage {
            path: destination.to_owned(),
            reused: false,
            descriptor: descriptor.file_name().map(str::to_owned),
        })
    }

    /// Lists the descriptors at the top level of the mounted image and picks
    /// the first in sorted order.
    async fn find_descriptor(
        &self,
        mount: &ImageMount,
        image: &Utf8Path,
    ) -> Result<Utf8PathBuf, ProvisionError> {
        let cmd = HostCommand::new("find").args([
            mount.path().as_str(),
            "-maxdepth",
            "1",
            "-type",
            "f",
            "-name",
            "*.ks",
        ]);
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            return Err(anyhow::anyhow!(
                "scanning {} for kickstarts failed: {}",
                mount.path(),
                output.stderr_lossy()
            )
            .into());
        }

        let mut found: Vec<Utf8PathBuf> = output
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(Utf8PathBuf::from)
            .collect();
        found.sort();

        match found.len() {
            0 => Err(ProvisionError::MissingKickstartDescriptor {
                image: image.to_owned(),
            }),
            1 => Ok(found.remove(0)),
            n => {
                warn!(
                    count = n,
                    candidates = ?found,
                    "image has several kickstarts, using the first"
                );
                Ok(found.remove(0))
            }
        }
    }

    async fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, ProvisionError> {
        let output = self.runner.run(HostCommand::new("cat").arg(path.as_str())).await?;
        if !output.success() {
            return Err(anyhow::anyhow!(
                "reading {path} failed: {}",
                output.stderr_lossy()
            )
            .into());
        }

        Ok(output.stdout)
    }
}

/// An ephemeral directory holding the mount point, the composed kickstart and
/// `mkksiso`'s scratch space. Deleted when removed or dropped.
struct WorkDir {
    dir: TempDir,
    root: Utf8PathBuf,
}

impl WorkDir {
    fn create(parent: &Utf8Path) -> Result<Self, ProvisionError> {
        std::fs::create_dir_all(parent)?;
        let dir = tempfile::Builder::new().prefix("ksbed-").tempdir_in(parent)?;
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf())
            .map_err(|e| anyhow::anyhow!("work directory is not UTF-8: {e}"))?;

        std::fs::create_dir(root.join("mnt"))?;
        std::fs::create_dir(root.join("tmp"))?;
        debug!(%root, "created work directory");
        Ok(Self { dir, root })
    }

    fn mount_point(&self) -> Utf8PathBuf {
        self.root.join("mnt")
    }

    fn tmp_dir(&self) -> Utf8PathBuf {
        self.root.join("tmp")
    }

    fn kickstart_path(&self) -> Utf8PathBuf {
        self.root.join("ks.cfg")
    }

    fn remove(self) {
        let root = self.root;
        match self.dir.close() {
            Ok(()) => debug!(%root, "removed work directory"),
            Err(e) => error!(%root, error = %e, "failed to remove work directory"),
        }
    }
}

/// A read-only loop mount of an installation image.
///
/// Unmounting needs the command runner, so it can't happen in `Drop`; owners
/// must call [`ImageMount::release`] on every path once the mount succeeded.
struct ImageMount {
    path: Utf8PathBuf,
    released: bool,
}

impl ImageMount {
    async fn acquire(
        runner: &dyn CommandRunner,
        image: &Utf8Path,
        mount_point: Utf8PathBuf,
    ) -> Result<Self, ProvisionError> {
        let cmd = HostCommand::new("mount").args([
            "-o",
            "loop,ro",
            image.as_str(),
            mount_point.as_str(),
        ]);
        let output = runner.run(cmd).await?;
        if !output.success() {
            return Err(anyhow::anyhow!(
                "mounting {image} at {mount_point} failed: {}",
                output.stderr_lossy()
            )
            .into());
        }

        debug!(%image, %mount_point, "mounted image");
        Ok(Self { path: mount_point, released: false })
    }

    fn path(&self) -> &Utf8Path {
        &self.path
    }

    async fn release(mut self, runner: &dyn CommandRunner) {
        self.released = true;
        match runner.run(HostCommand::new("umount").arg(self.path.as_str())).await {
            Ok(out) if out.success() => debug!(path = %self.path, "unmounted image"),
            Ok(out) => error!(
                path = %self.path,
                stderr = %out.stderr_lossy(),
                "failed to unmount image"
            ),
            Err(e) => error!(path = %self.path, error = ?e, "failed to unmount image"),
        }
    }
}

impl Drop for ImageMount {
    fn drop(&mut self) {
        if !self.released {
            error!(path = %self.path, "image mount dropped while still mounted");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::host::CommandOutput;
    use crate::kickstart::GuestAccounts;
    use crate::testutil::{ok, status, utf8_tempdir, ScriptedRunner};

    const ORIGINAL: &[u8] = b"lang en_US.UTF-8\nkeyboard us\n%packages\n@core\n%end\n";

    fn patch() -> CustomizationPatch {
        CustomizationPatch::new(
            &GuestAccounts::new(["admin".to_owned(), "tester".to_owned()]),
            "ssh-ed25519 AAAA test",
            &["console=ttyS0,115200n8"],
        )
    }

    fn arg_after<'c>(cmd: &'c HostCommand, flag: &str) -> &'c str {
        let idx = cmd.args.iter().position(|a| a == flag).unwrap();
        &cmd.args[idx + 1]
    }

    /// Stands in for the host: the mounted image lists `descriptors`, and
    /// `mkksiso` copies the kickstart it was given to its output path so the
    /// test can inspect it. `mkksiso_status` controls whether it succeeds.
    fn fake_host(descriptors: &'static str, mkksiso_status: i32) -> ScriptedRunner {
        ScriptedRunner::new(move |cmd| match cmd.program.as_str() {
            "mount" | "umount" => Ok(ok("")),
            "find" => Ok(ok(descriptors)),
            "cat" => Ok(CommandOutput { stdout: ORIGINAL.to_vec(), ..status(0) }),
            "mkksiso" => {
                if mkksiso_status == 0 {
                    let ks = std::fs::read(arg_after(cmd, "--ks")).unwrap();
                    std::fs::write(cmd.args.last().unwrap(), ks).unwrap();
                }
                Ok(status(mkksiso_status))
            }
            other => panic!("unexpected command {other}"),
        })
    }

    fn programs(runner: &ScriptedRunner) -> Vec<String> {
        runner.commands().into_iter().map(|c| c.program).collect()
    }

    fn is_empty_dir(path: &Utf8Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    fn source(root: &Utf8Path) -> InstallationImage {
        let path = root.join("c-x86_64-dvd1.iso");
        std::fs::write(&path, b"pristine").unwrap();
        InstallationImage { path, cached: true }
    }

    #[tokio::test]
    async fn remasters_with_composed_descriptor() {
        let (_dir, root) = utf8_tempdir();
        let work = root.join("work");
        let dest = root.join("c-x86_64-dvd1-ks.iso");
        let source = source(&root);

        let runner = fake_host("/w/mnt/zz.ks\n/w/mnt/anaconda.ks\n", 0);
        let image = ImageCustomizer::new(&runner, &work)
            .customize(&source, &dest, &patch(), &["console=ttyS0,115200n8", "quiet"])
            .await
            .unwrap();

        assert!(!image.reused);
        assert_eq!(image.descriptor.as_deref(), Some("anaconda.ks"));
        assert_eq!(
            programs(&runner),
            ["mount", "find", "cat", "mkksiso", "umount"]
        );

        let cmds = runner.commands();
        assert_eq!(cmds[0].args[..2], ["-o", "loop,ro"]);
        assert_eq!(cmds[2].args, ["/w/mnt/anaconda.ks"]);
        assert_eq!(arg_after(&cmds[3], "--cmdline"), "console=ttyS0,115200n8 quiet");
        assert!(cmds[3].env.iter().any(|(k, _)| k == "TMPDIR"));

        let written = std::fs::read(&dest).unwrap();
        assert_eq!(written, patch().compose(ORIGINAL));
        assert_eq!(std::fs::read(&source.path).unwrap(), b"pristine");
        assert!(is_empty_dir(&work));
    }

    #[tokio::test]
    async fn existing_destination_is_reused_untouched() {
        let (_dir, root) = utf8_tempdir();
        let work = root.join("work");
        let dest = root.join("c-x86_64-dvd1-ks.iso");
        let source = source(&root);

        let runner = fake_host("/w/mnt/anaconda.ks\n", 0);
        let customizer = ImageCustomizer::new(&runner, &work);
        customizer.customize(&source, &dest, &patch(), &[]).await.unwrap();
        let first = std::fs::read(&dest).unwrap();
        let commands_after_first = runner.commands().len();

        let again = customizer.customize(&source, &dest, &patch(), &[]).await.unwrap();
        assert!(again.reused);
        assert_eq!(runner.commands().len(), commands_after_first);
        assert_eq!(std::fs::read(&dest).unwrap(), first);
    }

    #[tokio::test]
    async fn image_without_descriptor_fails_and_cleans_up() {
        let (_dir, root) = utf8_tempdir();
        let work = root.join("work");
        let dest = root.join("c-x86_64-dvd1-ks.iso");
        let source = source(&root);

        let runner = fake_host("", 0);
        let err = ImageCustomizer::new(&runner, &work)
            .customize(&source, &dest, &patch(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::MissingKickstartDescriptor { .. }));
        assert_eq!(programs(&runner), ["mount", "find", "umount"]);
        assert!(!dest.exists());
        assert!(is_empty_dir(&work));
    }

    #[tokio::test]
    async fn remaster_failure_still_unmounts_and_cleans_up() {
        let (_dir, root) = utf8_tempdir();
        let work = root.join("work");
        let dest = root.join("c-x86_64-dvd1-ks.iso");
        let source = source(&root);

        let runner = fake_host("/w/mnt/anaconda.ks\n", 1);
        let err = ImageCustomizer::new(&runner, &work)
            .customize(&source, &dest, &patch(), &[])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ProvisionError::RemasterFailure { status: Some(1), .. }
        ));
        assert_eq!(programs(&runner).last().unwrap(), "umount");
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        assert!(is_empty_dir(&work));
    }

    #[tokio::test]
    async fn mount_failure_skips_unmount() {
        let (_dir, root) = utf8_tempdir();
        let work = root.join("work");
        let dest = root.join("c-x86_64-dvd1-ks.iso");
        let source = source(&root);

        let runner = ScriptedRunner::new(|cmd| {
            assert_eq!(cmd.program, "mount");
            Ok(status(32))
        });
        let err = ImageCustomizer::new(&runner, &work)
            .customize(&source, &dest, &patch(), &[])
            .await
            .unwrap_err();

        assert!(matches!(err, ProvisionError::Other(_)));
        assert_eq!(runner.commands().len(), 1);
        assert!(is_empty_dir(&work));
    }
}
