//! Everything that touches kernel-visible state goes through [`Host`].
//!
//! Production code uses [`LinuxHost`]; tests swap in a recording fake.
use std::{
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    error::ProvisionError,
    util::cmd::{pipe_cmd, Cmd, CmdOutput},
};

#[cfg(test)]
pub mod fake;

pub trait Host {
    /// Run a program to completion. A non-zero exit is reported in the output, not as an error.
    ///
    /// # Errors
    /// - the program could not be spawned
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput, ProvisionError>;

    /// Mount `source` on `target`. `options` is a `mount(8)`-style option string.
    ///
    /// # Errors
    /// - the `mount(2)` syscall failed
    fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &str) -> std::io::Result<()>;

    /// Remount an existing mount read-only.
    ///
    /// # Errors
    /// - the `mount(2)` syscall failed
    fn remount_readonly(&self, target: &Path) -> std::io::Result<()>;

    /// # Errors
    /// - `EINVAL` if `target` is not a mount point
    /// - anything else `umount(2)` reports, e.g. `EBUSY`
    fn umount(&self, target: &Path) -> std::io::Result<()>;

    fn is_block_device(&self, path: &Path) -> bool;
    fn find_program(&self, name: &str) -> Option<PathBuf>;

    /// Bytes available to unprivileged writers in the filesystem holding `dir`.
    ///
    /// # Errors
    /// - `statvfs(2)` failed
    fn available_space(&self, dir: &Path) -> std::io::Result<u64>;

    fn is_privileged(&self) -> bool;
    fn sleep(&self, duration: Duration);

    /// Whether a termination signal arrived.
    fn interrupted(&self) -> bool {
        crate::util::signal::interrupted()
    }

    /// Like [`Host::run`], but a non-zero exit becomes [`ProvisionError::ExternalToolFailure`].
    ///
    /// # Errors
    /// - the program could not be spawned, or exited non-zero
    fn check(&self, cmd: &Cmd) -> Result<CmdOutput, ProvisionError> {
        let out = self.run(cmd)?;
        if out.success() {
            Ok(out)
        } else {
            Err(ProvisionError::ExternalToolFailure {
                command: cmd.to_string(),
                status: out.status,
                output: out.combined(),
            })
        }
    }
}

/// The real machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxHost;

impl Host for LinuxHost {
    #[tracing::instrument(skip_all, fields(program = %cmd.program))]
    fn run(&self, cmd: &Cmd) -> Result<CmdOutput, ProvisionError> {
        tracing::debug!(%cmd, "Running");
        match pipe_cmd(cmd) {
            Ok(out) => Ok(out),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ProvisionError::ExternalToolFailure {
                    command: cmd.to_string(),
                    status: 127,
                    output: format!("{}: command not found", cmd.program),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn mount(&self, source: &Path, target: &Path, fstype: &str, options: &str) -> std::io::Result<()> {
        use sys_mount::MountFlags;

        let mut flags = MountFlags::empty();
        let data = options
            .split(',')
            .filter(|o| match *o {
                "ro" => {
                    flags |= MountFlags::RDONLY;
                    false
                }
                "rw" | "defaults" | "" => false,
                _ => true,
            })
            .collect::<Vec<_>>()
            .join(",");

        tracing::info!(?source, ?target, fstype, options, "Mounting");
        sys_mount::Mount::builder()
            .fstype(fstype)
            .flags(flags)
            .data(&data)
            .mount(source, target)?;
        Ok(())
    }

    fn remount_readonly(&self, target: &Path) -> std::io::Result<()> {
        use nix::mount::MsFlags;

        tracing::info!(?target, "Remounting read-only");
        nix::mount::mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
        Ok(())
    }

    fn umount(&self, target: &Path) -> std::io::Result<()> {
        tracing::info!(?target, "Unmounting");
        nix::mount::umount(target)?;
        Ok(())
    }

    fn is_block_device(&self, path: &Path) -> bool {
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }

    fn available_space(&self, dir: &Path) -> std::io::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(dir)?;
        #[allow(clippy::useless_conversion)]
        Ok(u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size())))
    }

    fn is_privileged(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Whether an unmount error means "nothing was mounted there".
pub fn is_not_mounted(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound || e.raw_os_error() == Some(nix::libc::EINVAL)
}
