//! The target tree: which subvolume or partition is mounted where, and in what order.
use std::path::{Component, Path, PathBuf};

use super::{Layout, Role};
use crate::{context::BuildContext, error::ProvisionError, host::Host, util::fs::under};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// `None` for the ESP
    pub role: Option<Role>,
    pub source: PathBuf,
    /// Absolute path in the installed system, e.g. `/var/log`
    pub mountpoint: PathBuf,
    /// Where it is mounted on the build host
    pub target: PathBuf,
    pub fstype: String,
    /// Options used while building, without `ro`/`rw`
    pub options: Vec<String>,
    /// Whether the installed system mounts this read-only
    pub read_only: bool,
}

impl MountEntry {
    /// Options as the installed system should see them.
    pub fn persisted_options(&self) -> Vec<String> {
        let mut opts = vec![if self.read_only { "ro" } else { "rw" }.to_owned()];
        opts.extend(self.options.iter().cloned());
        opts
    }

    fn build_options(&self) -> String {
        std::iter::once("rw")
            .chain(self.options.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan(pub Vec<MountEntry>);

impl MountPlan {
    /// Plan the tree for `layout`: the active root at `target_root`, the ESP at
    /// `/boot`, then every mounted persistent role.
    pub fn build(layout: &Layout, esp: &Path, data: &Path, target_root: &Path) -> Self {
        let mut entries: Vec<MountEntry> = (layout.roles().into_iter())
            .filter_map(|role| {
                let mountpoint = role.mount_point()?;
                let mut options = vec![format!("subvol={}", role.subvolume_name())];
                if role != Role::Swap {
                    options.extend(layout.compression.as_ref().map(|c| format!("compress={c}")));
                }
                Some(MountEntry {
                    role: Some(role),
                    source: data.to_path_buf(),
                    mountpoint: mountpoint.to_path_buf(),
                    target: under(target_root, mountpoint),
                    fstype: "btrfs".to_owned(),
                    options,
                    read_only: role == Role::ActiveOs && layout.root_read_only(),
                })
            })
            .collect();

        entries.push(MountEntry {
            role: None,
            source: esp.to_path_buf(),
            mountpoint: PathBuf::from("/boot"),
            target: under(target_root, Path::new("/boot")),
            fstype: "vfat".to_owned(),
            options: vec!["umask=0077".to_owned()],
            read_only: false,
        });

        let mut plan = Self(entries);
        plan.sort_mounts();
        plan
    }

    /// Sort mounts by mountpoint and depth.
    /// Root is first, everything else is sorted by depth, then alphabetically.
    fn sort_mounts(&mut self) {
        self.0.sort_by(|a, b| {
            match (
                a.mountpoint.components().count(),
                b.mountpoint.components().count(),
            ) {
                (1, _) if a.mountpoint.components().next() == Some(Component::RootDir) => {
                    std::cmp::Ordering::Less
                } // root dir
                (_, 1) if b.mountpoint.components().next() == Some(Component::RootDir) => {
                    std::cmp::Ordering::Greater
                } // root dir
                (x, y) if x == y => a.mountpoint.cmp(&b.mountpoint),
                (x, y) => x.cmp(&y),
            }
        });
    }

    pub fn root(&self) -> Option<&MountEntry> {
        self.0.iter().find(|e| e.role == Some(Role::ActiveOs))
    }

    pub fn esp(&self) -> Option<&MountEntry> {
        self.0.iter().find(|e| e.role.is_none())
    }

    /// Mount every entry in order, creating mount points as needed.
    ///
    /// Each entry is pushed onto `ctx.mounted` as soon as it is mounted, so on
    /// failure `ctx` holds exactly the mounted prefix.
    ///
    /// # Errors
    /// - creating a mount point or mounting failed
    pub fn execute(&self, host: &dyn Host, ctx: &mut BuildContext) -> Result<(), ProvisionError> {
        for (step, entry) in self.0.iter().enumerate() {
            std::fs::create_dir_all(&entry.target)?;
            host.mount(&entry.source, &entry.target, &entry.fstype, &entry.build_options())
                .map_err(|e| super::subvol::mount_error(e, &entry.source, &entry.target))?;
            tracing::info!(step, target = ?entry.target, "Mounted");
            ctx.mounted.push(entry.clone());
        }
        Ok(())
    }

    /// Remount the read-only entries read-only, now that the build wrote into them.
    ///
    /// # Errors
    /// - the remount failed
    pub fn seal(&self, host: &dyn Host) -> Result<(), ProvisionError> {
        for entry in self.0.iter().filter(|e| e.read_only) {
            host.remount_readonly(&entry.target)?;
            tracing::info!(target = ?entry.target, "Sealed read-only");
        }
        Ok(())
    }
}

impl std::fmt::Display for MountPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for e in &self.0 {
            writeln!(
                f,
                "{} -> {} ({}, {})",
                e.source.display(),
                e.mountpoint.display(),
                e.fstype,
                e.persisted_options().join(",")
            )?;
        }
        Ok(())
    }
}
