use std::{collections::BTreeMap, path::PathBuf};

use crate::{
    disks::BlockDevice,
    error::ProvisionError,
    layout::{plan::MountEntry, Role, Subvolume},
};

/// Kernel-visible state acquired so far by one build.
///
/// Each stage records what it acquired the moment it succeeds, so teardown
/// unwinds exactly what exists and nothing more.
#[derive(Debug, Default)]
pub struct BuildContext {
    /// The attached loop device and its resolved partitions
    pub device: Option<BlockDevice>,
    /// The raw data filesystem, mounted while subvolumes are created
    pub scratch_mount: Option<PathBuf>,
    /// The mounted prefix of the mount plan, in mount order
    pub mounted: Vec<MountEntry>,
    /// Directories created for the build, removed after everything is unmounted
    pub work_dirs: Vec<PathBuf>,
    pub subvolumes: BTreeMap<Role, Subvolume>,
}

impl BuildContext {
    /// # Errors
    /// - nothing is attached yet
    pub fn device_mut(&mut self) -> Result<&mut BlockDevice, ProvisionError> {
        self.device
            .as_mut()
            .ok_or_else(|| ProvisionError::DeviceNotFound("no loop device attached".to_owned()))
    }

    /// Remember a directory we created, once.
    pub fn track_dir(&mut self, dir: PathBuf) {
        if !self.work_dirs.contains(&dir) {
            self.work_dirs.push(dir);
        }
    }

    /// Whether teardown has anything left to do.
    #[must_use]
    pub fn holds_resources(&self) -> bool {
        self.scratch_mount.is_some()
            || !self.mounted.is_empty()
            || self.device.as_ref().is_some_and(BlockDevice::is_attached)
    }
}
