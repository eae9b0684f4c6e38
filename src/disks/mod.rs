//! Block devices: loop attachment, the GPT layout and filesystem creation.
pub mod format;
pub mod loopdev;
pub mod partition;

use std::path::PathBuf;

use crate::error::ProvisionError;

/// How partition nodes of a device are named for the rest of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamingScheme {
    /// `/dev/loop0p1`, created by the kernel on re-read
    Kernel,
    /// `/dev/mapper/loop0p1`, created by `kpartx`
    Mapper,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Esp,
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    /// 1-based GPT index
    pub index: u32,
    pub kind: PartitionKind,
    pub node: PathBuf,
}

/// A loop-backed disk. Owns one kernel loop allocation until detached.
#[derive(Debug)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub partitions: Vec<PartitionHandle>,
    /// Set once by partition resolution, never changed afterwards.
    pub naming: Option<NamingScheme>,
    attached: bool,
}

impl BlockDevice {
    #[must_use]
    pub const fn attached(path: PathBuf, size_bytes: u64) -> Self {
        Self {
            path,
            size_bytes,
            partitions: vec![],
            naming: None,
            attached: true,
        }
    }

    #[must_use]
    pub const fn is_attached(&self) -> bool {
        self.attached
    }

    /// # Errors
    /// - the partition has not been resolved
    pub fn partition(&self, kind: PartitionKind) -> Result<&PartitionHandle, ProvisionError> {
        self.partitions
            .iter()
            .find(|p| p.kind == kind)
            .ok_or_else(|| {
                ProvisionError::DeviceNotFound(format!(
                    "{kind:?} partition of {}",
                    self.path.display()
                ))
            })
    }
}
