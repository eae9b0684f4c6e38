//! Loop device attachment and partition node resolution.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use super::{BlockDevice, NamingScheme, PartitionHandle, PartitionKind};
use crate::{
    error::{ProvisionError, TeardownWarning},
    host::Host,
    util::{
        cmd::Cmd,
        fs::{partition_node, partition_number},
    },
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check that at least one loop device is free, without claiming it.
///
/// # Errors
/// - [`ProvisionError::ResourceUnavailable`] if `losetup` cannot find one
pub fn find_free(host: &dyn Host) -> Result<PathBuf, ProvisionError> {
    let out = host.run(&Cmd::new("losetup").arg("--find"))?;
    let dev = out.stdout.trim();
    if !out.success() || dev.is_empty() {
        return Err(ProvisionError::ResourceUnavailable(format!(
            "no free loop device: {}",
            out.combined()
        )));
    }
    Ok(PathBuf::from(dev))
}

/// Attach `image` to the next free loop device with partition scanning enabled.
///
/// # Errors
/// - [`ProvisionError::ResourceUnavailable`] if no loop device could be allocated
/// - the device size cannot be read
#[tracing::instrument(skip(host))]
pub fn attach(host: &dyn Host, image: &Path) -> Result<BlockDevice, ProvisionError> {
    let out = host.run(&Cmd::new("losetup").args(["--find", "--show", "--partscan"]).arg(image))?;
    let dev = out.stdout.trim();
    if !out.success() || dev.is_empty() {
        return Err(ProvisionError::ResourceUnavailable(format!(
            "cannot attach {}: {}",
            image.display(),
            out.combined()
        )));
    }
    let path = PathBuf::from(dev);
    tracing::info!(device = ?path, "Attached image");

    // From here on the allocation must be released even if we fail.
    let mut device = BlockDevice::attached(path, 0);
    match device_size(host, &device.path) {
        Ok(size) => {
            device.size_bytes = size;
            Ok(device)
        }
        Err(e) => {
            detach(host, &mut device);
            Err(e)
        }
    }
}

fn device_size(host: &dyn Host, dev: &Path) -> Result<u64, ProvisionError> {
    let out = host.check(&Cmd::new("blockdev").arg("--getsize64").arg(dev))?;
    out.stdout.trim().parse().map_err(|e| {
        ProvisionError::DeviceNotFound(format!("cannot read size of {}: {e}", dev.display()))
    })
}

/// Ask the kernel to re-read the partition table of `dev`.
///
/// Falls back from `partprobe` to `blockdev --rereadpt`. Neither succeeding is only
/// logged; node resolution decides whether it mattered.
pub fn reread(host: &dyn Host, dev: &Path) {
    let Err(e) = host.check(&Cmd::new("partprobe").arg(dev)) else {
        return;
    };
    tracing::warn!("partprobe failed, trying blockdev: {e}");
    if let Err(e) = host.check(&Cmd::new("blockdev").arg("--rereadpt").arg(dev)) {
        tracing::warn!("Cannot re-read partition table of {dev:?}: {e}");
    }
}

/// Find block nodes for the first `kinds.len()` partitions of `device`.
///
/// Waits up to `wait` for the kernel's own nodes, then falls back to mapping the
/// partitions with `kpartx`. Whichever scheme worked is stored on the device and
/// used for the rest of the build.
///
/// # Errors
/// - [`ProvisionError::DeviceNotFound`] if neither scheme yields every node
#[tracing::instrument(skip(host, device), fields(device = ?device.path))]
pub fn resolve_partitions(
    host: &dyn Host,
    device: &mut BlockDevice,
    kinds: &[PartitionKind],
    wait: Duration,
) -> Result<(), ProvisionError> {
    reread(host, &device.path);

    let natural: Vec<PathBuf> = (1..=kinds.len())
        .map(|n| partition_node(&device.path, n as u32))
        .collect();
    let attempts = (wait.as_millis() / POLL_INTERVAL.as_millis()).max(1);
    for attempt in 0..=attempts {
        if natural.iter().all(|n| host.is_block_device(n)) {
            tracing::debug!(attempt, "Partition nodes present");
            return assign(device, NamingScheme::Kernel, kinds, natural);
        }
        if attempt < attempts {
            host.sleep(POLL_INTERVAL);
        }
    }

    tracing::warn!(?natural, "Partition nodes did not appear, mapping with kpartx");
    let tried = natural.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", ");
    let dev = device.path.display().to_string();
    let not_found = |why: String| {
        ProvisionError::DeviceNotFound(format!(
            "no partition nodes for {dev} after {}ms (tried {tried} and kpartx): {why}",
            wait.as_millis(),
        ))
    };
    let out = host
        .run(&Cmd::new("kpartx").arg("-avs").arg(&device.path))
        .map_err(|e| not_found(e.to_string()))?;
    let mapped = parse_kpartx(&out.stdout);

    // a failed kpartx may still have left mappings behind; teardown must undo them
    if !mapped.is_empty() || !out.success() {
        device.naming = Some(NamingScheme::Mapper);
    }
    if !out.success() {
        return Err(not_found(format!("kpartx exited with {}: {}", out.status, out.combined())));
    }

    let nodes: Vec<PathBuf> = (1..=kinds.len() as u32)
        .filter_map(|n| mapped.iter().find(|(i, _)| *i == n).map(|(_, p)| p.clone()))
        .collect();
    if nodes.len() == kinds.len() && nodes.iter().all(|n| host.is_block_device(n)) {
        return assign(device, NamingScheme::Mapper, kinds, nodes);
    }
    Err(not_found(format!("kpartx mapped {} of {} partitions", nodes.len(), kinds.len())))
}

fn assign(
    device: &mut BlockDevice,
    scheme: NamingScheme,
    kinds: &[PartitionKind],
    nodes: Vec<PathBuf>,
) -> Result<(), ProvisionError> {
    if device.naming.is_some_and(|n| n != scheme) && !device.partitions.is_empty() {
        return Err(ProvisionError::DeviceNotFound(format!(
            "{} switched partition naming scheme mid-build",
            device.path.display()
        )));
    }
    tracing::info!(?scheme, ?nodes, "Resolved partitions");
    device.naming = Some(scheme);
    device.partitions = (kinds.iter().zip(nodes).zip(1..))
        .map(|((kind, node), index)| PartitionHandle {
            index,
            kind: *kind,
            node,
        })
        .collect();
    Ok(())
}

/// Parse `kpartx -av` output (`add map loop0p1 (253:0): 0 1048576 linear 7:0 2048`).
fn parse_kpartx(out: &str) -> Vec<(u32, PathBuf)> {
    out.lines()
        .filter_map(|line| line.strip_prefix("add map "))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|name| Some((partition_number(name)?, Path::new("/dev/mapper").join(name))))
        .collect()
}

/// Release the loop allocation.
///
/// Safe to call any number of times: only the first call does anything, later
/// calls return [`TeardownWarning::AlreadyDetached`].
pub fn detach(host: &dyn Host, device: &mut BlockDevice) -> Option<TeardownWarning> {
    if !device.attached {
        tracing::warn!(device = ?device.path, "Loop device already detached");
        return Some(TeardownWarning::AlreadyDetached(device.path.clone()));
    }
    device.attached = false;

    if device.naming == Some(NamingScheme::Mapper) {
        if let Err(e) = host.check(&Cmd::new("kpartx").arg("-d").arg(&device.path)) {
            tracing::warn!("Cannot remove partition mappings: {e}");
        }
    }

    match host.check(&Cmd::new("losetup").arg("-d").arg(&device.path)) {
        Ok(_) => {
            tracing::info!(device = ?device.path, "Detached loop device");
            None
        }
        Err(e) => {
            tracing::warn!(device = ?device.path, "Cannot detach loop device: {e}");
            Some(TeardownWarning::DetachFailed {
                device: device.path.clone(),
                reason: e.to_string(),
            })
        }
    }
}
