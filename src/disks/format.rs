use crate::{
    disks::PartitionHandle,
    error::ProvisionError,
    host::Host,
    util::cmd::Cmd,
};

/// FAT volume labels are at most 11 bytes.
pub const MAX_FAT_LABEL: usize = 11;

/// # Errors
/// - the label is empty, too long or not ASCII
/// - `mkfs.fat` failed
#[tracing::instrument(skip(host))]
pub fn format_efi(host: &dyn Host, part: &PartitionHandle, label: &str) -> Result<(), ProvisionError> {
    if label.is_empty() || label.len() > MAX_FAT_LABEL || !label.is_ascii() {
        return Err(ProvisionError::Config(format!(
            "EFI label {label:?} must be 1 to {MAX_FAT_LABEL} ASCII characters"
        )));
    }
    host.check(&Cmd::new("mkfs.fat").args(["-F", "32", "-n", label]).arg(&part.node))?;
    tracing::info!(node = ?part.node, "Created FAT32 filesystem");
    Ok(())
}

/// Create a btrfs filesystem, overwriting any existing signature.
///
/// # Errors
/// - `mkfs.btrfs` failed
#[tracing::instrument(skip(host))]
pub fn format_data(host: &dyn Host, part: &PartitionHandle, label: &str) -> Result<(), ProvisionError> {
    host.check(&Cmd::new("mkfs.btrfs").args(["-f", "-L", label]).arg(&part.node))?;
    tracing::info!(node = ?part.node, "Created btrfs filesystem");
    Ok(())
}

/// Filesystem UUID of `part`, as used for `UUID=` in mount tables and `root=` on the kernel command line.
///
/// # Errors
/// - `blkid` failed or reported nothing
pub fn filesystem_uuid(host: &dyn Host, node: &std::path::Path) -> Result<String, ProvisionError> {
    let out = host.check(&Cmd::new("blkid").args(["-s", "UUID", "-o", "value"]).arg(node))?;
    let uuid = out.stdout.trim();
    if uuid.is_empty() {
        return Err(ProvisionError::DeviceNotFound(format!(
            "no filesystem UUID on {}",
            node.display()
        )));
    }
    Ok(uuid.to_owned())
}
