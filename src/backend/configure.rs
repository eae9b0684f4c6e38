//! System configuration written into the target tree: mount table, hostname, and an optional hook.
use std::{collections::BTreeMap, path::Path};

use filesystem_table::{DeviceSpec, FsEntry, FsTable, FsckOrder};

use crate::{
    cfg::Configure,
    disks::format::filesystem_uuid,
    error::ProvisionError,
    host::Host,
    layout::plan::MountPlan,
    util::{cmd::Cmd, fs::under},
};

/// Build the installed system's mount table from the plan.
///
/// Devices are referenced by filesystem UUID; loop device paths mean nothing on the installed machine.
///
/// # Errors
/// - a UUID could not be read
pub fn generate_fstab(host: &dyn Host, plan: &MountPlan) -> Result<FsTable, ProvisionError> {
    let mut uuids: BTreeMap<&Path, String> = BTreeMap::new();
    let mut table = FsTable::default();

    for entry in &plan.0 {
        let uuid = match uuids.get(entry.source.as_path()) {
            Some(uuid) => uuid.clone(),
            None => {
                let uuid = filesystem_uuid(host, &entry.source)?;
                uuids.insert(entry.source.as_path(), uuid.clone());
                uuid
            }
        };
        // btrfs has no use for fsck at boot
        let pass = if entry.fstype == "vfat" {
            FsckOrder::PostBoot
        } else {
            FsckOrder::NoCheck
        };
        table.push(
            FsEntry::new(
                DeviceSpec::Uuid(uuid),
                Some(entry.mountpoint.to_string_lossy().as_ref()),
                &entry.fstype,
            )
            .with_options(entry.persisted_options())
            .with_pass(pass),
        );
    }

    tracing::trace!(?table, "Generated mount table");
    Ok(table)
}

/// Write `/etc/fstab` and `/etc/hostname` under `root`, then run the configured hook.
///
/// # Errors
/// - generating or writing the files failed
/// - the hook exited non-zero
#[tracing::instrument(skip_all, fields(root = ?root))]
pub fn configure(
    host: &dyn Host,
    cfg: &Configure,
    plan: &MountPlan,
    root: &Path,
) -> Result<FsTable, ProvisionError> {
    tracing::info!("Writing /etc/fstab...");
    let table = generate_fstab(host, plan)?;
    table.write_to(&under(root, Path::new("/etc/fstab")))?;

    tracing::info!(hostname = %cfg.hostname, "Writing /etc/hostname...");
    std::fs::write(under(root, Path::new("/etc/hostname")), format!("{}\n", cfg.hostname))?;

    if let Some(hook) = &cfg.hook {
        let root = root.to_string_lossy();
        let cmd = Cmd::from_template(hook, &[("root", root.as_ref())])?;
        tracing::info!(%cmd, "Running configuration hook");
        host.check(&cmd)?;
    }
    Ok(table)
}
