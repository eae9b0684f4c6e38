//! GPT layout: an EFI System Partition followed by one data partition filling the disk.
use std::time::Duration;

use bytesize::ByteSize;
use serde::Deserialize;
use uuid::{uuid, Uuid};

use super::{loopdev, BlockDevice, PartitionHandle, PartitionKind};
use crate::{error::ProvisionError, host::Host, util::cmd::Cmd};

pub const SECTOR_SIZE: u64 = 512;
/// 1 MiB in sectors. Partition 1 starts here.
pub const ALIGN_SECTORS: u64 = 2048;
pub const ESP_TYPE: Uuid = uuid!("C12A7328-F81F-11D2-BA4B-00A0C93EC93B");
pub const LINUX_FS_TYPE: Uuid = uuid!("0FC63DAF-8483-4772-8E79-3D69D8477DE4");

pub const LAYOUT: [PartitionKind; 2] = [PartitionKind::Esp, PartitionKind::Data];

/// ESP size in sectors, rounded up to whole MiB so the data partition stays aligned too.
///
/// # Errors
/// - the size is zero
pub fn esp_sectors(efi_size: ByteSize) -> Result<u64, ProvisionError> {
    let mib = efi_size.as_u64().div_ceil(ALIGN_SECTORS * SECTOR_SIZE);
    if mib == 0 {
        return Err(ProvisionError::Config("EFI partition size must not be zero".to_owned()));
    }
    Ok(mib * ALIGN_SECTORS)
}

/// The `sfdisk` script for the layout. The data partition has no size, so it runs to the end.
///
/// # Errors
/// - see [`esp_sectors`]
pub fn gpt_script(efi_size: ByteSize) -> Result<String, ProvisionError> {
    let esp = esp_sectors(efi_size)?;
    Ok(format!(
        "label: gpt\n\
         start={ALIGN_SECTORS}, size={esp}, type=U, bootable, name=\"esp\"\n\
         start={data}, type=L, name=\"root\"\n",
        data = ALIGN_SECTORS + esp,
    ))
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
struct PartitionTable {
    label: String,
    lastlba: Option<u64>,
    #[serde(default)]
    partitions: Vec<Partition>,
}

#[derive(Debug, Deserialize)]
struct Partition {
    start: u64,
    size: u64,
    /// sfdisk prints GPT type GUIDs upper case
    #[serde(rename = "type")]
    parttype: Uuid,
}

/// Check a `sfdisk -J` dump against the ESP + data layout.
///
/// # Errors
/// - [`ProvisionError::InvalidLayout`] describing the first mismatch
pub fn verify_table(json: &str) -> Result<(), ProvisionError> {
    let table = serde_json::from_str::<SfDiskOutput>(json)?.partitiontable;
    let bad = |m: String| Err(ProvisionError::InvalidLayout(m));

    if table.label != "gpt" {
        return bad(format!("label is {}, not gpt", table.label));
    }
    let [esp, data] = table.partitions.as_slice() else {
        return bad(format!("expected 2 partitions, found {}", table.partitions.len()));
    };
    if esp.start % ALIGN_SECTORS != 0 {
        return bad(format!("partition 1 starts at sector {}, not 1 MiB aligned", esp.start));
    }
    if esp.parttype != ESP_TYPE {
        return bad(format!("partition 1 has type {}, not ESP", esp.parttype));
    }
    if data.start != esp.start + esp.size {
        return bad(format!(
            "partition 2 starts at {} but partition 1 ends at {}",
            data.start,
            esp.start + esp.size
        ));
    }
    let Some(lastlba) = table.lastlba else {
        return bad("no last usable LBA reported".to_owned());
    };
    // sfdisk may round the last partition's end down to the alignment grain
    let end = data.start + data.size - 1;
    if end > lastlba || lastlba - end >= ALIGN_SECTORS {
        return bad(format!("partition 2 ends at {end}, disk ends at {lastlba}"));
    }
    Ok(())
}

/// Write a fresh GPT to `device`, verify it, and resolve both partition nodes.
///
/// Destroys whatever was on the device.
///
/// # Errors
/// - `sfdisk` failed
/// - [`ProvisionError::InvalidLayout`] if the written table is not what was asked for
/// - [`ProvisionError::DeviceNotFound`] if the partition nodes never appear
#[tracing::instrument(skip(host, device), fields(device = ?device.path))]
pub fn create_layout(
    host: &dyn Host,
    device: &mut BlockDevice,
    efi_size: ByteSize,
    wait: Duration,
) -> Result<(PartitionHandle, PartitionHandle), ProvisionError> {
    let script = gpt_script(efi_size)?;
    tracing::debug!(%script, "Writing partition table");
    host.check(
        &Cmd::new("sfdisk")
            .args(["--wipe", "always", "--wipe-partitions", "always", "--no-reread"])
            .arg(&device.path)
            .stdin(script),
    )?;

    let dump = host.check(&Cmd::new("sfdisk").arg("-J").arg(&device.path))?;
    verify_table(&dump.stdout)?;

    loopdev::resolve_partitions(host, device, &LAYOUT, wait)?;
    Ok((
        device.partition(PartitionKind::Esp)?.clone(),
        device.partition(PartitionKind::Data)?.clone(),
    ))
}
