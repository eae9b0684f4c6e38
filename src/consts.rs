/// Host programs every build needs. The configured package, bootloader and ISO
/// commands are checked on top of these.
pub const REQUIRED_TOOLS: &[&str] = &[
    "losetup",
    "blockdev",
    "sfdisk",
    "mkfs.fat",
    "mkfs.btrfs",
    "blkid",
    "btrfs",
    "chattr",
    "sync",
];

/// Used only when partition nodes do not appear on their own
pub const OPTIONAL_TOOLS: &[&str] = &["partprobe", "kpartx"];

pub const LOG_ENV: &str = "PREBAKE_LOG";
