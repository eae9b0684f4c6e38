use std::path::{Path, PathBuf};

/// Ignore errors about nonexisting files.
pub fn exist_then<T: Default>(r: std::io::Result<T>) -> std::io::Result<T> {
    match r {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        Err(_) => Ok(T::default()),
        Ok(x) => Ok(x),
    }
}

/// Kernel node name for partition `n` of `disk`.
///
/// Disks whose name ends in a digit get a `p` separator, i.e.
/// `/dev/loop0` -> `/dev/loop0p1`, `/dev/nvme0n1` -> `/dev/nvme0n1p1`, `/dev/sda` -> `/dev/sda1`.
pub fn partition_node(disk: &Path, n: u32) -> PathBuf {
    let disk = disk.to_string_lossy();
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{disk}p{n}"))
    } else {
        PathBuf::from(format!("{disk}{n}"))
    }
}

/// Partition index encoded at the end of a loop partition node or mapping name
/// (`loop0p2` -> 2, `/dev/sda3` -> 3).
pub fn partition_number(name: &str) -> Option<u32> {
    let digits = name
        .rsplit(|c: char| !c.is_ascii_digit())
        .next()
        .filter(|d| !d.is_empty())?;
    let stem = &name[..name.len() - digits.len()];
    // `loop0` is a whole disk, not partition 0
    if stem.ends_with("loop") || !stem.ends_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    digits.parse().ok()
}

/// Join an absolute in-system path (`/var/log`) onto a host directory.
pub fn under(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix("/").unwrap_or(path) {
        rel if rel.as_os_str().is_empty() => root.to_path_buf(),
        rel => root.join(rel),
    }
}
