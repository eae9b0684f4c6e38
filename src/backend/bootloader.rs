//! Boot Loader Specification entries in the ESP, and the bootloader binary itself.
//!
//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use itertools::Itertools;

use crate::{
    cfg::Bootloader,
    error::ProvisionError,
    host::Host,
    layout::{Layout, Role, Subvolume},
    util::cmd::Cmd,
};

const ENTRY_PREFIX: &str = "prebake";

/// One `loader/entries/*.conf` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub id: String,
    pub title: String,
    pub version: String,
    pub linux: String,
    pub initrd: String,
    pub options: String,
}

impl BootEntry {
    pub fn file_name(&self) -> String {
        format!("{}.conf", self.id)
    }
}

impl std::fmt::Display for BootEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "title {}", self.title)?;
        writeln!(f, "version {}", self.version)?;
        writeln!(f, "linux {}", self.linux)?;
        writeln!(f, "initrd {}", self.initrd)?;
        writeln!(f, "options {}", self.options)
    }
}

fn version_key(v: &str) -> Vec<u64> {
    v.split(|c: char| !c.is_ascii_digit())
        .filter_map(|n| n.parse().ok())
        .collect()
}

/// The kernel version to boot: `pinned` if given, else the newest `vmlinuz-<ver>`
/// in `esp` that has a matching `initramfs-<ver>.img`.
///
/// # Errors
/// - [`ProvisionError::KernelNotFound`] if there is no such pair
pub fn find_kernel(esp: &Path, pinned: Option<&str>) -> Result<String, ProvisionError> {
    let has_pair = |v: &str| {
        esp.join(format!("vmlinuz-{v}")).is_file() && esp.join(format!("initramfs-{v}.img")).is_file()
    };
    if let Some(v) = pinned {
        return if has_pair(v) {
            Ok(v.to_owned())
        } else {
            Err(ProvisionError::KernelNotFound(esp.join(format!("vmlinuz-{v}"))))
        };
    }

    let found = std::fs::read_dir(esp)?
        .flatten()
        .filter_map(|e| {
            e.file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("vmlinuz-"))
                .map(ToOwned::to_owned)
        })
        .filter(|v| has_pair(v))
        .sorted_by(|a, b| version_key(a).cmp(&version_key(b)).then_with(|| a.cmp(b)))
        .next_back();
    found.ok_or_else(|| ProvisionError::KernelNotFound(esp.to_path_buf()))
}

/// Entries for every OS subvolume that was created, pinned to it by name, plus a
/// fallback that boots whatever the filesystem default subvolume is.
pub fn entries(
    cfg: &Bootloader,
    layout: &Layout,
    subvolumes: &BTreeMap<Role, Subvolume>,
    root_uuid: &str,
    version: &str,
) -> Vec<BootEntry> {
    let mode = if layout.root_read_only() { "ro" } else { "rw" };
    let entry = |id: String, title: String, subvol: Option<&str>| BootEntry {
        id,
        title,
        version: version.to_owned(),
        linux: format!("/vmlinuz-{version}"),
        initrd: format!("/initramfs-{version}.img"),
        options: [
            Some(format!("root=UUID={root_uuid}")),
            subvol.map(|s| format!("rootflags=subvol={s}")),
            Some(mode.to_owned()),
            (!cfg.cmdline.is_empty()).then(|| cfg.cmdline.clone()),
        ]
        .into_iter()
        .flatten()
        .join(" "),
    };

    layout
        .os_roles()
        .filter_map(|role| subvolumes.get(&role))
        .map(|sub| {
            let title = match sub.role {
                Role::ActiveOs => cfg.title.clone(),
                role => format!("{} ({role})", cfg.title),
            };
            tracing::debug!(subvolume = %sub.name, id = sub.id, "Boot entry");
            entry(format!("{ENTRY_PREFIX}-{}", sub.role), title, Some(sub.name.as_str()))
        })
        .chain(std::iter::once(entry(
            format!("{ENTRY_PREFIX}-fallback"),
            format!("{} (fallback)", cfg.title),
            None,
        )))
        .collect()
}

/// Write the entries and `loader.conf` into `esp`, then run the configured installer.
///
/// # Errors
/// - no kernel was found
/// - writing into the ESP failed
/// - the installer exited non-zero
#[tracing::instrument(skip_all, fields(esp = ?esp))]
pub fn install(
    host: &dyn Host,
    cfg: &Bootloader,
    layout: &Layout,
    subvolumes: &BTreeMap<Role, Subvolume>,
    root_uuid: &str,
    root: &Path,
    esp: &Path,
) -> Result<Vec<PathBuf>, ProvisionError> {
    let version = find_kernel(esp, cfg.kernel_version.as_deref())?;
    tracing::info!(%version, "Using kernel");

    let dir = esp.join("loader/entries");
    std::fs::create_dir_all(&dir)?;
    let entries = entries(cfg, layout, subvolumes, root_uuid, &version);
    let mut written = vec![];
    for entry in &entries {
        let path = dir.join(entry.file_name());
        std::fs::write(&path, entry.to_string())?;
        tracing::debug!(?path, "Wrote boot entry");
        written.push(path);
    }
    std::fs::write(
        esp.join("loader/loader.conf"),
        format!("default {ENTRY_PREFIX}-{}.conf\ntimeout {}\n", Role::ActiveOs, cfg.timeout),
    )?;

    let root = root.to_string_lossy();
    let esp = esp.to_string_lossy();
    let cmd = Cmd::from_template(&cfg.install, &[("root", root.as_ref()), ("esp", esp.as_ref())])?;
    tracing::info!(%cmd, "Installing bootloader");
    host.check(&cmd)?;
    Ok(written)
}
