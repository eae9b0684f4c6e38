#![allow(clippy::str_to_string)]
use std::path::{Path, PathBuf};

use bytesize::ByteSize;
use color_eyre::eyre::eyre;
use color_eyre::Result;
use serde::Deserialize;
use serde_valid::toml::FromTomlStr;
use serde_valid::Validate;

use crate::error::ProvisionError;
use crate::layout::{Layout, LayoutKind, PersistentRole};

const DEFAULT_CFG_PATH: &str = "/etc/prebake.toml";

fn strings(s: &[&str]) -> Vec<String> {
    s.iter().map(|s| (*s).to_owned()).collect()
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub path: PathBuf,
    #[serde(default = "_default_image_size")]
    pub size: ByteSize,
    #[serde(default = "_default_efi_size")]
    pub efi_size: ByteSize,
    #[serde(default = "_default_efi_label")]
    #[validate(min_length = 1)]
    #[validate(max_length = 11)]
    pub efi_label: String,
    #[serde(default = "_default_data_label")]
    #[validate(min_length = 1)]
    #[validate(max_length = 255)]
    pub data_label: String,
}

fn _default_image_size() -> ByteSize {
    ByteSize::gib(4)
}
fn _default_efi_size() -> ByteSize {
    ByteSize::mib(512)
}
fn _default_efi_label() -> String {
    "EFI".into()
}
fn _default_data_label() -> String {
    "prebake".into()
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct LayoutCfg {
    #[serde(default)]
    pub kind: LayoutKind,
    #[serde(default = "_default_roles")]
    pub roles: Vec<PersistentRole>,
    pub compression: Option<String>,
}

impl Default for LayoutCfg {
    fn default() -> Self {
        Self {
            kind: LayoutKind::default(),
            roles: _default_roles(),
            compression: None,
        }
    }
}

fn _default_roles() -> Vec<PersistentRole> {
    vec![PersistentRole::Home, PersistentRole::Log, PersistentRole::Swap]
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Work {
    #[serde(default = "_default_work_dir")]
    pub dir: PathBuf,
    /// How long to wait for partition nodes to appear
    #[serde(default = "_default_partition_wait_ms")]
    #[validate(maximum = 600_000)]
    pub partition_wait_ms: u64,
}

impl Default for Work {
    fn default() -> Self {
        Self {
            dir: _default_work_dir(),
            partition_wait_ms: _default_partition_wait_ms(),
        }
    }
}

fn _default_work_dir() -> PathBuf {
    "/var/tmp/prebake".into()
}
const fn _default_partition_wait_ms() -> u64 {
    5000
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Packages {
    /// argv template, `{root}` is the mounted target tree. The list is appended.
    #[serde(default = "_default_packages_command")]
    #[validate(min_items = 1)]
    pub command: Vec<String>,
    #[serde(default)]
    pub list: Vec<String>,
}

impl Default for Packages {
    fn default() -> Self {
        Self {
            command: _default_packages_command(),
            list: vec![],
        }
    }
}

fn _default_packages_command() -> Vec<String> {
    strings(&["dnf", "--installroot={root}", "--use-host-config", "--assumeyes", "install"])
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Configure {
    #[serde(default = "_default_hostname")]
    #[validate(min_length = 1)]
    #[validate(max_length = 64)]
    pub hostname: String,
    /// Extra argv run after the mount table is written, `{root}` is the target tree
    pub hook: Option<Vec<String>>,
}

impl Default for Configure {
    fn default() -> Self {
        Self {
            hostname: _default_hostname(),
            hook: None,
        }
    }
}

fn _default_hostname() -> String {
    "prebake".into()
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Bootloader {
    #[serde(default = "_default_title")]
    pub title: String,
    #[serde(default = "_default_cmdline")]
    pub cmdline: String,
    #[serde(default = "_default_timeout")]
    #[validate(maximum = 600)]
    pub timeout: u32,
    /// Use this kernel instead of the newest one found in the ESP
    pub kernel_version: Option<String>,
    /// argv template, `{root}` is the target tree and `{esp}` the mounted ESP
    #[serde(default = "_default_bootloader_install")]
    #[validate(min_items = 1)]
    pub install: Vec<String>,
}

impl Default for Bootloader {
    fn default() -> Self {
        Self {
            title: _default_title(),
            cmdline: _default_cmdline(),
            timeout: _default_timeout(),
            kernel_version: None,
            install: _default_bootloader_install(),
        }
    }
}

fn _default_title() -> String {
    "Linux".into()
}
fn _default_cmdline() -> String {
    "quiet".into()
}
const fn _default_timeout() -> u32 {
    3
}
fn _default_bootloader_install() -> Vec<String> {
    strings(&["bootctl", "--root={root}", "--esp-path={esp}", "--no-variables", "install"])
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct Iso {
    #[serde(default = "_default_iso_output")]
    pub output: PathBuf,
    #[serde(default = "_default_volume_id")]
    #[validate(min_length = 1)]
    #[validate(max_length = 32)]
    pub volume_id: String,
    /// argv template with `{staging}`, `{output}` and `{volid}`
    #[serde(default = "_default_iso_command")]
    #[validate(min_items = 1)]
    pub command: Vec<String>,
}

impl Default for Iso {
    fn default() -> Self {
        Self {
            output: _default_iso_output(),
            volume_id: _default_volume_id(),
            command: _default_iso_command(),
        }
    }
}

fn _default_iso_output() -> PathBuf {
    "prebake.iso".into()
}
fn _default_volume_id() -> String {
    "PREBAKE".into()
}
fn _default_iso_command() -> Vec<String> {
    strings(&[
        "xorriso", "-as", "mkisofs", "-o", "{output}", "-V", "{volid}", "-J", "-R", "{staging}",
    ])
}

#[derive(Deserialize, Validate, Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    #[validate]
    pub image: Image,
    #[serde(default)]
    #[validate]
    pub layout: LayoutCfg,
    #[serde(default)]
    #[validate]
    pub work: Work,
    #[serde(default)]
    #[validate]
    pub packages: Packages,
    #[serde(default)]
    #[validate]
    pub configure: Configure,
    #[serde(default)]
    #[validate]
    pub bootloader: Bootloader,
    #[serde(default)]
    #[validate]
    pub iso: Iso,
}

impl BuildConfig {
    /// Checks spanning several fields.
    ///
    /// # Errors
    /// - the ESP does not fit in the image with room to spare
    pub fn check(&self) -> Result<(), ProvisionError> {
        let min_data = ByteSize::mib(256);
        if self.image.efi_size.as_u64() + min_data.as_u64() + ByteSize::mib(2).as_u64()
            > self.image.size.as_u64()
        {
            return Err(ProvisionError::Config(format!(
                "image of {} cannot hold a {} ESP and a data partition of at least {min_data}",
                self.image.size, self.image.efi_size
            )));
        }
        if self.image.efi_size < ByteSize::mib(32) {
            return Err(ProvisionError::Config(format!(
                "ESP of {} is below the FAT32 minimum of 32 MiB",
                self.image.efi_size
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        Layout {
            kind: self.layout.kind,
            persistent: self.layout.roles.clone(),
            compression: self.layout.compression.clone(),
        }
    }

    pub fn partition_wait(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.work.partition_wait_ms)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.work.dir.join("scratch")
    }

    pub fn target_dir(&self) -> PathBuf {
        self.work.dir.join("target")
    }
}

/// # Errors
/// - cannot read config file
/// - the config is invalid
#[allow(clippy::module_name_repetitions)]
#[tracing::instrument]
pub fn get_cfg(cli_path: Option<&Path>) -> Result<BuildConfig> {
    let path = std::env::var("PREBAKE_CONFIG");
    match (&path, cli_path) {
        (_, Some(p)) => tracing::debug!(?p, "Using --config"),
        (Err(std::env::VarError::NotUnicode(s)), None) => {
            tracing::error!(?s, "Cannot parse PREBAKE_CONFIG due to invalid unicode");
            tracing::debug!("Falling back to {DEFAULT_CFG_PATH}");
        }
        (Ok(p), None) => tracing::debug!("Using PREBAKE_CONFIG={p}"),
        (Err(std::env::VarError::NotPresent), None) => tracing::trace!("Using {DEFAULT_CFG_PATH}"),
    }
    let path = cli_path.unwrap_or_else(|| Path::new(path.as_deref().unwrap_or(DEFAULT_CFG_PATH)));
    let toml = std::fs::read_to_string(path)
        .map_err(|e| eyre!("Cannot read config file at {path:?}").wrap_err(e))?;
    let cfg = BuildConfig::from_toml_str(&toml)?;
    cfg.check()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfg_defaults() {
        let cfg = BuildConfig::from_toml_str(
            r#"
            [image]
            path = "/var/tmp/disk.img"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.image.size, ByteSize::gib(4));
        assert_eq!(cfg.image.efi_size, ByteSize::mib(512));
        assert_eq!(cfg.layout, LayoutCfg::default());
        assert_eq!(cfg.bootloader.install[0], "bootctl");
        assert_eq!(cfg.work.partition_wait_ms, 5000);
        cfg.check().unwrap();
    }

    #[test]
    fn test_cfg_full() {
        let cfg = BuildConfig::from_toml_str(
            r#"
            [image]
            path = "out/disk.img"
            size = "8 GiB"
            efi_size = "1 GiB"
            efi_label = "ESP"

            [layout]
            kind = "ab-atomic"
            roles = ["home", "log", "containers"]
            compression = "zstd:1"

            [packages]
            list = ["kernel", "systemd"]

            [configure]
            hostname = "kiosk"
            hook = ["sh", "-c", "echo hi > {root}/etc/motd"]

            [iso]
            output = "out/kiosk.iso"
            volume_id = "KIOSK"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.layout.kind, LayoutKind::AbAtomic);
        assert_eq!(
            cfg.layout().roles(),
            [
                crate::layout::Role::ActiveOs,
                crate::layout::Role::StandbyOs,
                crate::layout::Role::Home,
                crate::layout::Role::Log,
                crate::layout::Role::ContainerRoot,
            ]
        );
        assert_eq!(cfg.image.size, ByteSize::gib(8));
        assert_eq!(cfg.configure.hook.as_ref().map(Vec::len), Some(3));
        assert_eq!(cfg.target_dir(), PathBuf::from("/var/tmp/prebake/target"));
    }

    #[test]
    fn test_cfg_rejects_bad_values() {
        // FAT label too long
        assert!(BuildConfig::from_toml_str("[image]\npath = \"d.img\"\nefi_label = \"TWELVE-CHARS\"\n").is_err());
        // unknown role
        assert!(BuildConfig::from_toml_str("[image]\npath = \"d.img\"\n[layout]\nroles = [\"srv\"]\n").is_err());
        // ESP does not fit
        let cfg = BuildConfig::from_toml_str("[image]\npath = \"d.img\"\nsize = \"512 MiB\"\n").unwrap();
        assert!(matches!(cfg.check(), Err(ProvisionError::Config(_))));
    }
}
