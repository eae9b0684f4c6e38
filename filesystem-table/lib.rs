use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsTableError {
    #[error("Invalid fstab entry: {0}")]
    InvalidEntry(String),

    #[error("Invalid number conversion: {0}")]
    InvalidNumberConversion(String),

    #[error("Invalid fsck order: {0}")]
    InvalidFsckOrder(u8),

    #[error("Invalid device spec: {0}")]
    InvalidDeviceSpec(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, FsTableError>;

/// The order in which the filesystems should be checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum FsckOrder {
    /// Never check the filesystem automatically.
    #[default]
    NoCheck = 0,
    /// Check the filesystem while booting.
    Boot = 1,
    /// Check the filesystem after the boot process has finished.
    PostBoot = 2,
}

impl TryFrom<&u8> for FsckOrder {
    type Error = FsTableError;

    fn try_from(value: &u8) -> Result<Self> {
        match value {
            0 => Ok(Self::NoCheck),
            1 => Ok(Self::Boot),
            2 => Ok(Self::PostBoot),
            _ => Err(FsTableError::InvalidFsckOrder(*value)),
        }
    }
}

impl TryFrom<u8> for FsckOrder {
    type Error = FsTableError;

    fn try_from(value: u8) -> Result<Self> {
        Self::try_from(&value)
    }
}

impl TryFrom<&str> for FsckOrder {
    type Error = FsTableError;

    fn try_from(value: &str) -> Result<Self> {
        let n = value
            .parse::<u8>()
            .map_err(|e| FsTableError::InvalidNumberConversion(e.to_string()))?;
        Self::try_from(n)
    }
}

/// How the device of an entry is identified.
///
/// Generated tables for installed systems should prefer [`DeviceSpec::Uuid`],
/// since device paths (`/dev/loop0p2`, `/dev/sda2`, ...) are not stable across boots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// `UUID=...`, the filesystem UUID
    Uuid(String),
    /// `PARTUUID=...`, the GPT partition UUID
    PartUuid(String),
    /// `LABEL=...`
    Label(String),
    /// `PARTLABEL=...`
    PartLabel(String),
    /// A plain device node or pseudo source such as `tmpfs`
    Path(PathBuf),
}

impl DeviceSpec {
    #[must_use]
    pub const fn is_uuid(&self) -> bool {
        matches!(self, Self::Uuid(_))
    }
}

impl FromStr for DeviceSpec {
    type Err = FsTableError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((key, value)) = s.split_once('=') else {
            return Ok(Self::Path(PathBuf::from(s)));
        };
        if value.is_empty() {
            return Err(FsTableError::InvalidDeviceSpec(s.to_owned()));
        }
        match key {
            "UUID" => Ok(Self::Uuid(value.to_owned())),
            "PARTUUID" => Ok(Self::PartUuid(value.to_owned())),
            "LABEL" => Ok(Self::Label(value.to_owned())),
            "PARTLABEL" => Ok(Self::PartLabel(value.to_owned())),
            _ => Err(FsTableError::InvalidDeviceSpec(s.to_owned())),
        }
    }
}

impl std::fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uuid(u) => write!(f, "UUID={u}"),
            Self::PartUuid(u) => write!(f, "PARTUUID={u}"),
            Self::Label(l) => write!(f, "LABEL={l}"),
            Self::PartLabel(l) => write!(f, "PARTLABEL={l}"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// The device spec for mounting the filesystem.
    ///
    /// Examples:
    ///
    /// - `/dev/sda1`
    /// - `LABEL=ROOT`
    /// - `UUID=1234-5678`
    /// - `PARTUUID=1234-5678`
    pub device_spec: DeviceSpec,
    /// The mountpoint for the filesystem.
    ///
    /// A [`None`] value will serialize into `none` (swap and similar).
    pub mountpoint: Option<String>,

    /// The filesystem type, e.g. `btrfs` or `vfat`.
    pub fs_type: String,

    /// Mount options. Serialized into a comma-separated list, or `defaults` when empty.
    pub options: Vec<String>,

    /// The dump frequency for the filesystem.
    pub dump_freq: u8,

    /// The pass number for the filesystem.
    ///
    /// Determines when the filesystem health should be checked using `fsck`.
    pub pass: FsckOrder,
}

impl FsEntry {
    /// Create an entry with no options, no dump and no fsck pass.
    pub fn new(device_spec: DeviceSpec, mountpoint: Option<&str>, fs_type: &str) -> Self {
        Self {
            device_spec,
            mountpoint: mountpoint.map(ToOwned::to_owned),
            fs_type: fs_type.to_owned(),
            options: vec![],
            dump_freq: 0,
            pass: FsckOrder::NoCheck,
        }
    }

    #[must_use]
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn with_pass(mut self, pass: FsckOrder) -> Self {
        self.pass = pass;
        self
    }

    /// Parse a FsEntry from a line in the fstab file.
    ///
    /// The dump and pass fields are optional, as in `fstab(5)`.
    pub fn from_line_str(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();

        let [device_spec, mountpoint, fs_type, options, rest @ ..] = parts.as_slice() else {
            return Err(FsTableError::InvalidEntry(line.to_owned()));
        };
        if rest.len() > 2 {
            return Err(FsTableError::InvalidEntry(line.to_owned()));
        }

        let dump_freq = match rest.first() {
            Some(d) => d
                .parse::<u8>()
                .map_err(|_| FsTableError::InvalidEntry(line.to_owned()))?,
            None => 0,
        };
        let pass = match rest.get(1) {
            Some(p) => FsckOrder::try_from(*p)?,
            None => FsckOrder::NoCheck,
        };

        Ok(Self {
            device_spec: device_spec.parse()?,
            mountpoint: (*mountpoint != "none").then(|| (*mountpoint).to_owned()),
            fs_type: (*fs_type).to_owned(),
            options: options
                .split(',')
                .filter(|o| *o != "defaults")
                .map(ToOwned::to_owned)
                .collect(),
            dump_freq,
            pass,
        })
    }

    /// Serialize the FsEntry into a string that can be written to the fstab file.
    pub fn to_line_str(&self) -> String {
        let mountpoint = self.mountpoint.as_deref().unwrap_or("none");
        let options = if self.options.is_empty() {
            "defaults".to_owned()
        } else {
            self.options.join(",")
        };

        format!(
            "{device_spec}\t{mountpoint}\t{fs_type}\t{options}\t{dump_freq}\t{pass}",
            device_spec = self.device_spec,
            fs_type = self.fs_type,
            dump_freq = self.dump_freq,
            pass = self.pass as u8,
        )
    }
}

impl TryFrom<&str> for FsEntry {
    type Error = FsTableError;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_line_str(value)
    }
}

impl std::fmt::Display for FsEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_line_str())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FsTable {
    pub entries: Vec<FsEntry>,
}

impl FsTable {
    pub fn push(&mut self, entry: FsEntry) {
        self.entries.push(entry);
    }

    #[must_use]
    pub fn find_by_mountpoint(&self, mountpoint: &str) -> Option<&FsEntry> {
        self.entries
            .iter()
            .find(|e| e.mountpoint.as_deref() == Some(mountpoint))
    }

    /// Entries whose device is identified by filesystem UUID.
    pub fn uuid_entries(&self) -> impl Iterator<Item = &FsEntry> {
        self.entries.iter().filter(|e| e.device_spec.is_uuid())
    }

    /// Write the table to `path`, creating parent directories as needed.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_string())?;
        Ok(())
    }
}

impl FromStr for FsTable {
    type Err = FsTableError;

    fn from_str(table: &str) -> Result<Self> {
        let entries = table
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(FsEntry::from_line_str)
            .collect::<Result<Vec<FsEntry>>>()?;

        Ok(Self { entries })
    }
}

impl std::fmt::Display for FsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl TryFrom<&str> for FsTable {
    type Error = FsTableError;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_str(value)
    }
}

/// Read and parse a table such as `/etc/fstab` from `path`.
pub fn read_table(path: &Path) -> Result<FsTable> {
    let table = std::fs::read_to_string(path)?;
    FsTable::from_str(&table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fstab_parse() {
        let line = "/dev/sda1\t/\text4\trw,relatime\t0\t1";
        let entry = FsEntry::from_line_str(line).unwrap();

        assert_eq!(entry.device_spec, DeviceSpec::Path("/dev/sda1".into()));
        assert_eq!(entry.mountpoint, Some("/".to_owned()));
        assert_eq!(entry.fs_type, "ext4");
        assert_eq!(entry.options, vec!["rw", "relatime"]);
        assert_eq!(entry.dump_freq, 0);
        assert_eq!(entry.pass, FsckOrder::Boot);
    }

    #[test]
    fn test_fstab_parse_without_dump_and_pass() {
        let entry = FsEntry::from_line_str("UUID=abcd /home btrfs subvol=@home").unwrap();
        assert_eq!(entry.device_spec, DeviceSpec::Uuid("abcd".to_owned()));
        assert_eq!(entry.pass, FsckOrder::NoCheck);
        assert_eq!(entry.dump_freq, 0);
    }

    #[test]
    fn test_fstab_serialize() {
        let entry = FsEntry::new(DeviceSpec::Uuid("1234-ABCD".to_owned()), Some("/boot"), "vfat")
            .with_options(["umask=0077"])
            .with_pass(FsckOrder::PostBoot);

        assert_eq!(entry.to_line_str(), "UUID=1234-ABCD\t/boot\tvfat\tumask=0077\t0\t2");
    }

    #[test]
    fn test_defaults_when_no_options() {
        let entry = FsEntry::new(DeviceSpec::Label("SWAP".to_owned()), None, "swap");
        assert_eq!(entry.to_line_str(), "LABEL=SWAP\tnone\tswap\tdefaults\t0\t0");
        let back = FsEntry::from_line_str(&entry.to_line_str()).unwrap();
        assert!(back.options.is_empty());
        assert_eq!(back.mountpoint, None);
    }

    #[test]
    fn test_fsck_order() {
        assert_eq!(FsckOrder::try_from(&0u8).unwrap() as u8, 0);
        assert_eq!(FsckOrder::try_from(&1u8).unwrap() as u8, 1);
        assert_eq!(FsckOrder::try_from(&2u8).unwrap() as u8, 2);
        assert!(FsckOrder::try_from(&3u8).is_err());
    }

    #[test]
    fn test_device_spec() {
        assert_eq!(
            "PARTUUID=f00".parse::<DeviceSpec>().unwrap(),
            DeviceSpec::PartUuid("f00".to_owned())
        );
        assert!("UUID=".parse::<DeviceSpec>().is_err());
        assert!("BOGUS=1".parse::<DeviceSpec>().is_err());
        assert_eq!(DeviceSpec::Uuid("x".to_owned()).to_string(), "UUID=x");
    }

    #[test]
    fn test_fstab_table() {
        let table = "# generated\n\nUUID=aa\t/\tbtrfs\tsubvol=@,rw\t0\t0\nUUID=bb\t/boot\tvfat\tumask=0077\t0\t2\n";
        let fstab = FsTable::from_str(table).unwrap();

        assert_eq!(fstab.entries.len(), 2);
        assert_eq!(fstab.uuid_entries().count(), 2);
        assert_eq!(fstab.find_by_mountpoint("/boot").unwrap().fs_type, "vfat");

        let serialized = fstab.to_string();
        assert_eq!(
            serialized,
            "UUID=aa\t/\tbtrfs\tsubvol=@,rw\t0\t0\nUUID=bb\t/boot\tvfat\tumask=0077\t0\t2\n"
        );
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = std::env::temp_dir().join(format!("fstab-test-{}", std::process::id()));
        let path = dir.join("etc/fstab");
        let mut table = FsTable::default();
        table.push(FsEntry::new(DeviceSpec::Uuid("aa".to_owned()), Some("/"), "btrfs"));
        table.write_to(&path).unwrap();

        let read = read_table(&path).unwrap();
        assert_eq!(read, table);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
