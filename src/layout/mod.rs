//! Subvolume roles and the two build variants.
pub mod plan;
pub mod subvol;

use std::path::Path;

use serde::Deserialize;

/// What a subvolume is for. Each role has one fixed subvolume name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    ActiveOs,
    StandbyOs,
    Home,
    Log,
    Swap,
    ContainerRoot,
}

impl Role {
    /// The reserved subvolume name. Update tooling on the produced system relies on these.
    #[must_use]
    pub const fn subvolume_name(self) -> &'static str {
        match self {
            Self::ActiveOs => "@rootfs",
            Self::StandbyOs => "@rootfs_b",
            Self::Home => "@home",
            Self::Log => "@var_log",
            Self::Swap => "@swap",
            Self::ContainerRoot => "@containers",
        }
    }

    /// Where the role is mounted in the installed system. The standby OS is never mounted.
    #[must_use]
    pub fn mount_point(self) -> Option<&'static Path> {
        let p = match self {
            Self::ActiveOs => "/",
            Self::StandbyOs => return None,
            Self::Home => "/home",
            Self::Log => "/var/log",
            Self::Swap => "/swap",
            Self::ContainerRoot => "/var/lib/containers",
        };
        Some(Path::new(p))
    }

    #[must_use]
    pub const fn is_os(self) -> bool {
        matches!(self, Self::ActiveOs | Self::StandbyOs)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            Self::ActiveOs => "active",
            Self::StandbyOs => "standby",
            Self::Home => "home",
            Self::Log => "log",
            Self::Swap => "swap",
            Self::ContainerRoot => "containers",
        })
    }
}

/// Roles that hold data surviving OS updates. These are what the config may list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistentRole {
    Home,
    Log,
    Swap,
    Containers,
}

impl From<PersistentRole> for Role {
    fn from(r: PersistentRole) -> Self {
        match r {
            PersistentRole::Home => Self::Home,
            PersistentRole::Log => Self::Log,
            PersistentRole::Swap => Self::Swap,
            PersistentRole::Containers => Self::ContainerRoot,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    /// One writable root
    #[default]
    SingleRoot,
    /// Active and standby roots; the active one is sealed read-only
    AbAtomic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub kind: LayoutKind,
    pub persistent: Vec<PersistentRole>,
    /// btrfs `compress=` value for everything but swap
    pub compression: Option<String>,
}

impl Layout {
    /// Every role the filesystem gets a subvolume for, OS roles first, without duplicates.
    #[must_use]
    pub fn roles(&self) -> Vec<Role> {
        let os: &[Role] = match self.kind {
            LayoutKind::SingleRoot => &[Role::ActiveOs],
            LayoutKind::AbAtomic => &[Role::ActiveOs, Role::StandbyOs],
        };
        let mut roles = os.to_vec();
        for r in self.persistent.iter().copied().map(Role::from) {
            if !roles.contains(&r) {
                roles.push(r);
            }
        }
        roles
    }

    pub fn os_roles(&self) -> impl Iterator<Item = Role> {
        self.roles().into_iter().filter(|r| r.is_os())
    }

    /// Exactly one subvolume is the filesystem default: the active OS.
    #[must_use]
    pub const fn default_role(&self) -> Role {
        Role::ActiveOs
    }

    /// Whether the installed root is read-only. Mutually exclusive with a writable root.
    #[must_use]
    pub const fn root_read_only(&self) -> bool {
        matches!(self.kind, LayoutKind::AbAtomic)
    }
}

/// A subvolume that exists in the data filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subvolume {
    pub name: String,
    pub role: Role,
    pub id: u64,
    pub is_default: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_root_roles() {
        let layout = Layout {
            kind: LayoutKind::SingleRoot,
            persistent: vec![PersistentRole::Home, PersistentRole::Log, PersistentRole::Swap, PersistentRole::Home],
            compression: None,
        };
        assert_eq!(layout.roles(), [Role::ActiveOs, Role::Home, Role::Log, Role::Swap]);
        assert!(!layout.root_read_only());
        assert_eq!(layout.os_roles().count(), 1);
    }

    #[test]
    fn ab_roles() {
        let layout = Layout {
            kind: LayoutKind::AbAtomic,
            persistent: vec![PersistentRole::Containers],
            compression: None,
        };
        assert_eq!(layout.roles(), [Role::ActiveOs, Role::StandbyOs, Role::ContainerRoot]);
        assert!(layout.root_read_only());
        assert_eq!(Role::StandbyOs.mount_point(), None);
        assert_eq!(Role::ContainerRoot.mount_point(), Some(Path::new("/var/lib/containers")));
    }

    #[test]
    fn role_names_pad_in_tables() {
        assert_eq!(format!("{:<10}|", Role::Home), "home      |");
        assert_eq!(format!("{:>8}", Role::ActiveOs), "  active");
    }
}
