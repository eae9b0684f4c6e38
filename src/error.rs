use std::path::PathBuf;

use thiserror::Error;

use crate::build::Stage;

/// Fatal provisioning failures. Every one of these aborts the build.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),

    #[error("device node not found: {0}")]
    DeviceNotFound(String),

    #[error("subvolume layout incomplete, missing: {}", .missing.join(", "))]
    LayoutIncomplete { missing: Vec<String> },

    #[error("`{command}` exited with {status}\n{output}")]
    ExternalToolFailure {
        command: String,
        /// Exit code, or `-1` if the process was killed by a signal
        status: i32,
        output: String,
    },

    #[error("partition table does not match the expected layout: {0}")]
    InvalidLayout(String),

    #[error("no kernel found in {}", .0.display())]
    KernelNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("interrupted by signal")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<filesystem_table::FsTableError> for ProvisionError {
    fn from(e: filesystem_table::FsTableError) -> Self {
        match e {
            filesystem_table::FsTableError::IoError(e) => Self::Io(e),
            e => Self::Config(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProvisionError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidLayout(format!("cannot parse partition table dump: {e}"))
    }
}

/// A provisioning failure tagged with the stage that produced it.
#[derive(Error, Debug)]
#[error("stage '{stage}' failed: {source}")]
pub struct BuildError {
    pub stage: Stage,
    #[source]
    pub source: ProvisionError,
}

/// Something that went wrong while unwinding. Logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownWarning {
    UnmountFailed { target: PathBuf, reason: String },
    AlreadyUnmounted(PathBuf),
    DetachFailed { device: PathBuf, reason: String },
    AlreadyDetached(PathBuf),
    RemoveDirFailed { path: PathBuf, reason: String },
}

impl std::fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnmountFailed { target, reason } => {
                write!(f, "cannot unmount {}: {reason}", target.display())
            }
            Self::AlreadyUnmounted(target) => write!(f, "{} was already unmounted", target.display()),
            Self::DetachFailed { device, reason } => {
                write!(f, "cannot detach {}: {reason}", device.display())
            }
            Self::AlreadyDetached(device) => write!(f, "{} was already detached", device.display()),
            Self::RemoveDirFailed { path, reason } => {
                write!(f, "cannot remove {}: {reason}", path.display())
            }
        }
    }
}

impl TeardownWarning {
    /// Whether this warning means kernel state may have leaked.
    #[must_use]
    pub const fn is_leak(&self) -> bool {
        matches!(self, Self::UnmountFailed { .. } | Self::DetachFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_names_stage() {
        let err = BuildError {
            stage: Stage::Bootloader,
            source: ProvisionError::ExternalToolFailure {
                command: "bootctl install".to_owned(),
                status: 1,
                output: "no ESP".to_owned(),
            },
        };
        assert!(err.to_string().starts_with("stage 'bootloader' failed: `bootctl install` exited with 1"));
    }

    #[test]
    fn layout_incomplete_lists_names() {
        let err = ProvisionError::LayoutIncomplete {
            missing: vec!["@home".to_owned(), "@swap".to_owned()],
        };
        assert_eq!(err.to_string(), "subvolume layout incomplete, missing: @home, @swap");
    }
}
