//! Shared helpers for the provisioning stages

pub mod cmd;
pub mod fs;
pub mod macros;
pub mod signal;

// The loop, partition and mount plumbing below only makes sense on Linux
#[cfg(not(target_os = "linux"))]
compile_error!("prebake only supports Linux hosts, loop devices and btrfs are Linux-specific.");
