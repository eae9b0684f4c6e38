//! Stages that run inside the mounted target tree.
pub mod bootloader;
pub mod configure;
pub mod iso;
pub mod packages;
