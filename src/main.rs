#![warn(rust_2018_idioms)]
mod backend;
mod build;
pub mod cfg;
mod consts;
mod context;
mod disks;
mod error;
mod host;
mod layout;
mod teardown;
mod util;

use std::path::{Path, PathBuf};

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::prelude::*;

use crate::{
    cfg::BuildConfig,
    disks::partition::gpt_script,
    host::LinuxHost,
    layout::{plan::MountPlan, LayoutKind},
    util::fs::partition_node,
};

/// Bake a bootable btrfs disk image and wrap it in an installable ISO.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Build file, overrides `PREBAKE_CONFIG`
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Disk image to create, overrides `[image] path`
    #[arg(long)]
    image: Option<PathBuf>,
    /// ISO to write, overrides `[iso] output`
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long, value_enum)]
    layout: Option<LayoutKind>,
    /// Print the resolved plan and exit without touching the host
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logs_and_install_panic_hook()?;

    let mut cfg = cfg::get_cfg(cli.config.as_deref())?;
    if let Some(image) = cli.image {
        cfg.image.path = image;
    }
    if let Some(output) = cli.output {
        cfg.iso.output = output;
    }
    if let Some(kind) = cli.layout {
        cfg.layout.kind = kind;
    }
    tracing::debug!(?cfg, "Resolved configuration");

    if cli.dry_run {
        return print_plan(&cfg);
    }

    util::signal::install()?;
    let artifact = build::build(&LinuxHost, &cfg)?;
    tracing::info!(iso = ?artifact.iso, checksum = ?artifact.checksum, "Done");
    Ok(())
}

fn print_plan(cfg: &BuildConfig) -> Result<()> {
    let layout = cfg.layout();
    let dev = Path::new("/dev/loop0");
    let plan = MountPlan::build(
        &layout,
        &partition_node(dev, 1),
        &partition_node(dev, 2),
        &cfg.target_dir(),
    );

    println!(
        "image: {} ({}, ESP {})",
        cfg.image.path.display(),
        cfg.image.size,
        cfg.image.efi_size
    );
    println!("layout: {:?}", layout.kind);
    println!("subvolumes:");
    for role in layout.roles() {
        let default = if role == layout.default_role() { " (default)" } else { "" };
        println!("  {role:<10} {}{default}", role.subvolume_name());
    }
    println!("partition table:\n{}", gpt_script(cfg.image.efi_size)?);
    println!("mount plan:\n{plan}");
    println!("iso: {}", cfg.iso.output.display());
    Ok(())
}

/// Returns a logging guard.
///
/// # Errors
/// - cannot install `color_eyre`
/// - cannot create the log tempdir
/// - a global subscriber is already set
fn setup_logs_and_install_panic_hook() -> Result<impl std::any::Any> {
    color_eyre::install()?;
    let temp_dir = tempfile::Builder::new()
        .prefix("prebake-logs")
        .tempdir()?
        .into_path();
    let file_appender = tracing_appender::rolling::never(&temp_dir, "prebake.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let directives = std::env::var(consts::LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_default();
    let sub_builder = tracing_subscriber::fmt()
        // only the last writer is used, so the file and journal go in as layers
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .pretty()
        .finish()
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .parse(directives)?,
        )
        .with(
            tracing_subscriber::fmt::Layer::new()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact(),
        )
        // not every build host runs systemd
        .with(
            tracing_journald::layer()
                .ok()
                .map(|l| l.with_syslog_identifier("prebake".to_owned())),
        );
    tracing::subscriber::set_global_default(sub_builder)?;

    tracing::info!("prebake {version}", version = env!("CARGO_PKG_VERSION"));
    tracing::info!("Logging to {tmp}/prebake.log", tmp = temp_dir.to_string_lossy());
    Ok(guard)
}
