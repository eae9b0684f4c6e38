//! The provisioning pipeline, from an empty image file to a packaged ISO.
use std::path::{Path, PathBuf};

use filesystem_table::FsTable;
use itertools::Itertools;

use crate::{
    backend::{bootloader, configure, iso, packages},
    cfg::BuildConfig,
    consts::{OPTIONAL_TOOLS, REQUIRED_TOOLS},
    context::BuildContext,
    disks::{format, loopdev, partition},
    error::{BuildError, ProvisionError},
    host::Host,
    layout::{plan::MountPlan, subvol},
    stage,
    teardown::unwind,
    util::cmd::Cmd,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Preflight,
    CreateImage,
    Attach,
    Partition,
    Format,
    Subvolumes,
    Mount,
    Packages,
    Configure,
    Bootloader,
    Seal,
    Release,
    PackageIso,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Preflight => "preflight",
            Self::CreateImage => "create-image",
            Self::Attach => "attach",
            Self::Partition => "partition",
            Self::Format => "format",
            Self::Subvolumes => "subvolumes",
            Self::Mount => "mount",
            Self::Packages => "packages",
            Self::Configure => "configure",
            Self::Bootloader => "bootloader",
            Self::Seal => "seal",
            Self::Release => "release",
            Self::PackageIso => "package-iso",
        })
    }
}

/// What a successful build leaves behind.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub image: PathBuf,
    pub iso: PathBuf,
    pub checksum: PathBuf,
    /// The mount table written into the image
    pub mount_table: FsTable,
}

/// Refuse to start when something destructive would fail halfway.
fn preflight(host: &dyn Host, cfg: &BuildConfig) -> Result<(), ProvisionError> {
    if !host.is_privileged() {
        return Err(ProvisionError::ResourceUnavailable(
            "root privileges are required to attach loop devices and mount".to_owned(),
        ));
    }

    let configured = [
        cfg.packages.command.first(),
        cfg.bootloader.install.first(),
        cfg.iso.command.first(),
        cfg.configure.hook.as_ref().and_then(|h| h.first()),
    ];
    let missing = (REQUIRED_TOOLS.iter().copied())
        .chain(configured.into_iter().flatten().map(String::as_str))
        .unique()
        .filter(|tool| host.find_program(tool).is_none())
        .collect_vec();
    if !missing.is_empty() {
        return Err(ProvisionError::ResourceUnavailable(format!(
            "missing host tools: {}",
            missing.join(", ")
        )));
    }
    for tool in OPTIONAL_TOOLS.iter().filter(|t| host.find_program(t).is_none()) {
        tracing::warn!(tool, "Optional tool not found, its fallback is unavailable");
    }

    let free = loopdev::find_free(host)?;
    tracing::debug!(?free, "A loop device is available");

    let dir = image_dir(&cfg.image.path);
    std::fs::create_dir_all(dir)?;
    let available = host.available_space(dir)?;
    if available < cfg.image.size.as_u64() {
        return Err(ProvisionError::ResourceUnavailable(format!(
            "{} needs {} but only {} is free",
            dir.display(),
            cfg.image.size,
            bytesize::ByteSize::b(available)
        )));
    }
    Ok(())
}

fn image_dir(image: &Path) -> &Path {
    image.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."))
}

fn create_image(cfg: &crate::cfg::Image) -> Result<(), ProvisionError> {
    tracing::info!(path = ?cfg.path, size = %cfg.size, "Creating sparse image");
    let f = std::fs::File::create(&cfg.path)?;
    f.set_len(cfg.size.as_u64())?;
    Ok(())
}

/// Build the image described by `cfg` and package it.
///
/// Everything acquired along the way is recorded in a [`BuildContext`] held by a
/// guard, so whether this returns, fails at some stage, or unwinds from a panic,
/// the mounts and the loop device are released in reverse order.
///
/// # Errors
/// - the first failing stage, tagged with its name
#[tracing::instrument(skip_all, fields(image = ?cfg.image.path))]
pub fn build(host: &dyn Host, cfg: &BuildConfig) -> Result<Artifact, BuildError> {
    let layout = cfg.layout();
    let target = cfg.target_dir();

    let mut ctx = scopeguard::guard(BuildContext::default(), |mut ctx| {
        let report = unwind(host, &mut ctx);
        if !report.is_clean() {
            tracing::warn!(warnings = report.warnings.len(), "Teardown finished with warnings");
        }
    });

    stage!(host, Stage::Preflight => { preflight(host, cfg) })?;
    stage!(host, Stage::CreateImage => { create_image(&cfg.image) })?;
    stage!(host, Stage::Attach => {
        ctx.device = Some(loopdev::attach(host, &cfg.image.path)?);
        Ok(())
    })?;

    let (esp, data) = stage!(host, Stage::Partition => {
        partition::create_layout(host, ctx.device_mut()?, cfg.image.efi_size, cfg.partition_wait())
    })?;

    stage!(host, Stage::Format => {
        format::format_efi(host, &esp, &cfg.image.efi_label)?;
        format::format_data(host, &data, &cfg.image.data_label)
    })?;

    stage!(host, Stage::Subvolumes => {
        let created = subvol::create_subvolumes(
            host,
            &mut ctx,
            &data,
            &layout.roles(),
            layout.default_role(),
            &cfg.scratch_dir(),
        )?;
        ctx.subvolumes = created;
        Ok(())
    })?;

    let plan = MountPlan::build(&layout, &esp.node, &data.node, &target);
    tracing::debug!("Mount plan:\n{plan}");
    stage!(host, Stage::Mount => {
        std::fs::create_dir_all(&target)?;
        ctx.track_dir(target.clone());
        plan.execute(host, &mut ctx)
    })?;

    stage!(host, Stage::Packages => { packages::install(host, &cfg.packages, &target) })?;

    let mount_table = stage!(host, Stage::Configure => {
        configure::configure(host, &cfg.configure, &plan, &target)
    })?;

    stage!(host, Stage::Bootloader => {
        let (Some(root), Some(esp_entry)) = (plan.root(), plan.esp()) else {
            return Err(ProvisionError::InvalidLayout("mount plan needs a root and an ESP".to_owned()));
        };
        // the fallback entry boots the default subvolume, so it has to be the active OS
        match ctx.subvolumes.values().find(|s| s.is_default) {
            Some(s) if s.role == layout.default_role() => {
                tracing::debug!(subvolume = %s.name, id = s.id, "Fallback boots the default subvolume");
            }
            other => {
                return Err(ProvisionError::LayoutIncomplete {
                    missing: vec![format!(
                        "{} (as default, found {:?})",
                        layout.default_role().subvolume_name(),
                        other.map(|s| &s.name)
                    )],
                });
            }
        }
        let root_uuid = format::filesystem_uuid(host, &data.node)?;
        bootloader::install(
            host,
            &cfg.bootloader,
            &layout,
            &ctx.subvolumes,
            &root_uuid,
            &root.target,
            &esp_entry.target,
        )?;
        Ok(())
    })?;

    stage!(host, Stage::Seal => { plan.seal(host) })?;

    stage!(host, Stage::Release => {
        host.check(&Cmd::new("sync"))?;
        let report = unwind(host, &mut ctx);
        if report.leaked() {
            return Err(ProvisionError::ResourceUnavailable(format!(
                "image still in use after release: {}",
                report.warnings.iter().join("; ")
            )));
        }
        Ok(())
    })?;

    let (iso, checksum) = stage!(host, Stage::PackageIso => {
        let iso = iso::package(host, &cfg.iso, &cfg.image.path, &cfg.work.dir)?;
        let checksum = iso::write_checksum(&iso)?;
        Ok((iso, checksum))
    })?;

    tracing::info!(?iso, ?checksum, "Build finished");
    Ok(Artifact {
        image: cfg.image.path.clone(),
        iso,
        checksum,
        mount_table,
    })
}
