//! Wrapping the finished disk image into an ISO, plus its checksum manifest.
use std::{
    io::Write,
    path::{Path, PathBuf},
};

use sha2::{Digest, Sha256};

use crate::{
    cfg::Iso,
    error::ProvisionError,
    host::Host,
    util::{cmd::Cmd, fs::exist_then},
};

/// Stage `image` into `work/iso-staging` and run the mastering command on it.
///
/// The image is hard-linked when possible and copied sparsely otherwise. The
/// staging directory is always removed afterwards.
///
/// # Errors
/// - staging failed
/// - the mastering command exited non-zero, or did not produce the ISO
#[tracing::instrument(skip_all, fields(output = ?cfg.output))]
pub fn package(host: &dyn Host, cfg: &Iso, image: &Path, work: &Path) -> Result<PathBuf, ProvisionError> {
    let staging = work.join("iso-staging");
    exist_then(std::fs::remove_dir_all(&staging))?;
    std::fs::create_dir_all(&staging)?;
    let staging = scopeguard::guard(staging, |dir| {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(?dir, ?e, "Cannot remove ISO staging directory");
        }
    });

    let name = image
        .file_name()
        .ok_or_else(|| ProvisionError::Config(format!("image path {image:?} has no file name")))?;
    let staged = staging.join(name);
    if let Err(e) = std::fs::hard_link(image, &staged) {
        tracing::debug!(?e, "Cannot hard-link image, copying instead");
        host.check(&Cmd::new("cp").arg("--sparse=always").arg(image).arg(&staged))?;
    }

    if let Some(parent) = cfg.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let output = cfg.output.to_string_lossy();
    let staging_str = staging.to_string_lossy();
    let cmd = Cmd::from_template(
        &cfg.command,
        &[
            ("staging", staging_str.as_ref()),
            ("output", output.as_ref()),
            ("volid", cfg.volume_id.as_str()),
        ],
    )?;
    tracing::info!(%cmd, "Mastering ISO");
    host.check(&cmd)?;

    if !cfg.output.is_file() {
        return Err(ProvisionError::ExternalToolFailure {
            command: cmd.to_string(),
            status: 0,
            output: format!("{} was not created", cfg.output.display()),
        });
    }
    Ok(cfg.output.clone())
}

/// Hex SHA-256 of a file.
///
/// # Errors
/// - the file cannot be read
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Write `<iso>.sha256` in `sha256sum` format next to the ISO.
///
/// # Errors
/// - the ISO cannot be read or the manifest cannot be written
#[tracing::instrument]
pub fn write_checksum(iso: &Path) -> Result<PathBuf, ProvisionError> {
    let digest = sha256_file(iso)?;
    let name = iso
        .file_name()
        .ok_or_else(|| ProvisionError::Config(format!("ISO path {iso:?} has no file name")))?;
    let mut manifest = iso.as_os_str().to_owned();
    manifest.push(".sha256");
    let manifest = PathBuf::from(manifest);

    let mut f = std::fs::File::create(&manifest)?;
    writeln!(f, "{digest}  {}", name.to_string_lossy())?;
    tracing::info!(%digest, ?manifest, "Wrote checksum");
    Ok(manifest)
}
