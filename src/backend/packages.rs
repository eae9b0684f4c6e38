use std::path::Path;

use crate::{cfg::Packages, error::ProvisionError, host::Host, util::cmd::Cmd};

/// Hand the package list to the configured installer, rooted at `root`.
///
/// # Errors
/// - the command template is invalid
/// - the installer exited non-zero
#[tracing::instrument(skip_all, fields(count = cfg.list.len()))]
pub fn install(host: &dyn Host, cfg: &Packages, root: &Path) -> Result<(), ProvisionError> {
    if cfg.list.is_empty() {
        tracing::warn!("No packages configured, the image will only contain what the hook adds");
        return Ok(());
    }
    let root = root.to_string_lossy();
    let cmd = Cmd::from_template(&cfg.command, &[("root", root.as_ref())])?.args(&cfg.list);
    tracing::info!(%cmd, "Installing packages");
    host.check(&cmd)?;
    Ok(())
}
