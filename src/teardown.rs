//! Unwinding whatever a build acquired.
use std::path::Path;

use crate::{
    context::BuildContext,
    disks::loopdev,
    error::TeardownWarning,
    host::{is_not_mounted, Host},
    util::fs::exist_then,
};

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub warnings: Vec<TeardownWarning>,
    /// Successful unmounts, scratch mount included
    pub unmounted: usize,
    pub detached: bool,
}

impl TeardownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Whether a mount or the loop device may still be held.
    #[must_use]
    pub fn leaked(&self) -> bool {
        self.warnings.iter().any(TeardownWarning::is_leak)
    }

    fn warn(&mut self, w: TeardownWarning) {
        tracing::warn!("{w}");
        self.warnings.push(w);
    }
}

fn unmount(host: &dyn Host, target: &Path, report: &mut TeardownReport) {
    match host.umount(target) {
        Ok(()) => report.unmounted += 1,
        Err(e) if is_not_mounted(&e) => report.warn(TeardownWarning::AlreadyUnmounted(target.to_path_buf())),
        Err(e) => report.warn(TeardownWarning::UnmountFailed {
            target: target.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Release everything recorded in `ctx`, best effort.
///
/// Order: the scratch mount, the mounted plan prefix in reverse, the loop
/// device, then the work directories (only if nothing leaked, and only if
/// empty). Nothing here fails; problems come back as warnings. What was released
/// is removed from `ctx`, so running this again is a no-op.
#[tracing::instrument(skip_all)]
pub fn unwind(host: &dyn Host, ctx: &mut BuildContext) -> TeardownReport {
    let mut report = TeardownReport::default();
    if !ctx.holds_resources() && ctx.work_dirs.is_empty() && ctx.device.is_none() {
        tracing::debug!("Nothing to unwind");
        return report;
    }
    tracing::info!(mounted = ctx.mounted.len(), "Unwinding");

    if let Some(scratch) = ctx.scratch_mount.take() {
        unmount(host, &scratch, &mut report);
    }
    while let Some(entry) = ctx.mounted.pop() {
        unmount(host, &entry.target, &mut report);
    }

    if let Some(mut device) = ctx.device.take() {
        if device.is_attached() {
            match loopdev::detach(host, &mut device) {
                None => report.detached = true,
                Some(w) => report.warnings.push(w),
            }
        }
    }

    let dirs = std::mem::take(&mut ctx.work_dirs);
    if report.leaked() {
        tracing::warn!(?dirs, "Something is still mounted or attached, keeping work directories");
    } else {
        for dir in dirs.iter().rev() {
            // remove_dir refuses non-empty directories, so a missed mount never loses data
            if let Err(e) = exist_then(std::fs::remove_dir(dir)) {
                report.warn(TeardownWarning::RemoveDirFailed {
                    path: dir.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        unmounted = report.unmounted,
        detached = report.detached,
        warnings = report.warnings.len(),
        "Unwind finished"
    );
    report
}
