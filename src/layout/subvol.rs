//! Creating the reserved subvolume set and choosing the default one.
use std::{collections::BTreeMap, path::Path};

use super::{Role, Subvolume};
use crate::{
    context::BuildContext, disks::PartitionHandle, error::ProvisionError, host::Host, util::cmd::Cmd,
};

/// One line of `btrfs subvolume list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedSubvolume {
    pub id: u64,
    pub path: String,
}

/// Parse `btrfs subvolume list` / `get-default` output
/// (`ID 256 gen 7 top level 5 path @rootfs`). Lines without a path, like the
/// top level's `ID 5 (FS_TREE)`, are skipped.
pub fn parse_list(out: &str) -> Vec<ListedSubvolume> {
    out.lines()
        .filter_map(|line| {
            let (head, path) = line.split_once(" path ")?;
            let id = head.strip_prefix("ID ")?.split_whitespace().next()?.parse().ok()?;
            Some(ListedSubvolume {
                id,
                path: path.trim().to_owned(),
            })
        })
        .collect()
}

/// The listed subvolume whose path is exactly `name`.
///
/// `@rootfs` must never pick `@rootfs_b` or `old/@rootfs`.
pub fn find_exact<'a>(listed: &'a [ListedSubvolume], name: &str) -> Option<&'a ListedSubvolume> {
    listed.iter().find(|s| s.path == name)
}

/// Create one subvolume per role in the data filesystem and make the default
/// role's subvolume the filesystem default.
///
/// The raw filesystem is mounted at `scratch` for the duration; the mount is
/// recorded in `ctx` so teardown can release it if anything here fails.
///
/// # Errors
/// - [`ProvisionError::LayoutIncomplete`] if a subvolume is missing after creation,
///   or the default could not be set
/// - any `btrfs`/`chattr` failure
#[tracing::instrument(skip(host, ctx, data), fields(node = ?data.node))]
pub fn create_subvolumes(
    host: &dyn Host,
    ctx: &mut BuildContext,
    data: &PartitionHandle,
    roles: &[Role],
    default_role: Role,
    scratch: &Path,
) -> Result<BTreeMap<Role, Subvolume>, ProvisionError> {
    std::fs::create_dir_all(scratch)?;
    ctx.track_dir(scratch.to_path_buf());
    host.mount(&data.node, scratch, "btrfs", "")
        .map_err(|e| mount_error(e, &data.node, scratch))?;
    ctx.scratch_mount = Some(scratch.to_path_buf());

    for role in roles {
        let path = scratch.join(role.subvolume_name());
        host.check(&Cmd::new("btrfs").args(["subvolume", "create"]).arg(&path))?;
        if *role == Role::Swap {
            // swapfiles cannot live on copy-on-write extents
            host.check(&Cmd::new("chattr").arg("+C").arg(&path))?;
        }
    }

    let out = host.check(&Cmd::new("btrfs").args(["subvolume", "list"]).arg(scratch))?;
    let listed = parse_list(&out.stdout);
    tracing::debug!(?listed, "Subvolumes present");

    let missing: Vec<String> = (roles.iter())
        .map(|r| r.subvolume_name())
        .filter(|name| find_exact(&listed, name).is_none())
        .map(ToOwned::to_owned)
        .collect();
    if !missing.is_empty() {
        return Err(ProvisionError::LayoutIncomplete { missing });
    }

    let default_name = default_role.subvolume_name();
    let default_id = find_exact(&listed, default_name)
        .map(|s| s.id)
        .ok_or_else(|| ProvisionError::LayoutIncomplete {
            missing: vec![default_name.to_owned()],
        })?;
    host.check(
        &Cmd::new("btrfs")
            .args(["subvolume", "set-default", &default_id.to_string()])
            .arg(scratch),
    )?;

    let out = host.check(&Cmd::new("btrfs").args(["subvolume", "get-default"]).arg(scratch))?;
    match parse_list(&out.stdout).first() {
        Some(s) if s.id == default_id && s.path == default_name => {}
        other => {
            tracing::error!(?other, "Default subvolume did not stick");
            return Err(ProvisionError::LayoutIncomplete {
                missing: vec![format!("{default_name} (as default)")],
            });
        }
    }
    tracing::info!(default_id, default_name, "Set default subvolume");

    host.umount(scratch)?;
    ctx.scratch_mount = None;

    Ok(roles
        .iter()
        .filter_map(|role| {
            let s = find_exact(&listed, role.subvolume_name())?;
            Some((
                *role,
                Subvolume {
                    name: s.path.clone(),
                    role: *role,
                    id: s.id,
                    is_default: s.id == default_id,
                },
            ))
        })
        .collect())
}

pub(crate) fn mount_error(e: std::io::Error, source: &Path, target: &Path) -> ProvisionError {
    ProvisionError::Io(std::io::Error::new(
        e.kind(),
        format!("cannot mount {} on {}: {e}", source.display(), target.display()),
    ))
}
