//! Space-relative symlink translation.
//!
//! Absolute link targets pointing under the mount point are stored with a
//! sentinel prefix carrying the space id, so the link survives remounts
//! under a different path or space name:
//!
//! ```text
//! <__onedata_space_id:SPACE_ID>/relative/path
//! ```
//!
//! Readlink inverts the translation against the current mount point,
//! using the space name (or the id when configured). A link whose space
//! cannot be resolved is returned verbatim.

use crate::error::Result;
use std::path::Path;

pub const SPACE_LINK_PREFIX: &str = "<__onedata_space_id:";

fn mount_point_str(mount_point: &Path) -> String {
    let mut s = mount_point.to_string_lossy().into_owned();
    while s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    s
}

/// Rewrites an absolute link under the mount point into its
/// space-relative form. `space_id_for_name` resolves a top-level space
/// name to its id. Links outside the mount point pass through unchanged.
pub fn encode_space_relative(
    link: &str,
    mount_point: &Path,
    space_id_for_name: &mut dyn FnMut(&str) -> Result<String>,
) -> String {
    if !link.starts_with('/') {
        return link.to_string();
    }
    let mut effective = link.to_string();
    while effective.len() > 1 && effective.ends_with('/') {
        effective.pop();
    }

    let mount = mount_point_str(mount_point);
    let Some(relative) = effective.strip_prefix(&mount) else {
        return effective;
    };
    if !relative.is_empty() && !relative.starts_with('/') {
        // A sibling path that merely shares the mount point as a string
        // prefix, e.g. /mnt/oneclient-backup.
        return effective;
    }
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return effective;
    }

    let (space_name, rest) = match relative.split_once('/') {
        Some((name, rest)) => (name, Some(rest)),
        None => (relative, None),
    };
    let space_id = match space_id_for_name(space_name) {
        Ok(id) => id,
        Err(e) => {
            tracing::debug!(
                "Keeping absolute symlink target {}: space {} not resolvable ({})",
                link,
                space_name,
                e
            );
            return effective;
        }
    };

    match rest {
        Some(rest) if !rest.is_empty() => {
            format!("{SPACE_LINK_PREFIX}{space_id}>/{rest}")
        }
        _ => format!("{SPACE_LINK_PREFIX}{space_id}>"),
    }
}

/// Resolves a stored space-relative link back to an absolute path under
/// the current mount point. `space_name_for_id` resolves a space id to
/// its visible name; when it fails, or the stored string is not actually
/// space-relative, the raw string is returned.
pub fn resolve_space_relative(
    stored: &str,
    mount_point: &Path,
    show_space_ids: bool,
    space_name_for_id: &mut dyn FnMut(&str) -> Result<String>,
) -> String {
    let Some(without_prefix) = stored.strip_prefix(SPACE_LINK_PREFIX) else {
        return stored.to_string();
    };
    let Some(close) = without_prefix.find('>') else {
        return stored.to_string();
    };
    let space_id = &without_prefix[..close];
    let mut relative = without_prefix[close + 1..].to_string();
    if !relative.is_empty() && !relative.starts_with('/') {
        relative.insert(0, '/');
    }

    let mount = mount_point_str(mount_point);
    if show_space_ids {
        return format!("{mount}/{space_id}{relative}");
    }
    match space_name_for_id(space_id) {
        Ok(name) => format!("{mount}/{name}{relative}"),
        Err(e) => {
            tracing::debug!(
                "Returning raw symlink target: space {} not resolvable ({})",
                space_id,
                e
            );
            stored.to_string()
        }
    }
}
