//! Ownership checks that back the idle-marker claim protocol.
//!
//! A pooled directory is only claimable by the OS user that created it. On
//! Unix this compares the file owner with the effective UID; elsewhere any
//! existing path is treated as owned.

use std::path::Path;

#[cfg(unix)]
use {nix::unistd::geteuid, std::os::unix::fs::MetadataExt};

/// Returns `true` when `path` exists and belongs to the effective user.
///
/// Symlinks are not followed so a link planted by another user cannot lend
/// its target's ownership to the check.
pub(crate) async fn owned_by_current_user(path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::symlink_metadata(path).await else {
        return false;
    };

    #[cfg(unix)]
    {
        metadata.uid() == geteuid().as_raw()
    }

    #[cfg(not(unix))]
    {
        drop(metadata);
        true
    }
}
