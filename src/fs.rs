//! Shared filesystem helpers that operate within the capability sandbox.

use std::io::{ErrorKind, Write as _};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{
    ambient_authority,
    fs::{Dir, OpenOptions},
};
use color_eyre::eyre::{Context, Result};

/// Resolves a path to an ambient directory handle paired with the relative path component.
///
/// Absolute paths are opened relative to the ambient root; relative paths reuse the current
/// working directory.
pub(crate) fn ambient_dir_and_path(path: &Utf8Path) -> Result<(Dir, Utf8PathBuf)> {
    if path.has_root() {
        let stripped = path
            .strip_prefix("/")
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());
        let dir = Dir::open_ambient_dir("/", ambient_authority())
            .context("open ambient root directory")?;
        Ok((dir, stripped))
    } else {
        let dir = Dir::open_ambient_dir(".", ambient_authority())
            .context("open ambient working directory")?;
        Ok((dir, path.to_path_buf()))
    }
}

/// Ensures the provided path exists, creating intermediate directories when required.
pub(crate) fn ensure_dir_exists(path: &Utf8Path) -> Result<()> {
    let (dir, relative) = ambient_dir_and_path(path)?;
    if relative.as_str().is_empty() {
        return Ok(());
    }

    dir.create_dir_all(relative.as_std_path())
        .or_else(|err| {
            if err.kind() == ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(err)
            }
        })
        .with_context(|| format!("create {}", path.as_str()))
}

/// Creates (or truncates) a zero-byte file at `path`.
pub(crate) fn write_empty_file(path: &Utf8Path) -> Result<()> {
    let (dir, relative) = ambient_dir_and_path(path)?;
    dir.write(relative.as_std_path(), b"")
        .with_context(|| format!("write {}", path.as_str()))
}

/// Appends `contents` to an existing file.
pub(crate) fn append_to_file(path: &Utf8Path, contents: &str) -> Result<()> {
    let (dir, relative) = ambient_dir_and_path(path)?;
    let mut options = OpenOptions::new();
    options.append(true);
    let mut file = dir
        .open_with(relative.as_std_path(), &options)
        .with_context(|| format!("open {} for append", path.as_str()))?;
    file.write_all(contents.as_bytes())
        .and_then(|()| file.flush())
        .with_context(|| format!("append to {}", path.as_str()))
}

/// Opens `path` for appending, creating it when absent, and hands back a
/// standard file suitable for a child's stdout or stderr.
pub(crate) fn open_append_log(path: &Utf8Path) -> Result<std::fs::File> {
    let (dir, relative) = ambient_dir_and_path(path)?;
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    let file = dir
        .open_with(relative.as_std_path(), &options)
        .with_context(|| format!("open log {}", path.as_str()))?;
    Ok(file.into_std())
}
