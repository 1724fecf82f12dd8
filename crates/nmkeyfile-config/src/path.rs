//! Path utilities shared by the store and the CLI.
//!
//! Keyfile and sidecar paths are always handled in absolute form. These helpers
//! turn user input into absolute paths and answer "is this file directly inside
//! that directory" without touching the filesystem.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Run-time directory of generated profiles, relative to a root directory.
pub const RUN_CONNECTIONS_SUBDIR: &str = "run/NetworkManager/system-connections";

/// Make a path absolute without requiring it to exist.
///
/// Relative paths are joined onto the current directory. `.` components are
/// dropped; `..` is kept as-is since resolving it needs the filesystem.
///
/// # Example
/// ```ignore
/// let dir = absolute_path("system-connections")?;
/// assert!(dir.is_absolute());
/// ```
pub fn absolute_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(path)
    };
    Ok(joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect())
}

/// Return the file name of `path` if `path` names an entry directly inside `dir`.
///
/// Purely lexical: `dir/a` matches, `dir/sub/a`, `dir` and `other/a` do not.
/// Redundant separators are ignored.
pub fn file_in_directory<'a>(path: &'a Path, dir: &Path) -> Option<&'a OsStr> {
    let rest = path.strip_prefix(dir).ok()?;
    let mut components = rest.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Some(name),
        _ => None,
    }
}

/// Directory the generator writes run-time profiles into under `rootdir`.
pub fn run_connections_dir(rootdir: &Path) -> PathBuf {
    rootdir.join(RUN_CONNECTIONS_SUBDIR)
}

/// Derive the root directory from a keyfile directory located in the run-time tree.
///
/// `/tmp/x/run/NetworkManager/system-connections` yields `/tmp/x`. Any other
/// directory is returned unchanged.
pub fn rootdir_from_keyfile_dir(keyfile_dir: &Path) -> PathBuf {
    let suffix = Path::new(RUN_CONNECTIONS_SUBDIR);
    let mut root = keyfile_dir.to_path_buf();
    if keyfile_dir.ends_with(suffix) {
        for _ in suffix.components() {
            root.pop();
        }
    }
    root
}
