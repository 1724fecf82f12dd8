//! Small filesystem helpers shared by the writer, the sidecar codec and the
//! fixup pass.

use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use tempfile::NamedTempFile;

/// Mode of every file this crate creates.
pub const FILE_MODE: u32 = 0o600;
/// Mode of directories created on demand.
pub const DIR_MODE: u32 = 0o755;

/// Replace `path` with `data` atomically.
///
/// The content goes to a hidden temp file in the same directory, is synced,
/// gets `mode`, and is then renamed over `path`. Readers see either the old or
/// the new file, never a partial one.
pub fn set_contents(path: &Path, data: &[u8], mode: u32) -> io::Result<()> {
    stage_contents(path, data, mode)?
        .persist(path)
        .map_err(|e| e.error)?;
    Ok(())
}

/// First half of [`set_contents`]: the synced temp file, not yet renamed.
///
/// Dropping the result removes the temp file and leaves `path` untouched.
pub fn stage_contents(path: &Path, data: &[u8], mode: u32) -> io::Result<NamedTempFile> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));

    let mut tmp = tempfile::Builder::new()
        .prefix(".nmkf-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().set_permissions(fs::Permissions::from_mode(mode))?;
    tmp.as_file().sync_all()?;
    Ok(tmp)
}

/// Create `dir` and its parents with mode 0755 if missing.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(DIR_MODE).create(dir)
}

/// Unlink `path`. Returns whether something was removed; a missing file is not an error.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Negative errno of an I/O error, `-EIO` when the error has none.
pub fn neg_errno(err: &io::Error) -> i32 {
    -err.raw_os_error().unwrap_or(libc::EIO)
}
