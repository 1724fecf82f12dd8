//! Ownership and permission checks on files read back from disk.
//!
//! Keyfiles may contain secrets, so a file is only trusted when it is owned by
//! root or the service user and has no group/other permission bits. A file that
//! fails these checks is reported as insecure, never as missing.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use thiserror::Error;

/// Group and other permission bits.
const INSECURE_MODE_MASK: u32 = 0o077;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Profile keyfile: stat(2), must be a regular file
    Keyfile,
    /// Sidecar record: lstat(2), regular file or symlink
    Nmmeta,
}

/// Who may own trusted files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionPolicy {
    /// Trusted besides root
    pub service_uid: u32,
    /// Disabled only for tests running without root
    pub check_owner: bool,
}

impl PermissionPolicy {
    pub fn new(service_uid: u32) -> Self {
        Self {
            service_uid,
            check_owner: true,
        }
    }

    /// Trust the effective uid of this process.
    pub fn current_user() -> Self {
        Self::new(nix::unistd::geteuid().as_raw())
    }

    /// Skip the owner and mode checks; file type is still checked.
    pub fn without_owner_check(mut self) -> Self {
        self.check_owner = false;
        self
    }
}

#[derive(Error, Debug)]
pub enum PermissionError {
    #[error("cannot access file: {0}")]
    Access(#[source] io::Error),

    #[error("file is not a regular file")]
    NotRegular,

    #[error("file is neither a symlink nor a regular file")]
    NotRegularOrSymlink,

    #[error("File owner ({0}) is insecure")]
    InsecureOwner(u32),

    #[error("File permissions ({0:03o}) are insecure")]
    InsecureMode(u32),
}

impl PermissionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PermissionError::Access(e) if e.kind() == io::ErrorKind::NotFound)
    }

    /// Anything but a failed stat: the file is there and must not be trusted.
    pub fn is_insecure(&self) -> bool {
        !matches!(self, PermissionError::Access(_))
    }
}

/// Check already-obtained metadata.
pub fn check_metadata(
    kind: FileKind,
    meta: &Metadata,
    policy: &PermissionPolicy,
) -> Result<(), PermissionError> {
    let ft = meta.file_type();
    match kind {
        FileKind::Keyfile if !ft.is_file() => return Err(PermissionError::NotRegular),
        FileKind::Nmmeta if !ft.is_file() && !ft.is_symlink() => {
            return Err(PermissionError::NotRegularOrSymlink)
        }
        _ => {}
    }

    if policy.check_owner {
        let uid = meta.uid();
        if uid != 0 && uid != policy.service_uid {
            return Err(PermissionError::InsecureOwner(uid));
        }
        if ft.is_file() && meta.mode() & INSECURE_MODE_MASK != 0 {
            return Err(PermissionError::InsecureMode(meta.mode()));
        }
    }

    Ok(())
}

/// Stat `path` the way `kind` requires and check the result.
pub fn check_file(
    kind: FileKind,
    path: &Path,
    policy: &PermissionPolicy,
) -> Result<Metadata, PermissionError> {
    let meta = match kind {
        FileKind::Keyfile => fs::metadata(path),
        FileKind::Nmmeta => fs::symlink_metadata(path),
    }
    .map_err(PermissionError::Access)?;

    check_metadata(kind, &meta, policy)?;
    Ok(meta)
}
