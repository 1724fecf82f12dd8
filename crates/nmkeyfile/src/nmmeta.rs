//! Sidecar records: `<uuid>.nmmeta` files that say which file currently holds
//! a profile.
//!
//! A record whose only content is the loaded path is a symlink pointing at it;
//! a tombstone is a symlink to `/dev/null`. When shadowed storage must be
//! remembered as well the record is a small keyfile:
//!
//! ```text
//! [nmmeta]
//! uuid=2f2a5a5e-3c4b-4a8b-9e41-7d1c2a9a0b11
//! loaded-path=Home.nmconnection
//! shadowed-storage=/etc/NetworkManager/system-connections/Home.nmconnection
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use nmkeyfile_config::path::file_in_directory;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::filename::{ignore_filename, NMMETA_SUFFIX};
use crate::fsutil::{self, neg_errno, FILE_MODE};
use crate::keyfile::{KeyFile, KeyFileError};
use crate::permissions::{check_file, FileKind, PermissionError, PermissionPolicy};
use crate::profile::is_normalized_uuid;

pub const GROUP_NMMETA: &str = "nmmeta";
pub const KEY_UUID: &str = "uuid";
pub const KEY_LOADED_PATH: &str = "loaded-path";
pub const KEY_SHADOWED_STORAGE: &str = "shadowed-storage";

/// Loaded path of a tombstone.
pub const TOMBSTONE_TARGET: &str = "/dev/null";

const UUID_LEN: usize = 36;

#[derive(Error, Debug)]
pub enum NmmetaError {
    #[error("{}: {source}", path.display())]
    Insecure {
        path: PathBuf,
        #[source]
        source: PermissionError,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: KeyFileError,
    },

    #[error("{}: uuid {found:?} does not match the file name", path.display())]
    UuidMismatch { path: PathBuf, found: Option<String> },
}

/// Failure of [`write`], naming the artifact left on disk.
#[derive(Error, Debug)]
#[error("failed to write {}: {source}", path.display())]
pub struct NmmetaWriteError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl NmmetaWriteError {
    /// Negative errno.
    pub fn errno(&self) -> i32 {
        neg_errno(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NmmetaRecord {
    pub uuid: String,
    pub full_filename: PathBuf,
    /// Absolute; relative values are resolved against the record's directory.
    pub loaded_path: Option<PathBuf>,
    pub shadowed_storage: Option<String>,
}

impl NmmetaRecord {
    pub fn is_tombstone(&self) -> bool {
        self.loaded_path.as_deref() == Some(Path::new(TOMBSTONE_TARGET))
    }
}

/// The uuid part of a well-formed `<uuid>.nmmeta` name (directory components ignored).
pub fn check_filename(filename: &str) -> Option<&str> {
    let name = filename.rsplit('/').next().unwrap_or(filename);
    let uuid = name.strip_suffix(NMMETA_SUFFIX)?;
    (uuid.len() == UUID_LEN && is_normalized_uuid(uuid)).then_some(uuid)
}

/// `<dir>/<uuid>.nmmeta`, or the `~` staging name when `temporary`.
pub fn filename(dir: &Path, uuid: &str, temporary: bool) -> PathBuf {
    let name = format!("{}{}{}", uuid, NMMETA_SUFFIX, if temporary { "~" } else { "" });
    debug_assert!(ignore_filename(&name, false));
    dir.join(name)
}

/// Read `dir/filename`.
///
/// A name that is not a sidecar name, a missing file and a record without
/// loaded path or shadowed storage are all `Ok(None)`. A file that fails the
/// ownership check is an error.
pub fn read(
    dir: &Path,
    filename: &str,
    policy: &PermissionPolicy,
) -> Result<Option<NmmetaRecord>, NmmetaError> {
    let Some(uuid) = check_filename(filename) else {
        debug!(filename, "not a sidecar file name");
        return Ok(None);
    };
    let full_filename = dir.join(filename);

    let meta = match check_file(FileKind::Nmmeta, &full_filename, policy) {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(PermissionError::Access(source)) => {
            return Err(NmmetaError::Io {
                path: full_filename,
                source,
            })
        }
        Err(source) => {
            return Err(NmmetaError::Insecure {
                path: full_filename,
                source,
            })
        }
    };

    let (loaded_path, shadowed_storage) = if meta.file_type().is_symlink() {
        let target = fs::read_link(&full_filename).map_err(|source| NmmetaError::Io {
            path: full_filename.clone(),
            source,
        })?;
        (Some(target), None)
    } else {
        let kf = KeyFile::load_from_file(&full_filename).map_err(|source| match source {
            KeyFileError::Io(source) => NmmetaError::Io {
                path: full_filename.clone(),
                source,
            },
            source => NmmetaError::Malformed {
                path: full_filename.clone(),
                source,
            },
        })?;

        match kf.get_string(GROUP_NMMETA, KEY_UUID) {
            Some(found) if found == uuid => {}
            found => {
                return Err(NmmetaError::UuidMismatch {
                    path: full_filename,
                    found: found.map(str::to_string),
                })
            }
        }

        let loaded = kf.get_string(GROUP_NMMETA, KEY_LOADED_PATH).map(PathBuf::from);
        let shadowed = kf
            .get_string(GROUP_NMMETA, KEY_SHADOWED_STORAGE)
            .map(str::to_string);
        if loaded.is_none() && shadowed.is_none() {
            debug!(path = %full_filename.display(), "sidecar carries no information");
            return Ok(None);
        }
        (loaded, shadowed)
    };

    Ok(Some(NmmetaRecord {
        uuid: uuid.to_string(),
        loaded_path: loaded_path.map(|p| if p.is_relative() { dir.join(p) } else { p }),
        shadowed_storage,
        full_filename,
    }))
}

/// [`read`] with the directory and file name split from `full_filename`.
pub fn read_from_file(
    full_filename: &Path,
    policy: &PermissionPolicy,
) -> Result<Option<NmmetaRecord>, NmmetaError> {
    let (Some(dir), Some(name)) = (
        full_filename.parent(),
        full_filename.file_name().and_then(|n| n.to_str()),
    ) else {
        return Ok(None);
    };
    read(dir, name, policy)
}

/// Write or delete the record for `uuid`.
///
/// `loaded_path = None` deletes the record. With `allow_relative` a loaded path
/// directly inside `dir` is stored as a bare file name. Returns the record's
/// full path.
///
/// A bad uuid, a relative `loaded_path` or a shadowed storage without a loaded
/// path fail with `EINVAL` before anything is touched.
#[instrument(level = "debug", skip(dir), fields(dir = %dir.display()))]
pub fn write(
    dir: &Path,
    uuid: &str,
    loaded_path: Option<&Path>,
    allow_relative: bool,
    shadowed_storage: Option<&str>,
) -> Result<PathBuf, NmmetaWriteError> {
    let full_filename = filename(dir, uuid, false);
    let invalid = !is_normalized_uuid(uuid)
        || loaded_path.is_some_and(Path::is_relative)
        || (shadowed_storage.is_some() && loaded_path.is_none());
    if invalid {
        return Err(NmmetaWriteError {
            path: full_filename,
            source: io::Error::from_raw_os_error(libc::EINVAL),
        });
    }

    let full_filename_tmp = filename(dir, uuid, true);
    let _ = fs::remove_file(&full_filename_tmp);

    let Some(loaded_path) = loaded_path else {
        return match fsutil::remove_if_exists(&full_filename) {
            Ok(_) => Ok(full_filename),
            Err(source) => Err(NmmetaWriteError {
                path: full_filename,
                source,
            }),
        };
    };

    let loaded_path = if allow_relative {
        file_in_directory(loaded_path, dir).map_or(loaded_path, Path::new)
    } else {
        loaded_path
    };

    if let Some(shadowed) = shadowed_storage {
        let mut kf = KeyFile::new();
        kf.set_string(GROUP_NMMETA, KEY_UUID, uuid);
        kf.set_string(GROUP_NMMETA, KEY_LOADED_PATH, &loaded_path.to_string_lossy());
        kf.set_string(GROUP_NMMETA, KEY_SHADOWED_STORAGE, shadowed);

        fsutil::set_contents(&full_filename, kf.to_data().as_bytes(), FILE_MODE).map_err(
            |source| NmmetaWriteError {
                path: full_filename.clone(),
                source,
            },
        )?;
    } else {
        symlink(loaded_path, &full_filename_tmp).map_err(|source| NmmetaWriteError {
            path: full_filename.clone(),
            source,
        })?;
        if let Err(source) = fs::rename(&full_filename_tmp, &full_filename) {
            let _ = fs::remove_file(&full_filename_tmp);
            return Err(NmmetaWriteError {
                path: full_filename,
                source,
            });
        }
    }

    nmkeyfile_config::log_meta_info!(
        "Sidecar written",
        path = tracing::field::display(full_filename.display()),
        loaded_path = tracing::field::display(loaded_path.display()),
    );
    Ok(full_filename)
}
