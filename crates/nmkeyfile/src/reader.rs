//! Reading keyfiles back into profiles.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::codec::{from_keyfile, CodecError};
use crate::keyfile::{KeyFile, KeyFileError};
use crate::permissions::{check_file, FileKind, PermissionError, PermissionPolicy};
use crate::profile::{Profile, ProfileError};

#[derive(Error, Debug)]
pub enum ReadError {
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

    #[error("invalid keyfile: {0}")]
    Parse(#[from] KeyFileError),

    #[error("invalid connection: {0}")]
    Decode(#[from] CodecError),

    #[error("invalid connection: {0}")]
    Profile(#[from] ProfileError),
}

impl ReadError {
    pub fn is_insecure(&self) -> bool {
        matches!(self, ReadError::Insecure { .. })
    }
}

/// Permission check, parse, decode and normalize the keyfile at `path`.
///
/// Relative certificate paths resolve against the file's directory.
/// `profile_dir` is where profiles normally live; a file outside it is read
/// the same way but noted in the log.
pub fn read_from_file(
    path: &Path,
    profile_dir: &Path,
    policy: &PermissionPolicy,
) -> Result<Profile, ReadError> {
    check_file(FileKind::Keyfile, path, policy).map_err(|source| match source {
        PermissionError::Access(source) => ReadError::Io {
            path: path.to_path_buf(),
            source,
        },
        source => ReadError::Insecure {
            path: path.to_path_buf(),
            source,
        },
    })?;

    if !path.starts_with(profile_dir) {
        debug!(
            path = %path.display(),
            profile_dir = %profile_dir.display(),
            "reading keyfile outside the profile directory"
        );
    }

    let text = fs::read_to_string(path).map_err(|source| ReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or(profile_dir);
    from_keyfile_data(&text, base_dir)
}

/// Parse, decode and normalize in-memory keyfile text, with no filesystem checks.
pub fn from_keyfile_data(text: &str, base_dir: &Path) -> Result<Profile, ReadError> {
    let kf = KeyFile::parse(text)?;
    let mut profile = from_keyfile(&kf, base_dir)?;
    profile.normalize()?;
    Ok(profile)
}
