//! Keyfile naming: escaping profile ids into file names, deciding which
//! directory entries are keyfiles at all, and picking a free name for a write.

use std::path::{Path, PathBuf};

use nmkeyfile_config::path::file_in_directory;
use thiserror::Error;
use tracing::debug;

pub const NMCONNECTION_SUFFIX: &str = ".nmconnection";
pub const NMMETA_SUFFIX: &str = ".nmmeta";

/// Upper bound of the `id-uuid-N` sequence.
pub const MAX_NAME_ATTEMPTS: u32 = 10000;

/// Backup, package-manager and certificate suffixes that are never loaded as keyfiles.
const IGNORED_SUFFIXES: &[&str] = &[
    ".swp",
    ".swpx",
    ".rpmnew",
    ".rpmsave",
    ".orig",
    ".bak",
    ".dpkg-dist",
    ".dpkg-old",
    ".dpkg-new",
    ".dpkg-tmp",
    ".pem",
    ".der",
    NMMETA_SUFFIX,
];

#[derive(Error, Debug)]
#[error("could not find suitable keyfile file name ({} already used)", .0.display())]
pub struct AllocationExhausted(pub PathBuf);

/// Whether a directory entry must not be read as a keyfile.
///
/// With `require_extension`, only `*.nmconnection` names are accepted.
pub fn ignore_filename(filename: &str, require_extension: bool) -> bool {
    let name = filename.rsplit('/').next().unwrap_or(filename);

    if name.is_empty() || name.starts_with('.') {
        return true;
    }

    if require_extension {
        return name.len() <= NMCONNECTION_SUFFIX.len() || !name.ends_with(NMCONNECTION_SUFFIX);
    }

    name.ends_with('~')
        || has_mkstemp_suffix(name)
        || IGNORED_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// `*.XXXXXX` as left behind by mkstemp(3).
fn has_mkstemp_suffix(name: &str) -> bool {
    let b = name.as_bytes();
    b.len() > 7 && b[b.len() - 7] == b'.' && b[b.len() - 6..].iter().all(u8::is_ascii_alphanumeric)
}

/// Escape a profile id into a file name that [`ignore_filename`] accepts.
///
/// New-style names escape with `_` and get the `.nmconnection` extension;
/// legacy names escape `/` with `*` and have no extension.
pub fn create_filename(name: &str, with_extension: bool) -> String {
    let escape = if with_extension { '_' } else { '*' };

    let mut out: String = name
        .chars()
        .map(|c| if c == '/' || c == '\0' { escape } else { c })
        .collect();

    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with('.') {
        out.replace_range(..1, "_");
    }
    if out.ends_with('~') {
        out.pop();
        out.push('_');
    }
    if has_mkstemp_suffix(&out) || IGNORED_SUFFIXES.iter().any(|s| out.ends_with(s)) {
        out.push('_');
    }

    if with_extension {
        out.push_str(NMCONNECTION_SUFFIX);
    }

    debug_assert!(!ignore_filename(&out, with_extension));
    out
}

/// Inputs of a name search.
#[derive(Debug, Clone, Copy)]
pub struct NameRequest<'a> {
    pub dir: &'a Path,
    pub id: &'a str,
    pub uuid: &'a str,
    pub existing_path: Option<&'a Path>,
    pub existing_path_read_only: bool,
    pub force_rename: bool,
    pub with_extension: bool,
}

impl NameRequest<'_> {
    /// The existing file cannot be reused and a new name must be found.
    pub fn needs_rename(&self) -> bool {
        self.force_rename
            || self.existing_path_read_only
            || self
                .existing_path
                .is_some_and(|p| file_in_directory(p, self.dir).is_none())
    }

    /// Candidates in preference order: existing path, `id`, `id-uuid`, `id-uuid-N`.
    pub fn candidates(&self) -> impl Iterator<Item = PathBuf> + '_ {
        let reuse = self.existing_path.filter(|_| !self.needs_rename());
        reuse
            .map(Path::to_path_buf)
            .into_iter()
            .chain(std::iter::once_with(move || {
                self.dir.join(create_filename(self.id, self.with_extension))
            }))
            .chain((0..MAX_NAME_ATTEMPTS).map(move |n| {
                let name = if n == 0 {
                    format!("{}-{}", self.id, self.uuid)
                } else {
                    format!("{}-{}-{}", self.id, self.uuid, n)
                };
                self.dir.join(create_filename(&name, self.with_extension))
            }))
    }
}

/// Pick the first acceptable candidate.
///
/// A candidate is skipped when it is the existing path while renaming, when
/// `accept` rejects it, or when something already exists there (the existing
/// path itself excepted).
pub fn allocate(
    req: &NameRequest<'_>,
    accept: Option<&dyn Fn(&Path) -> bool>,
) -> Result<PathBuf, AllocationExhausted> {
    let rename = req.needs_rename();

    for candidate in req.candidates() {
        let is_existing = req.existing_path == Some(candidate.as_path());

        if is_existing && rename {
            continue;
        }
        if let Some(accept) = accept {
            if !accept(&candidate) {
                debug!(path = %candidate.display(), "file name rejected by filter");
                continue;
            }
        }
        if !is_existing && candidate.symlink_metadata().is_ok() {
            continue;
        }
        return Ok(candidate);
    }

    Err(AllocationExhausted(
        req.dir.join(create_filename(req.id, req.with_extension)),
    ))
}
