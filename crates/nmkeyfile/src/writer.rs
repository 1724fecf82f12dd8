//! Storing profiles as keyfiles.
//!
//! A write goes through these steps, and stops at the first failure:
//!
//! 1. serialize the profile, staging certificate blobs in memory
//! 2. pick a file name (reuse, rename or new)
//! 3. write the staged blobs next to the keyfile
//! 4. optionally check that the text reads back into a valid profile
//! 5. stage the keyfile in a 0600 temp file, chown it, then rename it into place
//! 6. remove the previous file when the profile moved
//! 7. for non-volatile profiles, hand the file to the projector, which may
//!    move the profile somewhere else and removes legacy netplan files
//!
//! Blob files created by a failed write are removed again. The projection step
//! spans several files and is not atomic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nmkeyfile_config::path::rootdir_from_keyfile_dir;
use nmkeyfile_config::Config;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{
    is_unqualified_cert_path, to_keyfile, CertWriter, CodecError, CERT_SCHEME_PREFIX_PATH,
};
use crate::filename::{allocate, AllocationExhausted, NameRequest};
use crate::fsutil::{self, neg_errno, FILE_MODE};
use crate::keyfile::KeyFile;
use crate::netplan::{GeneratorError, Projection, Projector};
use crate::permissions::{PermissionError, PermissionPolicy};
use crate::profile::{Cert, CertFormat, CertKey, Profile, ProfileError};
use crate::reader::{self, ReadError};

/// First two bytes of a DER encoded SEQUENCE with a two-byte length.
const DER_MAGIC: [u8; 2] = [0x30, 0x82];

#[derive(Error, Debug)]
pub enum WriteError {
    #[error(transparent)]
    AllocationExhausted(#[from] AllocationExhausted),

    #[error("cannot serialize connection: {0}")]
    Serialization(#[from] CodecError),

    #[error("invalid connection: {0}")]
    Profile(#[from] ProfileError),

    #[error("error {op} '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("error chowning '{}': {source}", path.display())]
    Chown {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("keyfile writer produces an invalid connection: {message}")]
    Verification { message: String },

    #[error("netplan: YAML translation failed: {0}")]
    Translation(#[source] GeneratorError),

    #[error("netplan: netdef ID \"{id}\" was not found in the Netplan state")]
    DefinitionNotFound { id: String },

    #[error("netplan generate failed: {0}")]
    Regeneration(#[source] GeneratorError),

    #[error("'{}': {source}", path.display())]
    InsecureFile {
        path: PathBuf,
        #[source]
        source: PermissionError,
    },
}

impl WriteError {
    /// Negative errno for failures that came from the OS.
    pub fn errno(&self) -> Option<i32> {
        match self {
            WriteError::Io { source, .. } | WriteError::Chown { source, .. } => {
                Some(neg_errno(source))
            }
            _ => None,
        }
    }

    pub fn is_insecure(&self) -> bool {
        matches!(self, WriteError::InsecureFile { .. })
    }

    fn io(path: &Path, op: &'static str, source: io::Error) -> Self {
        WriteError::Io {
            path: path.to_path_buf(),
            op,
            source,
        }
    }
}

/// Assigns ownership to written files.
pub trait Chown {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()>;
}

/// chown(2).
#[derive(Debug, Default, Clone, Copy)]
pub struct NixChown;

impl Chown for NixChown {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .map_err(io::Error::from)
    }
}

/// One profile write.
#[derive(Clone, Copy)]
pub struct WriteRequest<'a> {
    pub profile: &'a Profile,
    /// File currently holding the profile, if any
    pub existing_path: Option<&'a Path>,
    /// `existing_path` must not be overwritten or removed
    pub existing_path_read_only: bool,
    pub force_rename: bool,
    /// Veto for candidate file names
    pub allow_filename: Option<&'a dyn Fn(&Path) -> bool>,
    /// Return the profile as read back from the written text
    pub reread: bool,
    /// Compare the reread profile with `profile`
    pub reread_same: bool,
}

impl<'a> WriteRequest<'a> {
    pub fn new(profile: &'a Profile) -> Self {
        Self {
            profile,
            existing_path: None,
            existing_path_read_only: false,
            force_rename: false,
            allow_filename: None,
            reread: false,
            reread_same: false,
        }
    }

    pub fn existing(mut self, path: &'a Path, read_only: bool) -> Self {
        self.existing_path = Some(path);
        self.existing_path_read_only = read_only;
        self
    }

    pub fn force_rename(mut self, force: bool) -> Self {
        self.force_rename = force;
        self
    }

    pub fn allow_filename(mut self, accept: &'a dyn Fn(&Path) -> bool) -> Self {
        self.allow_filename = Some(accept);
        self
    }

    pub fn reread(mut self, reread: bool, reread_same: bool) -> Self {
        self.reread = reread;
        self.reread_same = reread_same;
        self
    }

    fn verify(&self) -> bool {
        self.reread || self.reread_same
    }
}

#[derive(Debug)]
pub struct WriteOutcome {
    /// Where the profile now lives
    pub path: PathBuf,
    pub reread: Option<Profile>,
    /// Reread profile equals the written one (false when not requested)
    pub reread_same: bool,
}

/// Directories and naming for one write.
struct Target<'a> {
    keyfile_dir: &'a Path,
    profile_dir: &'a Path,
    rootdir: &'a Path,
    with_extension: bool,
    uid: u32,
    gid: u32,
}

pub struct KeyfileWriter {
    keyfile_dir: PathBuf,
    profile_dir: PathBuf,
    rootdir: PathBuf,
    with_extension: bool,
    uid: u32,
    gid: u32,
    policy: PermissionPolicy,
    chown: Box<dyn Chown>,
    projector: Option<Box<dyn Projector>>,
}

impl KeyfileWriter {
    /// Writer owned by the current user, with no projector.
    pub fn new(keyfile_dir: impl Into<PathBuf>) -> Self {
        let keyfile_dir = keyfile_dir.into();
        Self {
            profile_dir: keyfile_dir.clone(),
            rootdir: PathBuf::from("/"),
            keyfile_dir,
            with_extension: true,
            uid: nix::unistd::geteuid().as_raw(),
            gid: nix::unistd::getegid().as_raw(),
            policy: PermissionPolicy::current_user(),
            chown: Box::new(NixChown),
            projector: None,
        }
    }

    /// Writer configured from `config`. The projector is only kept when
    /// netplan projection is enabled.
    pub fn from_config(config: &Config, projector: Option<Box<dyn Projector>>) -> Self {
        let (uid, gid) = config.owner.resolve();
        let mut policy = PermissionPolicy::new(config.security.resolved_service_uid());
        if !config.security.check_owner {
            policy = policy.without_owner_check();
        }
        Self {
            keyfile_dir: config.storage.keyfile_dir.clone(),
            profile_dir: config.storage.profile_dir.clone(),
            rootdir: config.storage.rootdir.clone(),
            with_extension: config.storage.with_extension,
            uid,
            gid,
            policy,
            chown: Box::new(NixChown),
            projector: projector.filter(|_| config.netplan.enabled),
        }
    }

    pub fn with_profile_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.profile_dir = dir.into();
        self
    }

    pub fn with_rootdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.rootdir = dir.into();
        self
    }

    pub fn with_extension(mut self, with_extension: bool) -> Self {
        self.with_extension = with_extension;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chown(mut self, chown: Box<dyn Chown>) -> Self {
        self.chown = chown;
        self
    }

    pub fn with_projector(mut self, projector: Box<dyn Projector>) -> Self {
        self.projector = Some(projector);
        self
    }

    pub fn keyfile_dir(&self) -> &Path {
        &self.keyfile_dir
    }

    /// Store a profile.
    #[instrument(skip_all, fields(uuid = req.profile.uuid(), existing = ?req.existing_path))]
    pub fn write(&self, req: &WriteRequest<'_>) -> Result<WriteOutcome, WriteError> {
        let target = Target {
            keyfile_dir: &self.keyfile_dir,
            profile_dir: &self.profile_dir,
            rootdir: &self.rootdir,
            with_extension: self.with_extension,
            uid: self.uid,
            gid: self.gid,
        };
        self.write_to(&target, req)
    }

    /// Store a profile into `keyfile_dir` with legacy naming and an explicit owner.
    ///
    /// No existing file is considered. When `keyfile_dir` is
    /// `<root>/run/NetworkManager/system-connections` the projector works
    /// below `<root>`.
    pub fn write_test_connection(
        &self,
        profile: &Profile,
        keyfile_dir: &Path,
        uid: u32,
        gid: u32,
        reread_same: bool,
    ) -> Result<WriteOutcome, WriteError> {
        let rootdir = rootdir_from_keyfile_dir(keyfile_dir);
        let target = Target {
            keyfile_dir,
            profile_dir: keyfile_dir,
            rootdir: &rootdir,
            with_extension: false,
            uid,
            gid,
        };
        self.write_to(&target, &WriteRequest::new(profile).reread(true, reread_same))
    }

    fn write_to(
        &self,
        target: &Target<'_>,
        req: &WriteRequest<'_>,
    ) -> Result<WriteOutcome, WriteError> {
        let profile = req.profile;
        let (id, uuid) = profile.identity()?;
        debug_assert!(!profile.meta.shadowed_owned || profile.meta.shadowed_storage.is_some());

        let mut staging = StagingCerts::new(target.keyfile_dir);
        let mut kf = to_keyfile(profile, &mut staging)?;

        fsutil::ensure_dir(target.keyfile_dir)
            .map_err(|e| WriteError::io(target.keyfile_dir, "creating directory", e))?;

        let name_req = NameRequest {
            dir: target.keyfile_dir,
            id,
            uuid,
            existing_path: req.existing_path,
            existing_path_read_only: req.existing_path_read_only,
            force_rename: req.force_rename,
            with_extension: target.with_extension,
        };
        let path = allocate(&name_req, req.allow_filename)?;
        debug!(path = %path.display(), rename = name_req.needs_rename(), "file name chosen");

        // Removes blob files created so far unless the write succeeds.
        let mut blobs = staging.commit(&mut kf);
        let text = kf.to_data();

        let mut reread = None;
        let mut reread_same = false;
        if req.verify() {
            let base_dir = path.parent().unwrap_or(target.keyfile_dir);
            let checked = verify_text(&text, base_dir)?;
            if req.reread_same {
                reread_same = checked == *profile;
            }
            reread = Some(checked);
        }

        // Ownership is set on the temp file, so a failed chown leaves whatever
        // was stored at `path` in place.
        let staged = fsutil::stage_contents(&path, text.as_bytes(), FILE_MODE)
            .map_err(|e| WriteError::io(&path, "writing to file", e))?;
        if let Err(source) = self.chown.chown(staged.path(), target.uid, target.gid) {
            return Err(WriteError::Chown { path, source });
        }
        staged
            .persist(&path)
            .map_err(|e| WriteError::io(&path, "writing to file", e.error))?;

        blobs.keep();

        if let Some(existing) = req.existing_path {
            if !req.existing_path_read_only && existing != path {
                match fsutil::remove_if_exists(existing) {
                    Ok(_) => debug!(old = %existing.display(), "removed previous file"),
                    Err(e) => {
                        warn!(old = %existing.display(), error = %e, "cannot remove previous file")
                    }
                }
            }
        }

        let mut final_path = path;
        if !profile.meta.volatile {
            if let Some(projector) = &self.projector {
                let projection = Projection {
                    content_path: &final_path,
                    profile_dir: target.profile_dir,
                    rootdir: target.rootdir,
                    existing_path: req.existing_path,
                    uuid,
                    interface_name: profile.interface_name(),
                    ssid: profile.ssid(),
                };
                let projected = projector.project(&projection)?;

                if req.verify() {
                    let checked = self.reread_file(&projected, target.profile_dir)?;
                    if req.reread_same {
                        reread_same = checked == *profile;
                    }
                    reread = Some(checked);
                }
                final_path = projected;
            }
        }

        nmkeyfile_config::log_writer_info!(
            "Profile stored",
            uuid = uuid,
            path = tracing::field::display(final_path.display()),
        );

        Ok(WriteOutcome {
            path: final_path,
            reread,
            reread_same,
        })
    }

    fn reread_file(&self, path: &Path, profile_dir: &Path) -> Result<Profile, WriteError> {
        match reader::read_from_file(path, profile_dir, &self.policy) {
            Ok(p) => Ok(p),
            Err(ReadError::Insecure { path, source }) => {
                Err(WriteError::InsecureFile { path, source })
            }
            Err(e) => Err(verification_failed(e)),
        }
    }
}

fn verify_text(text: &str, base_dir: &Path) -> Result<Profile, WriteError> {
    let result = reader::from_keyfile_data(text, base_dir);
    debug_assert!(
        result.is_ok(),
        "keyfile writer produced an unreadable profile: {:?}",
        result.as_ref().err()
    );
    result.map_err(verification_failed)
}

fn verification_failed(e: ReadError) -> WriteError {
    error!("BUG: the profile cannot be stored in keyfile format without becoming unusable: {}", e);
    WriteError::Verification {
        message: e.to_string(),
    }
}

struct StagedBlob {
    setting: String,
    key: &'static str,
    path: PathBuf,
    data: Vec<u8>,
}

/// Cert handler that keeps blobs in memory until a file name has been chosen.
struct StagingCerts<'a> {
    keyfile_dir: &'a Path,
    blobs: Vec<StagedBlob>,
}

impl<'a> StagingCerts<'a> {
    fn new(keyfile_dir: &'a Path) -> Self {
        Self {
            keyfile_dir,
            blobs: Vec::new(),
        }
    }

    fn path_value(&self, path: &Path) -> Option<String> {
        let Some(path) = path.to_str() else {
            warn!(path = %path.display(), "certificate path is not valid UTF-8");
            return None;
        };

        // Prefer a path relative to the keyfile directory.
        if let Some(rest) = self
            .keyfile_dir
            .to_str()
            .and_then(|dir| path.strip_prefix(dir))
            .filter(|rest| rest.starts_with('/'))
        {
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() && is_unqualified_cert_path(rest) {
                return Some(rest.to_string());
            }
        }

        // The reader must understand what we write; qualify anything ambiguous.
        if is_unqualified_cert_path(path) {
            Some(path.to_string())
        } else {
            Some(format!("{}{}", CERT_SCHEME_PREFIX_PATH, path))
        }
    }

    /// Write the staged blobs. A blob that cannot be written is logged and its
    /// field dropped from `kf`.
    fn commit(self, kf: &mut KeyFile) -> BlobFiles {
        let mut created = Vec::new();
        for blob in self.blobs {
            let existed = blob.path.symlink_metadata().is_ok();
            match fsutil::set_contents(&blob.path, &blob.data, FILE_MODE) {
                Ok(()) => {
                    if !existed {
                        created.push(blob.path);
                    }
                }
                Err(e) => {
                    nmkeyfile_config::log_writer_warn!(
                        "Failed to write certificate to file",
                        setting = blob.setting.as_str(),
                        key = blob.key,
                        path = tracing::field::display(blob.path.display()),
                        error = tracing::field::display(&e),
                    );
                    kf.remove_key(&blob.setting, blob.key);
                }
            }
        }
        BlobFiles {
            created,
            keep: false,
        }
    }
}

impl CertWriter for StagingCerts<'_> {
    fn write_cert(
        &mut self,
        uuid: &str,
        setting: &str,
        key: &CertKey,
        cert: &Cert,
    ) -> Option<String> {
        match cert {
            Cert::Path(path) => self.path_value(path),
            Cert::Pkcs11(uri) => Some(uri.clone()),
            Cert::Blob { data, format } => {
                let ext = blob_extension(key, data, *format);
                let file_name = format!("{}-{}.{}", uuid, key.file_suffix, ext);
                self.blobs.push(StagedBlob {
                    setting: setting.to_string(),
                    key: key.key,
                    path: self.keyfile_dir.join(&file_name),
                    data: data.clone(),
                });
                // starts with the uuid, so never mistaken for another scheme
                Some(file_name)
            }
        }
    }
}

fn blob_extension(key: &CertKey, data: &[u8], format: CertFormat) -> &'static str {
    if key.is_private_key {
        if format == CertFormat::Pkcs12 {
            "p12"
        } else {
            "pem"
        }
    } else if data.len() > 2 && data[..2] == DER_MAGIC {
        "der"
    } else {
        "pem"
    }
}

/// Blob files created by the current write.
struct BlobFiles {
    created: Vec<PathBuf>,
    keep: bool,
}

impl BlobFiles {
    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for BlobFiles {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        for path in &self.created {
            if fs::remove_file(path).is_ok() {
                info!(path = %path.display(), "removed certificate file of failed write");
            }
        }
    }
}
