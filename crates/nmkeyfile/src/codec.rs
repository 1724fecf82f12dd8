//! Profile ⇄ keyfile translation.
//!
//! Every setting becomes a group of the same name. The `connection` group is
//! emitted first. Storage metadata lives in the `.nmmeta` group, which is not a
//! setting and never shows up in [`Profile::settings`].
//!
//! Certificate fields are handed to a [`CertWriter`] on the way out, so the
//! caller decides whether a blob is inlined or spilled to a file. On the way in
//! they are decoded from one of:
//!
//! | form | example |
//! |---|---|
//! | `file://` path | `file:///etc/pki/ca.pem` |
//! | PKCS#11 URI | `pkcs11:token=corp` |
//! | inline blob | `data:;base64,MIIB` |
//! | legacy byte list | `48,130,1,10,` |
//! | unqualified path | `ca.pem` (relative to the keyfile's directory) |

use std::path::{Path, PathBuf};

use base64::Engine;
use thiserror::Error;

use crate::keyfile::{valid_group_name, valid_key_name, KeyFile, KeyFileError};
use crate::profile::{cert_key, Cert, CertFormat, CertKey, Profile, Value, SETTING_CONNECTION};

pub const GROUP_NMMETA: &str = ".nmmeta";
pub const KEY_NMMETA_NM_GENERATED: &str = "nm-generated";
pub const KEY_NMMETA_VOLATILE: &str = "volatile";
pub const KEY_NMMETA_EXTERNAL: &str = "external";
pub const KEY_NMMETA_SHADOWED_STORAGE: &str = "shadowed-storage";
pub const KEY_NMMETA_SHADOWED_OWNED: &str = "shadowed-owned";

pub const CERT_SCHEME_PREFIX_PATH: &str = "file://";
pub const CERT_SCHEME_PREFIX_PKCS11: &str = "pkcs11:";
pub const CERT_SCHEME_PREFIX_BLOB: &str = "data:;base64,";

const CERT_EXTENSIONS: &[&str] = &["pem", "cert", "crt", "cer", "p12", "der", "key"];
const MAX_UNQUALIFIED_PATH_LEN: usize = 500;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{group}.{key}: certificate value outside of a certificate field")]
    UntypedCert { group: String, key: String },

    #[error("{group}.{key}: cannot interpret certificate value {value:?}")]
    InvalidCert {
        group: String,
        key: String,
        value: String,
    },

    #[error("{group}.{key}: name cannot be stored in a keyfile")]
    InvalidName { group: String, key: String },

    #[error("keyfile error: {0}")]
    KeyFile(#[from] KeyFileError),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Decides how certificate fields are written.
pub trait CertWriter {
    /// Keyfile value for `cert`, or `None` to leave the field out.
    fn write_cert(
        &mut self,
        uuid: &str,
        setting: &str,
        key: &CertKey,
        cert: &Cert,
    ) -> Option<String>;
}

/// Writes every certificate into the keyfile itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineCerts;

impl CertWriter for InlineCerts {
    fn write_cert(
        &mut self,
        _uuid: &str,
        _setting: &str,
        _key: &CertKey,
        cert: &Cert,
    ) -> Option<String> {
        match cert {
            Cert::Path(p) => p
                .to_str()
                .map(|p| format!("{}{}", CERT_SCHEME_PREFIX_PATH, p)),
            Cert::Pkcs11(uri) => Some(uri.clone()),
            Cert::Blob { data, .. } => Some(format!(
                "{}{}",
                CERT_SCHEME_PREFIX_BLOB,
                base64::engine::general_purpose::STANDARD.encode(data)
            )),
        }
    }
}

/// Serialize a profile, including its `.nmmeta` group.
///
/// Setting and key names that would not parse back unchanged are rejected.
pub fn to_keyfile(profile: &Profile, certs: &mut dyn CertWriter) -> Result<KeyFile> {
    let mut kf = KeyFile::new();
    let uuid = profile.uuid().unwrap_or_default().to_string();

    let connection_first = profile
        .settings()
        .filter(|(name, _)| *name == SETTING_CONNECTION)
        .chain(profile.settings().filter(|(name, _)| *name != SETTING_CONNECTION));

    for (setting, values) in connection_first {
        for (key, value) in values {
            if !valid_group_name(setting) || !valid_key_name(key) {
                return Err(CodecError::InvalidName {
                    group: setting.to_string(),
                    key: key.clone(),
                });
            }
            match value {
                Value::Str(s) => kf.set_string(setting, key, s),
                Value::Cert(cert) => {
                    let ck = cert_key(setting, key).ok_or_else(|| CodecError::UntypedCert {
                        group: setting.to_string(),
                        key: key.clone(),
                    })?;
                    if let Some(v) = certs.write_cert(&uuid, setting, ck, cert) {
                        kf.set_string(setting, key, &v);
                    }
                }
            }
        }
    }

    let meta = &profile.meta;
    if meta.nm_generated {
        kf.set_boolean(GROUP_NMMETA, KEY_NMMETA_NM_GENERATED, true);
    }
    if meta.volatile {
        kf.set_boolean(GROUP_NMMETA, KEY_NMMETA_VOLATILE, true);
    }
    if meta.external {
        kf.set_boolean(GROUP_NMMETA, KEY_NMMETA_EXTERNAL, true);
    }
    if let Some(shadowed) = &meta.shadowed_storage {
        kf.set_string(GROUP_NMMETA, KEY_NMMETA_SHADOWED_STORAGE, shadowed);
    }
    if meta.shadowed_owned {
        kf.set_boolean(GROUP_NMMETA, KEY_NMMETA_SHADOWED_OWNED, true);
    }

    Ok(kf)
}

/// Deserialize a keyfile. Relative certificate paths resolve against `base_dir`.
///
/// The result is not normalized.
pub fn from_keyfile(kf: &KeyFile, base_dir: &Path) -> Result<Profile> {
    let mut profile = Profile::default();

    for group in kf.groups() {
        if group == GROUP_NMMETA {
            continue;
        }
        for (key, value) in kf.entries(group) {
            if cert_key(group, key).is_some() {
                let cert = parse_cert(value, base_dir).ok_or_else(|| CodecError::InvalidCert {
                    group: group.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                profile.set(group, key, Value::Cert(cert));
            } else {
                profile.set(group, key, value);
            }
        }
    }

    profile.meta.nm_generated = kf
        .get_boolean(GROUP_NMMETA, KEY_NMMETA_NM_GENERATED)?
        .unwrap_or(false);
    profile.meta.volatile = kf
        .get_boolean(GROUP_NMMETA, KEY_NMMETA_VOLATILE)?
        .unwrap_or(false);
    profile.meta.external = kf
        .get_boolean(GROUP_NMMETA, KEY_NMMETA_EXTERNAL)?
        .unwrap_or(false);
    profile.meta.shadowed_storage = kf
        .get_string(GROUP_NMMETA, KEY_NMMETA_SHADOWED_STORAGE)
        .map(str::to_string);
    profile.meta.shadowed_owned = kf
        .get_boolean(GROUP_NMMETA, KEY_NMMETA_SHADOWED_OWNED)?
        .unwrap_or(false);

    Ok(profile)
}

fn parse_cert(value: &str, base_dir: &Path) -> Option<Cert> {
    if let Some(path) = value.strip_prefix(CERT_SCHEME_PREFIX_PATH) {
        if path.is_empty() {
            return None;
        }
        return Some(Cert::Path(resolve(base_dir, path)));
    }
    if value.starts_with(CERT_SCHEME_PREFIX_PKCS11) {
        return Some(Cert::Pkcs11(value.to_string()));
    }
    if let Some(b64) = value.strip_prefix(CERT_SCHEME_PREFIX_BLOB) {
        let data = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
        return Some(Cert::Blob {
            data,
            format: CertFormat::Unknown,
        });
    }
    if let Some(data) = parse_integer_list(value) {
        return Some(Cert::Blob {
            data,
            format: CertFormat::Unknown,
        });
    }
    if is_unqualified_cert_path(value) {
        return Some(Cert::Path(resolve(base_dir, value)));
    }
    None
}

fn resolve(base_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

/// Whether `value` would be read back as a path without a `file://` prefix.
///
/// It must look like a certificate file name and must not be mistaken for the
/// legacy byte-list encoding.
pub fn is_unqualified_cert_path(value: &str) -> bool {
    if value.is_empty()
        || value.len() > MAX_UNQUALIFIED_PATH_LEN
        || value.chars().any(char::is_control)
        || value.starts_with(CERT_SCHEME_PREFIX_PATH)
        || value.starts_with(CERT_SCHEME_PREFIX_PKCS11)
        || value.starts_with(CERT_SCHEME_PREFIX_BLOB)
        || parse_integer_list(value).is_some()
    {
        return false;
    }
    Path::new(value)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| CERT_EXTENSIONS.iter().any(|c| c.eq_ignore_ascii_case(ext)))
}

/// Legacy blob encoding: decimal bytes separated by `,` or `;`.
fn parse_integer_list(value: &str) -> Option<Vec<u8>> {
    if !value.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let mut out = Vec::new();
    for part in value.split([',', ';']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        out.push(part.parse::<u8>().ok()?);
    }
    Some(out)
}
