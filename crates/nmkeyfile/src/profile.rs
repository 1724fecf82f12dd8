//! In-memory connection profile.
//!
//! A profile is a map of setting name → (key → value). Setting names are the
//! keyfile group names (`connection`, `wifi`, `802-1x`, ...). Certificate
//! fields are typed so the writer can decide how to persist them; everything
//! else is a string.

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

pub const SETTING_CONNECTION: &str = "connection";
pub const SETTING_WIFI: &str = "wifi";
pub const SETTING_8021X: &str = "802-1x";

pub const KEY_ID: &str = "id";
pub const KEY_UUID: &str = "uuid";
pub const KEY_INTERFACE_NAME: &str = "interface-name";
pub const KEY_SSID: &str = "ssid";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("connection.id is missing or empty")]
    MissingId,

    #[error("connection.uuid is missing")]
    MissingUuid,

    #[error("connection.uuid is not a valid UUID: {0}")]
    InvalidUuid(String),

    #[error("connection.uuid is not in normalized form: {0}")]
    UnnormalizedUuid(String),

    #[error("{group}.{key}: expected a string value")]
    NotAString { group: String, key: String },

    #[error("{group}.{key}: expected a certificate value")]
    NotACert { group: String, key: String },
}

/// Encoding hint for a private key blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertFormat {
    #[default]
    Unknown,
    X509,
    RawKey,
    Pkcs12,
}

/// How a certificate or key is referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cert {
    Path(PathBuf),
    Pkcs11(String),
    Blob { data: Vec<u8>, format: CertFormat },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Cert(Cert),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Cert(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Cert> for Value {
    fn from(c: Cert) -> Self {
        Value::Cert(c)
    }
}

/// A certificate-typed key and the file suffix used when its blob is spilled to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CertKey {
    pub key: &'static str,
    pub file_suffix: &'static str,
    /// Private keys carry a format hint instead of being sniffed for DER.
    pub is_private_key: bool,
}

pub const CERT_KEYS: &[CertKey] = &[
    CertKey { key: "ca-cert", file_suffix: "ca-cert", is_private_key: false },
    CertKey { key: "client-cert", file_suffix: "client-cert", is_private_key: false },
    CertKey { key: "private-key", file_suffix: "private-key", is_private_key: true },
    CertKey { key: "phase2-ca-cert", file_suffix: "inner-ca-cert", is_private_key: false },
    CertKey { key: "phase2-client-cert", file_suffix: "inner-client-cert", is_private_key: false },
    CertKey { key: "phase2-private-key", file_suffix: "inner-private-key", is_private_key: true },
];

/// Look up `group.key` among the certificate-typed fields.
pub fn cert_key(group: &str, key: &str) -> Option<&'static CertKey> {
    if group != SETTING_8021X {
        return None;
    }
    CERT_KEYS.iter().find(|c| c.key == key)
}

/// Storage metadata that is not part of the settings themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileMeta {
    pub nm_generated: bool,
    pub volatile: bool,
    pub external: bool,
    pub shadowed_storage: Option<String>,
    /// Only meaningful together with `shadowed_storage`.
    pub shadowed_owned: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    settings: BTreeMap<String, BTreeMap<String, Value>>,
    pub meta: ProfileMeta,
}

impl Profile {
    /// New profile with `connection.id` and `connection.uuid` set.
    pub fn new(id: impl Into<String>, uuid: Uuid) -> Self {
        let mut p = Profile::default();
        p.set(SETTING_CONNECTION, KEY_ID, Value::Str(id.into()));
        p.set(
            SETTING_CONNECTION,
            KEY_UUID,
            Value::Str(uuid.hyphenated().to_string()),
        );
        p
    }

    pub fn get(&self, setting: &str, key: &str) -> Option<&Value> {
        self.settings.get(setting)?.get(key)
    }

    pub fn get_str(&self, setting: &str, key: &str) -> Option<&str> {
        self.get(setting, key)?.as_str()
    }

    /// Set a value. Returns whether the profile changed.
    pub fn set(&mut self, setting: &str, key: &str, value: impl Into<Value>) -> bool {
        let value = value.into();
        let group = self.settings.entry(setting.to_string()).or_default();
        match group.get(key) {
            Some(old) if *old == value => false,
            _ => {
                group.insert(key.to_string(), value);
                true
            }
        }
    }

    /// Remove a value. Returns whether it was present. Empty settings are dropped.
    pub fn remove(&mut self, setting: &str, key: &str) -> bool {
        let Some(group) = self.settings.get_mut(setting) else {
            return false;
        };
        let removed = group.remove(key).is_some();
        if group.is_empty() {
            self.settings.remove(setting);
        }
        removed
    }

    pub fn settings(&self) -> impl Iterator<Item = (&str, &BTreeMap<String, Value>)> {
        self.settings.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_ID).filter(|s| !s.is_empty())
    }

    pub fn uuid(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_UUID)
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.get_str(SETTING_CONNECTION, KEY_INTERFACE_NAME)
    }

    pub fn ssid(&self) -> Option<&str> {
        self.get_str(SETTING_WIFI, KEY_SSID)
    }

    /// `(id, uuid)` of a profile that passes [`Profile::verify`].
    pub fn identity(&self) -> Result<(&str, &str), ProfileError> {
        self.verify()?;
        match (self.id(), self.uuid()) {
            (Some(id), Some(uuid)) => Ok((id, uuid)),
            (None, _) => Err(ProfileError::MissingId),
            (_, None) => Err(ProfileError::MissingUuid),
        }
    }

    /// Check the invariants the store relies on.
    pub fn verify(&self) -> Result<(), ProfileError> {
        if self.id().is_none() {
            return Err(ProfileError::MissingId);
        }
        for (setting, values) in &self.settings {
            for (key, value) in values {
                match (cert_key(setting, key).is_some(), value) {
                    (true, Value::Str(_)) => {
                        return Err(ProfileError::NotACert {
                            group: setting.clone(),
                            key: key.clone(),
                        })
                    }
                    (false, Value::Cert(_)) => {
                        return Err(ProfileError::NotAString {
                            group: setting.clone(),
                            key: key.clone(),
                        })
                    }
                    _ => {}
                }
            }
        }
        let uuid = self.uuid().ok_or(ProfileError::MissingUuid)?;
        if !is_normalized_uuid(uuid) {
            return match Uuid::parse_str(uuid) {
                Ok(_) => Err(ProfileError::UnnormalizedUuid(uuid.to_string())),
                Err(_) => Err(ProfileError::InvalidUuid(uuid.to_string())),
            };
        }
        Ok(())
    }

    /// Fix what can be fixed, then verify. Returns whether anything changed.
    pub fn normalize(&mut self) -> Result<bool, ProfileError> {
        let mut changed = false;
        if let Some(uuid) = self.uuid() {
            if !is_normalized_uuid(uuid) {
                if let Ok(parsed) = Uuid::parse_str(uuid) {
                    let normalized = parsed.hyphenated().to_string();
                    changed = self.set(SETTING_CONNECTION, KEY_UUID, normalized);
                }
            }
        }
        if self.meta.shadowed_storage.is_none() && self.meta.shadowed_owned {
            self.meta.shadowed_owned = false;
            changed = true;
        }
        self.verify()?;
        Ok(changed)
    }
}

/// Lowercase, hyphenated, 36 characters.
pub fn is_normalized_uuid(s: &str) -> bool {
    s.len() == 36
        && Uuid::parse_str(s).is_ok_and(|u| u.hyphenated().to_string() == s)
}
