//! # nmkeyfile-config
//!
//! Configuration management for the keyfile profile store.
//!
//! Loads configuration from:
//! 1. `/etc/nmkeyfile/config.toml` (system)
//! 2. `$XDG_CONFIG_HOME/nmkeyfile/config.toml` (overrides system)
//! 3. Environment variables (highest priority)
//!
//! The loaded [`Config`] is passed explicitly to whoever needs it. There is no
//! process-wide instance, so a test that disables the owner check cannot leak
//! that setting into another test.

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// System-wide config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/nmkeyfile/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub owner: OwnerConfig,
    pub security: SecurityConfig,
    pub netplan: NetplanConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let user_path = Self::user_config_path();
        let mut config = Self::load_from(Path::new(SYSTEM_CONFIG_PATH), user_path.as_deref())?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load the system file, then merge the user file over it.
    ///
    /// Missing files are skipped. Environment overrides are not applied.
    pub fn load_from(system: &Path, user: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if system.exists() {
            debug!("Loading system config from {:?}", system);
            let contents = std::fs::read_to_string(system)?;
            config = toml::from_str(&contents)?;
        }

        if let Some(user) = user.filter(|p| p.exists()) {
            debug!("Loading user config from {:?}", user);
            let contents = std::fs::read_to_string(user)?;
            let user_config: Config = toml::from_str(&contents)?;
            config.merge(user_config);
        }

        Ok(config)
    }

    /// User config path: ~/.config/nmkeyfile/config.toml
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("nmkeyfile/config.toml"))
    }

    /// Merge another config over this one.
    ///
    /// Values equal to the built-in default are considered unset.
    fn merge(&mut self, other: Config) {
        let storage_default = StorageConfig::default();
        if other.storage.keyfile_dir != storage_default.keyfile_dir {
            self.storage.keyfile_dir = other.storage.keyfile_dir;
        }
        if other.storage.profile_dir != storage_default.profile_dir {
            self.storage.profile_dir = other.storage.profile_dir;
        }
        if other.storage.rootdir != storage_default.rootdir {
            self.storage.rootdir = other.storage.rootdir;
        }
        if !other.storage.with_extension {
            self.storage.with_extension = false;
        }
        if other.owner.uid.is_some() {
            self.owner.uid = other.owner.uid;
        }
        if other.owner.gid.is_some() {
            self.owner.gid = other.owner.gid;
        }
        if !other.security.check_owner {
            self.security.check_owner = false;
        }
        if other.security.service_uid.is_some() {
            self.security.service_uid = other.security.service_uid;
        }
        if !other.netplan.enabled {
            self.netplan.enabled = false;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("NMKF_KEYFILE_DIR") {
            self.storage.keyfile_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("NMKF_ROOTDIR") {
            self.storage.rootdir = PathBuf::from(dir);
        }
        if let Ok(value) = std::env::var("NMKF_NO_OWNER_CHECK") {
            if matches!(value.as_str(), "1" | "true" | "yes") {
                self.security.check_owner = false;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Storage locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory keyfiles are written to
    pub keyfile_dir: PathBuf,
    /// Directory relative certificate paths are resolved against on reread
    pub profile_dir: PathBuf,
    /// Root the netplan tree and the run-time directory live under
    pub rootdir: PathBuf,
    /// New-style `.nmconnection` file names
    pub with_extension: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keyfile_dir: PathBuf::from("/etc/NetworkManager/system-connections"),
            profile_dir: PathBuf::from("/etc/NetworkManager/system-connections"),
            rootdir: PathBuf::from("/"),
            with_extension: true,
        }
    }
}

impl StorageConfig {
    /// Run-time directory generated profiles land in.
    pub fn run_dir(&self) -> PathBuf {
        path::run_connections_dir(&self.rootdir)
    }
}

/// Owner assigned to written files
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerConfig {
    /// Owner uid (None = effective uid of this process)
    pub uid: Option<u32>,
    /// Owner gid (None = effective gid of this process)
    pub gid: Option<u32>,
}

impl OwnerConfig {
    pub fn resolve(&self) -> (u32, u32) {
        let uid = self
            .uid
            .unwrap_or_else(|| nix::unistd::geteuid().as_raw());
        let gid = self
            .gid
            .unwrap_or_else(|| nix::unistd::getegid().as_raw());
        (uid, gid)
    }
}

/// Ownership/permission checks on files read back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Reject files with an untrusted owner or group/other permission bits
    pub check_owner: bool,
    /// Uid trusted besides root (None = effective uid of this process)
    pub service_uid: Option<u32>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            check_owner: true,
            service_uid: None,
        }
    }
}

impl SecurityConfig {
    pub fn resolved_service_uid(&self) -> u32 {
        self.service_uid
            .unwrap_or_else(|| nix::unistd::geteuid().as_raw())
    }
}

/// Netplan projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetplanConfig {
    /// Project non-volatile profiles into the netplan tree
    pub enabled: bool,
}

impl Default for NetplanConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}
