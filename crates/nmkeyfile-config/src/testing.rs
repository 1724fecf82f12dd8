//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated root directory
//! - The keyfile, run-time and netplan directories below it
//! - A `Config` pointing at those directories with the owner check tuned to
//!   the current user
//!
//! # Usage
//!
//! ```ignore
//! use nmkeyfile_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.keyfile_dir, env.run_dir, env.netplan_dir are all isolated
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root the whole tree hangs off
    pub rootdir: PathBuf,
    /// `<root>/etc/NetworkManager/system-connections`
    pub keyfile_dir: PathBuf,
    /// `<root>/run/NetworkManager/system-connections`
    pub run_dir: PathBuf,
    /// `<root>/etc/netplan`
    pub netplan_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let rootdir = temp_dir.path().to_path_buf();

        let keyfile_dir = rootdir.join("etc/NetworkManager/system-connections");
        let run_dir = crate::path::run_connections_dir(&rootdir);
        let netplan_dir = rootdir.join("etc/netplan");

        std::fs::create_dir_all(&keyfile_dir)?;
        std::fs::create_dir_all(&run_dir)?;
        std::fs::create_dir_all(&netplan_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            rootdir,
            keyfile_dir,
            run_dir,
            netplan_dir,
            test_id,
        })
    }

    /// Config whose directories point into this environment.
    ///
    /// Files are owned by the current user, who is also the trusted service uid.
    pub fn config(&self) -> Config {
        let uid = nix::unistd::geteuid().as_raw();
        let gid = nix::unistd::getegid().as_raw();

        let mut cfg = Config::default();
        cfg.storage.keyfile_dir = self.keyfile_dir.clone();
        cfg.storage.profile_dir = self.keyfile_dir.clone();
        cfg.storage.rootdir = self.rootdir.clone();
        cfg.owner.uid = Some(uid);
        cfg.owner.gid = Some(gid);
        cfg.security.service_uid = Some(uid);
        cfg
    }

    /// Write a file below the root with owner-only permissions.
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.rootdir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
