//! Cleanup of generated profiles carrying an invalid `interface-name`.
//!
//! The generator may copy a definition id such as `NM-<uuid>` into
//! `connection.interface-name`. That is longer than any kernel interface name,
//! so the key is dropped from every generated profile that has one.

use std::io;
use std::path::Path;

use nmkeyfile_config::path::run_connections_dir;
use tracing::warn;
use walkdir::WalkDir;

use crate::filename::NMCONNECTION_SUFFIX;
use crate::fsutil::{set_contents, FILE_MODE};
use crate::keyfile::KeyFile;
use crate::profile::{KEY_INTERFACE_NAME, SETTING_CONNECTION};

/// IFNAMSIZ - 1
pub const MAX_IFNAME_LEN: usize = 15;
const GENERATED_ID_PREFIX: &str = "NM-";

fn is_generated_ifname(ifname: &str) -> bool {
    ifname.starts_with(GENERATED_ID_PREFIX) && ifname.len() > MAX_IFNAME_LEN
}

/// Rewrite the generated profiles below `rootdir` that need it. Returns how
/// many files were changed. Running it again changes nothing.
pub fn fix_interface_names(rootdir: &Path) -> io::Result<usize> {
    let dir = run_connections_dir(rootdir);
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut fixed = 0;
    for entry in WalkDir::new(&dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let name = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file()
            || name.starts_with('.')
            || !name.ends_with(NMCONNECTION_SUFFIX)
        {
            continue;
        }

        let path = entry.path();
        let mut kf = match KeyFile::load_from_file(path) {
            Ok(kf) => kf,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot parse generated profile, not fixed"
                );
                continue;
            }
        };
        let Some(ifname) = kf.get_string(SETTING_CONNECTION, KEY_INTERFACE_NAME) else {
            continue;
        };
        if !is_generated_ifname(ifname) {
            continue;
        }
        let ifname = ifname.to_string();

        kf.remove_key(SETTING_CONNECTION, KEY_INTERFACE_NAME);
        set_contents(path, kf.to_data().as_bytes(), FILE_MODE)?;
        nmkeyfile_config::log_netplan_info!(
            "Deleted invalid connection.interface-name",
            interface_name = ifname.as_str(),
            path = tracing::field::display(path.display()),
        );
        fixed += 1;
    }
    Ok(fixed)
}
