//! Integration tests for the nmkeyfile command-line tool

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const UUID: &str = "2f2a5a5e-3c4b-4a8b-9e41-7d1c2a9a0b11";

/// Scratch root with a config file pointing all storage into it.
struct Fixture {
    temp: TempDir,
    config: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let keyfile_dir = temp.path().join("etc/NetworkManager/system-connections");
        fs::create_dir_all(&keyfile_dir).unwrap();

        let config = temp.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "[storage]\nkeyfile_dir = \"{dir}\"\nprofile_dir = \"{dir}\"\n\
                 rootdir = \"{root}\"\n\n[netplan]\nenabled = false\n",
                dir = keyfile_dir.display(),
                root = temp.path().display(),
            ),
        )
        .unwrap();
        Self { temp, config }
    }

    fn root(&self) -> &Path {
        self.temp.path()
    }

    fn keyfile_dir(&self) -> PathBuf {
        self.root().join("etc/NetworkManager/system-connections")
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_nmkeyfile"))
            .current_dir(self.root())
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("NMKF_KEYFILE_DIR")
            .env_remove("NMKF_ROOTDIR")
            .env_remove("NMKF_NO_OWNER_CHECK")
            .output()
            .expect("Failed to execute nmkeyfile")
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_config_default_outputs_toml() {
    let output = Command::new(env!("CARGO_BIN_EXE_nmkeyfile"))
        .args(["config", "default"])
        .output()
        .expect("Failed to execute nmkeyfile");
    let out = stdout(&output);

    assert!(output.status.success());
    assert!(out.contains("[storage]"));
    assert!(out.contains("[security]"));
    assert!(out.contains("[netplan]"));
}

#[test]
fn test_config_show_uses_config_file() {
    let fx = Fixture::new();
    let output = fx.run(&["config", "show"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains(&fx.keyfile_dir().display().to_string()));
}

#[test]
fn test_missing_config_file_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_nmkeyfile"))
        .args(["--config", "/nonexistent/nmkeyfile.toml", "config", "show"])
        .output()
        .expect("Failed to execute nmkeyfile");
    assert!(!output.status.success());
}

#[test]
fn test_write_then_check() {
    let fx = Fixture::new();
    let input = fx.root().join("input.nmconnection");
    fs::write(
        &input,
        format!(
            "[connection]\nid=Uplink\nuuid={}\ntype=802-3-ethernet\n\n[ipv4]\nmethod=auto\n",
            UUID.to_uppercase()
        ),
    )
    .unwrap();

    let output = fx.run(&["write", input.to_str().unwrap()]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let stored = fx.keyfile_dir().join("Uplink.nmconnection");
    assert_eq!(stdout(&output).lines().next(), Some(stored.to_str().unwrap()));
    assert_eq!(fs::metadata(&stored).unwrap().permissions().mode() & 0o777, 0o600);
    // the uuid was normalized on the way in
    assert!(fs::read_to_string(&stored).unwrap().contains(&format!("uuid={}", UUID)));

    let output = fx.run(&["check", stored.to_str().unwrap()]);
    let out = stdout(&output);
    assert!(output.status.success());
    assert!(out.contains("id:       Uplink"));
    assert!(out.contains(&format!("uuid:     {}", UUID)));
    assert!(out.contains("settings: connection, ipv4"));
}

#[test]
fn test_check_rejects_world_readable_file() {
    let fx = Fixture::new();
    let path = fx.keyfile_dir().join("Open.nmconnection");
    fs::write(&path, format!("[connection]\nid=Open\nuuid={}\n", UUID)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

    let output = fx.run(&["check", path.to_str().unwrap()]);
    assert!(!output.status.success());
}

#[test]
fn test_meta_tombstone_round_trip() {
    let fx = Fixture::new();
    let run_dir = fx.root().join("run/NetworkManager/system-connections");
    fs::create_dir_all(&run_dir).unwrap();

    let output = fx.run(&["meta", "write", UUID, "--tombstone"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let record = run_dir.join(format!("{}.nmmeta", UUID));
    assert_eq!(fs::read_link(&record).unwrap(), Path::new("/dev/null"));

    let output = fx.run(&["meta", "read", record.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("tombstone:        yes"));

    // no target deletes the record
    let output = fx.run(&["meta", "write", UUID]);
    assert!(output.status.success());
    assert!(fs::symlink_metadata(&record).is_err());
}

#[test]
fn test_meta_write_resolves_relative_paths() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.root().join("records")).unwrap();

    let output = fx.run(&[
        "meta",
        "write",
        "--dir",
        "records",
        "--loaded-path",
        "rel/Home.nmconnection",
        UUID,
    ]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let root = fs::canonicalize(fx.root()).unwrap();
    let record = root.join("records").join(format!("{}.nmmeta", UUID));
    assert_eq!(stdout(&output).trim(), record.to_str().unwrap());
    assert_eq!(
        fs::read_link(&record).unwrap(),
        root.join("rel/Home.nmconnection")
    );
}

#[test]
fn test_meta_write_rejects_bad_uuid() {
    let fx = Fixture::new();
    let output = fx.run(&["meta", "write", "not-a-uuid", "--tombstone"]);
    assert!(!output.status.success());
}

#[test]
fn test_fix_ifnames() {
    let fx = Fixture::new();
    let run_dir = fx.root().join("run/NetworkManager/system-connections");
    fs::create_dir_all(&run_dir).unwrap();
    let generated = run_dir.join(format!("netplan-NM-{}.nmconnection", UUID));
    fs::write(
        &generated,
        format!("[connection]\nid=x\ninterface-name=NM-{}\n", UUID),
    )
    .unwrap();

    let output = fx.run(&["fix-ifnames"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Fixed 1 profile(s)"));
    assert!(!fs::read_to_string(&generated).unwrap().contains("interface-name"));
}
