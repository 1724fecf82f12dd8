//! Integration tests for the profile writer: naming, round trip, ownership and
//! cleanup on failure.

mod common;

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use common::{names, uuid, UUID_A, UUID_B, UUID_C};
use nmkeyfile::codec::CodecError;
use nmkeyfile::nmmeta::{self, TOMBSTONE_TARGET};
use nmkeyfile::profile::SETTING_8021X;
use nmkeyfile::{
    reader, Cert, CertFormat, Chown, KeyfileWriter, PermissionError, PermissionPolicy, Profile,
    ReadError, Value, WriteError, WriteRequest,
};
use nmkeyfile_config::testing::TestEnvironment;
use pretty_assertions::assert_eq;

struct FailingChown;

impl Chown for FailingChown {
    fn chown(&self, _path: &Path, _uid: u32, _gid: u32) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::EPERM))
    }
}

fn writer(env: &TestEnvironment) -> KeyfileWriter {
    KeyfileWriter::from_config(&env.config(), None)
}

fn wired(id: &str, u: &str) -> Profile {
    let mut p = Profile::new(id, uuid(u));
    p.set("connection", "type", "802-3-ethernet");
    p.set("ipv4", "method", "auto");
    p
}

#[test]
fn test_round_trip_with_secret_and_der_blob() {
    let env = TestEnvironment::new().unwrap();
    let der = vec![0x30, 0x82, 0x01, 0x0a];

    let mut p = Profile::new("Office", uuid(UUID_A));
    p.set("connection", "type", "802-11-wireless");
    p.set("wifi", "ssid", "corp");
    p.set("wifi-security", "psk", "s3cret");
    p.set(
        SETTING_8021X,
        "ca-cert",
        Cert::Blob {
            data: der.clone(),
            format: CertFormat::Unknown,
        },
    );

    let out = writer(&env)
        .write(&WriteRequest::new(&p).reread(true, true))
        .unwrap();

    assert_eq!(out.path, env.keyfile_dir.join("Office.nmconnection"));
    let blob_path = env.keyfile_dir.join(format!("{}-ca-cert.der", UUID_A));
    assert_eq!(fs::read(&blob_path).unwrap(), der);
    assert_eq!(fs::metadata(&blob_path).unwrap().mode() & 0o777, 0o600);

    let text = fs::read_to_string(&out.path).unwrap();
    assert!(text.contains(&format!("ca-cert={}-ca-cert.der\n", UUID_A)));

    let reread = out.reread.unwrap();
    assert_eq!(reread.get_str("wifi", "ssid"), Some("corp"));
    assert_eq!(reread.get_str("wifi-security", "psk"), Some("s3cret"));
    assert_eq!(
        reread.get(SETTING_8021X, "ca-cert"),
        Some(&Value::Cert(Cert::Path(blob_path.clone())))
    );
    // the blob came back as a path
    assert!(!out.reread_same);

    let from_disk = reader::read_from_file(
        &out.path,
        &env.keyfile_dir,
        &PermissionPolicy::current_user(),
    )
    .unwrap();
    assert_eq!(from_disk, reread);
}

#[test]
fn test_same_id_gets_unique_names() {
    let env = TestEnvironment::new().unwrap();
    let w = writer(&env);

    let mut paths = Vec::new();
    for u in [UUID_A, UUID_B, UUID_C] {
        let p = wired("Wired", u);
        paths.push(w.write(&WriteRequest::new(&p)).unwrap().path);
    }

    assert_eq!(
        paths,
        vec![
            env.keyfile_dir.join("Wired.nmconnection"),
            env.keyfile_dir.join(format!("Wired-{}.nmconnection", UUID_B)),
            env.keyfile_dir.join(format!("Wired-{}.nmconnection", UUID_C)),
        ]
    );

    // the same uuid again finds the numbered name
    let again = w.write(&WriteRequest::new(&wired("Wired", UUID_B))).unwrap();
    assert_eq!(
        again.path,
        env.keyfile_dir.join(format!("Wired-{}-1.nmconnection", UUID_B))
    );
}

#[test]
fn test_update_reuses_existing_file() {
    let env = TestEnvironment::new().unwrap();
    let w = writer(&env);

    let mut p = wired("Wired", UUID_A);
    let first = w.write(&WriteRequest::new(&p)).unwrap().path;

    p.set("ipv4", "method", "manual");
    p.set("connection", "id", "Renamed");
    let second = w
        .write(&WriteRequest::new(&p).existing(&first, false))
        .unwrap()
        .path;

    assert_eq!(second, first);
    assert!(fs::read_to_string(&first).unwrap().contains("method=manual"));
}

#[test]
fn test_force_rename_removes_old_file() {
    let env = TestEnvironment::new().unwrap();
    let w = writer(&env);

    let p = wired("Wired", UUID_A);
    let first = w.write(&WriteRequest::new(&p)).unwrap().path;
    let second = w
        .write(&WriteRequest::new(&p).existing(&first, false).force_rename(true))
        .unwrap()
        .path;

    assert_eq!(second, env.keyfile_dir.join(format!("Wired-{}.nmconnection", UUID_A)));
    assert!(!first.exists());
    assert_eq!(
        names(&env.keyfile_dir),
        vec![format!("Wired-{}.nmconnection", UUID_A)]
    );
}

#[test]
fn test_read_only_existing_file_is_kept() {
    let env = TestEnvironment::new().unwrap();
    let usr_dir = env.rootdir.join("usr/lib/NetworkManager/system-connections");
    fs::create_dir_all(&usr_dir).unwrap();
    let vendor = usr_dir.join("Wired.nmconnection");
    fs::write(&vendor, "[connection]\nid=Wired\n").unwrap();

    let p = wired("Wired", UUID_A);
    let out = writer(&env)
        .write(&WriteRequest::new(&p).existing(&vendor, true))
        .unwrap();

    assert_eq!(out.path, env.keyfile_dir.join("Wired.nmconnection"));
    assert_eq!(fs::read_to_string(&vendor).unwrap(), "[connection]\nid=Wired\n");
}

#[test]
fn test_filename_hook_is_consulted() {
    let env = TestEnvironment::new().unwrap();
    let reserved = env.keyfile_dir.join("Wired.nmconnection");
    let accept = |p: &Path| p != reserved;

    let p = wired("Wired", UUID_A);
    let out = writer(&env)
        .write(&WriteRequest::new(&p).allow_filename(&accept))
        .unwrap();
    assert_eq!(out.path, env.keyfile_dir.join(format!("Wired-{}.nmconnection", UUID_A)));
}

#[test]
fn test_chown_failure_removes_new_file_and_blobs() {
    let env = TestEnvironment::new().unwrap();
    let w = writer(&env).with_chown(Box::new(FailingChown));

    let mut p = wired("Wired", UUID_A);
    p.set(
        SETTING_8021X,
        "client-cert",
        Cert::Blob {
            data: b"-----BEGIN CERTIFICATE-----".to_vec(),
            format: CertFormat::Unknown,
        },
    );

    let err = w.write(&WriteRequest::new(&p)).unwrap_err();
    assert!(matches!(err, WriteError::Chown { .. }));
    assert_eq!(err.errno(), Some(-libc::EPERM));
    assert_eq!(names(&env.keyfile_dir), Vec::<String>::new());
}

#[test]
fn test_failed_rename_keeps_old_file() {
    let env = TestEnvironment::new().unwrap();

    let p = wired("Wired", UUID_A);
    let old = writer(&env).write(&WriteRequest::new(&p)).unwrap().path;
    let old_text = fs::read_to_string(&old).unwrap();

    let err = writer(&env)
        .with_chown(Box::new(FailingChown))
        .write(&WriteRequest::new(&p).existing(&old, false).force_rename(true))
        .unwrap_err();

    assert!(matches!(err, WriteError::Chown { .. }));
    assert_eq!(fs::read_to_string(&old).unwrap(), old_text);
    assert_eq!(names(&env.keyfile_dir), vec!["Wired.nmconnection".to_string()]);
}

#[test]
fn test_unrepresentable_key_is_a_write_error() {
    let env = TestEnvironment::new().unwrap();

    for key in ["remote=host", "[x]", "multi\nline"] {
        let mut p = wired("Tunnel", UUID_A);
        p.set("vpn", key, "10.0.0.1");

        let err = writer(&env)
            .write(&WriteRequest::new(&p).reread(true, true))
            .unwrap_err();
        assert!(
            matches!(err, WriteError::Serialization(CodecError::InvalidName { .. })),
            "{key:?}: {err}"
        );
    }
    assert_eq!(names(&env.keyfile_dir), Vec::<String>::new());
}

#[test]
fn test_failed_chown_on_update_keeps_stored_profile() {
    let env = TestEnvironment::new().unwrap();

    let mut p = wired("Wired", UUID_A);
    let stored = writer(&env).write(&WriteRequest::new(&p)).unwrap().path;
    let old_text = fs::read_to_string(&stored).unwrap();

    p.set("ipv4", "method", "manual");
    let err = writer(&env)
        .with_chown(Box::new(FailingChown))
        .write(&WriteRequest::new(&p).existing(&stored, false))
        .unwrap_err();

    assert!(matches!(err, WriteError::Chown { ref path, .. } if *path == stored));
    assert_eq!(fs::read_to_string(&stored).unwrap(), old_text);
    assert_eq!(names(&env.keyfile_dir), vec!["Wired.nmconnection".to_string()]);
}

#[test]
fn test_foreign_owner_is_rejected_on_read() {
    let env = TestEnvironment::new().unwrap();
    let p = wired("Wired", UUID_A);
    let path = writer(&env).write(&WriteRequest::new(&p)).unwrap().path;

    let me = nix::unistd::geteuid().as_raw();
    let policy = if me == 0 {
        // root is always trusted, so give the file to an untrusted user
        nix::unistd::chown(&path, Some(nix::unistd::Uid::from_raw(4242)), None).unwrap();
        PermissionPolicy::new(4243)
    } else {
        PermissionPolicy::new(me + 1)
    };

    let err = reader::read_from_file(&path, &env.keyfile_dir, &policy).unwrap_err();
    assert!(err.is_insecure());
    assert!(matches!(
        err,
        ReadError::Insecure { source: PermissionError::InsecureOwner(_), .. }
    ));

    // the check can be switched off explicitly
    let policy = policy.without_owner_check();
    assert!(reader::read_from_file(&path, &env.keyfile_dir, &policy).is_ok());
}

#[test]
fn test_tombstone_round_trip() {
    let env = TestEnvironment::new().unwrap();
    let policy = PermissionPolicy::current_user();
    let name = format!("{}.nmmeta", UUID_A);

    let path = nmmeta::write(&env.run_dir, UUID_A, Some(Path::new(TOMBSTONE_TARGET)), false, None)
        .unwrap();
    assert_eq!(path, env.run_dir.join(&name));
    assert!(nmmeta::read(&env.run_dir, &name, &policy)
        .unwrap()
        .unwrap()
        .is_tombstone());

    nmmeta::write(&env.run_dir, UUID_A, None, false, None).unwrap();
    assert!(nmmeta::read(&env.run_dir, &name, &policy).unwrap().is_none());
}

#[test]
fn test_write_test_connection_uses_legacy_names() {
    let env = TestEnvironment::new().unwrap();
    let me = nix::unistd::geteuid().as_raw();
    let my_group = nix::unistd::getegid().as_raw();

    let p = wired("Wired/Uplink", UUID_A);
    let out = writer(&env)
        .write_test_connection(&p, &env.run_dir, me, my_group, true)
        .unwrap();

    assert_eq!(out.path, env.run_dir.join("Wired*Uplink"));
    assert!(out.reread_same);
    assert_eq!(fs::metadata(&out.path).unwrap().uid(), me);
}
