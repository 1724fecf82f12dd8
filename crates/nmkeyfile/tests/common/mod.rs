//! Shared helpers for the nmkeyfile integration tests.
//!
//! [`FakeGenerator`] stands in for libnetplan: it keeps ingested keyfiles in
//! memory, writes a YAML placeholder per definition and renders every known
//! definition back into the run-time directory on `generate`.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nmkeyfile::netplan::{GeneratorError, NetplanGenerator};
use nmkeyfile::KeyFile;
use nmkeyfile_config::path::run_connections_dir;
use uuid::Uuid;

pub const UUID_A: &str = "1b8e0c53-4a5e-4ad7-b2c8-0c8a7bfbedf0";
pub const UUID_B: &str = "6b3f4a0e-9e0e-4c1f-8f3a-2d7c9b1e5a44";
pub const UUID_C: &str = "0c6b8a55-7a3e-4f2f-9d3a-5b1c8e2f4a90";

pub fn uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeNetdef {
    pub id: String,
    pub uuid: String,
    pub ssid: Option<String>,
    pub text: String,
}

#[derive(Default)]
struct FakeState {
    /// Definitions written so far, by id
    tree: BTreeMap<String, FakeNetdef>,
    calls: Vec<String>,
    fail_load: bool,
    fail_generate: bool,
    generated_ifname: Option<String>,
    run_mode: Option<u32>,
}

/// Scripted netplan stand-in. Clones share state, so a test can keep one
/// handle and give another to the projector.
#[derive(Clone, Default)]
pub struct FakeGenerator {
    state: Rc<RefCell<FakeState>>,
}

impl FakeGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_load(self) -> Self {
        self.state.borrow_mut().fail_load = true;
        self
    }

    pub fn failing_generate(self) -> Self {
        self.state.borrow_mut().fail_generate = true;
        self
    }

    /// Copy this value into `connection.interface-name` of every generated file.
    pub fn with_generated_ifname(self, ifname: &str) -> Self {
        self.state.borrow_mut().generated_ifname = Some(ifname.to_string());
        self
    }

    /// Mode of generated files (default 0600).
    pub fn with_run_mode(self, mode: u32) -> Self {
        self.state.borrow_mut().run_mode = Some(mode);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl NetplanGenerator for FakeGenerator {
    type Parser = (String, KeyFile);
    type State = Vec<FakeNetdef>;
    type Netdef = FakeNetdef;

    fn load_keyfile(&self, path: &Path) -> Result<Self::Parser, GeneratorError> {
        self.record(format!("load {}", path.display()));
        if self.state.borrow().fail_load {
            return Err(GeneratorError::Failed("unsupported keyfile".to_string()));
        }
        let text = fs::read_to_string(path)?;
        let kf = KeyFile::parse(&text).map_err(|e| GeneratorError::Failed(e.to_string()))?;
        Ok((text, kf))
    }

    fn import(&self, (text, kf): Self::Parser) -> Result<Self::State, GeneratorError> {
        let uuid = kf
            .get_string("connection", "uuid")
            .ok_or_else(|| GeneratorError::Failed("no uuid".to_string()))?
            .to_string();
        // Logical interfaces are named after the interface.
        let id = match kf.get_string("connection", "type") {
            Some("bridge") | Some("bond") | Some("vlan") => kf
                .get_string("connection", "interface-name")
                .unwrap_or("unnamed")
                .to_string(),
            _ => format!("NM-{}", uuid),
        };
        let ssid = kf.get_string("wifi", "ssid").map(str::to_string);
        self.record(format!("import {}", id));
        Ok(vec![FakeNetdef { id, uuid, ssid, text }])
    }

    fn lookup<'s>(&self, state: &'s Self::State, id: &str) -> Option<&'s Self::Netdef> {
        self.record(format!("lookup {}", id));
        state.iter().find(|n| n.id == id)
    }

    fn write_netdef(
        &self,
        _state: &Self::State,
        netdef: &Self::Netdef,
        rootdir: &Path,
    ) -> Result<(), GeneratorError> {
        self.record(format!("write {}", netdef.id));
        let yaml = rootdir
            .join("etc/netplan")
            .join(format!("90-NM-{}.yaml", netdef.uuid));
        fs::create_dir_all(yaml.parent().unwrap())?;
        fs::write(&yaml, format!("network:\n  # {}\n", netdef.id))?;
        fs::set_permissions(&yaml, fs::Permissions::from_mode(0o600))?;
        self.state
            .borrow_mut()
            .tree
            .insert(netdef.id.clone(), netdef.clone());
        Ok(())
    }

    fn generate(&self, rootdir: &Path) -> Result<(), GeneratorError> {
        self.record("generate".to_string());
        let state = self.state.borrow();
        if state.fail_generate {
            return Err(GeneratorError::Failed("exit status 1".to_string()));
        }
        let run_dir = run_connections_dir(rootdir);
        fs::create_dir_all(&run_dir)?;
        for netdef in state.tree.values() {
            let name = match &netdef.ssid {
                Some(ssid) => format!(
                    "netplan-{}-{}.nmconnection",
                    netdef.id,
                    urlencoding::encode(ssid)
                ),
                None => format!("netplan-{}.nmconnection", netdef.id),
            };
            let mut kf = KeyFile::parse(&netdef.text)
                .map_err(|e| GeneratorError::Failed(e.to_string()))?;
            if let Some(ifname) = &state.generated_ifname {
                kf.set_string("connection", "interface-name", ifname);
            }
            let path = run_dir.join(name);
            fs::write(&path, kf.to_data())?;
            let mode = state.run_mode.unwrap_or(0o600);
            fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

/// Names in `dir`, sorted; empty when the directory does not exist.
pub fn names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

pub fn generated(rootdir: &Path, name: &str) -> PathBuf {
    run_connections_dir(rootdir).join(name)
}
