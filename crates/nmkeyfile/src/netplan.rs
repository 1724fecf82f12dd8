//! Projection of written keyfiles into the netplan tree.
//!
//! The netplan library itself is reached through [`NetplanGenerator`]; this
//! module only drives it. After a keyfile has been written it is ingested,
//! the matching network definition is written as YAML under the root
//! directory, and `generate` renders the whole tree back into
//! `<root>/run/NetworkManager/system-connections/netplan-*.nmconnection`.
//! The plain keyfile is removed; the generated file is where the profile
//! lives from then on.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nmkeyfile_config::path::run_connections_dir;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::filename::NMCONNECTION_SUFFIX;
use crate::fixup::fix_interface_names;
use crate::fsutil;
use crate::writer::WriteError;

/// Path fragment that marks a file generated from netplan.
const GENERATED_MARKER: &str = "system-connections/netplan-";

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Failed(String),
}

/// The narrow part of libnetplan the projector needs.
pub trait NetplanGenerator {
    type Parser;
    type State;
    type Netdef;

    /// Parse a keyfile into netplan's parser state.
    fn load_keyfile(&self, path: &Path) -> Result<Self::Parser, GeneratorError>;

    fn import(&self, parser: Self::Parser) -> Result<Self::State, GeneratorError>;

    fn lookup<'s>(&self, state: &'s Self::State, id: &str) -> Option<&'s Self::Netdef>;

    /// Write `netdef` as YAML below `rootdir`.
    fn write_netdef(
        &self,
        state: &Self::State,
        netdef: &Self::Netdef,
        rootdir: &Path,
    ) -> Result<(), GeneratorError>;

    /// Regenerate every backend file below `rootdir`.
    fn generate(&self, rootdir: &Path) -> Result<(), GeneratorError>;
}

/// One freshly written keyfile to project.
#[derive(Debug, Clone, Copy)]
pub struct Projection<'a> {
    pub content_path: &'a Path,
    pub profile_dir: &'a Path,
    pub rootdir: &'a Path,
    /// File that held the profile before this write
    pub existing_path: Option<&'a Path>,
    pub uuid: &'a str,
    pub interface_name: Option<&'a str>,
    pub ssid: Option<&'a str>,
}

/// Moves a written keyfile into an external store.
pub trait Projector {
    /// Returns the path the profile ends up at.
    fn project(&self, projection: &Projection<'_>) -> Result<PathBuf, WriteError>;
}

pub struct NetplanProjector<G> {
    generator: G,
}

impl<G: NetplanGenerator> NetplanProjector<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }
}

impl<G: NetplanGenerator> Projector for NetplanProjector<G> {
    #[instrument(skip_all, fields(uuid = p.uuid, rootdir = %p.rootdir.display()))]
    fn project(&self, p: &Projection<'_>) -> Result<PathBuf, WriteError> {
        let gen = &self.generator;
        let escaped_ssid = p.ssid.map(|s| urlencoding::encode(s).into_owned());

        // Updating a generated profile keeps its definition id.
        let prior_id = p
            .existing_path
            .and_then(|e| netdef_id_from_path(e, escaped_ssid.as_deref()));

        let mut input = p.content_path;
        if let (Some(_), Some(existing)) = (&prior_id, p.existing_path) {
            fs::copy(p.content_path, existing)
                .map_err(|e| io_error(existing, "copying keyfile to", e))?;
            input = existing;
        }
        let id = prior_id.unwrap_or_else(|| format!("NM-{}", p.uuid));
        debug!(id = %id, input = %input.display(), "ingesting keyfile");

        let parser = gen.load_keyfile(input).map_err(WriteError::Translation)?;
        let state = gen.import(parser).map_err(WriteError::Translation)?;

        let (netdef, actual_id) = match gen.lookup(&state, &id) {
            Some(netdef) => (netdef, id),
            None => {
                let by_ifname = p
                    .interface_name
                    .and_then(|ifname| gen.lookup(&state, ifname).map(|n| (n, ifname.to_string())));
                match by_ifname {
                    Some(found) => found,
                    None => return Err(WriteError::DefinitionNotFound { id }),
                }
            }
        };
        gen.write_netdef(&state, netdef, p.rootdir)
            .map_err(WriteError::Translation)?;

        remove_legacy_artifact(p.rootdir, p.uuid);
        if let Err(e) = fsutil::remove_if_exists(p.content_path) {
            warn!(path = %p.content_path.display(), error = %e, "cannot remove projected keyfile");
        }

        gen.generate(p.rootdir).map_err(WriteError::Regeneration)?;

        match fix_interface_names(p.rootdir) {
            Ok(0) => {}
            Ok(n) => debug!(fixed = n, "dropped generated interface names"),
            Err(e) => warn!(error = %e, "interface-name fixup failed"),
        }

        let path = match p.existing_path {
            Some(existing) => existing.to_path_buf(),
            None => generated_path(p.rootdir, p.uuid, &actual_id, escaped_ssid.as_deref()),
        };
        nmkeyfile_config::log_netplan_info!(
            "Profile projected",
            id = actual_id.as_str(),
            path = tracing::field::display(path.display()),
        );
        Ok(path)
    }
}

/// Where `generate` puts a new profile.
///
/// Definitions created from a profile are named `NM-<uuid>`; logical
/// interfaces use the interface name instead. The first name that exists wins,
/// otherwise the one derived from `actual_id`.
pub fn generated_path(
    rootdir: &Path,
    uuid: &str,
    actual_id: &str,
    escaped_ssid: Option<&str>,
) -> PathBuf {
    let run_dir = run_connections_dir(rootdir);
    let name = |id: &str| match escaped_ssid {
        Some(ssid) => format!("netplan-{}-{}{}", id, ssid, NMCONNECTION_SUFFIX),
        None => format!("netplan-{}{}", id, NMCONNECTION_SUFFIX),
    };

    let by_uuid = run_dir.join(name(&format!("NM-{}", uuid)));
    if by_uuid.exists() {
        return by_uuid;
    }
    run_dir.join(name(actual_id))
}

/// Definition id encoded in a generated file name.
///
/// `…/system-connections/netplan-<id>[-<escaped ssid>].nmconnection` yields
/// `<id>`. Anything else yields `None`.
pub fn netdef_id_from_path(path: &Path, escaped_ssid: Option<&str>) -> Option<String> {
    let path = path.to_str()?;
    let start = path.find(GENERATED_MARKER)? + GENERATED_MARKER.len();
    let name = path[start..].strip_suffix(NMCONNECTION_SUFFIX)?;
    if name.contains('/') {
        return None;
    }
    let id = match escaped_ssid {
        Some(ssid) => name.strip_suffix(ssid)?.strip_suffix('-')?,
        None => name,
    };
    (!id.is_empty()).then(|| id.to_string())
}

/// YAML written for the same profile by older releases.
pub fn legacy_artifact_path(rootdir: &Path, uuid: &str) -> PathBuf {
    rootdir.join("etc/netplan").join(format!("NM-{}.yaml", uuid))
}

/// Remove [`legacy_artifact_path`] if it is a regular file.
pub fn remove_legacy_artifact(rootdir: &Path, uuid: &str) {
    let path = legacy_artifact_path(rootdir, uuid);
    if !path.symlink_metadata().is_ok_and(|m| m.is_file()) {
        return;
    }
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "deleted legacy netplan connection"),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot delete legacy netplan connection")
        }
    }
}

fn io_error(path: &Path, op: &'static str, source: io::Error) -> WriteError {
    WriteError::Io {
        path: path.to_path_buf(),
        op,
        source,
    }
}
