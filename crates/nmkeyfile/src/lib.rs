//! # nmkeyfile
//!
//! Keyfile persistence for network connection profiles.
//!
//! Profiles are stored one per file in a keyfile directory, named after their
//! human-readable id. Next to them, sidecar records (`<uuid>.nmmeta`) remember
//! which file holds a profile, or that it was deleted:
//!
//! ```text
//! /etc/NetworkManager/system-connections/
//! ├── Home.nmconnection                         # keyfile, mode 0600
//! ├── Home-2f2a5a5e-....nmconnection            # same id, different uuid
//! └── 2f2a5a5e-...-ca-cert.der                  # certificate spilled from a profile
//! /run/NetworkManager/system-connections/
//! ├── 2f2a5a5e-....nmmeta -> /dev/null          # tombstone
//! └── netplan-NM-2f2a5a5e-....nmconnection      # generated from netplan
//! ```
//!
//! [`KeyfileWriter`] stores profiles. Non-volatile profiles can be handed to a
//! [`Projector`], which moves them into the netplan tree.

pub mod codec;
pub mod filename;
pub mod fixup;
pub mod fsutil;
pub mod keyfile;
pub mod netplan;
pub mod nmmeta;
pub mod permissions;
pub mod profile;
pub mod reader;
pub mod writer;

pub use filename::{allocate, create_filename, ignore_filename, AllocationExhausted, NameRequest};
pub use fixup::fix_interface_names;
pub use keyfile::{KeyFile, KeyFileError};
pub use netplan::{GeneratorError, NetplanGenerator, NetplanProjector, Projection, Projector};
pub use nmmeta::{NmmetaError, NmmetaRecord, NmmetaWriteError};
pub use permissions::{FileKind, PermissionError, PermissionPolicy};
pub use profile::{Cert, CertFormat, Profile, ProfileError, ProfileMeta, Value};
pub use reader::ReadError;
pub use writer::{Chown, KeyfileWriter, NixChown, WriteError, WriteOutcome, WriteRequest};
