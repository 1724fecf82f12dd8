//! `nmkeyfile meta` subcommands

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use nmkeyfile::nmmeta::{self, TOMBSTONE_TARGET};
use nmkeyfile_config::path::absolute_path;
use nmkeyfile_config::Config;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum MetaCommands {
    /// Print a `<uuid>.nmmeta` record
    Read {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Write the record for a profile uuid; without a target the record is deleted
    Write {
        /// Directory holding the records (defaults to the run-time directory)
        #[arg(long)]
        dir: Option<PathBuf>,

        #[arg(value_name = "UUID")]
        uuid: String,

        /// File the profile was loaded from, relative to the current directory
        #[arg(long, conflicts_with = "tombstone")]
        loaded_path: Option<PathBuf>,

        /// Mark the profile as deleted
        #[arg(long)]
        tombstone: bool,

        /// Storage the profile shadows
        #[arg(long, requires = "loaded_path")]
        shadowed_storage: Option<String>,

        /// Store a loaded path inside the directory as a bare file name
        #[arg(long)]
        relative: bool,
    },
}

pub fn run(config: &Config, command: MetaCommands) -> Result<()> {
    match command {
        MetaCommands::Read { file } => {
            let record = nmmeta::read_from_file(&file, &crate::policy(config))
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let Some(record) = record else {
                println!("{}: no record", file.display());
                return Ok(());
            };

            println!("{}", record.full_filename.display());
            println!("  uuid:             {}", record.uuid);
            if record.is_tombstone() {
                println!("  tombstone:        yes");
            } else if let Some(loaded) = &record.loaded_path {
                println!("  loaded-path:      {}", loaded.display());
            }
            if let Some(shadowed) = &record.shadowed_storage {
                println!("  shadowed-storage: {}", shadowed);
            }
            Ok(())
        }
        MetaCommands::Write {
            dir,
            uuid,
            loaded_path,
            tombstone,
            shadowed_storage,
            relative,
        } => {
            let uuid = Uuid::parse_str(&uuid)
                .with_context(|| format!("Invalid uuid: {}", uuid))?
                .hyphenated()
                .to_string();
            let dir = absolute_path(dir.unwrap_or_else(|| config.storage.run_dir()))?;
            let target = if tombstone {
                Some(PathBuf::from(TOMBSTONE_TARGET))
            } else {
                loaded_path.map(|p| absolute_path(&p)).transpose()?
            };

            let path = nmmeta::write(
                &dir,
                &uuid,
                target.as_deref(),
                relative,
                shadowed_storage.as_deref(),
            )?;
            nmkeyfile_config::log_cli_debug!(
                "Record updated",
                path = tracing::field::display(path.display()),
                deleted = target.is_none(),
            );
            println!("{}", path.display());
            Ok(())
        }
    }
}
