//! # nmkeyfile CLI
//!
//! Command-line tool for inspecting and maintaining a keyfile profile store.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nmkeyfile::{reader, KeyfileWriter, PermissionPolicy, Profile, WriteRequest};
use nmkeyfile_config::logging::{init_logging, LogLevel};
use nmkeyfile_config::Config;

mod meta;

/// Keyfile connection profile store
#[derive(Parser)]
#[command(name = "nmkeyfile")]
#[command(version, about, long_about = None)]
struct Cli {
    /// More output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file to use instead of the system and user files
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read keyfiles the way the store does and print a summary
    Check {
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
    },

    /// Store a keyfile through the writer
    Write {
        /// Keyfile holding the profile to store
        #[arg(value_name = "KEYFILE")]
        keyfile: PathBuf,

        /// File currently holding the profile
        #[arg(long)]
        existing: Option<PathBuf>,

        /// Never modify or remove the existing file
        #[arg(long, requires = "existing")]
        read_only: bool,

        /// Pick a fresh name even when the existing file could be reused
        #[arg(long, requires = "existing")]
        force_rename: bool,

        /// Store into this directory instead of the configured one
        #[arg(long)]
        keyfile_dir: Option<PathBuf>,
    },

    /// Read or write `<uuid>.nmmeta` records
    Meta {
        #[command(subcommand)]
        command: meta::MetaCommands,
    },

    /// Drop generated `NM-*` interface names from netplan-generated profiles
    FixIfnames {
        /// Root directory (defaults to the configured one)
        #[arg(long)]
        root: Option<PathBuf>,
    },

    /// Show configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the built-in defaults
    Default,
}

fn main() -> Result<()> {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    let config = load_config(cli.config.as_deref())?;
    nmkeyfile_config::log_cli_debug!(
        "Configuration loaded",
        keyfile_dir = tracing::field::display(config.storage.keyfile_dir.display()),
        rootdir = tracing::field::display(config.storage.rootdir.display()),
    );

    match cli.command {
        Commands::Check { files } => cmd_check(&config, &files),
        Commands::Write {
            keyfile,
            existing,
            read_only,
            force_rename,
            keyfile_dir,
        } => cmd_write(
            &config,
            &keyfile,
            existing.as_deref(),
            read_only,
            force_rename,
            keyfile_dir,
        ),
        Commands::Meta { command } => meta::run(&config, command),
        Commands::FixIfnames { root } => {
            let root = root.unwrap_or_else(|| config.storage.rootdir.clone());
            let fixed = nmkeyfile::fix_interface_names(&root)
                .with_context(|| format!("Failed to fix profiles below {}", root.display()))?;
            println!("Fixed {} profile(s)", fixed);
            Ok(())
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                print!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigCommands::Default => {
                print!("{}", Config::default_toml());
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            let mut config = Config::load_from(path, None)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            config.apply_env_overrides();
            Ok(config)
        }
        None => Config::load().context("Failed to load configuration"),
    }
}

pub(crate) fn policy(config: &Config) -> PermissionPolicy {
    let policy = PermissionPolicy::new(config.security.resolved_service_uid());
    if config.security.check_owner {
        policy
    } else {
        policy.without_owner_check()
    }
}

fn cmd_check(config: &Config, files: &[PathBuf]) -> Result<()> {
    let policy = policy(config);
    let mut failed = 0;

    for path in files {
        match reader::read_from_file(path, &config.storage.profile_dir, &policy) {
            Ok(profile) => print_profile(path, &profile),
            Err(e) => {
                nmkeyfile_config::log_cli_error!(
                    "Cannot read keyfile",
                    path = tracing::field::display(path.display()),
                    error = tracing::field::display(&e),
                );
                println!("{}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} file(s) failed", failed, files.len());
    }
    Ok(())
}

fn print_profile(path: &Path, profile: &Profile) {
    println!("{}", path.display());
    println!("  id:       {}", profile.id().unwrap_or_default());
    println!("  uuid:     {}", profile.uuid().unwrap_or_default());
    if let Some(kind) = profile.get_str("connection", "type") {
        println!("  type:     {}", kind);
    }
    let settings: Vec<&str> = profile.settings().map(|(name, _)| name).collect();
    println!("  settings: {}", settings.join(", "));
}

fn cmd_write(
    config: &Config,
    keyfile: &Path,
    existing: Option<&Path>,
    read_only: bool,
    force_rename: bool,
    keyfile_dir: Option<PathBuf>,
) -> Result<()> {
    let text = fs::read_to_string(keyfile)
        .with_context(|| format!("Failed to read {}", keyfile.display()))?;
    let base_dir = keyfile.parent().unwrap_or(Path::new("."));
    let profile = reader::from_keyfile_data(&text, base_dir)
        .with_context(|| format!("Invalid profile in {}", keyfile.display()))?;

    let mut config = config.clone();
    if let Some(dir) = keyfile_dir {
        config.storage.profile_dir = dir.clone();
        config.storage.keyfile_dir = dir;
    }
    // No netplan library is linked into the tool, so nothing is projected.
    let writer = KeyfileWriter::from_config(&config, None);

    let mut req = WriteRequest::new(&profile).reread(true, true);
    if let Some(existing) = existing {
        req = req.existing(existing, read_only).force_rename(force_rename);
    }

    let out = writer.write(&req).with_context(|| {
        format!(
            "Failed to store profile in {}",
            writer.keyfile_dir().display()
        )
    })?;

    nmkeyfile_config::log_cli_debug!(
        "Profile stored",
        path = tracing::field::display(out.path.display()),
        reread_same = out.reread_same,
    );
    println!("{}", out.path.display());
    if !out.reread_same {
        println!("note: the stored profile reads back differently");
    }
    Ok(())
}
