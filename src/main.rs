//! proxmox-mcp CLI - configuration and master key administration
//!
//! Run `proxmox-mcp --help` for usage information.

use clap::{Args, Parser, Subcommand};
use proxmox_mcp::config::{
    encrypt_config_file, encryption_status, read_document, resolve_config_path, ConfigLoader,
    LogFormat, LoggingConfig,
};
use proxmox_mcp::crypto::{write_key_file, KeyProvider, KeySourceConfig, MasterKey};
use proxmox_mcp::rotation::{self, RotationPlan};
use proxmox_mcp::storage::StorageError;
use proxmox_mcp::ProxmoxMcpError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

#[derive(Parser)]
#[command(
    name = "proxmox-mcp",
    about = "Manage the Proxmox MCP server's configuration and its encrypted API token",
    version
)]
struct Cli {
    /// Configuration file path (defaults to $PROXMOX_MCP_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log output format (overrides `log_format` in the configuration)
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration as the server would and print a redacted summary
    Check {
        #[command(flatten)]
        key: KeyArgs,
    },

    /// Generate a new master key and write it to a file
    GenerateKey {
        /// Where to write the key (defaults to ~/.proxmox_mcp_key)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing key file
        #[arg(short, long)]
        force: bool,
    },

    /// Write an encrypted copy of a plaintext configuration
    Encrypt {
        /// Output path (defaults to <name>.encrypted.json)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        key: KeyArgs,
    },

    /// Report whether the configuration's token is encrypted
    Status,

    /// Re-encrypt the configuration under a new master key
    Rotate {
        #[command(flatten)]
        old: OldKeyArgs,

        #[command(flatten)]
        new: NewKeyArgs,

        /// Generate the new key and write it here before rotating
        #[arg(long, conflicts_with_all = ["new_key_env", "new_key_file", "new_key_prompt"])]
        generate_new_key: Option<PathBuf>,

        /// Directory for the pre-rotation copy (defaults to beside the configuration)
        #[arg(long)]
        backup_dir: Option<PathBuf>,
    },

    /// Rotate every configuration file under a directory
    RotateAll {
        /// Directory to search for *.json configurations
        dir: PathBuf,

        #[command(flatten)]
        old: OldKeyArgs,

        #[command(flatten)]
        new: NewKeyArgs,
    },

    /// Delete a rotation backup after confirming the new key works
    Confirm {
        /// Backup path printed by `rotate`
        backup: PathBuf,
    },
}

/// Master key source for commands that need one key
#[derive(Args)]
struct KeyArgs {
    /// Read the master key from this environment variable
    #[arg(long)]
    key_env: Option<String>,

    /// Read the master key from this file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Prompt for the master key
    #[arg(long)]
    key_prompt: bool,
}

#[derive(Args)]
struct OldKeyArgs {
    /// Read the current master key from this environment variable
    #[arg(long)]
    old_key_env: Option<String>,

    /// Read the current master key from this file
    #[arg(long)]
    old_key_file: Option<PathBuf>,

    /// Prompt for the current master key
    #[arg(long)]
    old_key_prompt: bool,
}

#[derive(Args)]
struct NewKeyArgs {
    /// Read the new master key from this environment variable
    #[arg(long)]
    new_key_env: Option<String>,

    /// Read the new master key from this file
    #[arg(long)]
    new_key_file: Option<PathBuf>,

    /// Prompt for the new master key
    #[arg(long)]
    new_key_prompt: bool,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

/// Only the sources named on the command line, or `None` when none were
fn key_sources(env: Option<String>, file: Option<PathBuf>, prompt: bool) -> Option<KeySourceConfig> {
    if env.is_none() && file.is_none() && !prompt {
        return None;
    }
    Some(KeySourceConfig {
        env_var: env,
        key_file: file,
        interactive: prompt,
        ..KeySourceConfig::default()
    })
}

impl KeyArgs {
    fn sources(self) -> Option<KeySourceConfig> {
        key_sources(self.key_env, self.key_file, self.key_prompt)
    }
}

impl OldKeyArgs {
    fn sources(self) -> KeySourceConfig {
        key_sources(self.old_key_env, self.old_key_file, self.old_key_prompt).unwrap_or_default()
    }
}

impl NewKeyArgs {
    fn sources(self) -> Option<KeySourceConfig> {
        key_sources(self.new_key_env, self.new_key_file, self.new_key_prompt)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logging settings come from the document when it can be read, flags win
    let document_logging = match resolve_config_path(cli.config.as_deref()) {
        Ok(path) => read_document(&path).await.ok().map(|doc| doc.logging().clone()),
        Err(_) => None,
    };
    init_logging(&cli, document_logging.unwrap_or_default())?;

    run(cli).await?;
    Ok(())
}

fn init_logging(cli: &Cli, logging: LoggingConfig) -> Result<(), ProxmoxMcpError> {
    let log_level = match cli.verbose {
        0 => logging.level.parse::<Level>().unwrap_or(Level::INFO),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env().add_directive(log_level.into());

    // stdout carries command output
    let (writer, ansi) = match &logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(StorageError::from)?;
            (BoxMakeWriter::new(Arc::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let layer = match cli.log_format.unwrap_or(logging.format) {
        LogFormat::Json => fmt::layer().json().with_writer(writer).boxed(),
        LogFormat::Pretty => fmt::layer().with_ansi(ansi).with_writer(writer).boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ProxmoxMcpError> {
    match cli.command {
        Commands::Check { key } => {
            let mut loader = ConfigLoader::new();
            if let Some(sources) = key.sources() {
                loader = loader.with_key_sources(sources);
            }
            let config = loader.load_default(cli.config.as_deref()).await?;

            println!("Configuration OK");
            println!("  Host:        {}:{}", config.host(), config.port());
            println!("  Service:     {}", config.service());
            println!("  User:        {}", config.user());
            println!("  Token name:  {}", config.token_name());
            println!(
                "  Token:       {}",
                if config.token_was_encrypted() { "encrypted" } else { "PLAINTEXT" }
            );
            println!("  Verify TLS:  {}", config.verify_ssl());
            println!("  Log level:   {}", config.logging().level);
        }

        Commands::GenerateKey { output, force } => {
            let path = output.unwrap_or_else(KeySourceConfig::default_key_file);
            let key = MasterKey::generate();
            write_key_file(&path, &key, force).await?;

            println!("Master key written to {}", path.display());
            println!("Keep a copy somewhere safe; encrypted configurations cannot be recovered without it.");
        }

        Commands::Encrypt { output, key } => {
            let path = resolve_config_path(cli.config.as_deref())?;
            let sources = match key.sources() {
                Some(sources) => sources,
                None => read_document(&path).await?.key_sources().cloned().unwrap_or_default(),
            };
            let master = KeyProvider::new(sources).resolve_key().await?;
            let written = encrypt_config_file(&path, output.as_deref(), &master).await?;

            println!("Encrypted configuration written to {}", written.display());
            println!("Review it, then replace {} with it.", path.display());
        }

        Commands::Status => {
            let path = resolve_config_path(cli.config.as_deref())?;
            let status = encryption_status(&path).await?;
            println!("{}: token {}", path.display(), status);
        }

        Commands::Rotate {
            old,
            new,
            generate_new_key,
            backup_dir,
        } => {
            let path = resolve_config_path(cli.config.as_deref())?;
            let old = old.sources();

            let new = match generate_new_key {
                Some(key_path) => {
                    write_key_file(&key_path, &MasterKey::generate(), false).await?;
                    info!(path = %key_path.display(), "Generated new master key");
                    KeySourceConfig::file(key_path)
                }
                None => new.sources().ok_or_else(|| {
                    ProxmoxMcpError::InvalidRequest(
                        "a new key source is required (--new-key-env, --new-key-file, --new-key-prompt or --generate-new-key)"
                            .to_string(),
                    )
                })?,
            };

            let mut plan = RotationPlan::new(&path, old, new.clone());
            if let Some(dir) = backup_dir {
                if let Some(name) = plan.backup_path.file_name().map(|n| n.to_os_string()) {
                    plan = plan.with_backup_path(dir.join(name));
                }
            }

            let result = plan.execute().await;
            if let Some(error) = result.error {
                return Err(error.into());
            }

            report_rotation(&path, result.backup_path.as_deref());
            if let Some(file) = &new.key_file {
                println!("New master key: {}", file.display());
            }
        }

        Commands::RotateAll { dir, old, new } => {
            let new = new.sources().ok_or_else(|| {
                ProxmoxMcpError::InvalidRequest(
                    "a new key source is required (--new-key-env, --new-key-file or --new-key-prompt)"
                        .to_string(),
                )
            })?;
            let results = rotation::rotate_all(&dir, &old.sources(), &new).await?;

            let mut failed = 0;
            for (path, result) in &results {
                match &result.error {
                    Some(error) => {
                        failed += 1;
                        println!("FAILED  {}: {}", path.display(), error);
                    }
                    None => report_rotation(path, result.backup_path.as_deref()),
                }
            }

            println!("{} file(s), {} failed", results.len(), failed);
            if failed > 0 {
                return Err(ProxmoxMcpError::InvalidRequest(format!(
                    "{} rotation(s) failed",
                    failed
                )));
            }
        }

        Commands::Confirm { backup } => {
            rotation::confirm_rotation(&backup).await?;
            println!("Backup {} removed", backup.display());
        }
    }

    Ok(())
}

fn report_rotation(path: &Path, backup: Option<&Path>) {
    match backup {
        Some(backup) => {
            println!("ROTATED {}", path.display());
            println!("        backup: {}", backup.display());
            println!(
                "        run `proxmox-mcp confirm {}` once the server starts with the new key",
                backup.display()
            );
        }
        None => println!("SKIPPED {} (no encrypted fields)", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_rotate() {
        let cli = Cli::try_parse_from([
            "proxmox-mcp",
            "-c",
            "/etc/pmcp/config.json",
            "rotate",
            "--old-key-file",
            "/keys/old",
            "--generate-new-key",
            "/keys/new",
        ])
        .unwrap();

        match cli.command {
            Commands::Rotate { old, generate_new_key, .. } => {
                let old = old.sources();
                assert_eq!(old.key_file, Some(PathBuf::from("/keys/old")));
                assert_eq!(old.env_var, None);
                assert_eq!(generate_new_key, Some(PathBuf::from("/keys/new")));
            }
            _ => panic!("expected rotate"),
        }
    }

    #[test]
    fn test_generate_conflicts_with_new_source() {
        let parsed = Cli::try_parse_from([
            "proxmox-mcp",
            "rotate",
            "--new-key-env",
            "NEW",
            "--generate-new-key",
            "/keys/new",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_log_format_flag() {
        let cli = Cli::try_parse_from(["proxmox-mcp", "status", "--log-format", "json"]).unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));

        let cli = Cli::try_parse_from(["proxmox-mcp", "status"]).unwrap();
        assert_eq!(cli.log_format, None);

        assert!(Cli::try_parse_from(["proxmox-mcp", "status", "--log-format", "xml"]).is_err());
    }

    #[test]
    fn test_backup_dir_flag() {
        let cli = Cli::try_parse_from([
            "proxmox-mcp",
            "rotate",
            "--new-key-file",
            "/keys/new",
            "--backup-dir",
            "/var/backups/pmcp",
        ])
        .unwrap();

        match cli.command {
            Commands::Rotate { backup_dir, .. } => {
                assert_eq!(backup_dir, Some(PathBuf::from("/var/backups/pmcp")))
            }
            _ => panic!("expected rotate"),
        }
    }

    #[test]
    fn test_no_flags_means_default_sources() {
        assert!(key_sources(None, None, false).is_none());
    }
}
