//! StudySync CLI
//!
//! Operator tools for a StudySync store directory.
//!
//! # Commands
//!
//! - `counts` - Records per app table
//! - `status` - Pending outbox entries and unresolved conflicts
//! - `backup export|save|rotate|validate|import|estimate|sample` - Snapshot tools

mod commands;

use clap::{Parser, Subcommand};
use commands::Format;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// StudySync store and backup tools.
#[derive(Parser)]
#[command(name = "studysync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the number of records per app table
    Counts {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show pending changes and conflicts
    Status {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Backup and restore tools
    #[command(subcommand)]
    Backup(BackupCommand),

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum BackupCommand {
    /// Write a backup file
    Export {
        /// Output file
        output: PathBuf,
        /// Encrypt with this password
        #[arg(long)]
        password: Option<String>,
    },

    /// Save a backup into a directory and rotate old ones
    Save {
        /// Backup directory
        dir: PathBuf,
        /// Encrypt with this password
        #[arg(long)]
        password: Option<String>,
        /// Snapshots to keep
        #[arg(short, long, default_value_t = 10)]
        retention: usize,
    },

    /// Delete the oldest snapshots in a directory
    Rotate {
        /// Backup directory
        dir: PathBuf,
        /// Snapshots to keep
        #[arg(short, long, default_value_t = 10)]
        retention: usize,
    },

    /// Check a backup file without importing it
    Validate {
        /// Backup file
        file: PathBuf,
        /// Password for encrypted backups
        #[arg(long)]
        password: Option<String>,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Restore a backup file
    Import {
        /// Backup file
        file: PathBuf,
        /// Wipe app tables instead of merging
        #[arg(long)]
        replace: bool,
        /// Password for encrypted backups
        #[arg(long)]
        password: Option<String>,
        /// Take the incoming version of a conflicting record (table/id)
        #[arg(long = "take-incoming", value_name = "TABLE/ID")]
        take_incoming: Vec<String>,
        /// Keep the local version of a conflicting record (table/id)
        #[arg(long = "keep-local", value_name = "TABLE/ID")]
        keep_local: Vec<String>,
    },

    /// Count what a merge import would change
    Estimate {
        /// Backup file
        file: PathBuf,
        /// Password for encrypted backups
        #[arg(long)]
        password: Option<String>,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Show sample record diffs of a merge import
    Sample {
        /// Backup file
        file: PathBuf,
        /// Number of diffs
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        /// Password for encrypted backups
        #[arg(long)]
        password: Option<String>,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store_path = || cli.path.clone().ok_or("Store path required (--path)");

    match cli.command {
        Commands::Counts { format } => commands::counts::run(&store_path()?, format)?,
        Commands::Status { format } => commands::status::run(&store_path()?, format)?,
        Commands::Backup(command) => match command {
            BackupCommand::Export { output, password } => {
                commands::backup::export(&store_path()?, &output, password.as_deref())?;
            }
            BackupCommand::Save {
                dir,
                password,
                retention,
            } => {
                commands::backup::save(&store_path()?, &dir, password.as_deref(), retention)?;
            }
            BackupCommand::Rotate { dir, retention } => {
                commands::backup::rotate(&dir, retention)?;
            }
            BackupCommand::Validate {
                file,
                password,
                format,
            } => {
                commands::backup::validate(&file, password.as_deref(), format)?;
            }
            BackupCommand::Import {
                file,
                replace,
                password,
                take_incoming,
                keep_local,
            } => {
                commands::backup::import(
                    &store_path()?,
                    &file,
                    replace,
                    password.as_deref(),
                    &take_incoming,
                    &keep_local,
                )?;
            }
            BackupCommand::Estimate {
                file,
                password,
                format,
            } => {
                commands::backup::estimate(&store_path()?, &file, password.as_deref(), format)?;
            }
            BackupCommand::Sample {
                file,
                limit,
                password,
                format,
            } => {
                commands::backup::sample(
                    &store_path()?,
                    &file,
                    limit,
                    password.as_deref(),
                    format,
                )?;
            }
        },
        Commands::Version => {
            println!("StudySync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
