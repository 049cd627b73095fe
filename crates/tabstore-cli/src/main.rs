//! tabstore CLI
//!
//! Command-line interface for tabstore - buckets of rows on a CKAN DataStore.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tabstore_core::{Config, Storage, StorageError, DEFAULT_WRITE_METHOD};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "tabstore")]
#[command(about = "tabstore - Tabular buckets on a CKAN DataStore")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// CKAN base URL (overrides config)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Only use resources of this dataset as buckets (overrides config)
    #[arg(long, global = true)]
    dataset: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List buckets
    #[command(alias = "ls")]
    Buckets,
    /// Show the schema of a bucket
    Describe {
        /// Bucket (resource id)
        bucket: String,
    },
    /// Read all rows of a bucket
    Read {
        /// Bucket (resource id)
        bucket: String,
    },
    /// Create buckets from schema files
    Create {
        /// Buckets to create
        #[arg(required = true)]
        buckets: Vec<String>,
        /// Schema file per bucket, in the same order
        #[arg(short, long = "schema", required = true)]
        schemas: Vec<PathBuf>,
        /// Replace buckets that already exist
        #[arg(long)]
        force: bool,
    },
    /// Delete buckets
    #[command(alias = "rm")]
    Delete {
        /// Buckets to delete
        buckets: Vec<String>,
        /// Delete every bucket
        #[arg(long)]
        all: bool,
        /// Stop quietly at the first bucket that doesn't exist
        #[arg(long)]
        ignore: bool,
    },
    /// Write rows from a JSON file
    Write {
        /// Bucket (resource id)
        bucket: String,
        /// JSON file holding an array of rows
        file: PathBuf,
        /// Write method: insert, upsert or update
        #[arg(short, long, default_value = DEFAULT_WRITE_METHOD)]
        method: String,
        /// Convert the rows but don't send them
        #[arg(long)]
        dry_run: bool,
    },
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (base_url, dataset_id, api_key, max_pages, timeout_secs)
        key: String,
        /// Configuration value
        value: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let result = run(cli, &output);
    if let Err(ref e) = result {
        if let Some(hint) = e
            .downcast_ref::<StorageError>()
            .and_then(StorageError::recovery_suggestion)
        {
            if !output.is_quiet() {
                eprintln!("hint: {}", hint);
            }
        }
    }
    result
}

fn run(cli: Cli, output: &Output) -> Result<()> {
    // Config doesn't need a connection
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), output);
    }

    let mut config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }
    if let Some(dataset) = cli.dataset {
        config.dataset_id = Some(dataset);
    }

    let mut storage = Storage::from_config(&config).context("Failed to set up storage")?;
    tracing::debug!("Using {}", storage);

    match cli.command {
        Commands::Buckets => commands::bucket::list(&mut storage, output),
        Commands::Describe { bucket } => commands::bucket::describe(&mut storage, &bucket, output),
        Commands::Read { bucket } => commands::rows::read(&mut storage, &bucket, output),
        Commands::Create {
            buckets,
            schemas,
            force,
        } => commands::bucket::create(&mut storage, buckets, &schemas, force, output),
        Commands::Delete {
            buckets,
            all,
            ignore,
        } => commands::bucket::delete(&mut storage, buckets, all, ignore, output),
        Commands::Write {
            bucket,
            file,
            method,
            dry_run,
        } => commands::rows::write(&mut storage, &bucket, &file, &method, dry_run, output),
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Log to stderr; RUST_LOG wins over the -v flags
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("tabstore_core={level},tabstore_cli={level}"))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
