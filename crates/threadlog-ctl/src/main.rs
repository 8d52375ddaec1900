//! Operator CLI for threadlog event stores.
//!
//! Loads a YAML configuration, opens the configured backend (`PostgreSQL`
//! or a Data API endpoint behind a resource pool) and runs one command
//! against it.
//!
//! # Commands
//!
//! ```text
//! init | drop --yes            schema management
//! freeze | unfreeze | status   maintenance flag and progress
//! export <file>                stream events to NDJSON (resumable cursor)
//! import <file>                load an export back in
//! replicate run|state|...      merge another store, manage progress
//! ```

mod backend;
mod commands;
mod config;
mod error;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::backend::Backend;
use crate::commands::export::ExportArgs;
use crate::commands::import::ImportArgs;
use crate::commands::replicate::ReplicateCommand;
use crate::config::{CtlConfig, LoggingConfig};
use crate::error::CtlError;

#[derive(Parser)]
#[command(name = "threadlog-ctl")]
#[command(about = "Manage, export, import and replicate threadlog event stores")]
struct Cli {
    /// YAML configuration file (defaults plus environment when omitted)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the event store tables
    Init,
    /// Drop every table of the event store
    Drop {
        /// Confirm the drop
        #[arg(long)]
        yes: bool,
    },
    /// Mark the store as under maintenance
    Freeze,
    /// Clear the maintenance mark
    Unfreeze,
    /// Print maintenance and replication status
    Status,
    /// Export events as newline-delimited JSON
    Export(ExportArgs),
    /// Import a previous export
    Import(ImportArgs),
    /// Replicate from another store
    #[command(subcommand)]
    Replicate(ReplicateCommand),
}

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, the backend connection or the command
/// fails.
#[tokio::main]
async fn main() -> Result<(), CtlError> {
    let cli = Cli::parse();
    let mut config = CtlConfig::load(cli.config.as_deref())?;
    if cli.log_json {
        config.logging.json = true;
    }
    init_logging(&config.logging)?;

    tracing::info!(
        backend = ?config.backend.kind,
        events = config.tables.events,
        thread_count = config.store.thread_count,
        "configuration loaded"
    );

    let backend = Backend::connect(&config).await?;
    let result = run(&backend, &config, cli.command).await;
    backend.close().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "command failed");
    }
    result
}

async fn run(backend: &Backend, config: &CtlConfig, command: Command) -> Result<(), CtlError> {
    let store = backend.store(config)?;
    match command {
        Command::Init => commands::init(&store).await,
        Command::Drop { yes } => commands::drop_tables(&store, yes).await,
        Command::Freeze => commands::freeze(&store).await,
        Command::Unfreeze => commands::unfreeze(&store).await,
        Command::Status => commands::status(&store).await,
        Command::Export(args) => commands::export::run(&store, args).await,
        Command::Import(args) => commands::import::run(&store, args).await,
        Command::Replicate(command) => commands::replicate::run(&store, command).await,
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), CtlError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .map_err(|e| CtlError::Logging(e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| CtlError::Logging(e.to_string()))
}
