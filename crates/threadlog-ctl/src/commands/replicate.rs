//! `replicate`: merge another store into this one and manage replication
//! progress.

use std::path::PathBuf;

use clap::Subcommand;
use threadlog_store::{ReplicationRun, RunStop, StoreSource};

use super::{mode, print_json};
use crate::backend::{Backend, CtlStore};
use crate::config::CtlConfig;
use crate::error::CtlError;

/// Replication actions.
#[derive(Debug, Clone, Subcommand)]
pub enum ReplicateCommand {
    /// Pull every new event from a source store
    Run {
        /// Config file of the source store
        #[arg(long)]
        source: PathBuf,
        /// Events per replicated chunk
        #[arg(long, default_value_t = 200)]
        page_size: usize,
        /// Do not freeze and unfreeze the target around the run
        #[arg(long)]
        manual: bool,
    },
    /// Print the persisted replication state
    State,
    /// Stop replication runs at their next chunk
    Pause,
    /// Allow replication runs again
    Resume,
    /// Forget replication progress
    Reset,
}

/// Run a replication action against `store`.
pub async fn run(store: &CtlStore, command: ReplicateCommand) -> Result<(), CtlError> {
    let replication = store.replication();
    match command {
        ReplicateCommand::Run {
            source,
            page_size,
            manual,
        } => {
            if page_size == 0 {
                return Err(CtlError::Usage("page size must be positive".to_owned()));
            }
            let source_config = CtlConfig::from_file(&source)?;
            let source_backend = Backend::connect(&source_config).await?;
            let result = replicate_from_backend(
                store,
                &source_backend,
                &source_config,
                page_size,
                manual,
            )
            .await;
            source_backend.close().await;
            print_run(&result?)
        }
        ReplicateCommand::State => print_json(&replication.replication_state().await?),
        ReplicateCommand::Pause => {
            replication.pause().await?;
            tracing::info!("Replication paused");
            Ok(())
        }
        ReplicateCommand::Resume => {
            replication.resume().await?;
            tracing::info!("Replication resumed");
            Ok(())
        }
        ReplicateCommand::Reset => {
            replication.reset().await?;
            tracing::info!("Replication state reset");
            Ok(())
        }
    }
}

async fn replicate_from_backend(
    store: &CtlStore,
    source: &Backend,
    source_config: &CtlConfig,
    page_size: usize,
    manual: bool,
) -> Result<ReplicationRun, CtlError> {
    let storage = source.storage();
    let source = StoreSource::new(storage.as_ref(), source_config.store.thread_count);
    Ok(store
        .replication()
        .replicate_from(&source, page_size, mode(manual))
        .await?)
}

fn print_run(run: &ReplicationRun) -> Result<(), CtlError> {
    let stop = match run.stop {
        RunStop::Exhausted => "exhausted",
        RunStop::Paused => "paused",
    };
    print_json(&serde_json::json!({
        "chunks": run.chunks,
        "events": run.events,
        "stop": stop,
    }))
}
