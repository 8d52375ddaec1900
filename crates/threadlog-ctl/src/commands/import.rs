//! `import`: load a file produced by `export` back into a store.

use std::path::PathBuf;

use threadlog_store::ImportSummary;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{mode, print_json};
use crate::backend::CtlStore;
use crate::error::CtlError;

/// Bytes read from the input per push.
const READ_CHUNK: usize = 64 * 1024;

/// Arguments of the import command.
#[derive(Debug, Clone, clap::Args)]
pub struct ImportArgs {
    /// Input file, or `-` for stdin
    pub input: PathBuf,
    /// Do not freeze and unfreeze the store around the import
    #[arg(long)]
    pub manual: bool,
}

/// Run the import command.
pub async fn run(store: &CtlStore, args: ImportArgs) -> Result<(), CtlError> {
    let mut input: Box<dyn AsyncRead + Unpin + Send> = if args.input.as_os_str() == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(tokio::fs::File::open(&args.input).await?)
    };

    let summary = import_from(store, args.manual, &mut input).await?;
    print_json(&serde_json::json!({
        "events": summary.events,
        "batches": summary.batches,
    }))
}

/// Feed everything readable from `input` to a fresh importer.
pub async fn import_from<R: AsyncRead + Unpin + ?Sized>(
    store: &CtlStore,
    manual: bool,
    input: &mut R,
) -> Result<ImportSummary, CtlError> {
    let mut importer = store.import(mode(manual)).await?;
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        let read = match input.read(&mut buf).await {
            Ok(read) => read,
            Err(e) => {
                // A read failure is invisible to the importer; release the freeze here.
                store.maintenance(mode(manual)).end_quietly().await;
                return Err(e.into());
            }
        };
        let Some(chunk) = buf.get(..read) else {
            break;
        };
        if chunk.is_empty() {
            break;
        }
        importer.push(chunk).await?;
    }
    Ok(importer.finish().await?)
}
