//! `export`: stream the store into a newline-delimited JSON file.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use threadlog_store::{ExportOptions, Termination};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{mode, print_json};
use crate::backend::CtlStore;
use crate::error::CtlError;

/// Arguments of the export command.
#[derive(Debug, Clone, clap::Args)]
pub struct ExportArgs {
    /// Output file, or `-` for stdout
    pub output: PathBuf,
    /// Resume after this cursor (from a previous export)
    #[arg(long)]
    pub cursor: Option<String>,
    /// Stop before writing more than this many bytes
    #[arg(long)]
    pub buffer_size: Option<u64>,
    /// Do not freeze and unfreeze the store around the export
    #[arg(long)]
    pub manual: bool,
    /// Stop cooperatively after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

/// Printed once the export stops.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    /// Cursor to resume from.
    pub cursor: String,
    /// Why the export stopped.
    pub termination: &'static str,
    /// Bytes written.
    pub bytes: u64,
}

const fn termination_name(termination: Option<Termination>) -> &'static str {
    match termination {
        Some(Termination::Overflow) => "overflow",
        Some(Termination::End) => "end",
        Some(Termination::Timeout) => "timeout",
        None => "incomplete",
    }
}

/// Run the export command.
pub async fn run(store: &CtlStore, args: ExportArgs) -> Result<(), CtlError> {
    let maintenance_mode = mode(args.manual);
    let mut out: Box<dyn AsyncWrite + Unpin + Send> = if args.output.as_os_str() == "-" {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(&args.output).await?)
    };

    let options = ExportOptions {
        cursor: args.cursor,
        maintenance_mode,
        buffer_size: args.buffer_size,
    };
    let report = export_to(store, options, args.timeout_secs, &mut out).await;
    let report = match report {
        Ok(report) => report,
        Err(CtlError::Io(e)) => {
            // The stream never saw the failure, so it still holds the freeze.
            store.maintenance(maintenance_mode).end_quietly().await;
            return Err(CtlError::Io(e));
        }
        Err(e) => return Err(e),
    };

    tracing::info!(
        cursor = report.cursor,
        termination = report.termination,
        bytes = report.bytes,
        "Export written"
    );
    if args.output.as_os_str() != "-" {
        print_json(&report)?;
    }
    Ok(())
}

/// Write every chunk of an export to `out`.
pub async fn export_to<W: AsyncWrite + Unpin + ?Sized>(
    store: &CtlStore,
    options: ExportOptions,
    timeout_secs: Option<u64>,
    out: &mut W,
) -> Result<ExportReport, CtlError> {
    let mut export = store.export(options)?;

    let timer = timeout_secs.map(|secs| {
        let signal = export.timeout_signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            signal.trigger();
        })
    });

    let written = async {
        while let Some(chunk) = export.next_chunk().await? {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        Ok::<_, CtlError>(())
    }
    .await;

    if let Some(timer) = timer {
        timer.abort();
    }
    written?;

    Ok(ExportReport {
        cursor: export.cursor().encode(),
        termination: termination_name(export.termination()),
        bytes: export.emitted_bytes(),
    })
}
