use std::io;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::app::Backend;
use crate::cli::{OutputFormat, PrintArgs};
use crate::config::PrinterConfig;
use crate::error::PrinterError;
use crate::printer::{StdoutPrinter, TextPrinter, ensure_printable, json_text};
use crate::session::{PrintReceipt, PrinterSession};
use crate::terminal::TerminalClient;

use super::ui::{Painter, ReceiptView, Spinner};

/// Executes the `print` command.
///
/// Ctrl-C cancels a device print between frames.
#[instrument(
    skip(args, backend, config, out, terminal_client),
    level = "info",
    fields(stdout = args.stdout(), json = args.json(), ?output_format)
)]
pub(crate) async fn run<W>(
    args: &PrintArgs,
    backend: &Backend,
    config: PrinterConfig,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write + Send,
{
    let text = document_text(args)?;
    let receipt = if args.stdout() {
        let printer = StdoutPrinter::with_writer(config.render_config(), &mut *out)?;
        printer.print_text(&text).await?
    } else {
        let adapter = backend.adapter().await?;
        let label = config.device_filter().to_string();
        let session = PrinterSession::new(adapter, config)?;
        let spinner = Spinner::new(
            output_format == OutputFormat::Pretty && terminal_client.stderr_is_terminal(),
        );
        let result = spinner
            .with_spinner(&format!("Printing on {label}"), || {
                print_interruptibly(&session, &text)
            })
            .await;
        session.close().await;
        result?
    };
    info!(pages = receipt.pages(), rows = receipt.rows(), "print finished");

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(terminal_client.stdout_is_terminal());
            writeln!(out, "{}", ReceiptView::new(&receipt, &painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, &receipt)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

fn document_text(args: &PrintArgs) -> Result<String> {
    if !args.json() {
        return Ok(args.text().to_string());
    }
    let value: serde_json::Value =
        serde_json::from_str(args.text()).context("print --json expects a JSON document")?;
    Ok(json_text(&value)?)
}

async fn print_interruptibly(
    session: &PrinterSession,
    text: &str,
) -> Result<PrintReceipt, PrinterError> {
    ensure_printable(text)?;
    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted; cancelling print");
                cancel.cancel();
            }
        }
    });

    let result = session.print_text_with_cancellation(text, &cancel).await;
    interrupt.abort();
    result
}
