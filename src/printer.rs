use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{info, instrument};

use crate::error::{ConnectionError, PrinterError, RenderError};
use crate::render::{BitmapRenderer, RenderConfig};
use crate::session::{PrintReceipt, PrinterSession};

/// Port through which callers print text, whatever the device behind it.
#[async_trait]
pub trait TextPrinter: Send + Sync {
    /// Prints `text`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] for empty text, and otherwise
    /// whatever the printer reports.
    async fn print_text(&self, text: &str) -> Result<PrintReceipt, PrinterError>;

    /// Pretty-prints a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] for `null` or when the value cannot
    /// be formatted, and otherwise the error of [`TextPrinter::print_text`].
    async fn print_json(&self, value: &serde_json::Value) -> Result<PrintReceipt, PrinterError> {
        let text = json_text(value)?;
        self.print_text(&text).await
    }
}

/// Pretty-prints `value` the way [`TextPrinter::print_json`] lays it out.
pub(crate) fn json_text(value: &serde_json::Value) -> Result<String, RenderError> {
    if value.is_null() {
        return Err(RenderError::invalid("JSON data cannot be null"));
    }
    serde_json::to_string_pretty(value)
        .map_err(|error| RenderError::invalid(format!("failed to format JSON: {error}")))
}

pub(crate) fn ensure_printable(text: &str) -> Result<(), RenderError> {
    if text.is_empty() {
        return Err(RenderError::invalid("text cannot be empty"));
    }
    Ok(())
}

#[async_trait]
impl TextPrinter for PrinterSession {
    async fn print_text(&self, text: &str) -> Result<PrintReceipt, PrinterError> {
        ensure_printable(text)?;
        PrinterSession::print_text(self, text).await
    }
}

/// Stand-in printer that writes text to a terminal instead of paper.
///
/// The text is still rendered so layout limits apply as they would on the
/// device.
pub struct StdoutPrinter<W = io::Stdout> {
    renderer: BitmapRenderer,
    out: Mutex<W>,
}

impl<W> std::fmt::Debug for StdoutPrinter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdoutPrinter")
            .field("renderer", &self.renderer)
            .finish_non_exhaustive()
    }
}

impl StdoutPrinter {
    /// Creates a printer writing to standard output.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] for unusable render options.
    pub fn new(config: RenderConfig) -> Result<Self, RenderError> {
        Self::with_writer(config, io::stdout())
    }
}

impl<W: Write> StdoutPrinter<W> {
    /// Creates a printer writing to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] for unusable render options.
    pub fn with_writer(config: RenderConfig, out: W) -> Result<Self, RenderError> {
        Ok(Self {
            renderer: BitmapRenderer::new(config)?,
            out: Mutex::new(out),
        })
    }

    fn write_text(&self, text: &str) -> io::Result<()> {
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{text}")?;
        out.flush()
    }
}

#[async_trait]
impl<W: Write + Send> TextPrinter for StdoutPrinter<W> {
    #[instrument(skip(self, text), level = "info", fields(chars = text.chars().count()))]
    async fn print_text(&self, text: &str) -> Result<PrintReceipt, PrinterError> {
        ensure_printable(text)?;
        let pages = self.renderer.render(text)?;

        info!("stand-in printer output begins");
        self.write_text(text)
            .map_err(|error| ConnectionError::Dropped {
                detail: format!("stand-in output failed: {error}"),
            })?;
        info!("stand-in printer output ends");

        let rows = pages.iter().map(|page| page.rows()).sum();
        Ok(PrintReceipt::new(None, pages.len(), rows))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().expect("buffer lock").clone()).expect("utf-8 output")
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("buffer lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn printer() -> (StdoutPrinter<SharedBuffer>, SharedBuffer) {
        let buffer = SharedBuffer::default();
        let printer = StdoutPrinter::with_writer(RenderConfig::default(), buffer.clone())
            .expect("default render config should be valid");
        (printer, buffer)
    }

    #[tokio::test]
    async fn stdout_printer_writes_text() {
        let (printer, buffer) = printer();

        let receipt = printer.print_text("Hello").await.expect("print should succeed");

        assert_eq!("Hello\n", buffer.contents());
        assert_eq!(1, receipt.pages());
        assert_eq!(None, receipt.device());
    }

    #[tokio::test]
    async fn empty_text_is_rejected_at_the_port() {
        let (printer, buffer) = printer();

        let result = printer.print_text("").await;

        assert_matches!(result, Err(PrinterError::Render(RenderError::InvalidInput { .. })));
        assert_eq!("", buffer.contents());
    }

    #[tokio::test]
    async fn print_json_pretty_prints() {
        let (printer, buffer) = printer();

        printer
            .print_json(&json!({"title": "Receipt"}))
            .await
            .expect("print should succeed");

        assert_eq!("{\n  \"title\": \"Receipt\"\n}\n", buffer.contents());
    }

    #[tokio::test]
    async fn print_json_rejects_null() {
        let (printer, _buffer) = printer();

        assert_matches!(
            printer.print_json(&serde_json::Value::Null).await,
            Err(PrinterError::Render(RenderError::InvalidInput { .. }))
        );
    }
}
