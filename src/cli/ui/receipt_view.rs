use std::fmt::{self, Display, Formatter};

use crate::session::PrintReceipt;

use super::painter::Painter;

/// One-line summary of a finished print.
pub(crate) struct ReceiptView<'a> {
    receipt: &'a PrintReceipt,
    painter: &'a Painter,
}

impl<'a> ReceiptView<'a> {
    pub(crate) fn new(receipt: &'a PrintReceipt, painter: &'a Painter) -> Self {
        Self { receipt, painter }
    }
}

impl Display for ReceiptView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let pages = match self.receipt.pages() {
            1 => "1 page".to_string(),
            count => format!("{count} pages"),
        };
        let target = self
            .receipt
            .device()
            .map_or_else(|| "stand-in printer".to_string(), |device| device.label().to_string());
        write!(
            f,
            "{} Printed {pages} ({} rows) on {target}",
            self.painter.success("✓"),
            self.receipt.rows()
        )?;

        let frames = self.receipt.frames();
        if !frames.is_empty() {
            let retries: u32 = frames.iter().map(|frame| frame.attempts() - 1).sum();
            write!(
                f,
                " {}",
                self.painter
                    .muted(format!("[{} frames, {retries} retries]", frames.len()))
            )?;
        }
        if self.receipt.device().is_some() && !self.receipt.print_confirmed() {
            write!(f, " {}", self.painter.warning("(completion not reported)"))?;
        }
        Ok(())
    }
}
