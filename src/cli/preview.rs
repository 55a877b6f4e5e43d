use std::io;

use anyhow::Result;
use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::serde_as;
use tracing::instrument;

use crate::cli::{OutputFormat, PreviewArgs};
use crate::config::PrinterConfig;
use crate::render::{BitmapImage, BitmapRenderer};

use super::ui::{Painter, PreviewView};

#[serde_as]
#[derive(Debug, Serialize)]
struct PagePreview<'a> {
    width_px: u32,
    rows: u32,
    #[serde_as(as = "Hex")]
    bytes: &'a [u8],
}

impl<'a> From<&'a BitmapImage> for PagePreview<'a> {
    fn from(page: &'a BitmapImage) -> Self {
        Self {
            width_px: page.width_px(),
            rows: page.rows(),
            bytes: page.bytes(),
        }
    }
}

/// Executes the `preview` command. Nothing is sent to a printer.
#[instrument(skip(args, config, out), level = "info", fields(?output_format))]
pub(crate) fn run<W>(
    args: &PreviewArgs,
    config: &PrinterConfig,
    out: &mut W,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let renderer = BitmapRenderer::new(config.render_config())?;
    let pages = renderer.render(args.text())?;

    match output_format {
        OutputFormat::Pretty => {
            let painter = Painter::new(false);
            write!(out, "{}", PreviewView::new(&pages, &painter))?;
        }
        OutputFormat::Json => {
            let previews: Vec<PagePreview<'_>> = pages.iter().map(PagePreview::from).collect();
            serde_json::to_writer_pretty(&mut *out, &previews)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
