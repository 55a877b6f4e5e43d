use std::fmt::{self, Display, Formatter};

use crate::render::BitmapImage;

use super::painter::Painter;

/// Draws rasters as text, one character per pixel.
pub(crate) struct PreviewView<'a> {
    pages: &'a [BitmapImage],
    painter: &'a Painter,
}

impl<'a> PreviewView<'a> {
    pub(crate) fn new(pages: &'a [BitmapImage], painter: &'a Painter) -> Self {
        Self { pages, painter }
    }
}

impl Display for PreviewView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let total = self.pages.len();
        for (index, page) in self.pages.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(
                f,
                "{}",
                self.painter.heading(format!(
                    "page {}/{total} ({}x{})",
                    index + 1,
                    page.width_px(),
                    page.rows()
                ))
            )?;
            for y in 0..page.rows() {
                let line: String = (0..page.width_px())
                    .map(|x| self.painter.ink(page.pixel(x, y)))
                    .collect();
                writeln!(f, "{}", line.trim_end_matches(['.', ' ']))?;
            }
        }
        Ok(())
    }
}
