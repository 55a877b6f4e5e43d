mod bitmap;
mod dither;
mod font;

use bon::Builder;
use image::{GrayImage, Luma};
use serde::Serialize;
use tracing::{debug, instrument};

pub use self::bitmap::BitmapImage;
pub use self::dither::DitherMode;
use self::font::{GLYPH_SIZE, glyph_exact, glyph_for, glyph_pixel};
use crate::error::RenderError;

pub(crate) const DEFAULT_PRINT_WIDTH_PX: u32 = 384;
const PAPER: Luma<u8> = Luma([255]);
const INK: Luma<u8> = Luma([0]);

/// Layout and rasterisation options.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Builder)]
pub struct RenderConfig {
    #[builder(default = DEFAULT_PRINT_WIDTH_PX)]
    width_px: u32,
    /// Integer magnification applied to the 8x8 glyphs.
    #[builder(default = 2)]
    glyph_scale: u32,
    /// Blank pixel rows below each text line.
    #[builder(default = 4)]
    line_spacing: u32,
    /// Blank pixel columns on each side of the text.
    #[builder(default = 8)]
    margin_px: u32,
    #[builder(default = 2_000)]
    max_rows_per_page: u32,
    #[builder(default = '?')]
    fallback_glyph: char,
    /// Luminance below which a pixel is inked in threshold mode.
    #[builder(default = 128)]
    threshold: u8,
    #[builder(default)]
    dither: DitherMode,
    #[builder(default = 4_096)]
    max_text_chars: usize,
    #[builder(default = 4)]
    tab_width: usize,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RenderConfig {
    #[must_use]
    pub fn width_px(&self) -> u32 {
        self.width_px
    }

    /// Returns a copy with a different print width.
    #[must_use]
    pub fn with_width_px(mut self, width_px: u32) -> Self {
        self.width_px = width_px;
        self
    }

    /// Height in pixels of one text line, spacing included.
    #[must_use]
    pub fn line_height(&self) -> u32 {
        GLYPH_SIZE * self.glyph_scale + self.line_spacing
    }

    fn cell_width(&self) -> u32 {
        GLYPH_SIZE * self.glyph_scale
    }

    /// Number of glyphs that fit on one line.
    #[must_use]
    pub fn columns(&self) -> usize {
        let printable = self.width_px.saturating_sub(2 * self.margin_px);
        match self.cell_width() {
            0 => 0,
            cell => (printable / cell) as usize,
        }
    }

    /// Checks that the options describe a printable layout.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] describing the first problem.
    pub fn validate(&self) -> Result<(), RenderError> {
        bitmap::validate_width(self.width_px)?;
        if self.glyph_scale == 0 {
            return Err(RenderError::invalid("glyph scale must be at least 1"));
        }
        if self.columns() == 0 {
            return Err(RenderError::invalid(format!(
                "a {}px glyph does not fit {}px with {}px margins",
                self.cell_width(),
                self.width_px,
                self.margin_px
            )));
        }
        if self.line_height() > self.max_rows_per_page {
            return Err(RenderError::invalid(format!(
                "line height {}px exceeds {} rows per page",
                self.line_height(),
                self.max_rows_per_page
            )));
        }
        if glyph_exact(self.fallback_glyph).is_none() {
            return Err(RenderError::invalid(format!(
                "fallback glyph {:?} is not in the font",
                self.fallback_glyph
            )));
        }
        if self.max_text_chars == 0 {
            return Err(RenderError::invalid("max text length must be at least 1"));
        }
        Ok(())
    }
}

/// Turns text into printer rasters.
#[derive(Debug, Clone)]
pub struct BitmapRenderer {
    config: RenderConfig,
}

impl BitmapRenderer {
    /// Creates a renderer after validating its options.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] for an unusable configuration.
    pub fn new(config: RenderConfig) -> Result<Self, RenderError> {
        config.validate()?;
        Ok(Self { config })
    }

    #[must_use]
    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    /// Word-wraps and rasterises `text` into one image per page.
    ///
    /// Empty text yields a single blank line.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] when the text exceeds the
    /// configured maximum length.
    ///
    /// ```
    /// use peripage::{BitmapRenderer, RenderConfig};
    ///
    /// let renderer = BitmapRenderer::new(RenderConfig::default())?;
    /// let pages = renderer.render("Hello")?;
    /// assert_eq!(1, pages.len());
    /// assert_eq!(384, pages[0].width_px());
    /// # Ok::<(), peripage::RenderError>(())
    /// ```
    #[instrument(skip(self, text), level = "debug", fields(chars = text.chars().count()))]
    pub fn render(&self, text: &str) -> Result<Vec<BitmapImage>, RenderError> {
        let char_count = text.chars().count();
        if char_count > self.config.max_text_chars {
            return Err(RenderError::invalid(format!(
                "text of {char_count} characters exceeds the {} character limit",
                self.config.max_text_chars
            )));
        }

        let lines = wrap_text(text, self.config.columns(), self.config.tab_width);
        let lines_per_page = (self.config.max_rows_per_page / self.config.line_height()).max(1);
        let pages = lines
            .chunks(lines_per_page as usize)
            .map(|page| self.render_page(page))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(lines = lines.len(), pages = pages.len(), "rendered text");
        Ok(pages)
    }

    /// Converts a grayscale image of the print width into a raster.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] when the image width differs from
    /// the print width or the image is empty.
    pub fn rasterize(&self, image: &GrayImage) -> Result<BitmapImage, RenderError> {
        if image.width() != self.config.width_px {
            return Err(RenderError::invalid(format!(
                "image width {}px does not match print width {}px",
                image.width(),
                self.config.width_px
            )));
        }

        let pixels: Vec<bool> = image
            .enumerate_pixels()
            .map(|(x, y, Luma([luma]))| self.config.dither.ink(x, y, *luma, self.config.threshold))
            .collect();
        BitmapImage::from_pixels(self.config.width_px, &pixels)
    }

    fn render_page(&self, lines: &[Vec<char>]) -> Result<BitmapImage, RenderError> {
        let line_height = self.config.line_height();
        let line_count = u32::try_from(lines.len())
            .map_err(|_| RenderError::invalid("page has too many lines"))?;
        let mut canvas =
            GrayImage::from_pixel(self.config.width_px, line_count * line_height, PAPER);

        for (row, line) in (0u32..).zip(lines) {
            for (column, ch) in (0u32..).zip(line) {
                let glyph = glyph_for(*ch, self.config.fallback_glyph);
                let origin_x = self.config.margin_px + column * self.config.cell_width();
                let origin_y = row * line_height;
                self.draw_glyph(&mut canvas, &glyph, origin_x, origin_y);
            }
        }

        self.rasterize(&canvas)
    }

    fn draw_glyph(&self, canvas: &mut GrayImage, glyph: &[u8; 8], origin_x: u32, origin_y: u32) {
        let scale = self.config.glyph_scale;
        for gy in 0..GLYPH_SIZE {
            for gx in 0..GLYPH_SIZE {
                if !glyph_pixel(glyph, gx, gy) {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = origin_x + gx * scale + dx;
                        let y = origin_y + gy * scale + dy;
                        if x < canvas.width() && y < canvas.height() {
                            canvas.put_pixel(x, y, INK);
                        }
                    }
                }
            }
        }
    }
}

/// Splits text into display lines of at most `columns` glyphs.
///
/// `\n` starts a new line, `\r` is dropped and tabs become `tab_width`
/// spaces. Leading indentation is kept. Words longer than a line are
/// hard-broken.
fn wrap_text(text: &str, columns: usize, tab_width: usize) -> Vec<Vec<char>> {
    let columns = columns.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let expanded: String = paragraph
            .chars()
            .filter(|ch| *ch != '\r')
            .flat_map(|ch| {
                let repeat = if ch == '\t' { tab_width } else { 1 };
                std::iter::repeat_n(if ch == '\t' { ' ' } else { ch }, repeat)
            })
            .collect();

        let body = expanded.trim_start_matches(' ');
        let mut line: Vec<char> = vec![' '; expanded.len() - body.len()];
        while line.len() > columns {
            let rest = line.split_off(columns);
            lines.push(std::mem::replace(&mut line, rest));
        }

        let mut started = false;
        for word in body.split(' ') {
            let mut word: Vec<char> = word.chars().collect();
            while line.len() + usize::from(started) + word.len() > columns {
                if started || line.len() >= columns {
                    lines.push(std::mem::take(&mut line));
                    started = false;
                    continue;
                }
                let rest = word.split_off(columns - line.len());
                line.extend(word);
                lines.push(std::mem::take(&mut line));
                word = rest;
            }
            if started {
                line.push(' ');
            }
            line.extend(word);
            started = true;
        }
        lines.push(line);
    }

    lines
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn renderer() -> BitmapRenderer {
        BitmapRenderer::new(RenderConfig::default()).expect("default config should be valid")
    }

    fn as_strings(lines: &[Vec<char>]) -> Vec<String> {
        lines.iter().map(|line| line.iter().collect()).collect()
    }

    #[test]
    fn hello_renders_one_line_image() {
        let config = RenderConfig::default();
        let pages = renderer().render("Hello").expect("text should render");

        assert_eq!(1, pages.len());
        assert_eq!(384, pages[0].width_px());
        assert_eq!(config.line_height(), pages[0].rows());
        assert!(!pages[0].is_blank());
    }

    #[rstest]
    #[case("".to_owned())]
    #[case("Hello".to_owned())]
    #[case("line one\nline two\r\n\tindented".to_owned())]
    #[case("Grüße aus Köln ✓".to_owned())]
    #[case("word ".repeat(300))]
    #[case("x".repeat(500))]
    fn rendered_images_satisfy_raster_invariants(#[case] text: String) {
        let pages = renderer().render(&text).expect("text should render");

        assert!(!pages.is_empty());
        for page in &pages {
            assert!(page.rows() >= 1);
            assert!(page.rows() <= 2_000);
            assert_eq!(page.rows() as usize * 48, page.bytes().len());
            let repacked =
                BitmapImage::from_pixels(page.width_px(), &page.pixels()).expect("pixels should pack");
            assert_eq!(page, &repacked);
        }
    }

    #[test]
    fn empty_text_yields_one_blank_line() {
        let pages = renderer().render("").expect("empty text should render");

        assert_eq!(1, pages.len());
        assert_eq!(RenderConfig::default().line_height(), pages[0].rows());
        assert!(pages[0].is_blank());
    }

    #[test]
    fn unknown_characters_render_fallback_glyph() {
        let unknown = renderer().render("漢").expect("text should render");
        let fallback = renderer().render("?").expect("text should render");

        assert_eq!(fallback, unknown);
    }

    #[test]
    fn rendering_is_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog";
        assert_eq!(renderer().render(text), renderer().render(text));
    }

    #[rstest]
    #[case("hello world", 5, vec!["hello", "world"])]
    #[case("hello world", 11, vec!["hello world"])]
    #[case("abcdefghij", 4, vec!["abcd", "efgh", "ij"])]
    #[case("ab\n\ncd", 10, vec!["ab", "", "cd"])]
    #[case("a\r\nb", 10, vec!["a", "b"])]
    #[case("\tx", 10, vec!["    x"])]
    #[case("to abcdefgh", 4, vec!["to", "abcd", "efgh"])]
    #[case("  a b", 10, vec!["  a b"])]
    #[case("      ab", 4, vec!["    ", "  ab"])]
    #[case("  abcdef", 4, vec!["  ab", "cdef"])]
    fn wrap_text_breaks_lines(
        #[case] text: &str,
        #[case] columns: usize,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(expected, as_strings(&wrap_text(text, columns, 4)));
    }

    #[test]
    fn indentation_reaches_the_raster() {
        let indented = renderer().render("{\n  \"a\": 1\n}");
        let flat = renderer().render("{\n\"a\": 1\n}");

        assert_ne!(flat, indented);
    }

    #[test]
    fn pages_hold_whole_lines_within_row_limit() {
        let config = RenderConfig::builder().max_rows_per_page(50).build();
        let renderer = BitmapRenderer::new(config).expect("config should be valid");

        let pages = renderer.render("1\n2\n3\n4\n5").expect("text should render");

        assert_eq!(vec![40, 40, 20], pages.iter().map(BitmapImage::rows).collect::<Vec<_>>());
    }

    #[test]
    fn oversized_text_is_rejected() {
        let config = RenderConfig::builder().max_text_chars(10).build();
        let renderer = BitmapRenderer::new(config).expect("config should be valid");

        assert_matches!(
            renderer.render("eleven char"),
            Err(RenderError::InvalidInput { .. })
        );
    }

    #[rstest]
    #[case(RenderConfig::builder().width_px(100).build())]
    #[case(RenderConfig::builder().glyph_scale(0).build())]
    #[case(RenderConfig::builder().width_px(16).build())]
    #[case(RenderConfig::builder().max_rows_per_page(10).build())]
    #[case(RenderConfig::builder().fallback_glyph('漢').build())]
    fn invalid_configs_are_rejected(#[case] config: RenderConfig) {
        assert_matches!(BitmapRenderer::new(config), Err(RenderError::InvalidInput { .. }));
    }

    #[test]
    fn rasterize_supports_ordered_dither() {
        let config = RenderConfig::builder()
            .width_px(8)
            .margin_px(0)
            .glyph_scale(1)
            .dither(DitherMode::Ordered)
            .build();
        let renderer = BitmapRenderer::new(config).expect("config should be valid");
        let gray = GrayImage::from_pixel(8, 8, Luma([128]));

        let raster = renderer.rasterize(&gray).expect("image should rasterize");

        assert_eq!(32, raster.pixels().iter().filter(|inked| **inked).count());
    }

    #[test]
    fn rasterize_rejects_mismatched_width() {
        let gray = GrayImage::from_pixel(100, 4, PAPER);
        assert_matches!(renderer().rasterize(&gray), Err(RenderError::InvalidInput { .. }));
    }
}
