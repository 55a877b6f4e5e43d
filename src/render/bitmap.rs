use crate::error::RenderError;

/// A 1-bit raster in the printer's native format.
///
/// Rows are packed MSB-first: bit 7 of the first byte is the leftmost pixel.
/// A set bit is ink.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BitmapImage {
    width_px: u32,
    rows: u32,
    bytes: Vec<u8>,
}

impl BitmapImage {
    /// Wraps packed raster bytes.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] when the width is not a non-zero
    /// multiple of 8, there are no rows, or the byte length disagrees with
    /// the dimensions.
    pub fn new(width_px: u32, rows: u32, bytes: Vec<u8>) -> Result<Self, RenderError> {
        validate_width(width_px)?;
        if rows == 0 {
            return Err(RenderError::invalid("bitmap must contain at least one row"));
        }
        let expected = packed_len(width_px, rows)
            .ok_or_else(|| RenderError::invalid("bitmap dimensions overflow"))?;
        if bytes.len() != expected {
            return Err(RenderError::invalid(format!(
                "bitmap of {width_px}x{rows} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }

        Ok(Self {
            width_px,
            rows,
            bytes,
        })
    }

    /// Packs a row-major pixel grid.
    ///
    /// # Errors
    ///
    /// Returns [`RenderError::InvalidInput`] when the width is invalid or the
    /// pixel count is not a non-zero multiple of the width.
    ///
    /// ```
    /// use peripage::BitmapImage;
    ///
    /// let mut pixels = vec![false; 16];
    /// pixels[0] = true;
    /// pixels[9] = true;
    /// let image = BitmapImage::from_pixels(8, &pixels)?;
    /// assert_eq!(&[0x80, 0x40], image.bytes());
    /// # Ok::<(), peripage::RenderError>(())
    /// ```
    pub fn from_pixels(width_px: u32, pixels: &[bool]) -> Result<Self, RenderError> {
        validate_width(width_px)?;
        let width = width_px as usize;
        if pixels.is_empty() || !pixels.len().is_multiple_of(width) {
            return Err(RenderError::invalid(format!(
                "{} pixels do not form whole rows of {width_px}",
                pixels.len()
            )));
        }
        let rows = u32::try_from(pixels.len() / width)
            .map_err(|_| RenderError::invalid("bitmap has too many rows"))?;

        let bytes = pixels.chunks(width).flat_map(pack_row).collect();
        Self::new(width_px, rows, bytes)
    }

    #[must_use]
    pub fn width_px(&self) -> u32 {
        self.width_px
    }

    #[must_use]
    pub fn rows(&self) -> u32 {
        self.rows
    }

    #[must_use]
    pub fn bytes_per_row(&self) -> usize {
        (self.width_px / 8) as usize
    }

    /// Returns the packed raster.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Returns whether the pixel at (`x`, `y`) is inked.
    #[must_use]
    pub fn pixel(&self, x: u32, y: u32) -> bool {
        if x >= self.width_px || y >= self.rows {
            return false;
        }
        let index = y as usize * self.bytes_per_row() + (x / 8) as usize;
        self.bytes[index] & (0x80 >> (x % 8)) != 0
    }

    /// Unpacks the raster into a row-major pixel grid.
    #[must_use]
    pub fn pixels(&self) -> Vec<bool> {
        self.bytes
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| byte & (0x80 >> bit) != 0))
            .collect()
    }

    /// Returns whether no pixel is inked.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(|byte| *byte == 0)
    }

    /// Renders the raster as text, `#` for ink and `.` for paper.
    #[must_use]
    pub fn to_ascii(&self) -> String {
        let width = self.width_px as usize;
        self.pixels()
            .chunks(width)
            .map(|row| {
                row.iter()
                    .map(|inked| if *inked { '#' } else { '.' })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub(crate) fn validate_width(width_px: u32) -> Result<(), RenderError> {
    if width_px == 0 || !width_px.is_multiple_of(8) {
        return Err(RenderError::invalid(format!(
            "print width {width_px}px must be a non-zero multiple of 8"
        )));
    }
    Ok(())
}

fn packed_len(width_px: u32, rows: u32) -> Option<usize> {
    (width_px as usize / 8).checked_mul(rows as usize)
}

fn pack_row(row: &[bool]) -> Vec<u8> {
    row.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .filter(|(_, inked)| **inked)
                .fold(0u8, |byte, (bit, _)| byte | (0x80 >> bit))
        })
        .collect()
}
