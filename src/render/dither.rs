use serde_with::SerializeDisplay;

/// Bayer 8x8 threshold matrix, values `0..64`.
const BAYER8: [[u8; 8]; 8] = [
    [0, 32, 8, 40, 2, 34, 10, 42],
    [48, 16, 56, 24, 50, 18, 58, 26],
    [12, 44, 4, 36, 14, 46, 6, 38],
    [60, 28, 52, 20, 62, 30, 54, 22],
    [3, 35, 11, 43, 1, 33, 9, 41],
    [51, 19, 59, 27, 49, 17, 57, 25],
    [15, 47, 7, 39, 13, 45, 5, 37],
    [63, 31, 55, 23, 61, 29, 53, 21],
];

/// How grayscale pixels become ink.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default, derive_more::Display, SerializeDisplay)]
pub enum DitherMode {
    /// Ink every pixel darker than the luminance threshold.
    #[default]
    #[display("threshold")]
    Threshold,
    /// Bayer 8x8 ordered dithering.
    #[display("ordered")]
    Ordered,
}

impl DitherMode {
    /// Returns whether the pixel at (`x`, `y`) with luminance `luma` is inked.
    ///
    /// ```
    /// use peripage::DitherMode;
    ///
    /// assert!(DitherMode::Threshold.ink(0, 0, 10, 128));
    /// assert!(!DitherMode::Threshold.ink(0, 0, 200, 128));
    /// assert!(DitherMode::Ordered.ink(3, 5, 0, 128));
    /// assert!(!DitherMode::Ordered.ink(3, 5, 255, 128));
    /// ```
    #[must_use]
    pub fn ink(self, x: u32, y: u32, luma: u8, threshold: u8) -> bool {
        match self {
            Self::Threshold => luma < threshold,
            Self::Ordered => {
                let intensity = 1.0 - f32::from(luma) / 255.0;
                intensity > bayer_threshold(x, y)
            }
        }
    }
}

fn bayer_threshold(x: u32, y: u32) -> f32 {
    let value = BAYER8[(y & 7) as usize][(x & 7) as usize];
    (f32::from(value) + 0.5) / 64.0
}
