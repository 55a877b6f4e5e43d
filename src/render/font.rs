use font8x8::UnicodeFonts;

pub(crate) const GLYPH_SIZE: u32 = 8;

/// Returns the 8x8 glyph for `ch`, bit 0 of each row being the leftmost pixel.
pub(crate) fn glyph_exact(ch: char) -> Option<[u8; 8]> {
    if ch.is_control() {
        return None;
    }
    font8x8::BASIC_FONTS
        .get(ch)
        .or_else(|| font8x8::LATIN_FONTS.get(ch))
}

/// Returns the glyph for `ch`, substituting `fallback` for unknown characters.
pub(crate) fn glyph_for(ch: char, fallback: char) -> [u8; 8] {
    glyph_exact(ch)
        .or_else(|| glyph_exact(fallback))
        .unwrap_or([0u8; 8])
}

pub(crate) fn glyph_pixel(glyph: &[u8; 8], x: u32, y: u32) -> bool {
    let Some(row) = usize::try_from(y).ok().and_then(|y| glyph.get(y)) else {
        return false;
    };
    x < GLYPH_SIZE && (row >> x) & 0x01 == 0x01
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case('A')]
    #[case('~')]
    #[case('é')]
    #[case('ß')]
    fn known_characters_have_glyphs(#[case] ch: char) {
        assert!(glyph_exact(ch).is_some_and(|glyph| glyph.iter().any(|row| *row != 0)));
    }

    #[rstest]
    #[case('\u{7}')]
    #[case('漢')]
    #[case('🙂')]
    fn unknown_characters_use_fallback(#[case] ch: char) {
        assert_eq!(glyph_exact('?'), Some(glyph_for(ch, '?')));
    }

    #[test]
    fn glyph_pixel_reads_lsb_as_leftmost() {
        let glyph = [0b0000_0001, 0, 0, 0, 0, 0, 0, 0b1000_0000];
        assert!(glyph_pixel(&glyph, 0, 0));
        assert!(!glyph_pixel(&glyph, 1, 0));
        assert!(glyph_pixel(&glyph, 7, 7));
        assert!(!glyph_pixel(&glyph, 8, 7));
    }
}
