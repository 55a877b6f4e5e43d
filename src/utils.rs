use std::time::Duration;

/// Formats bytes as uppercase hexadecimal pairs separated by spaces.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    bytes
        .iter()
        .map(|value| format!("{value:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => format!("{value} dBm"),
        None => "-".to_string(),
    }
}

/// Converts a duration to whole milliseconds for error payloads.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_uppercase_pairs() {
        assert_snapshot!(format_hex(&[0x05, 0x00, 0xA1, 0xFF]), @"05 00 A1 FF");
    }

    #[test]
    fn format_rssi_handles_unknown() {
        assert_eq!("-", format_rssi(None));
        assert_eq!("-61 dBm", format_rssi(Some(-61)));
    }

    #[test]
    fn duration_millis_saturates() {
        assert_eq!(1_500, duration_millis(Duration::from_millis(1_500)));
        assert_eq!(u64::MAX, duration_millis(Duration::MAX));
    }
}
