use tracing::instrument;

use crate::protocol::ProtocolProfile;

/// Typed notification events emitted by the printer during a send.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NotifyEvent {
    /// The printer accepted the last frame.
    Ack,
    /// The printer rejected the last frame's checksum.
    Nak,
    /// The printer finished feeding the page.
    PrintComplete,
    /// Unrecognised notification payload preserved as raw bytes.
    Unknown(Vec<u8>),
}

impl NotifyEvent {
    /// Classifies one notification payload against a profile's patterns.
    ///
    /// ```
    /// use peripage::{NotifyEvent, ProtocolProfile};
    ///
    /// let profile = ProtocolProfile::peripage_a6();
    /// assert_eq!(NotifyEvent::Ack, NotifyEvent::classify(&profile, &[0xAA, 0x01]));
    /// assert_eq!(
    ///     NotifyEvent::Unknown(vec![0x42]),
    ///     NotifyEvent::classify(&profile, &[0x42])
    /// );
    /// ```
    #[must_use]
    #[instrument(skip(profile, payload), level = "trace", fields(payload_len = payload.len()))]
    pub fn classify(profile: &ProtocolProfile, payload: &[u8]) -> Self {
        if profile.ack_pattern().matches(payload) {
            return Self::Ack;
        }
        if profile
            .nak_pattern()
            .is_some_and(|pattern| pattern.matches(payload))
        {
            return Self::Nak;
        }
        if profile
            .print_complete_pattern()
            .is_some_and(|pattern| pattern.matches(payload))
        {
            return Self::PrintComplete;
        }
        Self::Unknown(payload.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::protocol::ResponsePattern;

    #[rstest]
    #[case(&[0xAA, 0x01], NotifyEvent::Ack)]
    #[case(&[0xAA, 0xEE], NotifyEvent::Nak)]
    #[case(&[0xAA, 0x0F], NotifyEvent::PrintComplete)]
    #[case(&[0xAA, 0x01, 0x00], NotifyEvent::Unknown(vec![0xAA, 0x01, 0x00]))]
    #[case(&[], NotifyEvent::Unknown(Vec::new()))]
    fn classify_maps_profile_patterns(#[case] payload: &[u8], #[case] expected: NotifyEvent) {
        let profile = ProtocolProfile::peripage_a6();
        assert_eq!(expected, NotifyEvent::classify(&profile, payload));
    }

    #[test]
    fn classify_without_nak_pattern_reports_unknown() {
        let profile = ProtocolProfile::builder()
            .name("bare")
            .endpoint_candidates(Vec::new())
            .ack_pattern(ResponsePattern::prefix([0x01]))
            .build();

        assert_eq!(NotifyEvent::Ack, NotifyEvent::classify(&profile, &[0x01, 0x07]));
        assert_eq!(
            NotifyEvent::Unknown(vec![0xAA, 0xEE]),
            NotifyEvent::classify(&profile, &[0xAA, 0xEE])
        );
    }
}
