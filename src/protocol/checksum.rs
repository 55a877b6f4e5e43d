use serde_with::SerializeDisplay;

const CRC8_POLYNOMIAL: u8 = 0x07;

/// Checksum appended to every transport frame, computed over the payload.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, derive_more::Display, SerializeDisplay)]
pub enum ChecksumAlgorithm {
    /// Sum of payload bytes modulo 256.
    #[default]
    #[display("additive")]
    Additive,
    /// CRC-8 with polynomial `0x07`, zero initial value, no reflection.
    #[display("crc8")]
    Crc8,
    /// Bytewise XOR of the payload.
    #[display("xor")]
    Xor,
}

impl ChecksumAlgorithm {
    /// Computes the one-byte checksum of `payload`.
    ///
    /// ```
    /// use peripage::ChecksumAlgorithm;
    ///
    /// assert_eq!(0x06, ChecksumAlgorithm::Additive.compute(&[0x01, 0x02, 0x03]));
    /// assert_eq!(0x00, ChecksumAlgorithm::Xor.compute(&[0x01, 0x02, 0x03]));
    /// ```
    #[must_use]
    pub fn compute(self, payload: &[u8]) -> u8 {
        match self {
            Self::Additive => payload
                .iter()
                .fold(0u8, |sum, value| sum.wrapping_add(*value)),
            Self::Crc8 => crc8(payload),
            Self::Xor => payload.iter().fold(0u8, |acc, value| acc ^ value),
        }
    }

    /// Returns whether `checksum` matches the payload.
    #[must_use]
    pub fn verify(self, payload: &[u8], checksum: u8) -> bool {
        self.compute(payload) == checksum
    }
}

fn crc8(payload: &[u8]) -> u8 {
    let mut crc = 0u8;
    for value in payload {
        crc ^= value;
        for _bit in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ CRC8_POLYNOMIAL
            } else {
                crc << 1
            };
        }
    }
    crc
}
