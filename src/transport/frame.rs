use thiserror::Error;

use crate::protocol::ChecksumAlgorithm;

const HEADER_LEN: usize = 3;
const TRAILER_LEN: usize = 1;

/// Bytes added around every frame payload: type, 16-bit length, checksum.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + TRAILER_LEN;

/// Largest payload the 16-bit length field can describe.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Errors returned by frame encoding and decoding.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum FrameCodecError {
    /// The frame is shorter than its fixed header and trailer.
    #[error("frame is too short: expected at least 4 bytes, got {actual}")]
    TooShort { actual: usize },
    /// The declared payload length does not match the bytes provided.
    #[error("frame length mismatch: header declares {declared} payload bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    /// The payload cannot be described by the 16-bit length field.
    #[error("frame payload of {payload_len} bytes exceeds max {}", MAX_FRAME_PAYLOAD)]
    PayloadTooLarge { payload_len: usize },
}

/// One transport unit: `[type][length: u16 BE][payload][checksum]`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    frame_type: u8,
    payload: Vec<u8>,
    checksum: u8,
}

impl Frame {
    /// Builds a frame and computes its checksum.
    ///
    /// # Errors
    ///
    /// Returns [`FrameCodecError::PayloadTooLarge`] when the payload does not
    /// fit the length field.
    ///
    /// ```
    /// use peripage::{ChecksumAlgorithm, Frame};
    ///
    /// let frame = Frame::new(0x01, vec![0x01, 0x02, 0x03], ChecksumAlgorithm::Additive)?;
    /// assert_eq!(vec![0x01, 0x00, 0x03, 0x01, 0x02, 0x03, 0x06], frame.encode());
    /// # Ok::<(), peripage::FrameCodecError>(())
    /// ```
    pub fn new(
        frame_type: u8,
        payload: Vec<u8>,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self, FrameCodecError> {
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameCodecError::PayloadTooLarge {
                payload_len: payload.len(),
            });
        }

        let checksum = algorithm.compute(&payload);
        Ok(Self {
            frame_type,
            payload,
            checksum,
        })
    }

    /// Parses a frame from raw bytes without checking its checksum.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are truncated or the declared length
    /// disagrees with the payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameCodecError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameCodecError::TooShort {
                actual: bytes.len(),
            });
        }

        let declared = usize::from(u16::from_be_bytes([bytes[1], bytes[2]]));
        let actual = bytes.len() - FRAME_OVERHEAD;
        if declared != actual {
            return Err(FrameCodecError::LengthMismatch { declared, actual });
        }

        Ok(Self {
            frame_type: bytes[0],
            payload: bytes[HEADER_LEN..bytes.len() - TRAILER_LEN].to_vec(),
            checksum: bytes[bytes.len() - 1],
        })
    }

    /// Serialises the frame for the wire.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(FRAME_OVERHEAD + self.payload.len());
        bytes.push(self.frame_type);
        // `new` and `decode` both bound the payload to the u16 range.
        let len = u16::try_from(self.payload.len()).unwrap_or(u16::MAX);
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes.push(self.checksum);
        bytes
    }

    #[must_use]
    pub fn frame_type(&self) -> u8 {
        self.frame_type
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Returns whether the carried checksum matches the payload.
    #[must_use]
    pub fn checksum_valid(&self, algorithm: ChecksumAlgorithm) -> bool {
        algorithm.verify(&self.payload, self.checksum)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn decode_reads_encoded_frame() {
        let frame = Frame::new(0x02, vec![0x1B, 0x4A], ChecksumAlgorithm::Xor)
            .expect("payload should fit");

        let decoded = Frame::decode(&frame.encode()).expect("frame should decode");

        assert_eq!(frame, decoded);
        assert!(decoded.checksum_valid(ChecksumAlgorithm::Xor));
    }

    #[test]
    fn length_field_is_big_endian() {
        let frame = Frame::new(0x01, vec![0u8; 0x0102], ChecksumAlgorithm::Additive)
            .expect("payload should fit");

        let bytes = frame.encode();

        assert_eq!([0x01, 0x01, 0x02], bytes[..3]);
        assert_eq!(0x0102 + FRAME_OVERHEAD, bytes.len());
    }

    #[rstest]
    #[case(&[0x01, 0x00, 0x00], FrameCodecError::TooShort { actual: 3 })]
    #[case(&[0x01, 0x00, 0x02, 0xAA, 0x00], FrameCodecError::LengthMismatch { declared: 2, actual: 1 })]
    fn decode_rejects_malformed_frames(#[case] bytes: &[u8], #[case] expected: FrameCodecError) {
        assert_eq!(Err(expected), Frame::decode(bytes));
    }

    #[test]
    fn new_rejects_oversized_payload() {
        let result = Frame::new(0x01, vec![0u8; MAX_FRAME_PAYLOAD + 1], ChecksumAlgorithm::Crc8);
        assert_matches!(result, Err(FrameCodecError::PayloadTooLarge { .. }));
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut bytes = Frame::new(0x01, vec![0x10, 0x20, 0x30], ChecksumAlgorithm::Crc8)
            .expect("payload should fit")
            .encode();
        bytes[4] ^= 0x01;

        let decoded = Frame::decode(&bytes).expect("frame should decode");

        assert!(!decoded.checksum_valid(ChecksumAlgorithm::Crc8));
    }
}
