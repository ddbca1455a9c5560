//! Binary frame header prefixed to every published frame.
//!
//! ```text
//! offset  size  field
//! 0       4     flag         (u32)
//! 4       4     width        (u32)
//! 8       4     height       (u32)
//! 12      4     frame index  (u32)
//! 16      8     timestamp    (f64, seconds)
//! 24      4     extra        (i32, sensor defined)
//! 28      4     data length  (u32)
//! ```
//!
//! All fields are little-endian, matching the `<LLLLdlL` layout NDSI
//! receivers unpack without a schema exchange.

use thiserror::Error;

/// Encoded header size in bytes.
pub const HEADER_LEN: usize = 32;

/// Every channel of the sensor is present in the encoded payload.
pub const FLAG_ALL: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("frame header must be {HEADER_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub flag: u32,
    pub width: u32,
    pub height: u32,
    pub index: u32,
    pub timestamp: f64,
    pub extra: i32,
    pub data_length: u32,
}

impl FrameHeader {
    /// Build a header whose data length is taken from `payload`.
    pub fn for_payload(
        flag: u32,
        width: u32,
        height: u32,
        index: u32,
        timestamp: f64,
        extra: i32,
        payload: &[u8],
    ) -> Self {
        Self {
            flag,
            width,
            height,
            index,
            timestamp,
            extra,
            data_length: payload.len() as u32,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.flag.to_le_bytes());
        buf[4..8].copy_from_slice(&self.width.to_le_bytes());
        buf[8..12].copy_from_slice(&self.height.to_le_bytes());
        buf[12..16].copy_from_slice(&self.index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..28].copy_from_slice(&self.extra.to_le_bytes());
        buf[28..32].copy_from_slice(&self.data_length.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        let buf: &[u8; HEADER_LEN] = bytes
            .try_into()
            .map_err(|_| HeaderError::InvalidLength(bytes.len()))?;

        let u32_at = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
        let mut timestamp = [0u8; 8];
        timestamp.copy_from_slice(&buf[16..24]);

        Ok(Self {
            flag: u32_at(0),
            width: u32_at(4),
            height: u32_at(8),
            index: u32_at(12),
            timestamp: f64::from_le_bytes(timestamp),
            extra: u32_at(24) as i32,
            data_length: u32_at(28),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(payload: &[u8]) -> FrameHeader {
        FrameHeader::for_payload(FLAG_ALL, 224, 172, 41, 1_700_000_000.125, -3, payload)
    }

    #[test]
    fn test_round_trip_payload_sizes() {
        for size in [0usize, 1, 70_000] {
            let payload = vec![0xA5u8; size];
            let header = header_for(&payload);
            let decoded = FrameHeader::decode(&header.encode()).unwrap();

            assert_eq!(decoded, header);
            assert_eq!(decoded.data_length as usize, payload.len());
        }
    }

    #[test]
    fn test_layout_is_little_endian() {
        let header = FrameHeader {
            flag: 1,
            width: 2,
            height: 3,
            index: 0x0102_0304,
            timestamp: 1.5,
            extra: 500,
            data_length: 7,
        };
        let bytes = header.encode();

        assert_eq!(&bytes[0..4], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..16], &[4, 3, 2, 1]);
        assert_eq!(&bytes[16..24], &1.5f64.to_le_bytes());
        assert_eq!(&bytes[24..28], &500i32.to_le_bytes());
        assert_eq!(&bytes[28..32], &[7, 0, 0, 0]);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(
            FrameHeader::decode(&[0u8; 31]),
            Err(HeaderError::InvalidLength(31))
        );
    }
}
