//! Wire representation of one BSP segment.
//!
//! Format: tag (1 byte) ‖ BER length (L = len(payload) + 8) ‖ payload ‖ MAC (8 bytes)

use crate::tlv::{decode_length, encode_length};
use crate::types::{BspError, Result, MAC_LENGTH};

/// One tagged, MAC-protected segment as it travels inside a BPP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment tag (0x86, 0x87 or 0x88).
    pub tag: u8,
    /// Ciphertext or, for MAC-only segments, plaintext.
    pub payload: Vec<u8>,
    /// Truncated MAC.
    pub mac: [u8; MAC_LENGTH],
}

impl Segment {
    /// Value of the BER length field: payload plus MAC.
    pub fn content_length(&self) -> usize {
        self.payload.len() + MAC_LENGTH
    }

    /// Encode the segment to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let length = encode_length(self.content_length())?;
        let mut data = Vec::with_capacity(1 + length.len() + self.content_length());
        data.push(self.tag);
        data.extend_from_slice(&length);
        data.extend_from_slice(&self.payload);
        data.extend_from_slice(&self.mac);
        Ok(data)
    }

    /// Decode a complete segment. Trailing bytes are rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(BspError::MalformedPackage(format!(
                "Segment too short: {} bytes",
                data.len()
            )));
        }

        let tag = data[0];
        let (length, len_len) = decode_length(&data[1..])?;
        if len_len > 3 {
            return Err(BspError::MalformedPackage(
                "Segment length exceeds two-byte long form".into(),
            ));
        }

        let header = 1 + len_len;
        if header + length != data.len() {
            return Err(BspError::MalformedPackage(format!(
                "Segment length {} does not match {} available bytes",
                length,
                data.len() - header
            )));
        }

        if length <= MAC_LENGTH {
            return Err(BspError::MalformedPackage(
                "Segment payload too small".into(),
            ));
        }

        let payload_end = data.len() - MAC_LENGTH;
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&data[payload_end..]);

        Ok(Self {
            tag,
            payload: data[header..payload_end].to_vec(),
            mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let segment = Segment {
            tag: 0x86,
            payload: vec![0x55; 200],
            mac: [0xAA; 8],
        };

        let encoded = segment.encode().unwrap();
        assert_eq!(&encoded[..3], &[0x86, 0x81, 208]);

        let decoded = Segment::decode(&encoded).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn test_decode_known_segment() {
        let data = hex::decode("880d0102030405e11985114596ada6").unwrap();
        let segment = Segment::decode(&data).unwrap();
        assert_eq!(segment.tag, 0x88);
        assert_eq!(segment.payload, vec![1, 2, 3, 4, 5]);
        assert_eq!(hex::encode(segment.mac), "e11985114596ada6");
    }

    #[test]
    fn test_decode_payload_too_small() {
        let data = [0x88, 0x08, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            Segment::decode(&data),
            Err(BspError::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_decode_length_mismatch() {
        let data = hex::decode("880e0102030405e11985114596ada6").unwrap();
        assert!(Segment::decode(&data).is_err());

        let mut data = hex::decode("880d0102030405e11985114596ada6").unwrap();
        data.push(0x00);
        assert!(Segment::decode(&data).is_err());
    }

    #[test]
    fn test_decode_too_short() {
        assert!(Segment::decode(&[0x87, 0x00]).is_err());
    }
}
