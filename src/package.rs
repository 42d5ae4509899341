//! Bound Profile Package codec.
//!
//! ```text
//! BoundProfilePackage ::= [54] SEQUENCE {                  -- BF36
//!     initialiseSecureChannelRequest [35] SEQUENCE,         -- BF23
//!     firstSequenceOf87  [0] SEQUENCE OF [7] OCTET STRING,  -- A0 { 87 .. }
//!     sequenceOf88       [1] SEQUENCE OF [8] OCTET STRING,  -- A1 { 88 .. }
//!     secondSequenceOf87 [2] SEQUENCE OF [7] OCTET STRING OPTIONAL, -- A2 { 87 }
//!     sequenceOf86       [3] SEQUENCE OF [6] OCTET STRING   -- A3 { 86 .. }
//! }
//! ```

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::segment::Segment;
use crate::tlv::{encode_tlv, TlvReader};
use crate::types::{
    BspError, Result, TAG_CONFIGURE_ISDP, TAG_PROFILE_DATA, TAG_REPLACE_SESSION_KEYS,
    TAG_STORE_METADATA,
};

/// Tag of the BoundProfilePackage container.
pub const TAG_BOUND_PROFILE_PACKAGE: u32 = 0xBF36;

/// Tag of InitialiseSecureChannelRequest.
pub const TAG_INITIALISE_SECURE_CHANNEL: u32 = 0xBF23;

const TAG_FIRST_SEQUENCE_OF_87: u32 = 0xA0;
const TAG_SEQUENCE_OF_88: u32 = 0xA1;
const TAG_SECOND_SEQUENCE_OF_87: u32 = 0xA2;
const TAG_SEQUENCE_OF_86: u32 = 0xA3;

const TAG_REMOTE_OP_ID: u32 = 0x82;
const TAG_TRANSACTION_ID: u32 = 0x80;
const TAG_CONTROL_REF_TEMPLATE: u32 = 0xA6;
const TAG_KEY_TYPE: u32 = 0x80;
const TAG_KEY_LENGTH: u32 = 0x81;
const TAG_HOST_ID: u32 = 0x84;
const TAG_SMDP_OTPK: u32 = 0x5F49;
const TAG_SMDP_SIGN: u32 = 0x5F37;

/// remoteOpId value for installBoundProfilePackage.
pub const REMOTE_OP_INSTALL_BPP: u32 = 1;

/// InitialiseSecureChannelRequest: the handshake confirmation at the head of a BPP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialiseSecureChannelRequest {
    /// Remote operation identifier.
    pub remote_op_id: u32,
    /// Transaction identifier.
    pub transaction_id: Vec<u8>,
    /// Key type from the control reference template.
    pub key_type: u8,
    /// Key length from the control reference template.
    pub key_length: u8,
    /// Host identifier.
    pub host_id: Vec<u8>,
    /// SM-DP+ one-time public key (uncompressed point).
    pub smdp_otpk: Vec<u8>,
    /// SM-DP+ signature over the request.
    pub smdp_sign: Vec<u8>,
}

impl InitialiseSecureChannelRequest {
    /// Encode as BF23.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut crt = encode_tlv(TAG_KEY_TYPE, &[self.key_type])?;
        crt.extend(encode_tlv(TAG_KEY_LENGTH, &[self.key_length])?);
        crt.extend(encode_tlv(TAG_HOST_ID, &self.host_id)?);

        let mut body = encode_tlv(TAG_REMOTE_OP_ID, &encode_unsigned(self.remote_op_id))?;
        body.extend(encode_tlv(TAG_TRANSACTION_ID, &self.transaction_id)?);
        body.extend(encode_tlv(TAG_CONTROL_REF_TEMPLATE, &crt)?);
        body.extend(encode_tlv(TAG_SMDP_OTPK, &self.smdp_otpk)?);
        body.extend(encode_tlv(TAG_SMDP_SIGN, &self.smdp_sign)?);
        encode_tlv(TAG_INITIALISE_SECURE_CHANNEL, &body)
    }

    /// Decode a complete BF23 element.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut outer = TlvReader::new(data);
        let request = outer.read_expected(TAG_INITIALISE_SECURE_CHANNEL, "InitialiseSecureChannelRequest")?;
        outer.finish("InitialiseSecureChannelRequest")?;

        let mut fields = TlvReader::new(request.value);
        let remote_op_id = decode_unsigned(fields.read_expected(TAG_REMOTE_OP_ID, "remoteOpId")?.value)?;
        let transaction_id = fields.read_expected(TAG_TRANSACTION_ID, "transactionId")?.value.to_vec();

        let crt = fields.read_expected(TAG_CONTROL_REF_TEMPLATE, "controlRefTemplate")?;
        let mut crt_fields = TlvReader::new(crt.value);
        let key_type = single_byte("keyType", crt_fields.read_expected(TAG_KEY_TYPE, "keyType")?.value)?;
        let key_length = single_byte("keyLen", crt_fields.read_expected(TAG_KEY_LENGTH, "keyLen")?.value)?;
        let host_id = crt_fields.read_expected(TAG_HOST_ID, "hostId")?.value.to_vec();
        crt_fields.finish("controlRefTemplate")?;

        let smdp_otpk = fields.read_expected(TAG_SMDP_OTPK, "smdpOtpk")?.value.to_vec();
        let smdp_sign = fields.read_expected(TAG_SMDP_SIGN, "smdpSign")?.value.to_vec();
        fields.finish("smdpSign")?;

        Ok(Self {
            remote_op_id,
            transaction_id,
            key_type,
            key_length,
            host_id,
            smdp_otpk,
            smdp_sign,
        })
    }
}

/// A decoded Bound Profile Package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundProfilePackage {
    /// The BF23 element exactly as received (passed through, not interpreted here).
    pub initialise_secure_channel: Vec<u8>,
    /// ConfigureISDP segments (encrypted).
    pub configure_isdp: Vec<Segment>,
    /// StoreMetadata segments (MAC-only).
    pub store_metadata: Vec<Segment>,
    /// ReplaceSessionKeys segment (encrypted), if the package re-keys to PPKs.
    pub replace_session_keys: Option<Segment>,
    /// Profile data segments (encrypted).
    pub profile_data: Vec<Segment>,
}

impl BoundProfilePackage {
    /// Decode a BF36 package.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut outer = TlvReader::new(data);
        let package = outer.read_expected(TAG_BOUND_PROFILE_PACKAGE, "BoundProfilePackage")?;
        outer.finish("BoundProfilePackage")?;

        let mut sections = TlvReader::new(package.value);
        let iscr = sections.read_expected(TAG_INITIALISE_SECURE_CHANNEL, "initialiseSecureChannelRequest")?;
        let first87 = sections.read_expected(TAG_FIRST_SEQUENCE_OF_87, "firstSequenceOf87")?;
        let seq88 = sections.read_expected(TAG_SEQUENCE_OF_88, "sequenceOf88")?;
        let second87 = sections.read_optional(TAG_SECOND_SEQUENCE_OF_87)?;
        let seq86 = sections.read_expected(TAG_SEQUENCE_OF_86, "sequenceOf86")?;
        sections.finish("sequenceOf86")?;

        let replace_session_keys = match second87 {
            Some(section) => {
                let mut segments = decode_segments(section.value, TAG_REPLACE_SESSION_KEYS, "secondSequenceOf87")?;
                if segments.len() != 1 {
                    return Err(BspError::MalformedPackage(format!(
                        "secondSequenceOf87 must hold exactly one segment, found {}",
                        segments.len()
                    )));
                }
                segments.pop()
            }
            None => None,
        };

        Ok(Self {
            initialise_secure_channel: iscr.raw.to_vec(),
            configure_isdp: decode_segments(first87.value, TAG_CONFIGURE_ISDP, "firstSequenceOf87")?,
            store_metadata: decode_segments(seq88.value, TAG_STORE_METADATA, "sequenceOf88")?,
            replace_session_keys,
            profile_data: decode_segments(seq86.value, TAG_PROFILE_DATA, "sequenceOf86")?,
        })
    }

    /// Encode to BF36 bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = self.initialise_secure_channel.clone();
        body.extend(encode_segments(TAG_FIRST_SEQUENCE_OF_87, &self.configure_isdp)?);
        body.extend(encode_segments(TAG_SEQUENCE_OF_88, &self.store_metadata)?);
        if let Some(segment) = &self.replace_session_keys {
            body.extend(encode_segments(TAG_SECOND_SEQUENCE_OF_87, std::slice::from_ref(segment))?);
        }
        body.extend(encode_segments(TAG_SEQUENCE_OF_86, &self.profile_data)?);
        encode_tlv(TAG_BOUND_PROFILE_PACKAGE, &body)
    }

    /// Decode the base64 form used in ES9+ JSON bodies.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let data = BASE64
            .decode(encoded.trim())
            .map_err(|e| BspError::MalformedPackage(format!("Invalid base64: {}", e)))?;
        Self::decode(&data)
    }

    /// Encode to base64.
    pub fn to_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.encode()?))
    }

    /// Parse the pass-through handshake confirmation.
    pub fn initialise_secure_channel_request(&self) -> Result<InitialiseSecureChannelRequest> {
        InitialiseSecureChannelRequest::decode(&self.initialise_secure_channel)
    }

    /// Total number of segments in the package.
    pub fn segment_count(&self) -> usize {
        self.configure_isdp.len()
            + self.store_metadata.len()
            + usize::from(self.replace_session_keys.is_some())
            + self.profile_data.len()
    }
}

/// Check if data looks like a Bound Profile Package.
pub fn is_bound_profile_package(data: &[u8]) -> bool {
    data.len() > 2 && data[0] == 0xBF && data[1] == 0x36
}

fn decode_segments(value: &[u8], tag: u8, section: &str) -> Result<Vec<Segment>> {
    let mut reader = TlvReader::new(value);
    let mut segments = Vec::new();
    while !reader.is_empty() {
        let element = reader.read_expected(tag as u32, section)?;
        segments.push(Segment::decode(element.raw)?);
    }

    if segments.is_empty() {
        return Err(BspError::MalformedPackage(format!("{} is empty", section)));
    }
    Ok(segments)
}

fn encode_segments(tag: u32, segments: &[Segment]) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    for segment in segments {
        body.extend(segment.encode()?);
    }
    encode_tlv(tag, &body)
}

fn encode_unsigned(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(3);
    let mut out = Vec::with_capacity(5);
    if bytes[start] & 0x80 != 0 {
        out.push(0x00);
    }
    out.extend_from_slice(&bytes[start..]);
    out
}

fn decode_unsigned(value: &[u8]) -> Result<u32> {
    let digits = match value {
        [0x00, rest @ ..] if !rest.is_empty() => rest,
        _ => value,
    };
    if digits.is_empty() || digits.len() > 4 || value[0] & 0x80 != 0 {
        return Err(BspError::MalformedPackage(format!(
            "Invalid remoteOpId encoding: {}",
            hex::encode(value)
        )));
    }
    Ok(digits.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

fn single_byte(name: &str, value: &[u8]) -> Result<u8> {
    match value {
        [b] => Ok(*b),
        _ => Err(BspError::MalformedPackage(format!(
            "{} must be one byte, got {}",
            name,
            value.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(tag: u8, fill: u8, len: usize) -> Segment {
        Segment {
            tag,
            payload: vec![fill; len],
            mac: [fill; 8],
        }
    }

    fn sample_request() -> InitialiseSecureChannelRequest {
        InitialiseSecureChannelRequest {
            remote_op_id: REMOTE_OP_INSTALL_BPP,
            transaction_id: vec![0x01, 0x02, 0x03, 0x04],
            key_type: 0x88,
            key_length: 0x10,
            host_id: b"HOSTID".to_vec(),
            smdp_otpk: [vec![0x04], vec![0xAA; 64]].concat(),
            smdp_sign: vec![0x55; 64],
        }
    }

    fn sample_package(with_rsk: bool) -> BoundProfilePackage {
        BoundProfilePackage {
            initialise_secure_channel: sample_request().encode().unwrap(),
            configure_isdp: vec![segment(0x87, 0x01, 32)],
            store_metadata: vec![segment(0x88, 0x02, 100), segment(0x88, 0x03, 7)],
            replace_session_keys: with_rsk.then(|| segment(0x87, 0x04, 64)),
            profile_data: vec![
                segment(0x86, 0x05, 1024),
                segment(0x86, 0x06, 1024),
                segment(0x86, 0x07, 16),
            ],
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let encoded = sample_request().encode().unwrap();
        assert_eq!(&encoded[..2], &[0xBF, 0x23]);
        let decoded = InitialiseSecureChannelRequest::decode(&encoded).unwrap();
        assert_eq!(decoded, sample_request());
    }

    #[test]
    fn test_request_fields() {
        let package = sample_package(false);
        let request = package.initialise_secure_channel_request().unwrap();
        assert_eq!(request.remote_op_id, 1);
        assert_eq!(request.key_type, 0x88);
        assert_eq!(request.key_length, 0x10);
        assert_eq!(request.host_id, b"HOSTID");
        assert_eq!(request.smdp_otpk.len(), 65);
    }

    #[test]
    fn test_package_roundtrip() {
        for with_rsk in [false, true] {
            let package = sample_package(with_rsk);
            let encoded = package.encode().unwrap();
            assert!(is_bound_profile_package(&encoded));

            let decoded = BoundProfilePackage::decode(&encoded).unwrap();
            assert_eq!(decoded, package);
            assert_eq!(decoded.encode().unwrap(), encoded);
            assert_eq!(decoded.segment_count(), if with_rsk { 7 } else { 6 });
        }
    }

    #[test]
    fn test_base64_roundtrip() {
        let package = sample_package(true);
        let encoded = package.to_base64().unwrap();
        assert_eq!(BoundProfilePackage::from_base64(&encoded).unwrap(), package);
        assert!(BoundProfilePackage::from_base64("not base64!").is_err());
    }

    fn assemble(sections: &[(u32, Vec<Segment>)]) -> Vec<u8> {
        let mut body = sample_request().encode().unwrap();
        for (tag, segments) in sections {
            body.extend(encode_segments(*tag, segments).unwrap());
        }
        encode_tlv(TAG_BOUND_PROFILE_PACKAGE, &body).unwrap()
    }

    #[test]
    fn test_missing_mandatory_section() {
        let data = assemble(&[
            (TAG_FIRST_SEQUENCE_OF_87, vec![segment(0x87, 1, 16)]),
            (TAG_SEQUENCE_OF_86, vec![segment(0x86, 1, 16)]),
        ]);
        let result = BoundProfilePackage::decode(&data);
        assert!(matches!(result, Err(BspError::MalformedPackage(msg)) if msg.contains("sequenceOf88")));
    }

    #[test]
    fn test_empty_mandatory_section() {
        let data = assemble(&[
            (TAG_FIRST_SEQUENCE_OF_87, vec![segment(0x87, 1, 16)]),
            (TAG_SEQUENCE_OF_88, vec![segment(0x88, 1, 16)]),
            (TAG_SEQUENCE_OF_86, vec![]),
        ]);
        let result = BoundProfilePackage::decode(&data);
        assert!(matches!(result, Err(BspError::MalformedPackage(msg)) if msg.contains("empty")));
    }

    #[test]
    fn test_second_sequence_must_hold_one_segment() {
        let data = assemble(&[
            (TAG_FIRST_SEQUENCE_OF_87, vec![segment(0x87, 1, 16)]),
            (TAG_SEQUENCE_OF_88, vec![segment(0x88, 1, 16)]),
            (TAG_SECOND_SEQUENCE_OF_87, vec![segment(0x87, 1, 16), segment(0x87, 2, 16)]),
            (TAG_SEQUENCE_OF_86, vec![segment(0x86, 1, 16)]),
        ]);
        assert!(BoundProfilePackage::decode(&data).is_err());
    }

    #[test]
    fn test_wrong_element_tag() {
        let data = assemble(&[
            (TAG_FIRST_SEQUENCE_OF_87, vec![segment(0x87, 1, 16)]),
            (TAG_SEQUENCE_OF_88, vec![segment(0x86, 1, 16)]),
            (TAG_SEQUENCE_OF_86, vec![segment(0x86, 1, 16)]),
        ]);
        assert!(matches!(
            BoundProfilePackage::decode(&data),
            Err(BspError::MalformedPackage(_))
        ));
    }

    #[test]
    fn test_sections_out_of_order() {
        let data = assemble(&[
            (TAG_SEQUENCE_OF_88, vec![segment(0x88, 1, 16)]),
            (TAG_FIRST_SEQUENCE_OF_87, vec![segment(0x87, 1, 16)]),
            (TAG_SEQUENCE_OF_86, vec![segment(0x86, 1, 16)]),
        ]);
        assert!(BoundProfilePackage::decode(&data).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut data = sample_package(false).encode().unwrap();
        data.push(0x00);
        assert!(BoundProfilePackage::decode(&data).is_err());
    }

    #[test]
    fn test_wrong_outer_tag() {
        let mut data = sample_package(false).encode().unwrap();
        data[1] = 0x37;
        assert!(!is_bound_profile_package(&data));
        assert!(BoundProfilePackage::decode(&data).is_err());
    }

    #[test]
    fn test_unsigned_integer_encoding() {
        assert_eq!(encode_unsigned(0), vec![0x00]);
        assert_eq!(encode_unsigned(1), vec![0x01]);
        assert_eq!(encode_unsigned(0x80), vec![0x00, 0x80]);
        assert_eq!(encode_unsigned(0x0100), vec![0x01, 0x00]);
        assert_eq!(decode_unsigned(&[0x00, 0x80]).unwrap(), 0x80);
        assert_eq!(decode_unsigned(&[0x00]).unwrap(), 0);
        assert!(decode_unsigned(&[0xFF]).is_err());
        assert!(decode_unsigned(&[]).is_err());
    }
}
