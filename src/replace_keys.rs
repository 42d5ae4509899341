//! ReplaceSessionKeysRequest: the PPK set that re-keys a BPP mid-stream.
//!
//! ```text
//! ReplaceSessionKeysRequest ::= [38] SEQUENCE {   -- BF26
//!     initialMacChainingValue [0] OCTET STRING,    -- 80, 16 bytes
//!     ppkEnc                  [1] OCTET STRING,    -- 81, 16 bytes
//!     ppkCmac                 [2] OCTET STRING     -- 82, 16 bytes
//! }
//! ```

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::session::SessionKeys;
use crate::tlv::{encode_tlv, TlvReader};
use crate::types::{BspError, Result, SESSION_KEY_SIZE};

/// Tag of the ReplaceSessionKeysRequest container.
pub const TAG_REPLACE_SESSION_KEYS_REQUEST: u32 = 0xBF26;

const TAG_INITIAL_MCV: u32 = 0x80;
const TAG_PPK_ENC: u32 = 0x81;
const TAG_PPK_CMAC: u32 = 0x82;

/// Decoded PPK set.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ReplaceSessionKeysRequest {
    /// Initial MAC chaining value for the new session.
    pub initial_mac_chaining_value: [u8; SESSION_KEY_SIZE],
    /// PPK-ENC.
    pub ppk_enc: [u8; SESSION_KEY_SIZE],
    /// PPK-CMAC.
    pub ppk_cmac: [u8; SESSION_KEY_SIZE],
}

impl ReplaceSessionKeysRequest {
    /// Encode as BF26 { 80 81 82 }.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = encode_tlv(TAG_INITIAL_MCV, &self.initial_mac_chaining_value)?;
        body.extend(encode_tlv(TAG_PPK_ENC, &self.ppk_enc)?);
        body.extend(encode_tlv(TAG_PPK_CMAC, &self.ppk_cmac)?);
        encode_tlv(TAG_REPLACE_SESSION_KEYS_REQUEST, &body)
    }

    /// Decode the plaintext of the key-replacement segment.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(BspError::MalformedPackage(
                "Empty ReplaceSessionKeysRequest".into(),
            ));
        }

        let mut outer = TlvReader::new(data);
        let request = outer.read_expected(TAG_REPLACE_SESSION_KEYS_REQUEST, "ReplaceSessionKeysRequest")?;
        outer.finish("ReplaceSessionKeysRequest")?;

        let mut fields = TlvReader::new(request.value);
        let initial_mcv = fields.read_expected(TAG_INITIAL_MCV, "initialMacChainingValue")?;
        let ppk_enc = fields.read_expected(TAG_PPK_ENC, "ppkEnc")?;
        let ppk_cmac = fields.read_expected(TAG_PPK_CMAC, "ppkCmac")?;
        fields.finish("ppkCmac")?;

        Ok(Self {
            initial_mac_chaining_value: to_field("initialMacChainingValue", initial_mcv.value)?,
            ppk_enc: to_field("ppkEnc", ppk_enc.value)?,
            ppk_cmac: to_field("ppkCmac", ppk_cmac.value)?,
        })
    }

    /// Fresh session keys for the PPK session, block number 1.
    pub fn to_session_keys(&self) -> SessionKeys {
        SessionKeys::new(self.ppk_enc, self.ppk_cmac, self.initial_mac_chaining_value)
    }
}

impl fmt::Debug for ReplaceSessionKeysRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaceSessionKeysRequest")
            .field("initial_mac_chaining_value", &hex::encode(self.initial_mac_chaining_value))
            .field("ppk_enc", &"<redacted>")
            .field("ppk_cmac", &"<redacted>")
            .finish()
    }
}

fn to_field(name: &str, value: &[u8]) -> Result<[u8; SESSION_KEY_SIZE]> {
    value.try_into().map_err(|_| {
        BspError::MalformedPackage(format!(
            "Invalid {} length: expected {} bytes, got {}",
            name,
            SESSION_KEY_SIZE,
            value.len()
        ))
    })
}
