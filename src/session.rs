//! Session key material and the mutable MAC chain / block counter state.
//!
//! A `SessionKeys` value is owned by exactly one `BspCrypto`. It is neither
//! `Clone` nor `Copy`, so two decode flows can never share a counter.

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::{
    BspError, Result, INITIAL_BLOCK_NUMBER, KDF_OUTPUT_SIZE, SESSION_KEY_SIZE,
};

/// S-ENC, S-MAC and the running chain state of one secure channel session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    enc_key: [u8; SESSION_KEY_SIZE],
    mac_key: [u8; SESSION_KEY_SIZE],
    chain_value: [u8; SESSION_KEY_SIZE],
    block_number: u32,
}

impl SessionKeys {
    /// Creates session keys with the block counter at its initial value.
    ///
    /// # Arguments
    /// * `enc_key` - AES-128 encryption key (S-ENC or PPK-ENC)
    /// * `mac_key` - CMAC key (S-MAC or PPK-CMAC)
    /// * `initial_chain_value` - Initial MAC chaining value
    pub fn new(
        enc_key: [u8; SESSION_KEY_SIZE],
        mac_key: [u8; SESSION_KEY_SIZE],
        initial_chain_value: [u8; SESSION_KEY_SIZE],
    ) -> Self {
        Self {
            enc_key,
            mac_key,
            chain_value: initial_chain_value,
            block_number: INITIAL_BLOCK_NUMBER,
        }
    }

    /// Creates session keys from byte slices, checking each is 16 bytes.
    pub fn from_slices(enc_key: &[u8], mac_key: &[u8], initial_chain_value: &[u8]) -> Result<Self> {
        Ok(Self::new(
            to_key(enc_key)?,
            to_key(mac_key)?,
            to_key(initial_chain_value)?,
        ))
    }

    /// Splits a 48-byte KDF output into chain value, S-ENC and S-MAC.
    pub fn from_kdf_output(output: &[u8]) -> Result<Self> {
        if output.len() != KDF_OUTPUT_SIZE {
            return Err(BspError::InvalidKeyLength {
                expected: KDF_OUTPUT_SIZE,
                actual: output.len(),
            });
        }
        Self::from_slices(&output[16..32], &output[32..48], &output[0..16])
    }

    /// The encryption key.
    pub fn enc_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.enc_key
    }

    /// The MAC key.
    pub fn mac_key(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.mac_key
    }

    /// The current MAC chaining value.
    pub fn chain_value(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.chain_value
    }

    /// The block number that the next segment will use.
    pub fn block_number(&self) -> u32 {
        self.block_number
    }

    /// Commits the state computed for a successfully processed segment.
    pub(crate) fn commit(&mut self, chain_value: [u8; SESSION_KEY_SIZE], block_number: u32) {
        self.chain_value = chain_value;
        self.block_number = block_number;
    }
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeys")
            .field("enc_key", &"<redacted>")
            .field("mac_key", &"<redacted>")
            .field("chain_value", &hex::encode(self.chain_value))
            .field("block_number", &self.block_number)
            .finish()
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; SESSION_KEY_SIZE]> {
    bytes.try_into().map_err(|_| BspError::InvalidKeyLength {
        expected: SESSION_KEY_SIZE,
        actual: bytes.len(),
    })
}
