//! BSP segment crypto: AES-128-CBC with counter-derived ICVs and a CMAC chain.
//!
//! Every segment MAC is computed over the previous full CMAC value, so
//! segments must be processed in exactly the order they were produced.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::kdf::derive_session_keys;
use crate::replace_keys::ReplaceSessionKeysRequest;
use crate::segment::Segment;
use crate::session::SessionKeys;
use crate::tlv::encode_length;
use crate::types::{
    BspError, Result, AES_BLOCK_SIZE, CMAC_LENGTH, MAC_LENGTH, MAX_SEGMENT_PAYLOAD,
};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Segment crypto for one session.
///
/// Owns its `SessionKeys`; every state-changing operation takes `&mut self`
/// and commits the new chain value and block number only on success.
#[derive(Debug)]
pub struct BspCrypto {
    keys: SessionKeys,
}

impl BspCrypto {
    /// Create segment crypto over existing session keys.
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }

    /// Derive session keys with the X9.63 KDF and wrap them.
    ///
    /// # Arguments
    /// * `shared_secret` - ECDH shared secret
    /// * `key_type` - Key type from the control reference template
    /// * `key_length` - Key length from the control reference template
    /// * `host_id` - Host identifier
    /// * `eid` - eUICC identifier (binary)
    pub fn from_kdf(
        shared_secret: &[u8],
        key_type: u8,
        key_length: u8,
        host_id: &[u8],
        eid: &[u8],
    ) -> Result<Self> {
        derive_session_keys(shared_secret, key_type, key_length, host_id, eid).map(Self::new)
    }

    /// Build a fresh instance from PPK keys, with the block number reset to 1.
    pub fn from_replacement(request: &ReplaceSessionKeysRequest) -> Self {
        Self::new(request.to_session_keys())
    }

    /// The owned session state.
    pub fn session_keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// The block number that the next segment will use.
    pub fn block_number(&self) -> u32 {
        self.keys.block_number()
    }

    /// The current MAC chaining value.
    pub fn chain_value(&self) -> &[u8; CMAC_LENGTH] {
        self.keys.chain_value()
    }

    /// Compute the ICV for a block number: AES(S-ENC, 0^12 ‖ BE32(n)).
    pub fn icv_for_block(&self, block_number: u32) -> [u8; AES_BLOCK_SIZE] {
        let cipher = Aes128::new(GenericArray::from_slice(self.keys.enc_key()));
        let mut block = GenericArray::clone_from_slice(&[0u8; AES_BLOCK_SIZE]);
        block[12..].copy_from_slice(&block_number.to_be_bytes());
        cipher.encrypt_block(&mut block);

        let mut icv = [0u8; AES_BLOCK_SIZE];
        icv.copy_from_slice(&block);
        icv
    }

    /// Verify a segment's MAC and, if `decrypt`, decrypt its payload.
    ///
    /// On success the chain value becomes the full CMAC and the block number
    /// advances by one, for MAC-only segments as well.
    ///
    /// # Arguments
    /// * `segment` - The decoded segment
    /// * `decrypt` - Whether the payload is ciphertext
    ///
    /// # Returns
    /// The plaintext (or the authenticated payload when not decrypting)
    pub fn authenticate_and_maybe_decrypt(&mut self, segment: &Segment, decrypt: bool) -> Result<Vec<u8>> {
        let full_mac = self.compute_full_mac(segment.tag, &segment.payload)?;
        if !bool::from(full_mac[..MAC_LENGTH].ct_eq(&segment.mac)) {
            tracing::debug!(tag = segment.tag, "segment MAC mismatch");
            return Err(BspError::AuthenticationFailed);
        }

        let block_number = self.keys.block_number();
        let output = if decrypt {
            let icv = self.icv_for_block(block_number);
            let padded = self.cbc_decrypt(&icv, &segment.payload)?;
            unpad(&padded)
        } else {
            segment.payload.clone()
        };

        self.keys.commit(full_mac, block_number.wrapping_add(1));
        Ok(output)
    }

    /// Decode and decrypt one wire segment.
    pub fn decrypt_segment(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let segment = Segment::decode(data)?;
        self.authenticate_and_maybe_decrypt(&segment, true)
    }

    /// Decode and verify one MAC-only wire segment.
    pub fn verify_segment(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let segment = Segment::decode(data)?;
        self.authenticate_and_maybe_decrypt(&segment, false)
    }

    /// Encrypt and MAC one segment.
    ///
    /// # Arguments
    /// * `tag` - Segment tag
    /// * `plaintext` - At most `MAX_SEGMENT_PAYLOAD` bytes
    ///
    /// # Returns
    /// tag ‖ BER length ‖ ciphertext ‖ MAC
    pub fn encrypt_and_authenticate(&mut self, tag: u8, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_SEGMENT_PAYLOAD {
            return Err(BspError::SegmentTooLarge(plaintext.len()));
        }

        let block_number = self.keys.block_number();
        let icv = self.icv_for_block(block_number);
        let padded = Zeroizing::new(pad(plaintext));
        let ciphertext = Aes128CbcEnc::new(
            GenericArray::from_slice(self.keys.enc_key()),
            GenericArray::from_slice(&icv),
        )
        .encrypt_padded_vec_mut::<NoPadding>(&padded);

        self.seal(tag, ciphertext, block_number.wrapping_add(1))
    }

    /// MAC one segment without encrypting it. Still advances the block number.
    pub fn authenticate_only(&mut self, tag: u8, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() > MAX_SEGMENT_PAYLOAD {
            return Err(BspError::SegmentTooLarge(data.len()));
        }

        let next_block = self.keys.block_number().wrapping_add(1);
        self.seal(tag, data.to_vec(), next_block)
    }

    /// Split `data` into `MAX_SEGMENT_PAYLOAD` chunks and encrypt each in order.
    pub fn encrypt_and_authenticate_segmented(&mut self, tag: u8, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        data.chunks(MAX_SEGMENT_PAYLOAD)
            .map(|chunk| self.encrypt_and_authenticate(tag, chunk))
            .collect()
    }

    /// Split `data` into `MAX_SEGMENT_PAYLOAD` chunks and MAC each in order.
    pub fn authenticate_only_segmented(&mut self, tag: u8, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        data.chunks(MAX_SEGMENT_PAYLOAD)
            .map(|chunk| self.authenticate_only(tag, chunk))
            .collect()
    }

    fn seal(&mut self, tag: u8, payload: Vec<u8>, next_block: u32) -> Result<Vec<u8>> {
        let full_mac = self.compute_full_mac(tag, &payload)?;
        let mut mac = [0u8; MAC_LENGTH];
        mac.copy_from_slice(&full_mac[..MAC_LENGTH]);

        let encoded = Segment { tag, payload, mac }.encode()?;
        self.keys.commit(full_mac, next_block);
        Ok(encoded)
    }

    /// CMAC(S-MAC, chain ‖ tag ‖ BER(len(payload) + 8) ‖ payload)
    fn compute_full_mac(&self, tag: u8, payload: &[u8]) -> Result<[u8; CMAC_LENGTH]> {
        let length = encode_length(payload.len() + MAC_LENGTH)?;

        let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(self.keys.mac_key()));
        mac.update(self.keys.chain_value());
        mac.update(&[tag]);
        mac.update(&length);
        mac.update(payload);

        let mut full = [0u8; CMAC_LENGTH];
        full.copy_from_slice(&mac.finalize().into_bytes());
        Ok(full)
    }

    fn cbc_decrypt(&self, icv: &[u8; AES_BLOCK_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
            return Err(BspError::MalformedPackage(format!(
                "Ciphertext length {} is not a positive multiple of {}",
                ciphertext.len(),
                AES_BLOCK_SIZE
            )));
        }

        Aes128CbcDec::new(
            GenericArray::from_slice(self.keys.enc_key()),
            GenericArray::from_slice(icv),
        )
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| BspError::MalformedPackage(format!("CBC decryption failed: {}", e)))
    }
}

/// Pad with 0x80 followed by zeros to a multiple of 16 bytes.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let padded_len = (data.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(data);
    out.push(0x80);
    out.resize(padded_len, 0x00);
    out
}

/// Strip trailing zeros and one 0x80 marker.
///
/// Data without a marker is returned unchanged.
pub fn unpad(data: &[u8]) -> Vec<u8> {
    match data.iter().rposition(|&b| b != 0x00) {
        Some(pos) if data[pos] == 0x80 => data[..pos].to_vec(),
        _ => data.to_vec(),
    }
}
