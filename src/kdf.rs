//! Session key derivation (ANSI X9.63 KDF over SHA-256).
//!
//! `shared_info` binds the keys to the control reference template and the
//! eUICC: keyType ‖ keyLen ‖ len(hostId) ‖ hostId ‖ len(EID) ‖ EID.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::session::SessionKeys;
use crate::types::{BspError, Result, KDF_OUTPUT_SIZE};

/// Counter-mode KDF: SHA-256(Z ‖ BE32(counter) ‖ SharedInfo) for counter = 1, 2, ...
///
/// # Arguments
/// * `shared_secret` - The ECDH shared secret Z
/// * `shared_info` - Context binding data
/// * `output_length` - Number of bytes to produce
///
/// # Returns
/// `output_length` bytes of key material
pub fn x963_kdf_sha256(shared_secret: &[u8], shared_info: &[u8], output_length: usize) -> Vec<u8> {
    let mut output = Vec::with_capacity(output_length + 32);
    let mut counter: u32 = 1;

    while output.len() < output_length {
        let mut hasher = Sha256::new();
        hasher.update(shared_secret);
        hasher.update(counter.to_be_bytes());
        hasher.update(shared_info);
        output.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    output.truncate(output_length);
    output
}

/// Builds the KDF context string from the control reference template and EID.
///
/// # Arguments
/// * `key_type` - Key type from the control reference template (0x88 for AES)
/// * `key_length` - Key length from the control reference template (0x10)
/// * `host_id` - Host identifier (at most 255 bytes)
/// * `eid` - eUICC identifier (at most 255 bytes)
pub fn build_shared_info(key_type: u8, key_length: u8, host_id: &[u8], eid: &[u8]) -> Result<Vec<u8>> {
    let host_len = context_length("hostId", host_id)?;
    let eid_len = context_length("eid", eid)?;

    let mut info = Vec::with_capacity(4 + host_id.len() + eid.len());
    info.push(key_type);
    info.push(key_length);
    info.push(host_len);
    info.extend_from_slice(host_id);
    info.push(eid_len);
    info.extend_from_slice(eid);
    Ok(info)
}

fn context_length(field: &'static str, value: &[u8]) -> Result<u8> {
    u8::try_from(value.len()).map_err(|_| BspError::ContextTooLong {
        field,
        len: value.len(),
    })
}

/// Derives the session keys for a BSP session.
///
/// # Arguments
/// * `shared_secret` - ECDH shared secret between the eUICC and SM-DP+ one-time keys
/// * `key_type` - Key type from the control reference template
/// * `key_length` - Key length from the control reference template
/// * `host_id` - Host identifier
/// * `eid` - eUICC identifier (binary)
///
/// # Returns
/// Fresh `SessionKeys` (initial MAC chaining value, S-ENC, S-MAC, block number 1)
pub fn derive_session_keys(
    shared_secret: &[u8],
    key_type: u8,
    key_length: u8,
    host_id: &[u8],
    eid: &[u8],
) -> Result<SessionKeys> {
    let shared_info = build_shared_info(key_type, key_length, host_id, eid)?;
    let output = Zeroizing::new(x963_kdf_sha256(shared_secret, &shared_info, KDF_OUTPUT_SIZE));
    let keys = SessionKeys::from_kdf_output(&output);
    tracing::debug!(shared_info_len = shared_info.len(), "derived BSP session keys");
    keys
}
