//! Handshake helpers: challenges and confirmation-code hashing.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of an eUICC or server challenge.
pub const CHALLENGE_SIZE: usize = 16;

/// Generate a random challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Hash a confirmation code for a transaction.
///
/// # Arguments
/// * `confirmation_code` - Code entered by the end user
/// * `transaction_id` - Transaction the code is bound to
///
/// # Returns
/// SHA-256(SHA-256(confirmation_code) ‖ transaction_id)
pub fn confirmation_code_hash(confirmation_code: &[u8], transaction_id: &[u8]) -> [u8; 32] {
    let code_hash = Sha256::digest(confirmation_code);

    let mut hasher = Sha256::new();
    hasher.update(code_hash);
    hasher.update(transaction_id);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenges_are_random() {
        let a = generate_challenge();
        let b = generate_challenge();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_confirmation_code_hash() {
        let transaction_id = hex::decode("0102030405060708090a0b0c0d0e0f10").unwrap();
        let hash = confirmation_code_hash(b"12345678", &transaction_id);

        let inner = Sha256::digest(b"12345678");
        let expected = Sha256::digest([inner.as_slice(), transaction_id.as_slice()].concat());
        assert_eq!(hash.as_slice(), expected.as_slice());

        assert_ne!(hash, confirmation_code_hash(b"12345679", &transaction_id));
        assert_ne!(hash, confirmation_code_hash(b"12345678", &transaction_id[..15]));
    }
}
