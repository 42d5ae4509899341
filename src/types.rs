//! Type definitions and protocol constants for the BSP secure channel.

use thiserror::Error;

use crate::chain::ChainFailure;

/// Length of the truncated MAC carried on the wire.
pub const MAC_LENGTH: usize = 8;

/// Length of a full CMAC-AES128 output (the MAC chaining value).
pub const CMAC_LENGTH: usize = 16;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Size of each session key (S-ENC, S-MAC) and of the chaining value.
pub const SESSION_KEY_SIZE: usize = 16;

/// Number of bytes produced by the session key derivation.
pub const KDF_OUTPUT_SIZE: usize = 48;

/// Policy ceiling for a single encoded segment.
pub const MAX_SEGMENT_SIZE: usize = 1020;

/// Bytes reserved for tag, length and MAC inside a segment.
pub const SEGMENT_OVERHEAD: usize = 10;

/// Largest plaintext accepted for one segment.
pub const MAX_SEGMENT_PAYLOAD: usize = MAX_SEGMENT_SIZE - SEGMENT_OVERHEAD;

/// Block counter value of a freshly keyed session.
pub const INITIAL_BLOCK_NUMBER: u32 = 1;

/// Key type for AES in the control reference template.
pub const KEY_TYPE_AES: u8 = 0x88;

/// Key length (16 bytes) in the control reference template.
pub const KEY_LENGTH_AES128: u8 = 0x10;

/// Segment tag for ConfigureISDP and ReplaceSessionKeys.
pub const TAG_CONFIGURE_ISDP: u8 = 0x87;

/// Segment tag for StoreMetadata.
pub const TAG_STORE_METADATA: u8 = 0x88;

/// Segment tag for ReplaceSessionKeys.
pub const TAG_REPLACE_SESSION_KEYS: u8 = 0x87;

/// Segment tag for profile data (LoadProfileElements).
pub const TAG_PROFILE_DATA: u8 = 0x86;

/// Errors that can occur during BSP operations.
#[derive(Error, Debug)]
pub enum BspError {
    // Package Errors
    /// Structural decode failure.
    #[error("Malformed package: {0}")]
    MalformedPackage(String),

    /// MAC mismatch. Carries no detail on purpose.
    #[error("Authentication failed")]
    AuthenticationFailed,

    // Input Errors
    /// Plaintext exceeds the maximum segment size.
    #[error("Segment too large: {0} bytes (max {MAX_SEGMENT_PAYLOAD})")]
    SegmentTooLarge(usize),

    /// KDF context field longer than a one-byte length can express.
    #[error("Context field {field} too long: {len} bytes (max 255)")]
    ContextTooLong { field: &'static str, len: usize },

    /// Length not representable by the BER length codec.
    #[error("Length out of range: {0}")]
    LengthOutOfRange(usize),

    /// Key material of the wrong size.
    #[error("Invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // Handshake Errors
    /// Peer point does not match the selected curve.
    #[error("Incompatible curve: {0}")]
    IncompatibleCurve(String),

    /// Curve not supported for key agreement or signing.
    #[error("Unsupported curve: {0}")]
    UnsupportedCurve(String),

    /// Malformed raw or DER signature.
    #[error("Invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// Invalid public key.
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid private key.
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Signing failed.
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    // Certificate Errors
    /// Certificate could not be parsed or lacks a required field.
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Chain verification failed.
    #[error("Certificate verification failed: {0}")]
    CertificateVerificationFailed(ChainFailure),
}

pub type Result<T> = std::result::Result<T, BspError>;
