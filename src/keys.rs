//! Elliptic-curve key handling for the handshake.
//!
//! The curve follows the peer's certificate key. Ephemeral key pairs are
//! used for exactly one ECDH computation and never serialized.

use std::fmt;

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use rand::rngs::OsRng;
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::Decode;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::Certificate;
use zeroize::Zeroizing;

use crate::types::{BspError, Result};

/// id-ecPublicKey.
pub const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

/// prime256v1 / NIST P-256.
pub const OID_PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");

/// secp384r1 / NIST P-384.
pub const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// brainpoolP256r1.
pub const OID_BRAINPOOL_P256R1: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.7");

/// brainpoolP384r1.
pub const OID_BRAINPOOL_P384R1: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.36.3.3.2.8.1.1.11");

/// Curves supported for key agreement and signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    /// prime256v1
    NistP256,
    /// secp384r1
    NistP384,
}

impl EcCurve {
    /// Size of one field element in bytes.
    pub fn coordinate_size(&self) -> usize {
        match self {
            EcCurve::NistP256 => 32,
            EcCurve::NistP384 => 48,
        }
    }

    /// Size of an uncompressed point: 0x04 ‖ X ‖ Y.
    pub fn public_key_size(&self) -> usize {
        1 + 2 * self.coordinate_size()
    }

    /// Size of a raw r‖s signature.
    pub fn signature_size(&self) -> usize {
        2 * self.coordinate_size()
    }

    /// Named-curve OID.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            EcCurve::NistP256 => OID_PRIME256V1,
            EcCurve::NistP384 => OID_SECP384R1,
        }
    }

    /// OpenSSL short name.
    pub fn name(&self) -> &'static str {
        match self {
            EcCurve::NistP256 => "prime256v1",
            EcCurve::NistP384 => "secp384r1",
        }
    }

    /// Map a named-curve OID to a supported curve.
    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        match *oid {
            OID_PRIME256V1 => Ok(EcCurve::NistP256),
            OID_SECP384R1 => Ok(EcCurve::NistP384),
            other => Err(BspError::UnsupportedCurve(
                curve_name_for_oid(&other).map_or_else(|| other.to_string(), str::to_owned),
            )),
        }
    }

    /// Detect the curve from an EC SubjectPublicKeyInfo.
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
            return Err(BspError::UnsupportedCurve(format!(
                "Not an EC public key: {}",
                spki.algorithm.oid
            )));
        }

        let parameters = spki
            .algorithm
            .parameters
            .as_ref()
            .ok_or_else(|| BspError::UnsupportedCurve("Missing curve parameters".into()))?;
        let oid = parameters
            .decode_as::<ObjectIdentifier>()
            .map_err(|e| BspError::UnsupportedCurve(format!("Curve is not a named curve: {}", e)))?;

        Self::from_oid(&oid)
    }

    /// Detect the curve of a DER certificate's public key.
    pub fn from_certificate(der: &[u8]) -> Result<Self> {
        let cert = Certificate::from_der(der)
            .map_err(|e| BspError::InvalidCertificate(format!("Failed to parse certificate: {}", e)))?;
        Self::from_spki(&cert.tbs_certificate.subject_public_key_info)
    }
}

/// Name for a curve OID, including curves only recognised for reporting.
pub fn curve_name_for_oid(oid: &ObjectIdentifier) -> Option<&'static str> {
    match *oid {
        OID_PRIME256V1 => Some("prime256v1"),
        OID_SECP384R1 => Some("secp384r1"),
        OID_BRAINPOOL_P256R1 => Some("brainpoolP256r1"),
        OID_BRAINPOOL_P384R1 => Some("brainpoolP384r1"),
        _ => None,
    }
}

/// One-time key pair for the handshake ECDH.
pub enum EphemeralKeyPair {
    NistP256(p256::ecdh::EphemeralSecret),
    NistP384(p384::ecdh::EphemeralSecret),
}

impl EphemeralKeyPair {
    /// Curve of this key pair.
    pub fn curve(&self) -> EcCurve {
        match self {
            EphemeralKeyPair::NistP256(_) => EcCurve::NistP256,
            EphemeralKeyPair::NistP384(_) => EcCurve::NistP384,
        }
    }

    /// Public key as an uncompressed point.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            EphemeralKeyPair::NistP256(secret) => {
                secret.public_key().to_encoded_point(false).as_bytes().to_vec()
            }
            EphemeralKeyPair::NistP384(secret) => {
                secret.public_key().to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("curve", &self.curve())
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

/// Generate a random ephemeral key pair on the given curve.
pub fn generate_ephemeral_keypair(curve: EcCurve) -> EphemeralKeyPair {
    match curve {
        EcCurve::NistP256 => EphemeralKeyPair::NistP256(p256::ecdh::EphemeralSecret::random(&mut OsRng)),
        EcCurve::NistP384 => EphemeralKeyPair::NistP384(p384::ecdh::EphemeralSecret::random(&mut OsRng)),
    }
}

/// Perform ECDH with the peer's uncompressed point.
///
/// # Arguments
/// * `own` - Our ephemeral key pair
/// * `peer_public_key` - Peer point, 0x04 ‖ X ‖ Y on the same curve
///
/// # Returns
/// The shared secret (x-coordinate of the shared point)
pub fn compute_shared_secret(
    own: &EphemeralKeyPair,
    peer_public_key: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let curve = own.curve();
    if peer_public_key.len() != curve.public_key_size() || peer_public_key[0] != 0x04 {
        return Err(BspError::IncompatibleCurve(format!(
            "Peer key of {} bytes is not an uncompressed {} point ({} bytes)",
            peer_public_key.len(),
            curve.name(),
            curve.public_key_size()
        )));
    }

    let shared = match own {
        EphemeralKeyPair::NistP256(secret) => {
            let peer = p256::PublicKey::from_sec1_bytes(peer_public_key)
                .map_err(|e| BspError::InvalidPublicKey(format!("Peer point rejected: {}", e)))?;
            secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
        }
        EphemeralKeyPair::NistP384(secret) => {
            let peer = p384::PublicKey::from_sec1_bytes(peer_public_key)
                .map_err(|e| BspError::InvalidPublicKey(format!("Peer point rejected: {}", e)))?;
            secret.diffie_hellman(&peer).raw_secret_bytes().to_vec()
        }
    };

    Ok(Zeroizing::new(shared))
}

/// Whether two public keys are uncompressed points of the same size.
pub fn verify_ecdh_compatible(key_a: &[u8], key_b: &[u8]) -> bool {
    let uncompressed = |key: &[u8]| key.first() == Some(&0x04);
    if !uncompressed(key_a) || !uncompressed(key_b) {
        return false;
    }

    matches!((key_a.len(), key_b.len()), (65, 65) | (97, 97))
}

/// Long-term ECDSA key used to sign handshake data.
pub enum SigningKeyPair {
    NistP256(p256::ecdsa::SigningKey),
    NistP384(p384::ecdsa::SigningKey),
}

impl SigningKeyPair {
    /// Generate a random signing key.
    pub fn generate(curve: EcCurve) -> Self {
        match curve {
            EcCurve::NistP256 => SigningKeyPair::NistP256(p256::ecdsa::SigningKey::random(&mut OsRng)),
            EcCurve::NistP384 => SigningKeyPair::NistP384(p384::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    /// Load a key from its big-endian private scalar.
    pub fn from_bytes(curve: EcCurve, scalar: &[u8]) -> Result<Self> {
        if scalar.len() != curve.coordinate_size() {
            return Err(BspError::InvalidKeyLength {
                expected: curve.coordinate_size(),
                actual: scalar.len(),
            });
        }

        match curve {
            EcCurve::NistP256 => p256::ecdsa::SigningKey::from_slice(scalar)
                .map(SigningKeyPair::NistP256)
                .map_err(|e| BspError::InvalidPrivateKey(format!("Invalid P-256 scalar: {}", e))),
            EcCurve::NistP384 => p384::ecdsa::SigningKey::from_slice(scalar)
                .map(SigningKeyPair::NistP384)
                .map_err(|e| BspError::InvalidPrivateKey(format!("Invalid P-384 scalar: {}", e))),
        }
    }

    /// Load a key from PKCS#8 DER. The curve comes from the key's parameters.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(SigningKeyPair::NistP256(key));
        }

        p384::ecdsa::SigningKey::from_pkcs8_der(der)
            .map(SigningKeyPair::NistP384)
            .map_err(|e| BspError::InvalidPrivateKey(format!("Unsupported PKCS#8 key: {}", e)))
    }

    /// Curve of this key.
    pub fn curve(&self) -> EcCurve {
        match self {
            SigningKeyPair::NistP256(_) => EcCurve::NistP256,
            SigningKeyPair::NistP384(_) => EcCurve::NistP384,
        }
    }

    /// Public key as an uncompressed point.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            SigningKeyPair::NistP256(key) => {
                key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
            }
            SigningKeyPair::NistP384(key) => {
                key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("curve", &self.curve())
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}
