//! ECDSA signing and verification for handshake data.
//!
//! Signatures travel as fixed-size raw r‖s values. The hash is SHA-256 on
//! both curves.

use p256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use sha2::{Digest, Sha256};
use x509_cert::der::asn1::UintRef;
use x509_cert::der::{Decode, Encode};

use crate::certificate::{parse_certificate, public_key_point};
use crate::keys::{EcCurve, SigningKeyPair};
use crate::types::{BspError, Result};

/// Tag and length prefix of a signature carried as `[APPLICATION 55]`.
pub const SIGNATURE_TAG_PREFIX: [u8; 3] = [0x5F, 0x37, 0x40];

/// Sign data with a long-term key.
///
/// # Arguments
/// * `data` - The data to sign
/// * `key` - P-256 or P-384 signing key
///
/// # Returns
/// The raw r‖s signature (2 × coordinate size bytes)
pub fn sign_with_key(data: &[u8], key: &SigningKeyPair) -> Result<Vec<u8>> {
    let digest = Sha256::digest(data);

    match key {
        SigningKeyPair::NistP256(signing_key) => {
            let signature: p256::ecdsa::Signature = signing_key
                .sign_prehash(&digest)
                .map_err(|e| BspError::SigningFailed(format!("P-256 signing failed: {}", e)))?;
            Ok(signature.to_bytes().to_vec())
        }
        SigningKeyPair::NistP384(signing_key) => {
            let signature: p384::ecdsa::Signature = signing_key
                .sign_prehash(&digest)
                .map_err(|e| BspError::SigningFailed(format!("P-384 signing failed: {}", e)))?;
            Ok(signature.to_bytes().to_vec())
        }
    }
}

/// Verify a raw signature against an uncompressed public point.
///
/// A leading `5F 37 40` tag is stripped before verification.
///
/// # Arguments
/// * `data` - The signed data
/// * `signature` - Raw r‖s, optionally tagged
/// * `public_key` - Uncompressed signer point
/// * `curve` - Curve of the signer key
///
/// # Returns
/// `true` if the signature is valid
pub fn verify_signature(
    data: &[u8],
    signature: &[u8],
    public_key: &[u8],
    curve: EcCurve,
) -> Result<bool> {
    let raw = strip_signature_tag(signature);
    if raw.len() != curve.signature_size() {
        return Err(BspError::InvalidSignatureEncoding(format!(
            "Signature must be {} bytes for {}, got {}",
            curve.signature_size(),
            curve.name(),
            raw.len()
        )));
    }

    let digest = Sha256::digest(data);

    let valid = match curve {
        EcCurve::NistP256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|e| BspError::InvalidPublicKey(format!("Invalid P-256 key: {}", e)))?;
            match p256::ecdsa::Signature::from_slice(raw) {
                Ok(signature) => key.verify_prehash(&digest, &signature).is_ok(),
                Err(_) => false,
            }
        }
        EcCurve::NistP384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|e| BspError::InvalidPublicKey(format!("Invalid P-384 key: {}", e)))?;
            match p384::ecdsa::Signature::from_slice(raw) {
                Ok(signature) => key.verify_prehash(&digest, &signature).is_ok(),
                Err(_) => false,
            }
        }
    };

    if !valid {
        tracing::debug!(curve = curve.name(), "signature verification failed");
    }
    Ok(valid)
}

/// Verify a raw signature with the public key of a DER certificate.
pub fn verify_with_certificate(data: &[u8], signature: &[u8], certificate_der: &[u8]) -> Result<bool> {
    let certificate = parse_certificate(certificate_der)?;
    let (curve, point) = public_key_point(&certificate)?;
    verify_signature(data, signature, &point, curve)
}

/// Convert raw r‖s to an ASN.1 `SEQUENCE { r INTEGER, s INTEGER }`.
///
/// A pure format conversion: r and s are not checked against the curve order.
pub fn raw_to_der(raw: &[u8], curve: EcCurve) -> Result<Vec<u8>> {
    if raw.len() != curve.signature_size() {
        return Err(BspError::InvalidSignatureEncoding(format!(
            "Raw signature must be {} bytes, got {}",
            curve.signature_size(),
            raw.len()
        )));
    }

    let (r, s) = raw.split_at(curve.coordinate_size());
    let integers = vec![
        UintRef::new(r).map_err(|e| BspError::InvalidSignatureEncoding(format!("Invalid r: {}", e)))?,
        UintRef::new(s).map_err(|e| BspError::InvalidSignatureEncoding(format!("Invalid s: {}", e)))?,
    ];
    integers
        .to_der()
        .map_err(|e| BspError::InvalidSignatureEncoding(format!("Failed to encode signature: {}", e)))
}

/// Convert an ASN.1 ECDSA signature to raw r‖s, zero-padded per coordinate.
pub fn der_to_raw(der: &[u8], curve: EcCurve) -> Result<Vec<u8>> {
    let integers = Vec::<UintRef>::from_der(der)
        .map_err(|e| BspError::InvalidSignatureEncoding(format!("Invalid DER signature: {}", e)))?;
    if integers.len() != 2 {
        return Err(BspError::InvalidSignatureEncoding(format!(
            "Expected 2 integers, got {}",
            integers.len()
        )));
    }

    let size = curve.coordinate_size();
    let mut raw = vec![0u8; 2 * size];
    for (index, integer) in integers.iter().enumerate() {
        let bytes = integer.as_bytes();
        if bytes.len() > size {
            return Err(BspError::InvalidSignatureEncoding(format!(
                "Integer of {} bytes exceeds the {} coordinate size",
                bytes.len(),
                curve.name()
            )));
        }
        let end = (index + 1) * size;
        raw[end - bytes.len()..end].copy_from_slice(bytes);
    }
    Ok(raw)
}

fn strip_signature_tag(signature: &[u8]) -> &[u8] {
    match signature.strip_prefix(&SIGNATURE_TAG_PREFIX) {
        Some(rest) => {
            tracing::debug!("stripping 5F3740 prefix from signature");
            rest
        }
        None => signature,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with(curve: EcCurve, r: &[u8], s: &[u8]) -> Vec<u8> {
        let size = curve.coordinate_size();
        let mut raw = vec![0u8; 2 * size];
        raw[size - r.len()..size].copy_from_slice(r);
        raw[2 * size - s.len()..].copy_from_slice(s);
        raw
    }

    #[test]
    fn test_sign_verify_both_curves() {
        for curve in [EcCurve::NistP256, EcCurve::NistP384] {
            let key = SigningKeyPair::generate(curve);
            let signature = sign_with_key(b"serverSigned1", &key).unwrap();
            assert_eq!(signature.len(), curve.signature_size());

            assert!(verify_signature(b"serverSigned1", &signature, &key.public_key(), curve).unwrap());
            assert!(!verify_signature(b"serverSigned2", &signature, &key.public_key(), curve).unwrap());
        }
    }

    #[test]
    fn test_verify_strips_tag_prefix() {
        let key = SigningKeyPair::generate(EcCurve::NistP256);
        let signature = sign_with_key(b"euiccSigned1", &key).unwrap();
        let tagged = [&SIGNATURE_TAG_PREFIX[..], signature.as_slice()].concat();

        assert!(verify_signature(b"euiccSigned1", &tagged, &key.public_key(), EcCurve::NistP256).unwrap());
    }

    #[test]
    fn test_verify_wrong_length() {
        let key = SigningKeyPair::generate(EcCurve::NistP256);
        let result = verify_signature(b"data", &[0u8; 63], &key.public_key(), EcCurve::NistP256);
        assert!(matches!(result, Err(BspError::InvalidSignatureEncoding(_))));
    }

    #[test]
    fn test_verify_wrong_key() {
        let signer = SigningKeyPair::generate(EcCurve::NistP256);
        let other = SigningKeyPair::generate(EcCurve::NistP256);
        let signature = sign_with_key(b"data", &signer).unwrap();
        assert!(!verify_signature(b"data", &signature, &other.public_key(), EcCurve::NistP256).unwrap());
    }

    #[test]
    fn test_raw_to_der_small_integers() {
        let raw = raw_with(EcCurve::NistP256, &[0x01], &[0x01]);
        let der = raw_to_der(&raw, EcCurve::NistP256).unwrap();
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01]);
        assert_eq!(der_to_raw(&der, EcCurve::NistP256).unwrap(), raw);
    }

    #[test]
    fn test_raw_to_der_high_bit() {
        let mut r = vec![0x80];
        r.extend([0x00; 30]);
        r.push(0x01);
        let raw = raw_with(EcCurve::NistP256, &r, &[0x7F, 0x02]);

        let der = raw_to_der(&raw, EcCurve::NistP256).unwrap();
        // r gains a leading zero octet, s stays two bytes.
        assert_eq!(&der[..5], &[0x30, 0x27, 0x02, 0x21, 0x00]);
        assert_eq!(&der[der.len() - 4..], &[0x02, 0x02, 0x7F, 0x02]);
        assert_eq!(der_to_raw(&der, EcCurve::NistP256).unwrap(), raw);
    }

    #[test]
    fn test_raw_to_der_ignores_curve_order() {
        let raw = [0xFF; 64];
        let der = raw_to_der(&raw, EcCurve::NistP256).unwrap();
        assert_eq!(der.len(), 70);
        assert_eq!(&der[..5], &[0x30, 0x44, 0x02, 0x21, 0x00]);
        assert_eq!(&der[37..40], &[0x02, 0x21, 0x00]);
        assert_eq!(der_to_raw(&der, EcCurve::NistP256).unwrap(), raw.to_vec());
    }

    #[test]
    fn test_zero_components() {
        let der = raw_to_der(&[0u8; 96], EcCurve::NistP384).unwrap();
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x00]);

        let raw = der_to_raw(&[0x30, 0x06, 0x02, 0x01, 0x00, 0x02, 0x01, 0x01], EcCurve::NistP256).unwrap();
        assert_eq!(raw, raw_with(EcCurve::NistP256, &[0x00], &[0x01]));
    }

    #[test]
    fn test_der_to_raw_rejects_wrong_integer_count() {
        assert!(matches!(
            der_to_raw(&[0x30, 0x03, 0x02, 0x01, 0x01], EcCurve::NistP256),
            Err(BspError::InvalidSignatureEncoding(_))
        ));
    }

    #[test]
    fn test_der_roundtrip_p384() {
        let key = SigningKeyPair::generate(EcCurve::NistP384);
        let raw = sign_with_key(b"data", &key).unwrap();
        let der = raw_to_der(&raw, EcCurve::NistP384).unwrap();
        assert_eq!(der[0], 0x30);
        assert_eq!(der_to_raw(&der, EcCurve::NistP384).unwrap(), raw);
    }

    #[test]
    fn test_raw_to_der_wrong_length() {
        assert!(matches!(
            raw_to_der(&[0x01; 65], EcCurve::NistP256),
            Err(BspError::InvalidSignatureEncoding(_))
        ));
        assert!(matches!(
            raw_to_der(&[0x01; 64], EcCurve::NistP384),
            Err(BspError::InvalidSignatureEncoding(_))
        ));
    }

    #[test]
    fn test_der_to_raw_rejects_oversized_integer() {
        // r is 33 significant bytes, wider than a P-256 coordinate.
        let mut der = vec![0x30, 0x26, 0x02, 0x21, 0x01];
        der.extend([0x00; 32]);
        der.extend([0x02, 0x01, 0x01]);
        assert!(matches!(
            der_to_raw(&der, EcCurve::NistP256),
            Err(BspError::InvalidSignatureEncoding(_))
        ));
    }

    #[test]
    fn test_der_to_raw_rejects_garbage() {
        assert!(der_to_raw(&[0x30, 0x03, 0x02, 0x01], EcCurve::NistP256).is_err());
        assert!(der_to_raw(&[], EcCurve::NistP384).is_err());
    }
}
