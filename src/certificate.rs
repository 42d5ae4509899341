//! Certificate inspection: EIDs, permitted EIN ranges, RSP roles and keys.

use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::{Any, Decode, Tag, Tagged};
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{
    AuthorityKeyIdentifier, CertificatePolicies, NameConstraints, SubjectKeyIdentifier,
};
use x509_cert::name::Name;
use x509_cert::Certificate;

use crate::keys::{curve_name_for_oid, EcCurve, OID_EC_PUBLIC_KEY};
use crate::types::{BspError, Result};

/// X.520 serialNumber attribute.
pub const OID_SERIAL_NUMBER: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.5");

/// GSMA permittedEins extension (SEQUENCE OF PrintableString).
pub const OID_PERMITTED_EINS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.23.146.1.2.2.0");

/// Certificate policy roles defined for the RSP ecosystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RspRole {
    Ci,
    Euicc,
    Eum,
    DpTls,
    DpAuth,
    DpPb,
}

impl RspRole {
    /// Certificate policy OID of the role.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            RspRole::Ci => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.0"),
            RspRole::Euicc => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.1"),
            RspRole::Eum => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.2"),
            RspRole::DpTls => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.3"),
            RspRole::DpAuth => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.4"),
            RspRole::DpPb => ObjectIdentifier::new_unwrap("2.23.146.1.2.1.5"),
        }
    }
}

/// EIN prefixes an EUM certificate permits, in the form the certificate uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermittedRange {
    /// serialNumber prefixes in directoryName permitted subtrees.
    NameConstraintSerialNumbers(Vec<String>),
    /// Entries of the permittedEins extension.
    PermittedEins(Vec<String>),
}

impl PermittedRange {
    /// The permitted prefixes.
    pub fn prefixes(&self) -> &[String] {
        match self {
            PermittedRange::NameConstraintSerialNumbers(prefixes) => prefixes,
            PermittedRange::PermittedEins(prefixes) => prefixes,
        }
    }
}

/// Parse a DER certificate.
pub fn parse_certificate(der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(der)
        .map_err(|e| BspError::InvalidCertificate(format!("Failed to parse certificate: {}", e)))
}

/// Curve and uncompressed point of a certificate's EC public key.
pub fn public_key_point(certificate: &Certificate) -> Result<(EcCurve, Vec<u8>)> {
    let spki = &certificate.tbs_certificate.subject_public_key_info;
    let curve = EcCurve::from_spki(spki)?;
    let point = spki
        .subject_public_key
        .as_bytes()
        .ok_or_else(|| BspError::InvalidPublicKey("Public key has unused bits".into()))?;

    if point.len() != curve.public_key_size() || point[0] != 0x04 {
        return Err(BspError::InvalidPublicKey(format!(
            "Expected uncompressed {} point, got {} bytes",
            curve.name(),
            point.len()
        )));
    }
    Ok((curve, point.to_vec()))
}

/// First value of an attribute in a distinguished name.
pub fn name_attribute(name: &Name, oid: ObjectIdentifier) -> Option<String> {
    name.0
        .iter()
        .flat_map(|rdn| rdn.0.iter())
        .find(|atv| atv.oid == oid)
        .and_then(|atv| std::str::from_utf8(atv.value.value()).ok())
        .map(str::to_owned)
}

/// EID from the subject serialNumber of an eUICC certificate.
pub fn get_eid(certificate: &Certificate) -> Result<String> {
    name_attribute(&certificate.tbs_certificate.subject, OID_SERIAL_NUMBER).ok_or_else(|| {
        BspError::InvalidCertificate("Subject has no serialNumber (EID)".into())
    })
}

/// Subject key identifier, if present.
pub fn subject_key_identifier(certificate: &Certificate) -> Result<Option<Vec<u8>>> {
    let extension = certificate
        .tbs_certificate
        .get::<SubjectKeyIdentifier>()
        .map_err(|e| BspError::InvalidCertificate(format!("Bad subjectKeyIdentifier: {}", e)))?;
    Ok(extension.map(|(_, ski)| ski.0.as_bytes().to_vec()))
}

/// Key identifier of the authority key identifier, if present.
pub fn authority_key_identifier(certificate: &Certificate) -> Result<Option<Vec<u8>>> {
    let extension = certificate
        .tbs_certificate
        .get::<AuthorityKeyIdentifier>()
        .map_err(|e| BspError::InvalidCertificate(format!("Bad authorityKeyIdentifier: {}", e)))?;
    Ok(extension.and_then(|(_, aki)| aki.key_identifier.map(|id| id.as_bytes().to_vec())))
}

/// Whether the certificate carries the role's policy OID.
pub fn has_rsp_role(certificate: &Certificate, role: RspRole) -> bool {
    has_policy(certificate, role.oid())
}

fn has_policy(certificate: &Certificate, oid: ObjectIdentifier) -> bool {
    match certificate.tbs_certificate.get::<CertificatePolicies>() {
        Ok(Some((_, policies))) => policies.0.iter().any(|policy| policy.policy_identifier == oid),
        Ok(None) => false,
        Err(e) => {
            tracing::debug!("unreadable certificatePolicies: {}", e);
            false
        }
    }
}

/// Short name of the certificate key's curve, or "unknown".
pub fn curve_name(certificate: &Certificate) -> &'static str {
    let algorithm = &certificate.tbs_certificate.subject_public_key_info.algorithm;
    if algorithm.oid != OID_EC_PUBLIC_KEY {
        return "unknown";
    }

    algorithm
        .parameters
        .as_ref()
        .and_then(|parameters| parameters.decode_as::<ObjectIdentifier>().ok())
        .and_then(|oid| curve_name_for_oid(&oid))
        .unwrap_or("unknown")
}

/// Extract the EIN prefixes an EUM certificate permits.
///
/// Certificates carrying the EUM role policy use the name-constraint form;
/// all others are read from the permittedEins extension.
pub fn extract_permitted_ranges(eum_certificate: &Certificate) -> Result<PermittedRange> {
    if has_rsp_role(eum_certificate, RspRole::Eum) {
        return name_constraint_serial_numbers(eum_certificate)
            .map(PermittedRange::NameConstraintSerialNumbers);
    }
    permitted_eins_extension(eum_certificate).map(PermittedRange::PermittedEins)
}

fn name_constraint_serial_numbers(certificate: &Certificate) -> Result<Vec<String>> {
    let constraints = certificate
        .tbs_certificate
        .get::<NameConstraints>()
        .map_err(|e| BspError::InvalidCertificate(format!("Bad nameConstraints: {}", e)))?;

    let subtrees = constraints
        .and_then(|(_, nc)| nc.permitted_subtrees)
        .unwrap_or_default();

    Ok(subtrees
        .iter()
        .filter_map(|subtree| match &subtree.base {
            GeneralName::DirectoryName(name) => name_attribute(name, OID_SERIAL_NUMBER),
            _ => None,
        })
        .collect())
}

fn permitted_eins_extension(certificate: &Certificate) -> Result<Vec<String>> {
    let extension = certificate
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == OID_PERMITTED_EINS);

    let Some(extension) = extension else {
        return Ok(Vec::new());
    };

    let entries = Vec::<Any>::from_der(extension.extn_value.as_bytes())
        .map_err(|e| BspError::InvalidCertificate(format!("Bad permittedEins: {}", e)))?;

    Ok(entries
        .iter()
        .filter(|entry| entry.tag() == Tag::PrintableString)
        .filter_map(|entry| std::str::from_utf8(entry.value()).ok())
        .map(str::to_owned)
        .collect())
}

/// Permitted EINs joined with commas. Empty when none can be read.
pub fn permitted_eins_string(eum_certificate_der: &[u8]) -> String {
    let ranges = parse_certificate(eum_certificate_der).and_then(|cert| extract_permitted_ranges(&cert));
    match ranges {
        Ok(ranges) => ranges.prefixes().join(","),
        Err(e) => {
            tracing::warn!("failed to read permitted EINs: {}", e);
            String::new()
        }
    }
}

/// Case-insensitive prefix match of an identifier against permitted prefixes.
///
/// An empty prefix list never matches.
pub fn validate_identifier_in_range(identifier: &str, prefixes: &[String]) -> bool {
    let identifier = identifier.to_ascii_uppercase();
    prefixes
        .iter()
        .any(|prefix| identifier.starts_with(&prefix.to_ascii_uppercase()))
}

/// Check an EID against the ranges permitted by its EUM certificate.
pub fn validate_eid_range(eid: &str, eum_certificate_der: &[u8]) -> bool {
    let ranges = match parse_certificate(eum_certificate_der).and_then(|cert| extract_permitted_ranges(&cert)) {
        Ok(ranges) => ranges,
        Err(e) => {
            tracing::warn!("failed to read EUM ranges: {}", e);
            return false;
        }
    };

    if ranges.prefixes().is_empty() {
        tracing::warn!("no permitted EINs in EUM certificate");
        return false;
    }

    let permitted = validate_identifier_in_range(eid, ranges.prefixes());
    if permitted {
        tracing::debug!(eid, "EID within permitted EIN range");
    } else {
        tracing::info!(eid, permitted = %ranges.prefixes().join(","), "EID outside permitted EIN range");
    }
    permitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        CertificateParams, CustomExtension, DistinguishedName, DnType, DnValue, IsCa, KeyPair,
        PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384,
    };
    use std::str::FromStr;
    use x509_cert::der::Encode;
    use x509_cert::ext::pkix::constraints::name::GeneralSubtree;

    const SERIAL_NUMBER: &[u64] = &[2, 5, 4, 5];
    const CERTIFICATE_POLICIES: &[u64] = &[2, 5, 29, 32];
    const NAME_CONSTRAINTS: &[u64] = &[2, 5, 29, 30];
    const PERMITTED_EINS: &[u64] = &[2, 23, 146, 1, 2, 2, 0];

    fn serial_dn(serial: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "Test");
        dn.push(
            DnType::CustomDnType(SERIAL_NUMBER.to_vec()),
            DnValue::PrintableString(serial.try_into().unwrap()),
        );
        dn
    }

    // certificatePolicies with a single policy OID, no qualifiers.
    fn policies_extension(policy: ObjectIdentifier) -> CustomExtension {
        let oid = policy.as_bytes();
        let mut info = vec![0x06, oid.len() as u8];
        info.extend_from_slice(oid);
        let mut policy_info = vec![0x30, info.len() as u8];
        policy_info.extend(info);
        let mut der = vec![0x30, policy_info.len() as u8];
        der.extend(policy_info);
        CustomExtension::from_oid_content(CERTIFICATE_POLICIES, der)
    }

    // Permitted directoryName subtrees matching serial_dn(prefix). rcgen tags
    // directoryName implicitly, so the extension is encoded with x509-cert.
    fn serial_number_constraints(prefixes: &[&str]) -> CustomExtension {
        let subtrees = prefixes
            .iter()
            .map(|prefix| GeneralSubtree {
                base: GeneralName::DirectoryName(
                    Name::from_str(&format!("serialNumber={},CN=Test", prefix)).unwrap(),
                ),
                minimum: 0,
                maximum: None,
            })
            .collect();
        let constraints = NameConstraints {
            permitted_subtrees: Some(subtrees),
            excluded_subtrees: None,
        };
        let mut extension = CustomExtension::from_oid_content(NAME_CONSTRAINTS, constraints.to_der().unwrap());
        extension.set_criticality(true);
        extension
    }

    fn permitted_eins_extension_der(eins: &[&str]) -> CustomExtension {
        let mut body = Vec::new();
        for ein in eins {
            body.push(0x13);
            body.push(ein.len() as u8);
            body.extend_from_slice(ein.as_bytes());
        }
        let mut der = vec![0x30, body.len() as u8];
        der.extend(body);
        CustomExtension::from_oid_content(PERMITTED_EINS, der)
    }

    fn self_signed(params: CertificateParams, alg: &'static rcgen::SignatureAlgorithm) -> Vec<u8> {
        let key = KeyPair::generate_for(alg).unwrap();
        params.self_signed(&key).unwrap().der().to_vec()
    }

    fn legacy_eum(prefixes: &[&str]) -> Vec<u8> {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = serial_dn("EUM-1");
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
        params.custom_extensions.push(serial_number_constraints(prefixes));
        params
            .custom_extensions
            .push(policies_extension(RspRole::Eum.oid()));
        self_signed(params, &PKCS_ECDSA_P256_SHA256)
    }

    fn extension_eum(eins: &[&str]) -> Vec<u8> {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = serial_dn("EUM-2");
        params.custom_extensions.push(permitted_eins_extension_der(eins));
        self_signed(params, &PKCS_ECDSA_P256_SHA256)
    }

    #[test]
    fn test_get_eid() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = serial_dn("89049032123456789012345678901235");
        let cert = parse_certificate(&self_signed(params, &PKCS_ECDSA_P256_SHA256)).unwrap();
        assert_eq!(get_eid(&cert).unwrap(), "89049032123456789012345678901235");
    }

    #[test]
    fn test_get_eid_missing() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name.push(DnType::CommonName, "No EID");
        let cert = parse_certificate(&self_signed(params, &PKCS_ECDSA_P256_SHA256)).unwrap();
        assert!(matches!(get_eid(&cert), Err(BspError::InvalidCertificate(_))));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_certificate(&[0x30, 0x03, 0x01, 0x01, 0x00]),
            Err(BspError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_curve_detection() {
        let p256 = self_signed(CertificateParams::new(vec!["a".into()]).unwrap(), &PKCS_ECDSA_P256_SHA256);
        let p384 = self_signed(CertificateParams::new(vec!["b".into()]).unwrap(), &PKCS_ECDSA_P384_SHA384);

        assert_eq!(curve_name(&parse_certificate(&p256).unwrap()), "prime256v1");
        assert_eq!(curve_name(&parse_certificate(&p384).unwrap()), "secp384r1");
        assert_eq!(EcCurve::from_certificate(&p256).unwrap(), EcCurve::NistP256);
        assert_eq!(EcCurve::from_certificate(&p384).unwrap(), EcCurve::NistP384);

        let (curve, point) = public_key_point(&parse_certificate(&p384).unwrap()).unwrap();
        assert_eq!(curve, EcCurve::NistP384);
        assert_eq!(point.len(), 97);
    }

    #[test]
    fn test_has_rsp_role() {
        let cert = parse_certificate(&legacy_eum(&["89049032"])).unwrap();
        assert!(has_rsp_role(&cert, RspRole::Eum));
        assert!(!has_rsp_role(&cert, RspRole::Ci));
        assert!(!has_rsp_role(&cert, RspRole::DpAuth));

        let plain = parse_certificate(&extension_eum(&["89049032"])).unwrap();
        assert!(!has_rsp_role(&plain, RspRole::Eum));
    }

    #[test]
    fn test_key_identifiers() {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let cert = parse_certificate(&self_signed(params, &PKCS_ECDSA_P256_SHA256)).unwrap();
        let ski = subject_key_identifier(&cert).unwrap();
        assert!(ski.is_some_and(|id| !id.is_empty()));
        assert_eq!(authority_key_identifier(&cert).unwrap(), None);

        let leaf = self_signed(CertificateParams::new(vec!["a".into()]).unwrap(), &PKCS_ECDSA_P256_SHA256);
        assert_eq!(subject_key_identifier(&parse_certificate(&leaf).unwrap()).unwrap(), None);
    }

    #[test]
    fn test_ranges_from_name_constraints() {
        let cert = parse_certificate(&legacy_eum(&["89049032", "89086030"])).unwrap();
        let ranges = extract_permitted_ranges(&cert).unwrap();
        assert_eq!(
            ranges,
            PermittedRange::NameConstraintSerialNumbers(vec!["89049032".into(), "89086030".into()])
        );
    }

    #[test]
    fn test_ranges_from_permitted_eins() {
        let cert = parse_certificate(&extension_eum(&["89049032", "89001012"])).unwrap();
        let ranges = extract_permitted_ranges(&cert).unwrap();
        assert_eq!(
            ranges,
            PermittedRange::PermittedEins(vec!["89049032".into(), "89001012".into()])
        );
        assert_eq!(
            permitted_eins_string(&extension_eum(&["89049032", "89001012"])),
            "89049032,89001012"
        );
    }

    #[test]
    fn test_validate_eid_range() {
        let eum = legacy_eum(&["89049032"]);
        assert!(validate_eid_range("8904903212345678901234567890", &eum));
        assert!(!validate_eid_range("8905000000000000000000000000", &eum));

        let eum = extension_eum(&["89049032"]);
        assert!(validate_eid_range("8904903212345678901234567890", &eum));

        let empty = extension_eum(&[]);
        assert!(!validate_eid_range("8904903212345678901234567890", &empty));
        assert!(!validate_eid_range("8904903212345678901234567890", &[0x30]));
    }

    #[test]
    fn test_validate_identifier_in_range() {
        let prefixes = vec!["8904903A".to_string()];
        assert!(validate_identifier_in_range("8904903a00", &prefixes));
        assert!(!validate_identifier_in_range("8904903", &prefixes));
        assert!(!validate_identifier_in_range("89049032", &[]));
    }
}
