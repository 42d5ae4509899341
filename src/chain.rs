//! Certificate chain evaluation with the SGP.22 name-constraint exception.
//!
//! EUM certificates constrain eUICC subjects with directoryName subtrees
//! whose serialNumber is only a prefix of the EID, which strict X.509
//! processing reports as a permitted-subtree violation. The evaluator
//! accepts the three name-constraint errors (and nothing else) when
//! configured to.

use std::fmt;
use std::time::SystemTime;

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use sha2::{Digest, Sha256, Sha384};
use x509_cert::der::asn1::ObjectIdentifier;
use x509_cert::der::Encode;
use x509_cert::ext::pkix::constraints::name::GeneralSubtree;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, NameConstraints};
use x509_cert::name::{Name, RelativeDistinguishedName};
use x509_cert::Certificate;

use crate::certificate::{authority_key_identifier, parse_certificate, public_key_point, subject_key_identifier};
use crate::keys::EcCurve;
use crate::types::{BspError, Result};

/// ecdsa-with-SHA256.
pub const OID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");

/// ecdsa-with-SHA384.
pub const OID_ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");

/// Default bound on the anchor's depth (leaf = 0).
pub const DEFAULT_MAX_CHAIN_DEPTH: usize = 4;

/// Configuration for chain evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustConfig {
    /// Time to evaluate validity at. `None` means now.
    pub verification_time: Option<SystemTime>,
    /// Accept permitted, excluded and min/max name-constraint errors.
    pub tolerate_name_constraint_errors: bool,
    /// Verify the anchor's self-signature.
    pub check_root_signature: bool,
    /// Maximum depth of the anchor (leaf = 0).
    pub max_chain_depth: usize,
}

impl TrustConfig {
    /// Create a new configuration.
    pub fn new(tolerate_name_constraint_errors: bool, check_root_signature: bool, max_chain_depth: usize) -> Self {
        Self {
            verification_time: None,
            tolerate_name_constraint_errors,
            check_root_signature,
            max_chain_depth,
        }
    }

    /// RSP ecosystem defaults: name-constraint relaxation on.
    pub fn sgp22() -> Self {
        Self::new(true, true, DEFAULT_MAX_CHAIN_DEPTH)
    }

    /// Plain X.509 evaluation without relaxation.
    pub fn strict() -> Self {
        Self::new(false, true, DEFAULT_MAX_CHAIN_DEPTH)
    }

    /// Evaluate validity at a fixed time.
    pub fn at(mut self, time: SystemTime) -> Self {
        self.verification_time = Some(time);
        self
    }

    fn now(&self) -> SystemTime {
        self.verification_time.unwrap_or_else(SystemTime::now)
    }
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self::sgp22()
    }
}

/// Reason a certificate in the chain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyErrorKind {
    UnableToGetIssuer,
    SignatureFailure,
    NotYetValid,
    Expired,
    InvalidCa,
    PathLengthExceeded,
    ChainTooLong,
    PermittedViolation,
    ExcludedViolation,
    SubtreeMinMax,
    UnsupportedAlgorithm,
    UnsupportedNameForm,
    Malformed,
}

impl VerifyErrorKind {
    /// Whether this is one of the name-constraint errors.
    pub fn is_name_constraint_error(&self) -> bool {
        matches!(
            self,
            VerifyErrorKind::PermittedViolation
                | VerifyErrorKind::ExcludedViolation
                | VerifyErrorKind::SubtreeMinMax
        )
    }
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            VerifyErrorKind::UnableToGetIssuer => "unable to get local issuer certificate",
            VerifyErrorKind::SignatureFailure => "certificate signature failure",
            VerifyErrorKind::NotYetValid => "certificate is not yet valid",
            VerifyErrorKind::Expired => "certificate has expired",
            VerifyErrorKind::InvalidCa => "invalid CA certificate",
            VerifyErrorKind::PathLengthExceeded => "path length constraint exceeded",
            VerifyErrorKind::ChainTooLong => "certificate chain too long",
            VerifyErrorKind::PermittedViolation => "permitted subtree violation",
            VerifyErrorKind::ExcludedViolation => "excluded subtree violation",
            VerifyErrorKind::SubtreeMinMax => "name constraints minimum and maximum not supported",
            VerifyErrorKind::UnsupportedAlgorithm => "unsupported signature algorithm",
            VerifyErrorKind::UnsupportedNameForm => "unsupported name constraint type",
            VerifyErrorKind::Malformed => "malformed certificate",
        };
        f.write_str(text)
    }
}

/// Which certificate failed, why, and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainFailure {
    /// RFC 4514 subject of the failing certificate.
    pub subject: String,
    /// Error kind.
    pub error: VerifyErrorKind,
    /// Depth in the chain (leaf = 0).
    pub depth: usize,
}

impl fmt::Display for ChainFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at depth {} ({})", self.error, self.depth, self.subject)
    }
}

/// A chain that passed evaluation, leaf first.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    /// Certificates from the leaf to the anchor.
    pub certificates: Vec<Certificate>,
    /// Name-constraint errors that were accepted.
    pub tolerated: Vec<ChainFailure>,
}

impl VerifiedChain {
    /// The verified leaf.
    pub fn leaf(&self) -> &Certificate {
        &self.certificates[0]
    }

    /// The trust anchor the chain ends at.
    pub fn anchor(&self) -> &Certificate {
        &self.certificates[self.certificates.len() - 1]
    }

    /// Subjects from the leaf to the anchor.
    pub fn subjects(&self) -> Vec<String> {
        self.certificates.iter().map(subject_of).collect()
    }
}

/// Builds and verifies certificate paths.
#[derive(Debug, Clone, Default)]
pub struct TrustEvaluator {
    config: TrustConfig,
}

impl TrustEvaluator {
    /// Create an evaluator with the given configuration.
    pub fn new(config: TrustConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    /// Build a path from `leaf` to a trust anchor and verify it.
    ///
    /// # Arguments
    /// * `leaf` - DER certificate to verify
    /// * `pool` - DER certificates available as intermediates (and anchors without `root`)
    /// * `root` - Explicit trust anchor
    ///
    /// # Returns
    /// The verified chain, or `CertificateVerificationFailed` with the failing certificate
    pub fn build_and_verify<T: AsRef<[u8]>>(
        &self,
        leaf: &[u8],
        pool: &[T],
        root: Option<&[u8]>,
    ) -> Result<VerifiedChain> {
        let leaf = parse_certificate(leaf)?;
        let pool = pool
            .iter()
            .map(|der| parse_certificate(der.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        let anchors = match root {
            Some(der) => vec![parse_certificate(der)?],
            None => {
                let anchors: Vec<Certificate> = pool.iter().filter(|cert| is_self_issued(cert)).cloned().collect();
                tracing::warn!(
                    count = anchors.len(),
                    "no root supplied, trusting self-signed certificates from the pool"
                );
                anchors
            }
        };

        let intermediates: Vec<&Certificate> = pool
            .iter()
            .filter(|cert| **cert != leaf && !anchors.contains(*cert))
            .collect();

        let path = self.build_path(leaf, &anchors, &intermediates)?;
        tracing::debug!(chain = %path.iter().map(subject_of).collect::<Vec<_>>().join(" <- "), "built certificate chain");

        let tolerated = self.verify_path(&path)?;
        Ok(VerifiedChain {
            certificates: path,
            tolerated,
        })
    }

    fn build_path(
        &self,
        leaf: Certificate,
        anchors: &[Certificate],
        intermediates: &[&Certificate],
    ) -> Result<Vec<Certificate>> {
        let mut path = vec![leaf];

        loop {
            let depth = path.len() - 1;
            let current = &path[depth];

            if anchors.contains(current) {
                return Ok(path);
            }
            if depth >= self.config.max_chain_depth {
                return Err(failure(current, VerifyErrorKind::ChainTooLong, depth));
            }

            let issuer = anchors
                .iter()
                .find(|anchor| issued_by(current, anchor))
                .or_else(|| {
                    intermediates
                        .iter()
                        .copied()
                        .find(|candidate| !path.contains(*candidate) && issued_by(current, candidate))
                })
                .cloned();

            match issuer {
                Some(issuer) => path.push(issuer),
                None => return Err(failure(&path[depth], VerifyErrorKind::UnableToGetIssuer, depth)),
            }
        }
    }

    fn verify_path(&self, path: &[Certificate]) -> Result<Vec<ChainFailure>> {
        let now = self.config.now();
        let mut tolerated = Vec::new();
        let last = path.len() - 1;

        for (depth, cert) in path.iter().enumerate() {
            let mut checks = Vec::new();

            if depth < last {
                checks.push(verify_signed_by(cert, &path[depth + 1]));
            } else if self.config.check_root_signature && is_self_issued(cert) {
                checks.push(verify_signed_by(cert, cert));
            }

            checks.push(check_validity(cert, now));

            if depth > 0 {
                checks.push(check_ca(cert, depth, path));
            }

            if depth == 0 || !is_self_issued(cert) {
                checks.extend(path[depth + 1..].iter().map(|issuer| check_name_constraints(cert, issuer)));
            }

            for check in checks {
                let Err(kind) = check else { continue };
                if !(self.config.tolerate_name_constraint_errors && kind.is_name_constraint_error()) {
                    return Err(failure(cert, kind, depth));
                }

                let subject = subject_of(cert);
                tracing::info!(subject = %subject, depth, error = %kind, "accepting name constraint error");
                tolerated.push(ChainFailure {
                    subject,
                    error: kind,
                    depth,
                });
            }
        }

        Ok(tolerated)
    }
}

/// Verify a chain with the default configuration.
///
/// # Returns
/// `true` if a path to a trust anchor verifies
pub fn verify_certificate_chain<T: AsRef<[u8]>>(leaf: &[u8], pool: &[T], root: Option<&[u8]>) -> bool {
    match TrustEvaluator::default().build_and_verify(leaf, pool, root) {
        Ok(chain) => {
            tracing::info!(depth = chain.certificates.len() - 1, "certificate chain verified");
            true
        }
        Err(e) => {
            tracing::warn!("certificate chain rejected: {}", e);
            false
        }
    }
}

fn subject_of(cert: &Certificate) -> String {
    cert.tbs_certificate.subject.to_string()
}

fn failure(cert: &Certificate, error: VerifyErrorKind, depth: usize) -> BspError {
    BspError::CertificateVerificationFailed(ChainFailure {
        subject: subject_of(cert),
        error,
        depth,
    })
}

/// Subject equals issuer and, when both are present, AKI equals SKI.
fn is_self_issued(cert: &Certificate) -> bool {
    issued_by(cert, cert)
}

fn issued_by(child: &Certificate, issuer: &Certificate) -> bool {
    if child.tbs_certificate.issuer != issuer.tbs_certificate.subject {
        return false;
    }

    match (
        authority_key_identifier(child).ok().flatten(),
        subject_key_identifier(issuer).ok().flatten(),
    ) {
        (Some(aki), Some(ski)) => aki == ski,
        _ => true,
    }
}

fn verify_signed_by(cert: &Certificate, issuer: &Certificate) -> std::result::Result<(), VerifyErrorKind> {
    let algorithm = cert.signature_algorithm.oid;
    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|_| VerifyErrorKind::Malformed)?;
    let digest = match algorithm {
        OID_ECDSA_WITH_SHA256 => Sha256::digest(&tbs).to_vec(),
        OID_ECDSA_WITH_SHA384 => Sha384::digest(&tbs).to_vec(),
        _ => return Err(VerifyErrorKind::UnsupportedAlgorithm),
    };

    let (curve, point) = public_key_point(issuer).map_err(|_| VerifyErrorKind::UnsupportedAlgorithm)?;
    let signature = cert.signature.as_bytes().ok_or(VerifyErrorKind::Malformed)?;

    let verified = match curve {
        EcCurve::NistP256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(|_| VerifyErrorKind::Malformed)?;
            let signature = p256::ecdsa::Signature::from_der(signature).map_err(|_| VerifyErrorKind::SignatureFailure)?;
            key.verify_prehash(&digest, &signature).is_ok()
        }
        EcCurve::NistP384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&point).map_err(|_| VerifyErrorKind::Malformed)?;
            let signature = p384::ecdsa::Signature::from_der(signature).map_err(|_| VerifyErrorKind::SignatureFailure)?;
            key.verify_prehash(&digest, &signature).is_ok()
        }
    };

    if verified {
        Ok(())
    } else {
        Err(VerifyErrorKind::SignatureFailure)
    }
}

fn check_validity(cert: &Certificate, now: SystemTime) -> std::result::Result<(), VerifyErrorKind> {
    let validity = &cert.tbs_certificate.validity;
    if validity.not_before.to_system_time() > now {
        return Err(VerifyErrorKind::NotYetValid);
    }
    if validity.not_after.to_system_time() < now {
        return Err(VerifyErrorKind::Expired);
    }
    Ok(())
}

/// The issuer at `depth` must be a CA whose path length admits the
/// non-self-issued intermediates below it.
fn check_ca(cert: &Certificate, depth: usize, path: &[Certificate]) -> std::result::Result<(), VerifyErrorKind> {
    let constraints = match cert.tbs_certificate.get::<BasicConstraints>() {
        Ok(Some((_, constraints))) => constraints,
        Ok(None) => return Err(VerifyErrorKind::InvalidCa),
        Err(_) => return Err(VerifyErrorKind::Malformed),
    };
    if !constraints.ca {
        return Err(VerifyErrorKind::InvalidCa);
    }

    if let Some(limit) = constraints.path_len_constraint {
        let intermediates_below = path[1..depth].iter().filter(|c| !is_self_issued(c)).count();
        if intermediates_below > limit as usize {
            return Err(VerifyErrorKind::PathLengthExceeded);
        }
    }
    Ok(())
}

fn check_name_constraints(cert: &Certificate, issuer: &Certificate) -> std::result::Result<(), VerifyErrorKind> {
    match issuer.tbs_certificate.get::<NameConstraints>() {
        Ok(Some((_, constraints))) => check_subject_against(&cert.tbs_certificate.subject, &constraints),
        Ok(None) => Ok(()),
        Err(_) => Err(VerifyErrorKind::Malformed),
    }
}

fn check_subject_against(subject: &Name, constraints: &NameConstraints) -> std::result::Result<(), VerifyErrorKind> {
    let permitted = constraints.permitted_subtrees.iter().flatten();
    let excluded = constraints.excluded_subtrees.iter().flatten();

    for subtree in permitted.clone().chain(excluded.clone()) {
        if subtree.minimum != 0 || subtree.maximum.is_some() {
            return Err(VerifyErrorKind::SubtreeMinMax);
        }
        if matches!(subtree.base, GeneralName::EdiPartyName(_) | GeneralName::RegisteredId(_)) {
            return Err(VerifyErrorKind::UnsupportedNameForm);
        }
    }

    if subject.0.is_empty() {
        return Ok(());
    }

    let within = |subtree: &GeneralSubtree| match &subtree.base {
        GeneralName::DirectoryName(base) => Some(dn_within(base, subject)),
        _ => None,
    };

    if excluded.clone().filter_map(within).any(|matched| matched) {
        return Err(VerifyErrorKind::ExcludedViolation);
    }

    let mut permitted_dns = permitted.filter_map(within).peekable();
    if permitted_dns.peek().is_some() && !permitted_dns.any(|matched| matched) {
        return Err(VerifyErrorKind::PermittedViolation);
    }
    Ok(())
}

/// Whether `name` lies in the subtree rooted at `base`: every RDN of the
/// base matches the corresponding leading RDN of the name.
fn dn_within(base: &Name, name: &Name) -> bool {
    base.0.len() <= name.0.len() && base.0.iter().zip(name.0.iter()).all(|(b, n)| rdn_matches(b, n))
}

fn rdn_matches(base: &RelativeDistinguishedName, name: &RelativeDistinguishedName) -> bool {
    base.0.len() == name.0.len()
        && base.0.iter().zip(name.0.iter()).all(|(b, n)| {
            b.oid == n.oid && canonical_value(b.value.value()) == canonical_value(n.value.value())
        })
}

/// Case-folded value with surrounding whitespace removed and inner runs collapsed.
fn canonical_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len());
    for word in value.split(|b| b.is_ascii_whitespace()).filter(|w| !w.is_empty()) {
        if !out.is_empty() {
            out.push(b' ');
        }
        out.extend(word.iter().map(u8::to_ascii_lowercase));
    }
    out
}
