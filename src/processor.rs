//! Bound Profile Package processing pipeline and the matching encoder.
//!
//! Segments are consumed in the fixed order configure → metadata →
//! (key replacement) → profile data. When a ReplaceSessionKeys segment is
//! present, the profile data is processed by a new `BspCrypto` built from
//! the PPKs it carries.

use crate::bsp::BspCrypto;
use crate::package::BoundProfilePackage;
use crate::replace_keys::ReplaceSessionKeysRequest;
use crate::segment::Segment;
use crate::types::{
    BspError, Result, TAG_CONFIGURE_ISDP, TAG_PROFILE_DATA, TAG_REPLACE_SESSION_KEYS,
    TAG_STORE_METADATA,
};

/// Pipeline states, in processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingState {
    Init,
    ConfigureDecoded,
    MetadataVerified,
    KeysReplaced,
    NoReplacement,
    ProfileDecoded,
    Done,
}

/// Plaintext output of a fully processed package.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessedPackage {
    /// Decrypted ConfigureISDP request.
    pub configure_isdp: Vec<u8>,
    /// Verified StoreMetadata request (concatenated).
    pub store_metadata: Vec<u8>,
    /// Decrypted profile data (concatenated).
    pub profile_data: Vec<u8>,
    /// PPKs that replaced the session keys, if the package carried them.
    pub replaced_keys: Option<ReplaceSessionKeysRequest>,
}

impl ProcessedPackage {
    /// Whether the profile data was protected with PPKs.
    pub fn has_replaced_keys(&self) -> bool {
        self.replaced_keys.is_some()
    }
}

/// Drives a `BspCrypto` session through one Bound Profile Package.
#[derive(Debug)]
pub struct BppProcessor {
    session: BspCrypto,
    state: ProcessingState,
}

impl BppProcessor {
    /// Create a processor over a freshly derived session.
    pub fn new(session: BspCrypto) -> Self {
        Self {
            session,
            state: ProcessingState::Init,
        }
    }

    /// Process the package. Any failure aborts the whole pipeline.
    ///
    /// # Arguments
    /// * `package` - The decoded package
    ///
    /// # Returns
    /// The decrypted configuration, metadata and profile data
    pub fn process(mut self, package: &BoundProfilePackage) -> Result<ProcessedPackage> {
        let mut output = ProcessedPackage::default();

        loop {
            let next = match self.state {
                ProcessingState::Init => {
                    for segment in &package.configure_isdp {
                        output.configure_isdp.extend(self.decrypt(segment)?);
                    }
                    ProcessingState::ConfigureDecoded
                }
                ProcessingState::ConfigureDecoded => {
                    for segment in &package.store_metadata {
                        output
                            .store_metadata
                            .extend(self.session.authenticate_and_maybe_decrypt(segment, false)?);
                    }
                    ProcessingState::MetadataVerified
                }
                ProcessingState::MetadataVerified => match &package.replace_session_keys {
                    Some(segment) => {
                        let plaintext = self.decrypt(segment)?;
                        let request = ReplaceSessionKeysRequest::decode(&plaintext)?;
                        self.session = BspCrypto::from_replacement(&request);
                        tracing::info!("session keys replaced with PPKs");
                        output.replaced_keys = Some(request);
                        ProcessingState::KeysReplaced
                    }
                    None => ProcessingState::NoReplacement,
                },
                ProcessingState::KeysReplaced | ProcessingState::NoReplacement => {
                    for segment in &package.profile_data {
                        output.profile_data.extend(self.decrypt(segment)?);
                    }
                    ProcessingState::ProfileDecoded
                }
                ProcessingState::ProfileDecoded => ProcessingState::Done,
                ProcessingState::Done => break,
            };

            tracing::debug!(from = ?self.state, to = ?next, "BPP state transition");
            self.state = next;
        }

        tracing::debug!(
            configure_len = output.configure_isdp.len(),
            metadata_segments = package.store_metadata.len(),
            metadata_len = output.store_metadata.len(),
            profile_segments = package.profile_data.len(),
            profile_len = output.profile_data.len(),
            "bound profile package processed"
        );
        Ok(output)
    }

    fn decrypt(&mut self, segment: &Segment) -> Result<Vec<u8>> {
        self.session.authenticate_and_maybe_decrypt(segment, true)
    }
}

/// Derive session keys and process an encoded Bound Profile Package.
///
/// # Arguments
/// * `shared_secret` - ECDH shared secret
/// * `key_type` - Key type from the control reference template
/// * `key_length` - Key length from the control reference template
/// * `host_id` - Host identifier
/// * `eid` - eUICC identifier (binary)
/// * `package_bytes` - BF36-encoded package
///
/// # Returns
/// The processed package, or the first error encountered
pub fn process_bound_profile_package(
    shared_secret: &[u8],
    key_type: u8,
    key_length: u8,
    host_id: &[u8],
    eid: &[u8],
    package_bytes: &[u8],
) -> Result<ProcessedPackage> {
    let package = BoundProfilePackage::decode(package_bytes)?;
    let session = BspCrypto::from_kdf(shared_secret, key_type, key_length, host_id, eid)?;
    BppProcessor::new(session).process(&package)
}

/// Produces a Bound Profile Package from plaintext parts (SM-DP+ side).
#[derive(Debug)]
pub struct BoundProfilePackageBuilder {
    session: BspCrypto,
    initialise_secure_channel: Vec<u8>,
    replacement: Option<ReplaceSessionKeysRequest>,
}

impl BoundProfilePackageBuilder {
    /// Create a builder.
    ///
    /// # Arguments
    /// * `session` - Session keys shared with the eUICC
    /// * `initialise_secure_channel` - Encoded BF23 element placed at the head of the package
    pub fn new(session: BspCrypto, initialise_secure_channel: Vec<u8>) -> Self {
        Self {
            session,
            initialise_secure_channel,
            replacement: None,
        }
    }

    /// Protect the profile data with PPKs instead of the session keys.
    pub fn with_replacement_keys(mut self, request: ReplaceSessionKeysRequest) -> Self {
        self.replacement = Some(request);
        self
    }

    /// Encrypt and MAC all parts in protocol order.
    ///
    /// # Arguments
    /// * `configure_isdp` - ConfigureISDP request
    /// * `store_metadata` - StoreMetadata request (must not be empty)
    /// * `profile_data` - Profile elements
    pub fn build(
        mut self,
        configure_isdp: &[u8],
        store_metadata: &[u8],
        profile_data: &[u8],
    ) -> Result<BoundProfilePackage> {
        if store_metadata.is_empty() {
            return Err(BspError::MalformedPackage(
                "StoreMetadata must not be empty".into(),
            ));
        }

        let configure_isdp = encrypt_part(&mut self.session, TAG_CONFIGURE_ISDP, configure_isdp)?;
        let store_metadata = to_segments(
            self.session
                .authenticate_only_segmented(TAG_STORE_METADATA, store_metadata)?,
        )?;

        let replace_session_keys = match &self.replacement {
            Some(request) => {
                let encoded = self
                    .session
                    .encrypt_and_authenticate(TAG_REPLACE_SESSION_KEYS, &request.encode()?)?;
                self.session = BspCrypto::from_replacement(request);
                Some(Segment::decode(&encoded)?)
            }
            None => None,
        };

        let profile_data = encrypt_part(&mut self.session, TAG_PROFILE_DATA, profile_data)?;

        Ok(BoundProfilePackage {
            initialise_secure_channel: self.initialise_secure_channel,
            configure_isdp,
            store_metadata,
            replace_session_keys,
            profile_data,
        })
    }
}

fn encrypt_part(session: &mut BspCrypto, tag: u8, data: &[u8]) -> Result<Vec<Segment>> {
    if data.is_empty() {
        return to_segments(vec![session.encrypt_and_authenticate(tag, data)?]);
    }
    to_segments(session.encrypt_and_authenticate_segmented(tag, data)?)
}

fn to_segments(encoded: Vec<Vec<u8>>) -> Result<Vec<Segment>> {
    encoded.iter().map(|bytes| Segment::decode(bytes)).collect()
}
