//! Encrypted sync package containers
//!
//! A package wraps a [`SyncPayload`] for transmission to a paired device.
//!
//! ## Security Model
//!
//! 1. Serialize the payload to a canonical body (postcard, ordered maps)
//! 2. Derive the package key from the pairing secret (HKDF-SHA256)
//! 3. Encrypt the body with ChaCha20-Poly1305 under a fresh random nonce,
//!    authenticating the encoded metadata block as associated data
//!
//! The metadata block stays readable so a receiver can route and validate a
//! package before attempting decryption, but any change to it breaks the
//! AEAD tag.
//!
//! ## Wire Format
//!
//! ```text
//! +--------------------------------------------------+-------+------------------+
//! | metadata                                         | nonce | ciphertext       |
//! | version | sender id | sender name | created_at   | (12)  | (varint len)     |
//! | domains | config snapshot                        |       | body + tag (16)  |
//! +--------------------------------------------------+-------+------------------+
//! ```
//!
//! Every variable-length field is varint length-prefixed (postcard), so each
//! part can be located without decrypting. The first byte is always the
//! format version.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{derive_package_key, PackageCipher, NONCE_SIZE};
use crate::error::{SyncError, SyncResult};
use crate::types::{DeviceIdentity, SyncConfiguration, SyncDomain, SyncPayload};

/// Current container format version
pub const PACKAGE_VERSION: u8 = 1;

/// Cleartext header of a package. Contains no payload content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Format version; always the first encoded byte
    pub version: u8,
    pub sender_id: String,
    pub sender_name: String,
    pub created_at: DateTime<Utc>,
    /// Domains present in the encrypted body
    pub domains: BTreeSet<SyncDomain>,
    /// Sender's configuration when the package was built
    pub config: SyncConfiguration,
}

/// The three logical parts of a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageContainer {
    pub metadata: PackageMetadata,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Plaintext body, encrypted inside the container
#[derive(Serialize, Deserialize)]
struct PayloadBody {
    domain_blobs: BTreeMap<SyncDomain, Vec<u8>>,
    /// Canonical JSON of the payload metadata map
    metadata_json: Vec<u8>,
}

/// Result of a successful [`unpack`]
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedPackage {
    pub metadata: PackageMetadata,
    pub payload: SyncPayload,
}

/// Serialize, encrypt, and frame a payload.
///
/// A fresh nonce is drawn on every call, so packing the same payload twice
/// yields different bytes.
pub fn pack(
    payload: &SyncPayload,
    sender: &DeviceIdentity,
    config: &SyncConfiguration,
    shared_secret: &[u8],
) -> SyncResult<Vec<u8>> {
    let metadata = PackageMetadata {
        version: PACKAGE_VERSION,
        sender_id: sender.id.clone(),
        sender_name: sender.display_name.clone(),
        created_at: Utc::now(),
        domains: payload.domains(),
        config: config.clone(),
    };

    let metadata_json = serde_json::to_vec(&payload.metadata)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode metadata: {}", e)))?;
    let body = PayloadBody {
        domain_blobs: payload.domain_blobs.clone(),
        metadata_json,
    };
    let plaintext = postcard::to_allocvec(&body)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode payload: {}", e)))?;

    let aad = postcard::to_allocvec(&metadata)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode header: {}", e)))?;

    let nonce = PackageCipher::generate_nonce();
    let cipher = PackageCipher::new(&derive_package_key(shared_secret));
    let ciphertext = cipher.encrypt(&plaintext, &aad, &nonce)?;

    let container = PackageContainer {
        metadata,
        nonce,
        ciphertext,
    };
    postcard::to_allocvec(&container)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode package: {}", e)))
}

/// Read the cleartext metadata without decrypting.
pub fn peek_metadata(bytes: &[u8]) -> SyncResult<PackageMetadata> {
    split_metadata(bytes).map(|(metadata, _, _)| metadata)
}

/// Parse, decrypt, and validate a package.
///
/// # Errors
///
/// - `SyncError::MalformedPackage` if the container cannot be parsed
/// - `SyncError::PackageVersionUnsupported` if the version byte is unknown
/// - `SyncError::DecryptionFailed` on a wrong secret or any tampering
/// - `SyncError::SchemaValidation` if the body disagrees with the metadata
pub fn unpack(bytes: &[u8], shared_secret: &[u8]) -> SyncResult<UnpackedPackage> {
    let (metadata, aad, rest) = split_metadata(bytes)?;

    let ((nonce, ciphertext), trailing): (([u8; NONCE_SIZE], Vec<u8>), &[u8]) =
        postcard::take_from_bytes(rest)
            .map_err(|e| SyncError::MalformedPackage(format!("Invalid body framing: {}", e)))?;
    if !trailing.is_empty() {
        return Err(SyncError::MalformedPackage(format!(
            "{} trailing bytes after ciphertext",
            trailing.len()
        )));
    }

    let cipher = PackageCipher::new(&derive_package_key(shared_secret));
    let plaintext = cipher.decrypt(&ciphertext, aad, &nonce)?;

    let body: PayloadBody = postcard::from_bytes(&plaintext)
        .map_err(|e| SyncError::SchemaValidation(format!("Invalid payload body: {}", e)))?;
    let payload_metadata: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(&body.metadata_json)
            .map_err(|e| SyncError::SchemaValidation(format!("Invalid payload metadata: {}", e)))?;

    let payload = SyncPayload {
        domain_blobs: body.domain_blobs,
        metadata: payload_metadata,
    };
    validate(&metadata, &payload)?;

    Ok(UnpackedPackage { metadata, payload })
}

/// Decode the metadata block and return it with its raw bytes and the remainder.
fn split_metadata(bytes: &[u8]) -> SyncResult<(PackageMetadata, &[u8], &[u8])> {
    let version = *bytes
        .first()
        .ok_or_else(|| SyncError::MalformedPackage("empty package".to_string()))?;
    if version != PACKAGE_VERSION {
        return Err(SyncError::PackageVersionUnsupported(version));
    }

    let (metadata, rest): (PackageMetadata, &[u8]) = postcard::take_from_bytes(bytes)
        .map_err(|e| SyncError::MalformedPackage(format!("Invalid metadata block: {}", e)))?;
    let raw = &bytes[..bytes.len() - rest.len()];
    Ok((metadata, raw, rest))
}

fn validate(metadata: &PackageMetadata, payload: &SyncPayload) -> SyncResult<()> {
    let present = payload.domains();
    if present != metadata.domains {
        return Err(SyncError::SchemaValidation(format!(
            "body carries {:?} but metadata declares {:?}",
            present, metadata.domains
        )));
    }
    if let Some(domain) = present
        .iter()
        .find(|d| !metadata.config.sync_domains.contains(d))
    {
        return Err(SyncError::SchemaValidation(format!(
            "domain {} is not enabled in the sender configuration",
            domain
        )));
    }
    Ok(())
}
