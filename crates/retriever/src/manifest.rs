//! The core index: the share's file-and-segment manifest.
//!
//! The manifest is serialised JSON, zlib-compressed, AES-GCM-encrypted
//! under the share master key, and signed with the folder's Ed25519 key.
//! Recipients verify the signature against the pinned verifying key
//! before trusting a single byte of the index. Oversized envelopes are
//! split across multiple index articles; the token (or share record)
//! carries their message ids.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use crypto::{verify_signature, FolderSigner, MasterKey, SegmentCipher};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RetrieverError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestCopy {
    pub redundancy_index: u8,
    pub message_id: String,
    /// SHA-256 of this copy's ciphertext, hex.
    pub hash: String,
    /// AES-GCM nonce, hex.
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestSegment {
    pub index: u32,
    /// Plaintext bytes covered by this segment.
    pub size: u64,
    pub offset_start: u64,
    pub offset_end: u64,
    pub compressed_size: Option<u64>,
    /// Set when this segment lives inside a packed article.
    pub packed_id: Option<String>,
    pub copies: Vec<ManifestCopy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestFile {
    pub file_id: String,
    pub path: String,
    pub size: u64,
    /// SHA-256 over the plaintext, hex; verified after reassembly.
    pub hash: String,
    pub segments: Vec<ManifestSegment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestPacked {
    pub packed_id: String,
    pub total_size: u64,
    pub compressed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareManifest {
    pub folder_id: String,
    pub folder_version: u32,
    pub folder_name: String,
    /// Ed25519 verifying key, hex, pinned from the first share onward.
    pub verifying_key: String,
    pub files: Vec<ManifestFile>,
    pub packed: Vec<ManifestPacked>,
}

/// On-the-wire envelope around the sealed manifest.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    v: u8,
    nonce: String,
    sig: String,
    payload: String,
}

const ENVELOPE_VERSION: u8 = 1;

/// Compress, encrypt and sign a manifest into envelope bytes.
pub fn seal(
    manifest: &ShareManifest,
    master: &MasterKey,
    signer: &FolderSigner,
) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(manifest).map_err(RetrieverError::ManifestEncode)?;
    let compressed = codec::compress(&json)?;
    let cipher = SegmentCipher::new(master.as_bytes())?;
    let (nonce, ciphertext) = cipher.encrypt(&compressed)?;
    let signature = signer.sign(&ciphertext);

    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        nonce: hex::encode(nonce),
        sig: hex::encode(signature),
        payload: B64.encode(&ciphertext),
    };
    serde_json::to_vec(&envelope).map_err(RetrieverError::ManifestEncode)
}

/// Verify, decrypt and decompress envelope bytes back into a manifest.
///
/// `expected_verifying_key` is the pinned key when the caller already
/// knows it; the manifest's own copy must agree either way.
pub fn open(
    bytes: &[u8],
    master: &MasterKey,
    expected_verifying_key: Option<&str>,
) -> Result<ShareManifest> {
    let envelope: Envelope =
        serde_json::from_slice(bytes).map_err(|_| RetrieverError::ManifestMalformed)?;
    if envelope.v != ENVELOPE_VERSION {
        return Err(RetrieverError::ManifestMalformed);
    }
    let ciphertext = B64
        .decode(&envelope.payload)
        .map_err(|_| RetrieverError::ManifestMalformed)?;
    let signature = hex::decode(&envelope.sig).map_err(|_| RetrieverError::ManifestMalformed)?;
    let nonce = hex::decode(&envelope.nonce).map_err(|_| RetrieverError::ManifestMalformed)?;

    let cipher = SegmentCipher::new(master.as_bytes())?;
    let compressed = cipher.decrypt(&nonce, &ciphertext)?;
    let json = codec::decompress(&compressed)?;
    let manifest: ShareManifest =
        serde_json::from_slice(&json).map_err(|_| RetrieverError::ManifestMalformed)?;

    // Signature check against the pinned key (or the manifest's own,
    // which the caller pins on first contact).
    let verifying_key = expected_verifying_key.unwrap_or(&manifest.verifying_key);
    if let Some(expected) = expected_verifying_key {
        if expected != manifest.verifying_key {
            return Err(RetrieverError::ManifestSignature);
        }
    }
    verify_signature(verifying_key, &ciphertext, &signature)
        .map_err(|_| RetrieverError::ManifestSignature)?;

    Ok(manifest)
}

/// Split envelope bytes into index-article chunks of at most `chunk_size`.
pub fn chunk_envelope(bytes: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes
        .chunks(chunk_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}
