//! Subject obfuscation.
//!
//! subject = base32(HMAC-SHA256(folder signing key, segment_id ‖ r))[..32]
//!
//! Nothing human-readable ever appears on the subject line; without the
//! folder key the subjects are indistinguishable from random.

use common::SegmentId;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Truncated length of the rendered subject.
pub const SUBJECT_LEN: usize = 32;

pub fn obfuscate_subject(folder_key: &[u8], segment_id: &SegmentId, redundancy_index: u8) -> String {
    let mut mac = HmacSha256::new_from_slice(folder_key)
        .expect("hmac accepts keys of any length");
    mac.update(segment_id.0.as_bytes());
    mac.update(&[redundancy_index]);
    let digest: [u8; 32] = mac.finalize().into_bytes().into();
    let rendered = base32::encode(base32::Alphabet::RFC4648 { padding: false }, &digest);
    rendered[..SUBJECT_LEN].to_string()
}
