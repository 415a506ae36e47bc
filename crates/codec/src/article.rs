//! Article body assembly.
//!
//! One posted article = a one-line announcement header followed by the
//! yEnc-framed ciphertext:
//!
//! ```text
//! UNS/1 sid=<hex16> r=<i>
//! =ybegin ...
//! ...
//! =yend ...
//! ```
//!
//! `sid` is the first 8 bytes of the ciphertext SHA-256 (hex), never the
//! secret segment id; `r` is the redundancy index. Decoding re-derives the
//! prefix from the decoded ciphertext and rejects bodies that disagree.

use rand::RngCore;

use crate::error::{CodecError, Result};
use crate::yenc;

pub const CODEC_VERSION: u8 = 1;

/// Length of the hex-rendered sid prefix (8 bytes).
pub const SID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleHeader {
    pub codec_version: u8,
    pub sid_prefix: String,
    pub redundancy_index: u8,
}

/// sid announced in the body header: hex of the first 8 ciphertext-hash bytes.
pub fn sid_prefix(ciphertext: &[u8]) -> String {
    hex::encode(&crypto::sha256(ciphertext)[..8])
}

/// Assemble the posted body for one ciphertext copy.
pub fn build_body(ciphertext: &[u8], redundancy_index: u8) -> Vec<u8> {
    let sid = sid_prefix(ciphertext);
    let mut body = format!("UNS/{CODEC_VERSION} sid={sid} r={redundancy_index}\r\n").into_bytes();
    body.extend_from_slice(&yenc::encode(ciphertext, &sid, yenc::DEFAULT_LINE_WIDTH));
    body
}

/// Parse a fetched body back into (header, ciphertext), verifying both the
/// yEnc trailer and the announced sid prefix.
pub fn parse_body(body: &[u8]) -> Result<(ArticleHeader, Vec<u8>)> {
    let newline = body
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CodecError::HeaderMalformed("missing announcement line".into()))?;
    let first_line = String::from_utf8_lossy(&body[..newline]);
    let first_line = first_line.trim_end_matches('\r');

    let header = parse_announcement(first_line)?;
    if header.codec_version != CODEC_VERSION {
        return Err(CodecError::HeaderMalformed(format!(
            "unsupported codec version {}",
            header.codec_version
        )));
    }

    let (ciphertext, _) = yenc::decode(&body[newline + 1..])?;
    if sid_prefix(&ciphertext) != header.sid_prefix {
        return Err(CodecError::HeaderMismatch);
    }
    Ok((header, ciphertext))
}

fn parse_announcement(line: &str) -> Result<ArticleHeader> {
    let mut parts = line.split_whitespace();
    let magic = parts
        .next()
        .ok_or_else(|| CodecError::HeaderMalformed("empty announcement".into()))?;
    let version = magic
        .strip_prefix("UNS/")
        .and_then(|v| v.parse::<u8>().ok())
        .ok_or_else(|| CodecError::HeaderMalformed(format!("bad magic {magic:?}")))?;

    let mut sid = None;
    let mut redundancy = None;
    for part in parts {
        if let Some(value) = part.strip_prefix("sid=") {
            if value.len() != SID_HEX_LEN || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(CodecError::HeaderMalformed(format!("bad sid {value:?}")));
            }
            sid = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("r=") {
            redundancy = value.parse::<u8>().ok();
            if redundancy.is_none() {
                return Err(CodecError::HeaderMalformed(format!(
                    "bad redundancy index {value:?}"
                )));
            }
        }
    }

    Ok(ArticleHeader {
        codec_version: version,
        sid_prefix: sid
            .ok_or_else(|| CodecError::HeaderMalformed("announcement missing sid".into()))?,
        redundancy_index: redundancy
            .ok_or_else(|| CodecError::HeaderMalformed("announcement missing r".into()))?,
    })
}

/// Client-side message id, unique per posting attempt so re-posting a
/// segment always produces a new id.
pub fn generate_message_id() -> String {
    let mut raw = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    format!("<{}@usenetsync.local>", hex::encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_round_trip() {
        let ciphertext = vec![0xAB; 1500];
        let body = build_body(&ciphertext, 2);
        let (header, decoded) = parse_body(&body).unwrap();
        assert_eq!(decoded, ciphertext);
        assert_eq!(header.codec_version, CODEC_VERSION);
        assert_eq!(header.redundancy_index, 2);
        assert_eq!(header.sid_prefix, sid_prefix(&ciphertext));
    }

    #[test]
    fn sid_is_hash_prefix_not_secret() {
        let ciphertext = b"ciphertext bytes";
        let sid = sid_prefix(ciphertext);
        assert_eq!(sid.len(), SID_HEX_LEN);
        assert_eq!(sid, hex::encode(&crypto::sha256(ciphertext)[..8]));
    }

    #[test]
    fn tampered_sid_is_detected() {
        let mut body = build_body(&[1, 2, 3, 4], 0);
        // Flip one hex digit of the announced sid.
        let pos = body.windows(4).position(|w| w == b"sid=").unwrap() + 4;
        body[pos] = if body[pos] == b'0' { b'1' } else { b'0' };
        assert!(matches!(parse_body(&body), Err(CodecError::HeaderMismatch)));
    }

    #[test]
    fn missing_announcement_is_malformed() {
        let framed = yenc::encode(b"payload", "x", 128);
        assert!(matches!(
            parse_body(&framed),
            Err(CodecError::HeaderMismatch) | Err(CodecError::HeaderMalformed(_))
        ));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let ciphertext = b"data";
        let mut body = format!("UNS/9 sid={} r=0\r\n", sid_prefix(ciphertext)).into_bytes();
        body.extend_from_slice(&yenc::encode(ciphertext, "x", 128));
        assert!(matches!(
            parse_body(&body),
            Err(CodecError::HeaderMalformed(_))
        ));
    }

    #[test]
    fn message_ids_are_unique_and_bracketed() {
        let a = generate_message_id();
        let b = generate_message_id();
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.ends_with('>'));
        assert!(a.contains('@'));
    }
}
