//! Access-token codec.
//!
//! Three interchangeable encodings of one logical payload:
//!
//! - JSON-framed: base64url of `{v, id, tier, folder, ver, ts, idx, chk}`
//!   where `chk` is a SHA-256 prefix over the canonical (sorted-key)
//!   object without `chk`.
//! - Compact binary: fixed layout with hashed index references.
//! - Legacy triplet: base64url of `share_id:message_id:group`.
//!
//! Parsing is total: every input either yields a verified descriptor or a
//! structured invalid-token error. The display form wraps the share id in
//! `usenetsync://<share_id>/<tier>[/<base64-key>]`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use common::{AccessTier, Classify, ErrorClass, ShareId, SHARE_ID_CORE_LEN};
use crypto::{sha256, MasterKey};
use serde_json::{json, Value};
use thiserror::Error;

pub const TOKEN_VERSION: u8 = 3;
pub const URI_SCHEME: &str = "usenetsync://";

const COMPACT_SINGLE_LEN: usize = 53;
const COMPACT_MULTI_LEN: usize = 54;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(&'static str),
}

impl Classify for TokenError {
    fn class(&self) -> ErrorClass {
        // A checksum or structure failure means the token bytes cannot be
        // trusted at all.
        ErrorClass::Integrity
    }
}

pub type Result<T> = std::result::Result<T, TokenError>;

/// Index-article reference as carried by a token. The compact encoding
/// hashes message ids; the JSON encoding carries them verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenIndexRef {
    Single {
        message_id: String,
        group: String,
    },
    Multi {
        count: u32,
        segments: Vec<(u32, String, String)>,
    },
    /// Compact form: SHA-256 prefix of the single index article's id.
    SingleHashed { id_hash: [u8; 16] },
    /// Compact form: article count plus first-segment id hash.
    MultiHashed { count: u8, first_hash: [u8; 16] },
}

/// The logical payload every encoding carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDescriptor {
    pub version: u8,
    pub share_id: ShareId,
    pub tier: AccessTier,
    /// Truncated folder id, hex (privacy: never the full id).
    pub folder_prefix: String,
    pub folder_version: u32,
    pub created_at: i64,
    pub index: Option<TokenIndexRef>,
}

impl TokenDescriptor {
    pub fn new(
        share_id: ShareId,
        tier: AccessTier,
        folder_prefix: String,
        folder_version: u32,
        created_at: i64,
        index: Option<TokenIndexRef>,
    ) -> Self {
        Self {
            version: TOKEN_VERSION,
            share_id,
            tier,
            folder_prefix,
            folder_version,
            created_at,
            index,
        }
    }
}

/// Display form handed to recipients. Only tier=open embeds the key.
pub fn encode_uri(share_id: &ShareId, tier: AccessTier, key: Option<&MasterKey>) -> String {
    match (tier, key) {
        (AccessTier::Open, Some(key)) => format!(
            "{URI_SCHEME}{share_id}/{}/{}",
            tier.as_str(),
            key.to_base64()
        ),
        _ => format!("{URI_SCHEME}{share_id}/{}", tier.as_str()),
    }
}

/// Parsed `usenetsync://` form.
#[derive(Debug, Clone)]
pub struct UriToken {
    pub share_id: ShareId,
    pub tier: AccessTier,
    pub embedded_key: Option<MasterKey>,
}

fn canonical_json(value: &Value) -> String {
    // Keys sorted recursively so the checksum is stable.
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical_json(&map[*k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap(),
    }
}

fn checksum8(value: &Value) -> String {
    hex::encode(&sha256(canonical_json(value).as_bytes())[..4])
}

/// JSON-framed encoding.
pub fn encode_json(token: &TokenDescriptor) -> String {
    let idx = match &token.index {
        Some(TokenIndexRef::Single { message_id, group }) => Some(json!({
            "t": "s",
            "m": message_id,
            "n": group,
        })),
        Some(TokenIndexRef::Multi { count, segments }) => Some(json!({
            "t": "m",
            "c": count,
            "s": segments
                .iter()
                .map(|(i, m, n)| json!({"i": i, "m": m, "n": n}))
                .collect::<Vec<_>>(),
        })),
        // Hashed refs only exist in the compact form.
        _ => None,
    };

    let mut body = json!({
        "v": token.version,
        "id": token.share_id.as_str(),
        "tier": token.tier.as_str(),
        "folder": token.folder_prefix,
        "ver": token.folder_version,
        "ts": token.created_at,
    });
    if let Some(idx) = idx {
        body["idx"] = idx;
    }
    let chk = checksum8(&body);
    body["chk"] = Value::String(chk);

    B64URL.encode(serde_json::to_string(&body).expect("token json serialises").as_bytes())
}

fn get_str(object: &serde_json::Map<String, Value>, key: &str) -> Result<String> {
    object
        .get(key)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or(TokenError::Invalid("missing field"))
}

fn parse_json(decoded: &[u8]) -> Result<TokenDescriptor> {
    let mut value: Value = serde_json::from_slice(decoded)
        .map_err(|_| TokenError::Invalid("not valid token json"))?;
    let object = value
        .as_object_mut()
        .ok_or(TokenError::Invalid("token json is not an object"))?;

    let presented = object
        .remove("chk")
        .and_then(|v| v.as_str().map(String::from))
        .ok_or(TokenError::Invalid("missing checksum"))?;
    let body = Value::Object(object.clone());
    if checksum8(&body) != presented {
        return Err(TokenError::Invalid("checksum mismatch"));
    }

    let version = object
        .get("v")
        .and_then(|v| v.as_u64())
        .ok_or(TokenError::Invalid("missing version"))? as u8;
    let share_id = ShareId::parse(&get_str(object, "id")?)
        .ok_or(TokenError::Invalid("malformed share id"))?;
    let tier = AccessTier::parse(&get_str(object, "tier")?)
        .ok_or(TokenError::Invalid("unknown tier"))?;
    let folder_prefix = get_str(object, "folder")?;
    let folder_version = object.get("ver").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
    let created_at = object.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);

    let index = match object.get("idx") {
        None => None,
        Some(idx) => {
            let idx = idx
                .as_object()
                .ok_or(TokenError::Invalid("malformed index reference"))?;
            match idx.get("t").and_then(|v| v.as_str()) {
                Some("s") => Some(TokenIndexRef::Single {
                    message_id: get_str(idx, "m")?,
                    group: get_str(idx, "n")?,
                }),
                Some("m") => {
                    let count = idx
                        .get("c")
                        .and_then(|v| v.as_u64())
                        .ok_or(TokenError::Invalid("malformed index reference"))?
                        as u32;
                    let segments = idx
                        .get("s")
                        .and_then(|v| v.as_array())
                        .ok_or(TokenError::Invalid("malformed index reference"))?
                        .iter()
                        .map(|seg| {
                            let seg = seg
                                .as_object()
                                .ok_or(TokenError::Invalid("malformed index segment"))?;
                            Ok((
                                seg.get("i").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                                get_str(seg, "m")?,
                                get_str(seg, "n")?,
                            ))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Some(TokenIndexRef::Multi { count, segments })
                }
                _ => return Err(TokenError::Invalid("unknown index reference type")),
            }
        }
    };

    Ok(TokenDescriptor {
        version,
        share_id,
        tier,
        folder_prefix,
        folder_version,
        created_at,
        index,
    })
}

fn tier_byte(tier: AccessTier) -> u8 {
    match tier {
        AccessTier::Open => 0,
        AccessTier::Member => 1,
        AccessTier::Passphrase => 2,
    }
}

fn tier_from_byte(byte: u8) -> Result<AccessTier> {
    match byte {
        0 => Ok(AccessTier::Open),
        1 => Ok(AccessTier::Member),
        2 => Ok(AccessTier::Passphrase),
        _ => Err(TokenError::Invalid("unknown tier byte")),
    }
}

pub fn hash16(data: &str) -> [u8; 16] {
    let digest = sha256(data.as_bytes());
    digest[..16].try_into().expect("16-byte prefix")
}

/// Compact binary encoding. Message ids are carried as 16-byte hashes;
/// the retriever resolves them through the share record.
pub fn encode_compact(token: &TokenDescriptor) -> String {
    let mut buffer = Vec::with_capacity(COMPACT_MULTI_LEN);
    buffer.push(token.version);
    buffer.push(tier_byte(token.tier));

    // 15-byte share id core padded to 16 with one reserved zero byte.
    buffer.extend_from_slice(&token.share_id.core());
    buffer.push(0);

    let mut folder_hash = [0u8; 8];
    let digest = sha256(token.folder_prefix.as_bytes());
    folder_hash.copy_from_slice(&digest[..8]);
    buffer.extend_from_slice(&folder_hash);

    buffer.extend_from_slice(&(token.folder_version as u16).to_be_bytes());
    buffer.extend_from_slice(&(token.created_at as u32).to_be_bytes());

    match &token.index {
        Some(TokenIndexRef::Single { message_id, .. }) => {
            buffer.push(1);
            buffer.extend_from_slice(&hash16(message_id));
        }
        Some(TokenIndexRef::SingleHashed { id_hash }) => {
            buffer.push(1);
            buffer.extend_from_slice(id_hash);
        }
        Some(TokenIndexRef::Multi { count, segments }) => {
            buffer.push(2);
            buffer.push((*count).min(255) as u8);
            let first = segments
                .first()
                .map(|(_, m, _)| hash16(m))
                .unwrap_or([0u8; 16]);
            buffer.extend_from_slice(&first);
        }
        Some(TokenIndexRef::MultiHashed { count, first_hash }) => {
            buffer.push(2);
            buffer.push(*count);
            buffer.extend_from_slice(first_hash);
        }
        None => {
            buffer.push(1);
            buffer.extend_from_slice(&[0u8; 16]);
        }
    }

    let checksum = sha256(&buffer);
    buffer.extend_from_slice(&checksum[..4]);
    B64URL.encode(&buffer)
}

fn parse_compact(decoded: &[u8]) -> Result<TokenDescriptor> {
    if decoded.len() != COMPACT_SINGLE_LEN && decoded.len() != COMPACT_MULTI_LEN {
        return Err(TokenError::Invalid("bad compact length"));
    }
    let (payload, presented) = decoded.split_at(decoded.len() - 4);
    if sha256(payload)[..4] != *presented {
        return Err(TokenError::Invalid("checksum mismatch"));
    }

    let version = payload[0];
    let tier = tier_from_byte(payload[1])?;
    let core: [u8; SHARE_ID_CORE_LEN] = payload[2..2 + SHARE_ID_CORE_LEN]
        .try_into()
        .expect("length checked");
    // payload[17] is the reserved pad byte.
    let share_id = ShareId::from_core(&core);
    let folder_hash = hex::encode(&payload[18..26]);
    let folder_version = u16::from_be_bytes(payload[26..28].try_into().unwrap()) as u32;
    let created_at = u32::from_be_bytes(payload[28..32].try_into().unwrap()) as i64;

    let index = match payload[32] {
        1 => {
            let id_hash: [u8; 16] = payload[33..49].try_into().unwrap();
            Some(TokenIndexRef::SingleHashed { id_hash })
        }
        2 => {
            if decoded.len() != COMPACT_MULTI_LEN {
                return Err(TokenError::Invalid("bad compact length"));
            }
            let count = payload[33];
            let first_hash: [u8; 16] = payload[34..50].try_into().unwrap();
            Some(TokenIndexRef::MultiHashed { count, first_hash })
        }
        _ => return Err(TokenError::Invalid("unknown index reference type")),
    };

    Ok(TokenDescriptor {
        version,
        share_id,
        tier,
        folder_prefix: folder_hash,
        folder_version,
        created_at,
        index,
    })
}

/// Legacy triplet for early deployments: `share_id:message_id:group`.
pub fn encode_legacy(share_id: &ShareId, message_id: &str, group: &str) -> String {
    B64URL.encode(format!("{share_id}:{message_id}:{group}").as_bytes())
}

fn parse_legacy(decoded: &[u8]) -> Result<TokenDescriptor> {
    let text =
        std::str::from_utf8(decoded).map_err(|_| TokenError::Invalid("unrecognised payload"))?;
    let mut parts = text.splitn(3, ':');
    let share_id = parts
        .next()
        .and_then(ShareId::parse)
        .ok_or(TokenError::Invalid("unrecognised payload"))?;
    let message_id = parts
        .next()
        .ok_or(TokenError::Invalid("legacy token missing message id"))?;
    let group = parts
        .next()
        .ok_or(TokenError::Invalid("legacy token missing group"))?;

    Ok(TokenDescriptor {
        version: 1,
        share_id,
        tier: AccessTier::Open,
        folder_prefix: String::new(),
        folder_version: 1,
        created_at: 0,
        index: Some(TokenIndexRef::Single {
            message_id: message_id.to_string(),
            group: group.to_string(),
        }),
    })
}

/// What [`parse`] accepts: a display URI or any of the three payload
/// encodings.
#[derive(Debug, Clone)]
pub enum ParsedToken {
    Uri(UriToken),
    Payload(TokenDescriptor),
}

impl ParsedToken {
    pub fn share_id(&self) -> &ShareId {
        match self {
            ParsedToken::Uri(uri) => &uri.share_id,
            ParsedToken::Payload(descriptor) => &descriptor.share_id,
        }
    }

    pub fn embedded_key(&self) -> Option<&MasterKey> {
        match self {
            ParsedToken::Uri(uri) => uri.embedded_key.as_ref(),
            ParsedToken::Payload(_) => None,
        }
    }
}

/// Total parser with format auto-detection. Never panics; any checksum
/// mismatch or malformed structure is a structured error.
pub fn parse(input: &str) -> Result<ParsedToken> {
    let input = input.trim();
    if input.is_empty() {
        return Err(TokenError::Invalid("empty token"));
    }

    if let Some(rest) = input.strip_prefix(URI_SCHEME) {
        return parse_uri(rest).map(ParsedToken::Uri);
    }

    let decoded = B64URL
        .decode(input)
        .or_else(|_| {
            // Tolerate padded variants.
            base64::engine::general_purpose::URL_SAFE.decode(input)
        })
        .map_err(|_| TokenError::Invalid("not base64url"))?;

    if decoded.first() == Some(&b'{') {
        return parse_json(&decoded).map(ParsedToken::Payload);
    }
    if (decoded.len() == COMPACT_SINGLE_LEN || decoded.len() == COMPACT_MULTI_LEN)
        && decoded.first() == Some(&TOKEN_VERSION)
    {
        return parse_compact(&decoded).map(ParsedToken::Payload);
    }
    parse_legacy(&decoded).map(ParsedToken::Payload)
}

fn parse_uri(rest: &str) -> Result<UriToken> {
    let mut parts = rest.split('/');
    let share_id = parts
        .next()
        .and_then(ShareId::parse)
        .ok_or(TokenError::Invalid("malformed share id"))?;
    let tier = parts
        .next()
        .and_then(AccessTier::parse)
        .ok_or(TokenError::Invalid("unknown tier"))?;
    let embedded_key = match parts.next() {
        None | Some("") => None,
        Some(encoded) => {
            if tier != AccessTier::Open {
                return Err(TokenError::Invalid("key embedded in non-open token"));
            }
            let raw = B64
                .decode(encoded)
                .map_err(|_| TokenError::Invalid("malformed embedded key"))?;
            Some(
                MasterKey::from_slice(&raw)
                    .map_err(|_| TokenError::Invalid("embedded key has wrong length"))?,
            )
        }
    };
    if tier == AccessTier::Open && embedded_key.is_none() {
        return Err(TokenError::Invalid("open token is missing its key"));
    }
    Ok(UriToken {
        share_id,
        tier,
        embedded_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn descriptor(index: Option<TokenIndexRef>) -> TokenDescriptor {
        TokenDescriptor::new(
            ShareId::generate(),
            AccessTier::Member,
            "a1b2c3d4e5f60718".to_string(),
            7,
            1_700_000_000,
            index,
        )
    }

    #[test]
    fn json_round_trip_single() {
        let token = descriptor(Some(TokenIndexRef::Single {
            message_id: "<idx@usenetsync.local>".to_string(),
            group: "alt.binaries.test".to_string(),
        }));
        let encoded = encode_json(&token);
        let ParsedToken::Payload(parsed) = parse(&encoded).unwrap() else {
            panic!("expected payload");
        };
        assert_eq!(parsed, token);
    }

    #[test]
    fn json_round_trip_multi() {
        let token = descriptor(Some(TokenIndexRef::Multi {
            count: 2,
            segments: vec![
                (0, "<i0@x>".to_string(), "g".to_string()),
                (1, "<i1@x>".to_string(), "g".to_string()),
            ],
        }));
        let encoded = encode_json(&token);
        let ParsedToken::Payload(parsed) = parse(&encoded).unwrap() else {
            panic!("expected payload");
        };
        assert_eq!(parsed, token);
    }

    #[test]
    fn json_checksum_tamper_is_detected() {
        let token = descriptor(None);
        let encoded = encode_json(&token);
        let decoded = B64URL.decode(&encoded).unwrap();
        let tampered = String::from_utf8(decoded)
            .unwrap()
            .replace("\"ver\":7", "\"ver\":8");
        let reencoded = B64URL.encode(tampered.as_bytes());
        assert_eq!(
            parse(&reencoded).unwrap_err(),
            TokenError::Invalid("checksum mismatch")
        );
    }

    #[test]
    fn compact_round_trip_single() {
        let token = descriptor(Some(TokenIndexRef::Single {
            message_id: "<idx@x>".to_string(),
            group: "g".to_string(),
        }));
        let encoded = encode_compact(&token);
        let ParsedToken::Payload(parsed) = parse(&encoded).unwrap() else {
            panic!("expected payload");
        };
        assert_eq!(parsed.share_id, token.share_id);
        assert_eq!(parsed.tier, token.tier);
        assert_eq!(parsed.folder_version, token.folder_version);
        assert_eq!(parsed.created_at, token.created_at);
        assert_eq!(
            parsed.index,
            Some(TokenIndexRef::SingleHashed {
                id_hash: hash16("<idx@x>")
            })
        );
    }

    #[test]
    fn compact_round_trip_multi() {
        let token = descriptor(Some(TokenIndexRef::Multi {
            count: 3,
            segments: vec![(0, "<first@x>".to_string(), "g".to_string())],
        }));
        let encoded = encode_compact(&token);
        let ParsedToken::Payload(parsed) = parse(&encoded).unwrap() else {
            panic!("expected payload");
        };
        assert_eq!(
            parsed.index,
            Some(TokenIndexRef::MultiHashed {
                count: 3,
                first_hash: hash16("<first@x>")
            })
        );
    }

    #[test]
    fn compact_checksum_tamper_is_detected() {
        let token = descriptor(None);
        let encoded = encode_compact(&token);
        let mut decoded = B64URL.decode(&encoded).unwrap();
        decoded[5] ^= 0xFF;
        let reencoded = B64URL.encode(&decoded);
        assert_eq!(
            parse(&reencoded).unwrap_err(),
            TokenError::Invalid("checksum mismatch")
        );
    }

    #[test]
    fn legacy_round_trip() {
        let share_id = ShareId::generate();
        let encoded = encode_legacy(&share_id, "<m@x>", "alt.binaries.test");
        let ParsedToken::Payload(parsed) = parse(&encoded).unwrap() else {
            panic!("expected payload");
        };
        assert_eq!(parsed.share_id, share_id);
        assert_eq!(
            parsed.index,
            Some(TokenIndexRef::Single {
                message_id: "<m@x>".to_string(),
                group: "alt.binaries.test".to_string(),
            })
        );
    }

    #[test]
    fn uri_round_trip_with_and_without_key() {
        let share_id = ShareId::generate();
        let key = MasterKey::generate();

        let open = encode_uri(&share_id, AccessTier::Open, Some(&key));
        let ParsedToken::Uri(parsed) = parse(&open).unwrap() else {
            panic!("expected uri");
        };
        assert_eq!(parsed.share_id, share_id);
        assert_eq!(parsed.tier, AccessTier::Open);
        assert_eq!(
            parsed.embedded_key.unwrap().as_bytes(),
            key.as_bytes()
        );

        let member = encode_uri(&share_id, AccessTier::Member, None);
        let ParsedToken::Uri(parsed) = parse(&member).unwrap() else {
            panic!("expected uri");
        };
        assert!(parsed.embedded_key.is_none());

        let passphrase = encode_uri(&share_id, AccessTier::Passphrase, None);
        assert!(parse(&passphrase).is_ok());
    }

    #[test]
    fn open_uri_without_key_is_invalid() {
        let uri = format!("{URI_SCHEME}{}/open", ShareId::generate());
        assert!(parse(&uri).is_err());
    }

    proptest! {
        /// Total parse: arbitrary strings never panic, always a value or
        /// a structured error.
        #[test]
        fn prop_parse_is_total(input in ".{0,200}") {
            let _ = parse(&input);
        }

        #[test]
        fn prop_parse_is_total_on_base64(raw in proptest::collection::vec(any::<u8>(), 0..128)) {
            let encoded = B64URL.encode(&raw);
            let _ = parse(&encoded);
        }
    }
}
