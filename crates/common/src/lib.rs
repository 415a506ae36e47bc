use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod metrics;
pub mod progress;

pub use config::{DatabaseType, ServerConfig, UnifiedConfig};
pub use error::{Classify, ErrorClass};
pub use metrics::{Metric, MetricKind, MetricsSink, NoopMetrics};
pub use progress::{noop_progress, Progress, ProgressFn, ProgressPhase, ProgressThrottle};

/// Default plaintext bytes per segment (~750 KB).
pub const DEFAULT_SEGMENT_SIZE: usize = 768_000;

/// Files below this size are packed together into shared segments.
pub const DEFAULT_PACK_THRESHOLD: usize = 50_000;

pub const PRIORITY_CRITICAL: u8 = 1;
pub const PRIORITY_HIGH: u8 = 2;
pub const PRIORITY_NORMAL: u8 = 5;
pub const PRIORITY_LOW: u8 = 8;
pub const PRIORITY_BACKGROUND: u8 = 10;

/// Seconds since the unix epoch, the timestamp unit used across all rows.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Demote a priority one step toward NORMAL. Items already at or below
/// NORMAL keep their level.
pub fn demote_priority(priority: u8) -> u8 {
    if priority < PRIORITY_NORMAL {
        priority + 1
    } else {
        priority
    }
}

/// 128 random bits from the process CSPRNG, rendered lowercase hex.
///
/// Sequential counters are fine for internal row ids; anything that leaves
/// the process (segment ids, subjects, share material) uses these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpaqueId([u8; 16]);

impl OpaqueId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        let bytes: [u8; 16] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for OpaqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for OpaqueId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for OpaqueId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        OpaqueId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("expected 32 hex chars"))
    }
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub OpaqueId);

        impl $name {
            pub fn generate() -> Self {
                Self(OpaqueId::generate())
            }

            pub fn from_hex(s: &str) -> Option<Self> {
                OpaqueId::from_hex(s).map(Self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

typed_id!(
    /// Stable folder identity, generated once and never mutated.
    FolderId
);
typed_id!(FileId);
typed_id!(SegmentId);
typed_id!(PackedSegmentId);
typed_id!(CommitmentId);
typed_id!(QueueId);

/// Share identity: 24 uppercase base32 chars over a 15-byte core of
/// 11 random bytes followed by the big-endian creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

pub const SHARE_ID_LEN: usize = 24;
pub const SHARE_ID_CORE_LEN: usize = 15;

impl ShareId {
    pub fn generate() -> Self {
        let mut core = [0u8; SHARE_ID_CORE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut core[..11]);
        core[11..].copy_from_slice(&(now_epoch() as u32).to_be_bytes());
        Self::from_core(&core)
    }

    pub fn from_core(core: &[u8; SHARE_ID_CORE_LEN]) -> Self {
        Self(base32::encode(
            base32::Alphabet::RFC4648 { padding: false },
            core,
        ))
    }

    /// Parse a candidate string, rejecting anything that is not 24 chars
    /// of the base32 alphabet.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != SHARE_ID_LEN {
            return None;
        }
        let upper = s.to_ascii_uppercase();
        let core = base32::decode(base32::Alphabet::RFC4648 { padding: false }, &upper)?;
        if core.len() != SHARE_ID_CORE_LEN {
            return None;
        }
        Some(Self(upper))
    }

    pub fn core(&self) -> [u8; SHARE_ID_CORE_LEN] {
        let raw = base32::decode(base32::Alphabet::RFC4648 { padding: false }, &self.0)
            .expect("share id is validated base32");
        raw.try_into().expect("share id core is 15 bytes")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Unchanged => "unchanged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(ChangeKind::Added),
            "modified" => Some(ChangeKind::Modified),
            "deleted" => Some(ChangeKind::Deleted),
            "unchanged" => Some(ChangeKind::Unchanged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
    Cancelled,
}

impl UploadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadState::Pending => "pending",
            UploadState::Uploading => "uploading",
            UploadState::Uploaded => "uploaded",
            UploadState::Failed => "failed",
            UploadState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadState::Pending),
            "uploading" => Some(UploadState::Uploading),
            "uploaded" => Some(UploadState::Uploaded),
            "failed" => Some(UploadState::Failed),
            "cancelled" => Some(UploadState::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Paused,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Queued => "queued",
            QueueState::Running => "running",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
            QueueState::Cancelled => "cancelled",
            QueueState::Retrying => "retrying",
            QueueState::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(QueueState::Queued),
            "running" => Some(QueueState::Running),
            "completed" => Some(QueueState::Completed),
            "failed" => Some(QueueState::Failed),
            "cancelled" => Some(QueueState::Cancelled),
            "retrying" => Some(QueueState::Retrying),
            "paused" => Some(QueueState::Paused),
            _ => None,
        }
    }

    /// Completed and cancelled items never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueState::Completed | QueueState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Open,
    Member,
    Passphrase,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessTier::Open => "open",
            AccessTier::Member => "member",
            AccessTier::Passphrase => "passphrase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(AccessTier::Open),
            "member" => Some(AccessTier::Member),
            "passphrase" => Some(AccessTier::Passphrase),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShareKind {
    Full,
    Partial,
    Incremental,
}

impl ShareKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareKind::Full => "full",
            ShareKind::Partial => "partial",
            ShareKind::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(ShareKind::Full),
            "partial" => Some(ShareKind::Partial),
            "incremental" => Some(ShareKind::Incremental),
            _ => None,
        }
    }
}

/// Coarse folder lifecycle, persisted on the folder row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderState {
    Added,
    Indexing,
    Indexed,
    Segmenting,
    Segmented,
    Uploading,
    Uploaded,
    Published,
    Error,
}

impl FolderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FolderState::Added => "added",
            FolderState::Indexing => "indexing",
            FolderState::Indexed => "indexed",
            FolderState::Segmenting => "segmenting",
            FolderState::Segmented => "segmented",
            FolderState::Uploading => "uploading",
            FolderState::Uploaded => "uploaded",
            FolderState::Published => "published",
            FolderState::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(FolderState::Added),
            "indexing" => Some(FolderState::Indexing),
            "indexed" => Some(FolderState::Indexed),
            "segmenting" => Some(FolderState::Segmenting),
            "segmented" => Some(FolderState::Segmented),
            "uploading" => Some(FolderState::Uploading),
            "uploaded" => Some(FolderState::Uploaded),
            "published" => Some(FolderState::Published),
            "error" => Some(FolderState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Folder,
    File,
    Segment,
    PackedSegment,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Folder => "folder",
            EntityKind::File => "file",
            EntityKind::Segment => "segment",
            EntityKind::PackedSegment => "packed_segment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "folder" => Some(EntityKind::Folder),
            "file" => Some(EntityKind::File),
            "segment" => Some(EntityKind::Segment),
            "packed_segment" => Some(EntityKind::PackedSegment),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub folder_id: FolderId,
    pub path: String,
    pub name: String,
    /// Ed25519 signing key, hex, generated on first use.
    pub signing_key: Option<String>,
    /// Ed25519 verifying key, hex, pinned by the first share.
    pub verifying_key: Option<String>,
    /// Content-encryption key for this folder's segments, base64.
    /// Shares wrap this key per their tier.
    pub content_key: Option<String>,
    pub version: u32,
    pub file_count: u64,
    pub total_size: u64,
    pub segment_count: u64,
    pub encryption_enabled: bool,
    pub redundancy_level: u8,
    pub target_group: String,
    pub state: FolderState,
    pub created_at: i64,
    pub last_indexed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_id: FileId,
    pub folder_id: FolderId,
    /// Path relative to the folder root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// SHA-256 over the plaintext, lowercase hex.
    pub hash: String,
    pub mime_type: Option<String>,
    pub version: u32,
    pub previous_version: Option<u32>,
    pub change_kind: ChangeKind,
    pub segment_size: u32,
    pub total_segments: u32,
    pub uploaded_segments: u32,
    pub encryption_key_ref: Option<String>,
    pub modified_at: i64,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub segment_id: SegmentId,
    pub file_id: Option<FileId>,
    pub packed_segment_id: Option<PackedSegmentId>,
    pub segment_index: u32,
    pub redundancy_index: u8,
    /// Plaintext bytes in this segment.
    pub size: u64,
    pub compressed_size: Option<u64>,
    /// SHA-256 over the ciphertext, lowercase hex.
    pub hash: String,
    pub offset_start: u64,
    pub offset_end: u64,
    pub message_id: Option<String>,
    pub subject: String,
    pub group: String,
    /// AES-GCM nonce, hex.
    pub nonce: String,
    pub upload_state: UploadState,
    pub attempts: u32,
    /// Position of the owning file inside a packed body.
    pub packing_index: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackedSegmentRecord {
    pub packed_segment_id: PackedSegmentId,
    pub total_size: u64,
    pub file_count: u32,
    pub compressed: bool,
    pub message_id: Option<String>,
}

/// Pointer from an access token to one core-index article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexArticleRef {
    pub index: u32,
    pub message_id: String,
    pub group: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub share_id: ShareId,
    pub folder_id: FolderId,
    pub folder_version: u32,
    pub kind: ShareKind,
    pub tier: AccessTier,
    pub owner_id: String,
    /// Base64 master key (open), or base64 wrapped master key (passphrase).
    pub master_key: Option<String>,
    pub passphrase_hash: Option<String>,
    pub passphrase_salt: Option<String>,
    pub key_salt: Option<String>,
    /// user_id -> base64 wrapped key; append-only until revocation.
    pub wrapped_keys: std::collections::BTreeMap<String, String>,
    pub allowed_users: Vec<String>,
    pub denied_users: Vec<String>,
    pub index_refs: Vec<IndexArticleRef>,
    pub expires_at: Option<i64>,
    pub revoked: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commitment {
    pub commitment_id: CommitmentId,
    pub share_id: ShareId,
    pub user_id: String,
    /// H(share_id || user_id || user_public_key), hex.
    pub commitment_hash: String,
    pub wrapped_key: String,
    pub permissions: String,
    pub granted_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

/// Local projection of a posted article; read-only after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub message_id: String,
    pub group: String,
    pub subject: String,
    pub size: u64,
    pub lines: u32,
    pub server: String,
    pub posted_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub queue_id: QueueId,
    pub entity_id: String,
    pub entity_kind: EntityKind,
    pub priority: u8,
    pub state: QueueState,
    pub progress: f64,
    pub total_size: u64,
    pub transferred: u64,
    pub retry_count: u32,
    pub max_retries: u32,
    pub session_id: Option<String>,
    pub worker_id: Option<String>,
    pub error: Option<String>,
    pub queued_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

impl QueueItem {
    pub fn new(entity_id: String, entity_kind: EntityKind, priority: u8, total_size: u64) -> Self {
        Self {
            queue_id: QueueId::generate(),
            entity_id,
            entity_kind,
            priority: priority.clamp(PRIORITY_CRITICAL, PRIORITY_BACKGROUND),
            state: QueueState::Queued,
            progress: 0.0,
            total_size,
            transferred: 0,
            retry_count: 0,
            max_retries: 3,
            session_id: None,
            worker_id: None,
            error: None,
            queued_at: now_epoch(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opaque_id_hex_round_trip() {
        let id = OpaqueId::generate();
        let parsed = OpaqueId::from_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn opaque_id_rejects_bad_hex() {
        assert!(OpaqueId::from_hex("xyz").is_none());
        assert!(OpaqueId::from_hex("00ff").is_none());
    }

    #[test]
    fn share_id_is_24_base32_chars() {
        let id = ShareId::generate();
        assert_eq!(id.as_str().len(), SHARE_ID_LEN);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        let reparsed = ShareId::parse(id.as_str()).unwrap();
        assert_eq!(id, reparsed);
        assert_eq!(id.core(), reparsed.core());
    }

    #[test]
    fn share_id_rejects_wrong_length() {
        assert!(ShareId::parse("SHORT").is_none());
        assert!(ShareId::parse(&"A".repeat(25)).is_none());
    }

    #[test]
    fn priority_demotion_stops_at_normal() {
        assert_eq!(demote_priority(PRIORITY_CRITICAL), 2);
        assert_eq!(demote_priority(4), PRIORITY_NORMAL);
        assert_eq!(demote_priority(PRIORITY_NORMAL), PRIORITY_NORMAL);
        assert_eq!(demote_priority(PRIORITY_LOW), PRIORITY_LOW);
    }

    #[test]
    fn queue_state_terminality() {
        assert!(QueueState::Completed.is_terminal());
        assert!(QueueState::Cancelled.is_terminal());
        assert!(!QueueState::Retrying.is_terminal());
    }

    #[test]
    fn enum_round_trips() {
        for kind in [
            ChangeKind::Added,
            ChangeKind::Modified,
            ChangeKind::Deleted,
            ChangeKind::Unchanged,
        ] {
            assert_eq!(ChangeKind::parse(kind.as_str()), Some(kind));
        }
        for tier in [AccessTier::Open, AccessTier::Member, AccessTier::Passphrase] {
            assert_eq!(AccessTier::parse(tier.as_str()), Some(tier));
        }
        for state in [
            UploadState::Pending,
            UploadState::Uploading,
            UploadState::Uploaded,
            UploadState::Failed,
            UploadState::Cancelled,
        ] {
            assert_eq!(UploadState::parse(state.as_str()), Some(state));
        }
    }
}
