//! The segment engine: fixed-size chunking, small-file packing,
//! compress-then-encrypt, and N-copy redundancy.
//!
//! Segment bodies are never persisted; rows record everything needed to
//! regenerate a copy deterministically (window, compression outcome,
//! nonce), so the uploader re-reads the source, re-compresses and
//! re-encrypts to the exact recorded ciphertext. The reverse path
//! decrypts, decompresses and verifies before bytes reach disk.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use common::{
    Classify, ErrorClass, FileId, FileRecord, PackedSegmentId, PackedSegmentRecord, SegmentId,
    SegmentRecord, UploadState,
};
use crypto::{sha256_hex, CryptoError, MasterKey, SegmentCipher};
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Error, Debug)]
pub enum SegmenterError {
    #[error("io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("window {offset}+{len} out of bounds for {path} ({actual} bytes)")]
    WindowOutOfBounds {
        path: PathBuf,
        offset: u64,
        len: usize,
        actual: u64,
    },

    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),

    #[error("codec: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("ciphertext does not match the recorded segment hash")]
    CiphertextMismatch,

    #[error("plaintext length {actual} does not match the recorded size {expected}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("invalid nonce encoding on segment row")]
    BadNonce,
}

impl Classify for SegmenterError {
    fn class(&self) -> ErrorClass {
        match self {
            SegmenterError::Io { .. } => ErrorClass::Transient,
            SegmenterError::WindowOutOfBounds { .. } | SegmenterError::BadNonce => {
                ErrorClass::Validation
            }
            SegmenterError::Crypto(e) => e.class(),
            SegmenterError::Codec(e) => e.class(),
            SegmenterError::CiphertextMismatch | SegmenterError::LengthMismatch { .. } => {
                ErrorClass::Integrity
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SegmenterError>;

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub segment_size: usize,
    pub pack_threshold: usize,
    pub redundancy_level: u8,
    pub compression_enabled: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            segment_size: common::DEFAULT_SEGMENT_SIZE,
            pack_threshold: common::DEFAULT_PACK_THRESHOLD,
            redundancy_level: 1,
            compression_enabled: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SegmentationResult {
    pub segments: Vec<SegmentRecord>,
    pub packed: Vec<PackedSegmentRecord>,
    /// Logical segment count per file (redundancy collapsed).
    pub file_totals: HashMap<FileId, u32>,
}

pub struct Segmenter {
    config: SegmenterConfig,
    cipher: SegmentCipher,
    /// HMAC key for subject obfuscation (the folder signing key).
    subject_key: Vec<u8>,
    group: String,
}

impl Segmenter {
    pub fn new(
        config: SegmenterConfig,
        content_key: &MasterKey,
        subject_key: Vec<u8>,
        group: String,
    ) -> Result<Self> {
        Ok(Self {
            config,
            cipher: SegmentCipher::new(content_key.as_bytes())?,
            subject_key,
            group,
        })
    }

    /// Segment a set of live files. Files at or above the pack threshold
    /// (or larger than one segment) are chunked; the rest are packed into
    /// shared bodies that never exceed `segment_size` of plaintext and
    /// never split one file across two bodies.
    #[instrument(skip_all, fields(files = files.len()))]
    pub fn segment_folder(&self, files: &[(FileRecord, PathBuf)]) -> Result<SegmentationResult> {
        let mut result = SegmentationResult::default();
        let mut small: Vec<&(FileRecord, PathBuf)> = Vec::new();

        for entry in files {
            let (record, path) = entry;
            if record.size as usize >= self.config.pack_threshold
                || record.size as usize > self.config.segment_size
            {
                let rows = self.segment_large(record, path)?;
                result
                    .file_totals
                    .insert(record.file_id, (rows.len() / self.config.redundancy_level as usize) as u32);
                result.segments.extend(rows);
            } else {
                small.push(entry);
            }
        }

        self.pack_small(&small, &mut result)?;
        debug!(
            segments = result.segments.len(),
            packed = result.packed.len(),
            "segmentation complete"
        );
        Ok(result)
    }

    fn segment_large(&self, record: &FileRecord, path: &Path) -> Result<Vec<SegmentRecord>> {
        let mut rows = Vec::new();
        let size = record.size;
        let segment_size = self.config.segment_size as u64;
        let mut index = 0u32;
        let mut offset = 0u64;

        while offset < size {
            let len = (size - offset).min(segment_size) as usize;
            let window = read_window(path, offset, len)?;
            rows.extend(self.encrypt_copies(
                &window,
                Some(record.file_id),
                None,
                index,
                offset,
                offset + len as u64,
                None,
            )?);
            offset += len as u64;
            index += 1;
        }
        Ok(rows)
    }

    fn pack_small(
        &self,
        files: &[&(FileRecord, PathBuf)],
        result: &mut SegmentationResult,
    ) -> Result<()> {
        let mut pending: Vec<(&FileRecord, Vec<u8>)> = Vec::new();
        let mut pending_bytes = 0usize;

        for (record, path) in files.iter().map(|e| (&e.0, &e.1)) {
            let body = read_window(path, 0, record.size as usize)?;
            if pending_bytes + body.len() > self.config.segment_size && !pending.is_empty() {
                self.flush_packed(&mut pending, &mut pending_bytes, result)?;
            }
            pending_bytes += body.len();
            pending.push((record, body));
        }
        if !pending.is_empty() {
            self.flush_packed(&mut pending, &mut pending_bytes, result)?;
        }
        Ok(())
    }

    fn flush_packed(
        &self,
        pending: &mut Vec<(&FileRecord, Vec<u8>)>,
        pending_bytes: &mut usize,
        result: &mut SegmentationResult,
    ) -> Result<()> {
        let packed_id = PackedSegmentId::generate();
        let members: Vec<(&FileRecord, Vec<u8>)> = std::mem::take(pending);
        *pending_bytes = 0;

        let mut body = Vec::new();
        let mut windows = Vec::with_capacity(members.len());
        for (record, bytes) in &members {
            let start = body.len() as u64;
            body.extend_from_slice(bytes);
            windows.push((*record, start, body.len() as u64));
        }

        // One article per redundancy copy carries the whole packed body;
        // each member row records its window inside the plaintext.
        let copies = self.encrypt_copies(
            &body,
            None,
            Some(packed_id),
            0,
            0,
            body.len() as u64,
            None,
        )?;
        let compressed = copies
            .first()
            .map(|c| c.compressed_size.unwrap_or(c.size) < c.size)
            .unwrap_or(false);

        for copy in &copies {
            for (member_index, (record, start, end)) in windows.iter().enumerate() {
                result.segments.push(SegmentRecord {
                    segment_id: segment_id_for_member(&packed_id, record.file_id),
                    file_id: Some(record.file_id),
                    packed_segment_id: Some(packed_id),
                    segment_index: 0,
                    redundancy_index: copy.redundancy_index,
                    size: end - start,
                    compressed_size: None,
                    hash: copy.hash.clone(),
                    offset_start: *start,
                    offset_end: *end,
                    message_id: None,
                    subject: copy.subject.clone(),
                    group: self.group.clone(),
                    nonce: copy.nonce.clone(),
                    upload_state: UploadState::Pending,
                    attempts: 0,
                    packing_index: Some(member_index as u32),
                });
                result.file_totals.insert(record.file_id, 1);
            }
        }

        result.packed.push(PackedSegmentRecord {
            packed_segment_id: packed_id,
            total_size: body.len() as u64,
            file_count: members.len() as u32,
            compressed,
            message_id: None,
        });
        Ok(())
    }

    /// Compress once, then produce one independent encryption per
    /// redundancy copy, each with a fresh nonce and its own subject.
    #[allow(clippy::too_many_arguments)]
    fn encrypt_copies(
        &self,
        plaintext: &[u8],
        file_id: Option<FileId>,
        packed_segment_id: Option<PackedSegmentId>,
        segment_index: u32,
        offset_start: u64,
        offset_end: u64,
        segment_id: Option<SegmentId>,
    ) -> Result<Vec<SegmentRecord>> {
        let segment_id = segment_id.unwrap_or_else(|| match packed_segment_id {
            Some(packed) => SegmentId(common::OpaqueId::from_bytes(*packed.0.as_bytes())),
            None => SegmentId::generate(),
        });

        let (body, outcome) = if self.config.compression_enabled {
            codec::compress_if_smaller(plaintext)?
        } else {
            (
                std::borrow::Cow::Borrowed(plaintext),
                codec::CompressionOutcome {
                    original_size: plaintext.len(),
                    output_size: plaintext.len(),
                    compressed: false,
                },
            )
        };

        let mut rows = Vec::with_capacity(self.config.redundancy_level as usize);
        for redundancy_index in 0..self.config.redundancy_level {
            let (nonce, ciphertext) = self.cipher.encrypt(body.as_ref())?;
            rows.push(SegmentRecord {
                segment_id,
                file_id,
                packed_segment_id,
                segment_index,
                redundancy_index,
                size: plaintext.len() as u64,
                compressed_size: Some(outcome.output_size as u64),
                hash: sha256_hex(&ciphertext),
                offset_start,
                offset_end,
                message_id: None,
                subject: codec::obfuscate_subject(&self.subject_key, &segment_id, redundancy_index),
                group: self.group.clone(),
                nonce: hex::encode(nonce),
                upload_state: UploadState::Pending,
                attempts: 0,
                packing_index: None,
            });
        }
        Ok(rows)
    }

    /// Regenerate the exact posted ciphertext for one recorded copy of a
    /// regular file segment.
    pub fn rebuild_file_segment(&self, record: &SegmentRecord, source: &Path) -> Result<Vec<u8>> {
        let window = read_window(
            source,
            record.offset_start,
            (record.offset_end - record.offset_start) as usize,
        )?;
        self.rebuild_from_plaintext(record, &window)
    }

    /// Regenerate the posted ciphertext for one copy of a packed body.
    /// `members` must be every member row of that copy, any order.
    pub fn rebuild_packed_segment(
        &self,
        members: &[(SegmentRecord, PathBuf)],
        total_size: u64,
    ) -> Result<Vec<u8>> {
        let mut ordered: Vec<&(SegmentRecord, PathBuf)> = members.iter().collect();
        ordered.sort_by_key(|(record, _)| record.offset_start);

        let mut body = vec![0u8; total_size as usize];
        for (record, path) in ordered {
            let bytes = read_window(path, 0, (record.offset_end - record.offset_start) as usize)?;
            body[record.offset_start as usize..record.offset_end as usize].copy_from_slice(&bytes);
        }
        let reference = members.first().expect("packed copy has at least one member");
        self.rebuild_packed_from_plaintext(&reference.0, &body)
    }

    fn rebuild_from_plaintext(&self, record: &SegmentRecord, plaintext: &[u8]) -> Result<Vec<u8>> {
        let compressed = record
            .compressed_size
            .map(|cs| cs < record.size)
            .unwrap_or(false);
        let body = if compressed {
            std::borrow::Cow::Owned(codec::compress(plaintext)?)
        } else {
            std::borrow::Cow::Borrowed(plaintext)
        };
        let nonce = hex::decode(&record.nonce).map_err(|_| SegmenterError::BadNonce)?;
        let ciphertext = self.cipher.encrypt_with_nonce(&nonce, body.as_ref())?;
        if sha256_hex(&ciphertext) != record.hash {
            return Err(SegmenterError::CiphertextMismatch);
        }
        Ok(ciphertext)
    }

    fn rebuild_packed_from_plaintext(
        &self,
        member: &SegmentRecord,
        body: &[u8],
    ) -> Result<Vec<u8>> {
        // Packed bodies record compression on the packed row; member rows
        // carry no compressed_size, so probe both encodings against the
        // recorded ciphertext hash.
        let nonce = hex::decode(&member.nonce).map_err(|_| SegmenterError::BadNonce)?;
        let plain_ct = self.cipher.encrypt_with_nonce(&nonce, body)?;
        if sha256_hex(&plain_ct) == member.hash {
            return Ok(plain_ct);
        }
        let compressed = codec::compress(body)?;
        let compressed_ct = self.cipher.encrypt_with_nonce(&nonce, &compressed)?;
        if sha256_hex(&compressed_ct) == member.hash {
            return Ok(compressed_ct);
        }
        Err(SegmenterError::CiphertextMismatch)
    }

    /// Reverse path for one fetched copy of a regular file segment:
    /// verify ciphertext hash, decrypt, decompress, verify length.
    pub fn decode_file_segment(
        &self,
        record: &SegmentRecord,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if sha256_hex(ciphertext) != record.hash {
            return Err(SegmenterError::CiphertextMismatch);
        }
        let nonce = hex::decode(&record.nonce).map_err(|_| SegmenterError::BadNonce)?;
        let body = self.cipher.decrypt(&nonce, ciphertext)?;
        let compressed = record
            .compressed_size
            .map(|cs| cs < record.size)
            .unwrap_or(false);
        let plaintext = if compressed {
            codec::decompress(&body)?
        } else {
            body
        };
        if plaintext.len() as u64 != record.size {
            return Err(SegmenterError::LengthMismatch {
                expected: record.size,
                actual: plaintext.len() as u64,
            });
        }
        Ok(plaintext)
    }

    /// Reverse path for a packed body: returns the full plaintext body;
    /// the caller slices member windows out of it.
    pub fn decode_packed_segment(
        &self,
        member: &SegmentRecord,
        packed: &PackedSegmentRecord,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>> {
        if sha256_hex(ciphertext) != member.hash {
            return Err(SegmenterError::CiphertextMismatch);
        }
        let nonce = hex::decode(&member.nonce).map_err(|_| SegmenterError::BadNonce)?;
        let body = self.cipher.decrypt(&nonce, ciphertext)?;
        let plaintext = if packed.compressed {
            codec::decompress(&body)?
        } else {
            body
        };
        if plaintext.len() as u64 != packed.total_size {
            return Err(SegmenterError::LengthMismatch {
                expected: packed.total_size,
                actual: plaintext.len() as u64,
            });
        }
        Ok(plaintext)
    }
}

fn segment_id_for_member(packed_id: &PackedSegmentId, file_id: FileId) -> SegmentId {
    // Stable per (packed body, file): fold the file id into the packed id
    // so member rows keep the (segment_id, redundancy_index) uniqueness.
    let mut bytes = *packed_id.0.as_bytes();
    for (dst, src) in bytes.iter_mut().zip(file_id.0.as_bytes()) {
        *dst ^= src;
    }
    SegmentId(common::OpaqueId::from_bytes(bytes))
}

/// Read `len` bytes at `offset`, memory-mapping when the platform allows
/// and falling back to seek+read. Bodies are windows, never whole files.
pub fn read_window(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|source| SegmenterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let actual = file
        .metadata()
        .map_err(|source| SegmenterError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    if offset + len as u64 > actual {
        return Err(SegmenterError::WindowOutOfBounds {
            path: path.to_path_buf(),
            offset,
            len,
            actual,
        });
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    match unsafe { Mmap::map(&file) } {
        Ok(map) => Ok(map[offset as usize..offset as usize + len].to_vec()),
        Err(_) => {
            let mut file = file;
            file.seek(SeekFrom::Start(offset))
                .map_err(|source| SegmenterError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            let mut buffer = vec![0u8; len];
            file.read_exact(&mut buffer)
                .map_err(|source| SegmenterError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(buffer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{now_epoch, ChangeKind, FolderId};

    fn file_record(size: u64) -> FileRecord {
        FileRecord {
            file_id: FileId::generate(),
            folder_id: FolderId::generate(),
            path: "f.bin".to_string(),
            size,
            hash: String::new(),
            mime_type: None,
            version: 1,
            previous_version: None,
            change_kind: ChangeKind::Added,
            segment_size: 0,
            total_segments: 0,
            uploaded_segments: 0,
            encryption_key_ref: None,
            modified_at: now_epoch(),
            indexed_at: now_epoch(),
        }
    }

    fn segmenter(segment_size: usize, pack_threshold: usize, redundancy: u8) -> Segmenter {
        Segmenter::new(
            SegmenterConfig {
                segment_size,
                pack_threshold,
                redundancy_level: redundancy,
                compression_enabled: true,
            },
            &MasterKey::generate(),
            b"subject-key".to_vec(),
            "alt.binaries.test".to_string(),
        )
        .unwrap()
    }

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn large_file_is_cut_into_fixed_windows() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let path = write_temp(&dir, "big.bin", &data);
        let mut record = file_record(data.len() as u64);
        record.path = "big.bin".to_string();

        let seg = segmenter(32_768, 1_000, 2);
        let result = seg.segment_folder(&[(record.clone(), path)]).unwrap();

        // ceil(100000 / 32768) = 4 logical segments, 2 copies each.
        assert_eq!(result.file_totals[&record.file_id], 4);
        assert_eq!(result.segments.len(), 8);
        let last = result
            .segments
            .iter()
            .filter(|s| s.redundancy_index == 0)
            .max_by_key(|s| s.segment_index)
            .unwrap();
        assert_eq!(last.offset_end, data.len() as u64);
        assert!(last.offset_end - last.offset_start <= 32_768);
    }

    #[test]
    fn exact_multiple_has_no_zero_tail() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![7u8; 65_536];
        let path = write_temp(&dir, "even.bin", &data);
        let record = file_record(data.len() as u64);

        let seg = segmenter(32_768, 1_000, 1);
        let result = seg.segment_folder(&[(record.clone(), path)]).unwrap();
        assert_eq!(result.file_totals[&record.file_id], 2);
        for row in &result.segments {
            assert_eq!(row.offset_end - row.offset_start, 32_768);
        }
    }

    #[test]
    fn redundant_copies_share_id_but_differ_in_nonce_hash_subject() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 60_000];
        let path = write_temp(&dir, "r.bin", &data);
        let record = file_record(data.len() as u64);

        let seg = segmenter(64_000, 1_000, 3);
        let result = seg.segment_folder(&[(record, path)]).unwrap();
        assert_eq!(result.segments.len(), 3);
        let ids: std::collections::HashSet<_> =
            result.segments.iter().map(|s| s.segment_id).collect();
        assert_eq!(ids.len(), 1);
        let nonces: std::collections::HashSet<_> =
            result.segments.iter().map(|s| s.nonce.clone()).collect();
        assert_eq!(nonces.len(), 3);
        let subjects: std::collections::HashSet<_> =
            result.segments.iter().map(|s| s.subject.clone()).collect();
        assert_eq!(subjects.len(), 3);
        let indexes: Vec<u8> = result
            .segments
            .iter()
            .map(|s| s.redundancy_index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[test]
    fn small_files_pack_without_exceeding_segment_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..10 {
            let data = vec![i as u8; 400];
            let path = write_temp(&dir, &format!("s{i}.bin"), &data);
            let mut record = file_record(400);
            record.path = format!("s{i}.bin");
            files.push((record, path));
        }

        // 400-byte files, 1 KiB bodies: at most 2 per packed body.
        let seg = segmenter(1_024, 1_000, 1);
        let result = seg.segment_folder(&files).unwrap();
        assert_eq!(result.packed.len(), 5);
        for packed in &result.packed {
            assert!(packed.total_size <= 1_024);
            assert_eq!(packed.file_count, 2);
        }
        // Member windows never split a file across bodies.
        for row in &result.segments {
            assert_eq!(row.offset_end - row.offset_start, 400);
        }
    }

    #[test]
    fn packed_round_trip_recovers_each_member() {
        let dir = tempfile::tempdir().unwrap();
        let contents: Vec<Vec<u8>> = (0..3).map(|i| vec![0x40 + i as u8; 300]).collect();
        let mut files = Vec::new();
        for (i, data) in contents.iter().enumerate() {
            let path = write_temp(&dir, &format!("m{i}.txt"), data);
            let mut record = file_record(data.len() as u64);
            record.path = format!("m{i}.txt");
            files.push((record, path));
        }

        let seg = segmenter(4_096, 1_000, 1);
        let result = seg.segment_folder(&files).unwrap();
        assert_eq!(result.packed.len(), 1);
        let packed = &result.packed[0];

        let members: Vec<(SegmentRecord, PathBuf)> = result
            .segments
            .iter()
            .cloned()
            .zip(files.iter().map(|(_, p)| p.clone()))
            .collect();
        let ciphertext = seg.rebuild_packed_segment(&members, packed.total_size).unwrap();

        let body = seg
            .decode_packed_segment(&result.segments[0], packed, &ciphertext)
            .unwrap();
        for (row, expected) in result.segments.iter().zip(&contents) {
            let slice = &body[row.offset_start as usize..row.offset_end as usize];
            assert_eq!(slice, expected.as_slice());
        }
    }

    #[test]
    fn file_segment_rebuild_matches_recorded_hash_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"compressible ".repeat(5_000);
        let path = write_temp(&dir, "c.bin", &data);
        let record = file_record(data.len() as u64);

        let seg = segmenter(100_000, 1_000, 2);
        let result = seg.segment_folder(&[(record, path.clone())]).unwrap();

        for row in &result.segments {
            let ciphertext = seg.rebuild_file_segment(row, &path).unwrap();
            assert_eq!(sha256_hex(&ciphertext), row.hash);
            let plaintext = seg.decode_file_segment(row, &ciphertext).unwrap();
            assert_eq!(
                plaintext,
                data[row.offset_start as usize..row.offset_end as usize]
            );
        }
    }

    #[test]
    fn tampered_ciphertext_is_an_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 70_000];
        let path = write_temp(&dir, "t.bin", &data);
        let record = file_record(data.len() as u64);

        let seg = segmenter(100_000, 1_000, 1);
        let result = seg.segment_folder(&[(record, path.clone())]).unwrap();
        let row = &result.segments[0];
        let mut ciphertext = seg.rebuild_file_segment(row, &path).unwrap();
        ciphertext[0] ^= 1;
        let err = seg.decode_file_segment(row, &ciphertext).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Integrity);
    }

    #[test]
    fn segment_size_one_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"abc".to_vec();
        let path = write_temp(&dir, "tiny.bin", &data);
        let record = file_record(3);

        let seg = segmenter(1, 0, 1);
        let result = seg.segment_folder(&[(record.clone(), path)]).unwrap();
        assert_eq!(result.file_totals[&record.file_id], 3);
    }

    #[test]
    fn window_reads_are_bounds_checked() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "small.bin", b"0123456789");
        assert!(matches!(
            read_window(&path, 8, 8),
            Err(SegmenterError::WindowOutOfBounds { .. })
        ));
        assert_eq!(read_window(&path, 2, 4).unwrap(), b"2345");
    }
}
