//! Retrieval: token-resolved share → core index → parallel segment
//! fetches with redundancy failover → verified reconstruction.
//!
//! Copies of a logical segment are tried in redundancy order; any fetch
//! or decode failure falls through to the next copy. A segment that
//! exhausts every copy fails its file; the session carries on with the
//! remaining files and reports a summary. Progress is persisted per file
//! so a restarted session fetches only what is missing.

pub mod error;
pub mod manifest;
mod writer;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use common::{
    Classify, ErrorClass, FileId, Progress, ProgressFn, ProgressPhase, Share, ShareId,
};
use crypto::{MasterKey, SegmentCipher, StreamingHasher};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use net::ArticleTransport;
use store::Store;
use tracing::{debug, info, instrument, warn};

pub use error::{Result, RetrieverError};
pub use manifest::{
    chunk_envelope, open as open_manifest, seal as seal_manifest, ManifestCopy, ManifestFile,
    ManifestPacked, ManifestSegment, ShareManifest,
};
use writer::FileWriter;

#[derive(Debug, Clone, Copy)]
pub struct RetrieverConfig {
    pub worker_count: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self { worker_count: 4 }
    }
}

#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub files_completed: u64,
    /// (relative path, error) for every file that gave up.
    pub files_failed: Vec<(String, String)>,
    pub bytes_written: u64,
    pub segments_resumed: u64,
}

impl DownloadSummary {
    pub fn fully_successful(&self) -> bool {
        self.files_failed.is_empty()
    }
}

pub struct Retriever {
    store: Store,
    transport: Arc<dyn ArticleTransport>,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: Store, transport: Arc<dyn ArticleTransport>, config: RetrieverConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Fetch and open the share's core index.
    #[instrument(skip_all, fields(share = %share.share_id))]
    pub async fn fetch_manifest(
        &self,
        share: &Share,
        master: &MasterKey,
        expected_verifying_key: Option<&str>,
    ) -> Result<ShareManifest> {
        if share.index_refs.is_empty() {
            return Err(RetrieverError::NoIndex);
        }
        let mut refs = share.index_refs.clone();
        refs.sort_by_key(|r| r.index);

        let mut envelope = Vec::new();
        for index_ref in &refs {
            let fetched = self
                .transport
                .fetch_article(&index_ref.message_id, None)
                .await?;
            let (_, chunk) = codec::parse_body(&fetched.body)?;
            envelope.extend_from_slice(&chunk);
        }
        manifest::open(&envelope, master, expected_verifying_key)
    }

    /// Reconstruct the share into `dest`.
    #[instrument(skip_all, fields(share = %share.share_id))]
    pub async fn download(
        &self,
        share: &Share,
        master: &MasterKey,
        dest: &Path,
        expected_verifying_key: Option<&str>,
        progress: &ProgressFn,
    ) -> Result<DownloadSummary> {
        let manifest = self
            .fetch_manifest(share, master, expected_verifying_key)
            .await?;
        self.download_with_manifest(share, master, &manifest, dest, progress)
            .await
    }

    pub async fn download_with_manifest(
        &self,
        share: &Share,
        master: &MasterKey,
        manifest: &ShareManifest,
        dest: &Path,
        progress: &ProgressFn,
    ) -> Result<DownloadSummary> {
        let cipher = Arc::new(SegmentCipher::new(master.as_bytes())?);
        let packed_meta: HashMap<&str, &ManifestPacked> = manifest
            .packed
            .iter()
            .map(|p| (p.packed_id.as_str(), p))
            .collect();
        let packed_cache: Arc<DashMap<String, Arc<Vec<u8>>>> = Arc::new(DashMap::new());

        let total_files = manifest.files.len() as u64;
        let mut summary = DownloadSummary::default();

        for (file_number, file) in manifest.files.iter().enumerate() {
            progress(Progress {
                phase: ProgressPhase::Downloading,
                current: file_number as u64,
                total: total_files,
                current_path: Some(file.path.clone()),
            });

            let mut outcome = self
                .download_file(share, &cipher, file, &packed_meta, &packed_cache, dest, 0)
                .await;

            // A whole-file hash mismatch gets one more pass over different
            // redundancy copies before the file is given up.
            if matches!(outcome, Err(RetrieverError::FileIntegrity { .. }))
                && file.segments.iter().any(|s| s.copies.len() > 1)
            {
                warn!(path = %file.path, "integrity mismatch; retrying on alternate copies");
                if let Some(file_id) = FileId::from_hex(&file.file_id) {
                    self.store
                        .set_download_progress(&share.share_id, &file_id, &[])
                        .await?;
                }
                outcome = self
                    .download_file(share, &cipher, file, &packed_meta, &packed_cache, dest, 1)
                    .await;
            }

            match outcome {
                Ok(bytes) => {
                    summary.files_completed += 1;
                    summary.bytes_written += bytes.written;
                    summary.segments_resumed += bytes.resumed;
                }
                Err(e) if e.class() == ErrorClass::Fatal => return Err(e),
                Err(e) => {
                    warn!(path = %file.path, error = %e, "file failed; continuing session");
                    summary.files_failed.push((file.path.clone(), e.to_string()));
                }
            }
        }

        if summary.fully_successful() {
            self.store.clear_download_progress(&share.share_id).await?;
        }
        info!(
            completed = summary.files_completed,
            failed = summary.files_failed.len(),
            "download session finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn download_file(
        &self,
        share: &Share,
        cipher: &Arc<SegmentCipher>,
        file: &ManifestFile,
        packed_meta: &HashMap<&str, &ManifestPacked>,
        packed_cache: &Arc<DashMap<String, Arc<Vec<u8>>>>,
        dest: &Path,
        start_copy: usize,
    ) -> Result<FileOutcome> {
        let relative = sanitize_relative(&file.path)
            .ok_or(RetrieverError::ManifestMalformed)?;
        let target = dest.join(relative);

        let mut segments = file.segments.clone();
        segments.sort_by_key(|s| s.index);

        let file_id = FileId::from_hex(&file.file_id);
        let resume = self
            .resume_state(&share.share_id, file_id.as_ref(), &segments, &target)
            .await?;
        let mut verified: Vec<u32> = (0..resume.prefix_segments).map(|i| segments[i].index).collect();

        let mut writer = FileWriter::create(&target, resume.prefix_bytes).map_err(|source| {
            RetrieverError::Io {
                path: target.display().to_string(),
                source,
            }
        })?;

        let remaining: Vec<ManifestSegment> =
            segments.iter().skip(resume.prefix_segments).cloned().collect();
        debug!(
            path = %file.path,
            resumed = resume.prefix_segments,
            remaining = remaining.len(),
            "planning file"
        );

        let mut fetches = stream::iter(remaining.into_iter().map(|segment| {
            let cipher = Arc::clone(cipher);
            let cache = Arc::clone(packed_cache);
            let packed = segment
                .packed_id
                .as_deref()
                .and_then(|id| packed_meta.get(id).copied().cloned());
            async move {
                let bytes = self
                    .fetch_segment(&cipher, &segment, packed.as_ref(), &cache, &file.path, start_copy)
                    .await;
                (segment, bytes)
            }
        }))
        .buffer_unordered(self.config.worker_count.max(1));

        let mut written = 0u64;
        while let Some((segment, outcome)) = fetches.next().await {
            let bytes = outcome?;
            written += bytes.len() as u64;
            // A packed member's window addresses the packed body; inside
            // its own file the content always starts at zero.
            let file_offset = if segment.packed_id.is_some() {
                0
            } else {
                segment.offset_start
            };
            let flushed = writer
                .insert(file_offset, segment.index, bytes)
                .map_err(|source| RetrieverError::Io {
                    path: target.display().to_string(),
                    source,
                })?;
            if !flushed.is_empty() {
                verified.extend(flushed);
                if let Some(file_id) = file_id.as_ref() {
                    self.store
                        .set_download_progress(&share.share_id, file_id, &verified)
                        .await?;
                }
            }
        }
        drop(fetches);
        writer.finish().map_err(|source| RetrieverError::Io {
            path: target.display().to_string(),
            source,
        })?;

        self.verify_file(&target, file)?;
        Ok(FileOutcome {
            written,
            resumed: resume.prefix_segments as u64,
        })
    }

    /// Work out how much of the destination can be trusted from persisted
    /// progress: the contiguous verified prefix, capped by what is
    /// actually on disk.
    async fn resume_state(
        &self,
        share_id: &ShareId,
        file_id: Option<&FileId>,
        segments: &[ManifestSegment],
        target: &Path,
    ) -> Result<ResumeState> {
        let Some(file_id) = file_id else {
            return Ok(ResumeState::default());
        };
        let recorded = self.store.download_progress(share_id, file_id).await?;
        if recorded.is_empty() {
            return Ok(ResumeState::default());
        }
        let on_disk = std::fs::metadata(target).map(|m| m.len()).unwrap_or(0);

        let mut prefix_segments = 0usize;
        let mut prefix_bytes = 0u64;
        for segment in segments {
            let file_end = if segment.packed_id.is_some() {
                segment.size
            } else {
                segment.offset_end
            };
            if !recorded.contains(&segment.index) || file_end > on_disk {
                break;
            }
            prefix_segments += 1;
            prefix_bytes = file_end;
        }
        Ok(ResumeState {
            prefix_segments,
            prefix_bytes,
        })
    }

    /// Fetch one logical segment, walking its redundancy copies starting
    /// at `start_copy` and falling through on every failure.
    #[allow(clippy::too_many_arguments)]
    async fn fetch_segment(
        &self,
        cipher: &SegmentCipher,
        segment: &ManifestSegment,
        packed: Option<&ManifestPacked>,
        cache: &DashMap<String, Arc<Vec<u8>>>,
        path: &str,
        start_copy: usize,
    ) -> Result<Vec<u8>> {
        let mut copies = segment.copies.clone();
        copies.sort_by_key(|c| c.redundancy_index);
        let rotate_by = start_copy.min(copies.len().saturating_sub(1));
        copies.rotate_left(rotate_by);

        let mut last = String::from("no copies recorded");
        for copy in &copies {
            match self
                .fetch_copy(cipher, segment, copy, packed, cache)
                .await
            {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(
                        message_id = %copy.message_id,
                        redundancy = copy.redundancy_index,
                        error = %e,
                        "copy failed, trying next"
                    );
                    last = e.to_string();
                }
            }
        }
        Err(RetrieverError::SegmentExhausted {
            path: path.to_string(),
            index: segment.index,
            last,
        })
    }

    async fn fetch_copy(
        &self,
        cipher: &SegmentCipher,
        segment: &ManifestSegment,
        copy: &ManifestCopy,
        packed: Option<&ManifestPacked>,
        cache: &DashMap<String, Arc<Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        match (segment.packed_id.as_deref(), packed) {
            (Some(packed_id), Some(packed)) => {
                // The packed plaintext is identical across copies; one
                // successful decode serves every member window.
                if let Some(body) = cache.get(packed_id) {
                    return Ok(slice_window(&body, segment)?);
                }
                let fetched = self.transport.fetch_article(&copy.message_id, None).await?;
                let (_, ciphertext) = codec::parse_body(&fetched.body)?;
                let body = self.decode_body(
                    cipher,
                    copy,
                    &ciphertext,
                    packed.compressed,
                    packed.total_size,
                )?;
                let body = Arc::new(body);
                cache.insert(packed_id.to_string(), Arc::clone(&body));
                Ok(slice_window(&body, segment)?)
            }
            _ => {
                let fetched = self.transport.fetch_article(&copy.message_id, None).await?;
                let (_, ciphertext) = codec::parse_body(&fetched.body)?;
                let compressed = segment
                    .compressed_size
                    .map(|cs| cs < segment.size)
                    .unwrap_or(false);
                self.decode_body(cipher, copy, &ciphertext, compressed, segment.size)
            }
        }
    }

    fn decode_body(
        &self,
        cipher: &SegmentCipher,
        copy: &ManifestCopy,
        ciphertext: &[u8],
        compressed: bool,
        expected_len: u64,
    ) -> Result<Vec<u8>> {
        if crypto::sha256_hex(ciphertext) != copy.hash {
            return Err(RetrieverError::Crypto(crypto::CryptoError::Integrity));
        }
        let nonce =
            hex::decode(&copy.nonce).map_err(|_| RetrieverError::ManifestMalformed)?;
        let body = cipher.decrypt(&nonce, ciphertext)?;
        let plaintext = if compressed {
            codec::decompress(&body)?
        } else {
            body
        };
        if plaintext.len() as u64 != expected_len {
            return Err(RetrieverError::Crypto(crypto::CryptoError::Integrity));
        }
        Ok(plaintext)
    }

    /// Final integrity gate: the reassembled file must hash to the record.
    fn verify_file(&self, target: &Path, file: &ManifestFile) -> Result<()> {
        let mut hasher = StreamingHasher::new();
        let mut reader = std::fs::File::open(target).map_err(|source| RetrieverError::Io {
            path: target.display().to_string(),
            source,
        })?;
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            use std::io::Read;
            let n = reader.read(&mut buffer).map_err(|source| RetrieverError::Io {
                path: target.display().to_string(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        if hasher.finalize_hex() != file.hash {
            return Err(RetrieverError::FileIntegrity {
                path: file.path.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
struct ResumeState {
    prefix_segments: usize,
    prefix_bytes: u64,
}

struct FileOutcome {
    written: u64,
    resumed: u64,
}

fn slice_window(body: &[u8], segment: &ManifestSegment) -> Result<Vec<u8>> {
    let start = segment.offset_start as usize;
    let end = segment.offset_end as usize;
    if end > body.len() || start > end {
        return Err(RetrieverError::ManifestMalformed);
    }
    Ok(body[start..end].to_vec())
}

/// Reject anything that could escape the destination directory.
fn sanitize_relative(path: &str) -> Option<PathBuf> {
    let candidate = PathBuf::from(path);
    let mut clean = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}
