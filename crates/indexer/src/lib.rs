//! Folder indexing: parallel tree walk, streamed content hashing and
//! versioned change detection.
//!
//! A re-index of an already-indexed folder produces the same end state as
//! a cold index plus the correct set of change-kind rows: `added` for new
//! paths, `modified` (version bumped, previous linked) when the content
//! hash moved, `deleted` tombstones for vanished paths, and `unchanged`
//! otherwise.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{
    now_epoch, ChangeKind, Classify, ErrorClass, FileId, FileRecord, Folder, Progress,
    ProgressFn, ProgressPhase, ProgressThrottle,
};
use crypto::StreamingHasher;
use futures::stream::{self, StreamExt};
use store::Store;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Hash read size; the principal constant when hashing is the bottleneck.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("folder root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("store: {0}")]
    Store(#[from] store::StoreError),

    #[error("walk failed: {0}")]
    Walk(String),

    #[error("join: {0}")]
    Join(String),
}

impl Classify for IndexerError {
    fn class(&self) -> ErrorClass {
        match self {
            IndexerError::MissingRoot(_) => ErrorClass::Validation,
            IndexerError::Store(e) => e.class(),
            IndexerError::Walk(_) | IndexerError::Join(_) => ErrorClass::Fatal,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    pub worker_threads: usize,
    pub batch_size: usize,
    /// Progress cadence: every N files or every interval.
    pub progress_every: u64,
    pub progress_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
            batch_size: 1000,
            progress_every: 10,
            progress_interval: Duration::from_millis(200),
        }
    }
}

/// Result of one index pass.
#[derive(Debug, Clone, Default)]
pub struct IndexOutcome {
    pub added: u64,
    pub modified: u64,
    pub deleted: u64,
    pub unchanged: u64,
    pub total_files: u64,
    pub total_bytes: u64,
}

#[derive(Debug)]
struct ScannedFile {
    relative_path: String,
    absolute_path: PathBuf,
    size: u64,
    modified_at: i64,
}

#[derive(Debug)]
struct HashedFile {
    scanned: ScannedFile,
    hash: String,
}

pub struct Indexer {
    store: Store,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(store: Store, config: IndexerConfig) -> Self {
        Self { store, config }
    }

    /// Index or re-index one folder tree.
    #[instrument(skip_all, fields(folder = %folder.folder_id))]
    pub async fn index_folder(&self, folder: &Folder, progress: &ProgressFn) -> Result<IndexOutcome> {
        let root = PathBuf::from(&folder.path);
        if !root.is_dir() {
            return Err(IndexerError::MissingRoot(root));
        }

        let scanned = self.scan_tree(root.clone(), progress).await?;
        let prior = self.store.latest_file_versions(&folder.folder_id).await?;
        let hashed = self.hash_files(scanned, progress).await?;

        let indexed_at = now_epoch();
        let mut outcome = IndexOutcome::default();
        let mut new_rows: Vec<FileRecord> = Vec::new();
        let mut unchanged_ids: Vec<FileId> = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::with_capacity(hashed.len());

        for hashed_file in &hashed {
            seen.insert(hashed_file.scanned.relative_path.clone(), ());
            match prior.get(&hashed_file.scanned.relative_path) {
                None => {
                    outcome.added += 1;
                    new_rows.push(self.record_for(folder, hashed_file, 1, None, ChangeKind::Added, indexed_at));
                }
                Some(previous) if previous.change_kind == ChangeKind::Deleted => {
                    // Path resurrected after a tombstone.
                    outcome.added += 1;
                    new_rows.push(self.record_for(
                        folder,
                        hashed_file,
                        previous.version + 1,
                        Some(previous.version),
                        ChangeKind::Added,
                        indexed_at,
                    ));
                }
                Some(previous) if previous.hash == hashed_file.hash => {
                    outcome.unchanged += 1;
                    unchanged_ids.push(previous.file_id);
                }
                Some(previous) => {
                    outcome.modified += 1;
                    new_rows.push(self.record_for(
                        folder,
                        hashed_file,
                        previous.version + 1,
                        Some(previous.version),
                        ChangeKind::Modified,
                        indexed_at,
                    ));
                }
            }
            outcome.total_files += 1;
            outcome.total_bytes += hashed_file.scanned.size;
        }

        // Tombstones for paths that disappeared since the last pass.
        for (path, previous) in &prior {
            if seen.contains_key(path) || previous.change_kind == ChangeKind::Deleted {
                continue;
            }
            outcome.deleted += 1;
            new_rows.push(FileRecord {
                file_id: FileId::generate(),
                folder_id: folder.folder_id,
                path: path.clone(),
                size: 0,
                hash: previous.hash.clone(),
                mime_type: previous.mime_type.clone(),
                version: previous.version + 1,
                previous_version: Some(previous.version),
                change_kind: ChangeKind::Deleted,
                segment_size: previous.segment_size,
                total_segments: 0,
                uploaded_segments: 0,
                encryption_key_ref: None,
                modified_at: indexed_at,
                indexed_at,
            });
        }

        // Commit in bulk batches.
        let mut throttle =
            ProgressThrottle::new(self.config.progress_every, self.config.progress_interval);
        let total_commits = new_rows.len() as u64;
        for (i, batch) in new_rows.chunks(self.config.batch_size).enumerate() {
            self.store.insert_files_bulk(batch).await?;
            throttle.observe(
                Progress {
                    phase: ProgressPhase::Committing,
                    current: ((i + 1) * self.config.batch_size).min(new_rows.len()) as u64,
                    total: total_commits,
                    current_path: None,
                },
                progress,
            );
        }
        self.store
            .mark_files_unchanged(&unchanged_ids, indexed_at)
            .await?;

        info!(
            added = outcome.added,
            modified = outcome.modified,
            deleted = outcome.deleted,
            unchanged = outcome.unchanged,
            "index pass complete"
        );
        Ok(outcome)
    }

    fn record_for(
        &self,
        folder: &Folder,
        hashed: &HashedFile,
        version: u32,
        previous_version: Option<u32>,
        change_kind: ChangeKind,
        indexed_at: i64,
    ) -> FileRecord {
        FileRecord {
            file_id: FileId::generate(),
            folder_id: folder.folder_id,
            path: hashed.scanned.relative_path.clone(),
            size: hashed.scanned.size,
            hash: hashed.hash.clone(),
            mime_type: guess_mime(&hashed.scanned.relative_path),
            version,
            previous_version,
            change_kind,
            segment_size: 0, // set by the segmenter
            total_segments: 0,
            uploaded_segments: 0,
            encryption_key_ref: None,
            modified_at: hashed.scanned.modified_at,
            indexed_at,
        }
    }

    async fn scan_tree(&self, root: PathBuf, progress: &ProgressFn) -> Result<Vec<ScannedFile>> {
        let emit = Arc::clone(progress);
        let scanned = tokio::task::spawn_blocking(move || -> Result<Vec<ScannedFile>> {
            let mut files = Vec::new();
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| IndexerError::Walk(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let metadata = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| IndexerError::Walk(e.to_string()))?;
                let relative_path = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let modified_at = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or_else(now_epoch);
                files.push(ScannedFile {
                    relative_path,
                    absolute_path: entry.path().to_path_buf(),
                    size: metadata.len(),
                    modified_at,
                });
                if files.len() % 1000 == 0 {
                    emit(Progress {
                        phase: ProgressPhase::Scanning,
                        current: files.len() as u64,
                        total: 0,
                        current_path: None,
                    });
                }
            }
            // Deterministic order keeps batches and progress stable.
            files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
            Ok(files)
        })
        .await
        .map_err(|e| IndexerError::Join(e.to_string()))??;
        debug!(files = scanned.len(), "scan complete");
        Ok(scanned)
    }

    async fn hash_files(
        &self,
        scanned: Vec<ScannedFile>,
        progress: &ProgressFn,
    ) -> Result<Vec<HashedFile>> {
        let total = scanned.len() as u64;
        let mut throttle =
            ProgressThrottle::new(self.config.progress_every, self.config.progress_interval);

        let mut hashed: Vec<HashedFile> = Vec::with_capacity(scanned.len());
        let mut results = stream::iter(scanned.into_iter().map(|file| {
            tokio::task::spawn_blocking(move || {
                let hash = hash_file(&file.absolute_path);
                (file, hash)
            })
        }))
        .buffer_unordered(self.config.worker_threads.max(1));

        let mut current = 0u64;
        while let Some(joined) = results.next().await {
            let (file, hash) = joined.map_err(|e| IndexerError::Join(e.to_string()))?;
            current += 1;
            match hash {
                Ok(hash) => {
                    throttle.observe(
                        Progress {
                            phase: ProgressPhase::Hashing,
                            current,
                            total,
                            current_path: Some(file.relative_path.clone()),
                        },
                        progress,
                    );
                    hashed.push(HashedFile {
                        scanned: file,
                        hash,
                    });
                }
                Err(e) => {
                    warn!(path = %file.absolute_path.display(), error = %e, "skipping unreadable file");
                }
            }
        }
        hashed.sort_by(|a, b| a.scanned.relative_path.cmp(&b.scanned.relative_path));
        Ok(hashed)
    }
}

/// Streamed SHA-256 of one file.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = StreamingHasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}

fn guess_mime(path: &str) -> Option<String> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        _ => return None,
    };
    Some(mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::progress::noop_progress;
    use common::{Folder, FolderId, FolderState};
    use std::io::Write;

    async fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("idx.db").display());
        let store = Store::connect(&url, 4).await.unwrap();
        (dir, store)
    }

    fn folder_at(path: &Path) -> Folder {
        Folder {
            folder_id: FolderId::generate(),
            path: path.to_string_lossy().into_owned(),
            name: "tree".to_string(),
            signing_key: None,
            verifying_key: None,
            content_key: None,
            version: 1,
            file_count: 0,
            total_size: 0,
            segment_count: 0,
            encryption_enabled: true,
            redundancy_level: 1,
            target_group: "alt.binaries.test".to_string(),
            state: FolderState::Added,
            created_at: now_epoch(),
            last_indexed: None,
        }
    }

    fn write_file(root: &Path, rel: &str, contents: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = File::create(path).unwrap();
        file.write_all(contents).unwrap();
    }

    #[tokio::test]
    async fn cold_index_marks_everything_added() {
        let tree = tempfile::tempdir().unwrap();
        write_file(tree.path(), "a.txt", b"alpha");
        write_file(tree.path(), "sub/b.bin", &[0u8; 4096]);
        let (_db, store) = temp_store().await;
        let folder = folder_at(tree.path());
        store.insert_folder(&folder).await.unwrap();

        let indexer = Indexer::new(store.clone(), IndexerConfig::default());
        let outcome = indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap();
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.modified + outcome.deleted + outcome.unchanged, 0);

        let latest = store.latest_file_versions(&folder.folder_id).await.unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["sub/b.bin"].version, 1);
        assert_eq!(latest["a.txt"].hash, crypto::sha256_hex(b"alpha"));
    }

    #[tokio::test]
    async fn reindex_detects_each_change_kind_exactly_once() {
        let tree = tempfile::tempdir().unwrap();
        write_file(tree.path(), "keep.txt", b"same");
        write_file(tree.path(), "change.txt", b"before");
        write_file(tree.path(), "remove.txt", b"bye");
        let (_db, store) = temp_store().await;
        let folder = folder_at(tree.path());
        store.insert_folder(&folder).await.unwrap();

        let indexer = Indexer::new(store.clone(), IndexerConfig::default());
        indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap();

        write_file(tree.path(), "change.txt", b"after");
        std::fs::remove_file(tree.path().join("remove.txt")).unwrap();
        write_file(tree.path(), "new.txt", b"hello");

        let outcome = indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.modified, 1);
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.unchanged, 1);

        let latest = store.latest_file_versions(&folder.folder_id).await.unwrap();
        assert_eq!(latest["change.txt"].version, 2);
        assert_eq!(latest["change.txt"].previous_version, Some(1));
        assert_eq!(latest["change.txt"].change_kind, ChangeKind::Modified);
        assert_eq!(latest["remove.txt"].change_kind, ChangeKind::Deleted);
        assert_eq!(latest["keep.txt"].change_kind, ChangeKind::Unchanged);
        assert_eq!(latest["new.txt"].change_kind, ChangeKind::Added);
    }

    #[tokio::test]
    async fn reindex_with_no_changes_is_idempotent() {
        let tree = tempfile::tempdir().unwrap();
        write_file(tree.path(), "stable.txt", b"stable");
        let (_db, store) = temp_store().await;
        let folder = folder_at(tree.path());
        store.insert_folder(&folder).await.unwrap();

        let indexer = Indexer::new(store.clone(), IndexerConfig::default());
        indexer.index_folder(&folder, &noop_progress()).await.unwrap();
        let second = indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap();
        assert_eq!(second.added, 0);
        assert_eq!(second.unchanged, 1);

        let latest = store.latest_file_versions(&folder.folder_id).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["stable.txt"].version, 1);
    }

    #[tokio::test]
    async fn deleted_then_restored_path_is_added_again() {
        let tree = tempfile::tempdir().unwrap();
        write_file(tree.path(), "ghost.txt", b"v1");
        let (_db, store) = temp_store().await;
        let folder = folder_at(tree.path());
        store.insert_folder(&folder).await.unwrap();
        let indexer = Indexer::new(store.clone(), IndexerConfig::default());

        indexer.index_folder(&folder, &noop_progress()).await.unwrap();
        std::fs::remove_file(tree.path().join("ghost.txt")).unwrap();
        indexer.index_folder(&folder, &noop_progress()).await.unwrap();
        write_file(tree.path(), "ghost.txt", b"v3");
        let outcome = indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap();

        assert_eq!(outcome.added, 1);
        let latest = store.latest_file_versions(&folder.folder_id).await.unwrap();
        assert_eq!(latest["ghost.txt"].change_kind, ChangeKind::Added);
        assert_eq!(latest["ghost.txt"].version, 3);
    }

    #[tokio::test]
    async fn missing_root_is_a_validation_error() {
        let (_db, store) = temp_store().await;
        let folder = folder_at(Path::new("/does/not/exist"));
        let indexer = Indexer::new(store, IndexerConfig::default());
        let err = indexer
            .index_folder(&folder, &noop_progress())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[test]
    fn hash_file_matches_in_memory_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![0x5Au8; 300_000];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), crypto::sha256_hex(&data));
    }
}
