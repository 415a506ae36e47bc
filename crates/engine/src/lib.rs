//! The operation surface every façade (CLI, HTTP, GUI) funnels into.
//!
//! One engine composes the leaf components around explicit handles built
//! at bootstrap: no import-time singletons, no hidden state. Each public
//! operation writes an audit row (begin/complete/fail, with duration).

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use access::{AccessControl, AccessError, AccessRequest, KdfParams};
use anyhow::{bail, Context, Result};
use common::{
    now_epoch, AccessTier, EntityKind, Folder, FolderId, FolderState, IndexArticleRef,
    MetricsSink, NoopMetrics, OpaqueId, ProgressFn, QueueState, Share, ShareId, ShareKind,
    UnifiedConfig, UploadState, PRIORITY_NORMAL,
};
use crypto::{FolderSigner, MasterKey};
use indexer::{IndexOutcome, Indexer, IndexerConfig};
use net::ArticleTransport;
use retriever::{
    DownloadSummary, ManifestCopy, ManifestFile, ManifestPacked, ManifestSegment, Retriever,
    RetrieverConfig, ShareManifest,
};
use segmenter::{Segmenter, SegmenterConfig};
use store::Store;
use tracing::{info, instrument, warn};
use uploader::{Uploader, UploaderConfig};

/// Member credentials presented at download time.
#[derive(Debug, Clone)]
pub struct MemberCredentials {
    pub user_id: String,
    pub public_key: Vec<u8>,
}

/// What `publish_folder` hands back to the caller.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub share: Share,
    /// Display token: `usenetsync://<share_id>/<tier>[/<key>]`.
    pub token: String,
    /// JSON-framed token carrying the index references.
    pub json_token: String,
}

pub struct Engine {
    store: Store,
    transport: Arc<dyn ArticleTransport>,
    config: UnifiedConfig,
    indexer: Indexer,
    uploader: Uploader,
    retriever: Retriever,
    access: AccessControl,
    metrics: Arc<dyn MetricsSink>,
    progress: ProgressFn,
    owner_id: String,
}

impl Engine {
    /// Compose an engine over an already-opened store and transport.
    pub fn new(
        store: Store,
        transport: Arc<dyn ArticleTransport>,
        config: UnifiedConfig,
        metrics: Arc<dyn MetricsSink>,
        progress: ProgressFn,
    ) -> Self {
        let indexer = Indexer::new(
            store.clone(),
            IndexerConfig {
                worker_threads: config.indexing_worker_threads.max(1),
                ..Default::default()
            },
        );
        let segmenter_config = SegmenterConfig {
            segment_size: config.segment_size,
            pack_threshold: config.pack_threshold,
            redundancy_level: config.redundancy_level.max(1),
            compression_enabled: true,
        };
        let uploader = Uploader::new(
            store.clone(),
            Arc::clone(&transport),
            UploaderConfig {
                worker_count: config.upload_worker_threads.max(1),
                max_retries: config.max_retries,
                segmenter: segmenter_config,
                ..Default::default()
            },
        );
        let retriever = Retriever::new(
            store.clone(),
            Arc::clone(&transport),
            RetrieverConfig {
                worker_count: config.download_worker_threads.max(1),
            },
        );
        let access = AccessControl::new(
            store.clone(),
            KdfParams {
                scrypt_n: config.scrypt_n,
                scrypt_r: config.scrypt_r,
                scrypt_p: config.scrypt_p,
                pbkdf2_iterations: config.pbkdf2_iterations,
            },
        );
        Self {
            store,
            transport,
            config,
            indexer,
            uploader,
            retriever,
            access,
            metrics,
            progress,
            owner_id: "local".to_string(),
        }
    }

    /// Open the configured store and compose with defaults.
    pub async fn open(config: UnifiedConfig, transport: Arc<dyn ArticleTransport>) -> Result<Self> {
        let store = Store::open(&config).await.context("opening store")?;
        Ok(Self::new(
            store,
            transport,
            config,
            Arc::new(NoopMetrics),
            common::noop_progress(),
        ))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn uploader(&self) -> &Uploader {
        &self.uploader
    }

    pub fn set_owner(&mut self, owner_id: impl Into<String>) {
        self.owner_id = owner_id.into();
    }

    async fn audited<T, F>(&self, name: &str, entity: Option<&str>, work: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let operation_id = OpaqueId::generate().to_string();
        let started = Instant::now();
        self.store
            .begin_operation(&operation_id, name, entity)
            .await?;
        match work.await {
            Ok(value) => {
                self.store
                    .complete_operation(&operation_id, started.elapsed().as_millis() as u64)
                    .await?;
                self.metrics.record(common::Metric::histogram(
                    format!("engine.{name}.ms"),
                    started.elapsed().as_millis() as f64,
                ));
                Ok(value)
            }
            Err(e) => {
                self.store
                    .fail_operation(&operation_id, &e.to_string())
                    .await?;
                Err(e)
            }
        }
    }

    /// Register a folder. Key material (Ed25519 signing pair and the
    /// content-encryption key) is generated here, once, and never changes.
    #[instrument(skip(self))]
    pub async fn add_folder(&self, path: &str, name: Option<String>) -> Result<Folder> {
        let absolute = std::fs::canonicalize(path)
            .with_context(|| format!("folder path {path} does not resolve"))?;
        if !absolute.is_dir() {
            bail!("{path} is not a directory");
        }
        let display = name.unwrap_or_else(|| {
            absolute
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "folder".to_string())
        });

        let signer = FolderSigner::generate();
        let content_key = MasterKey::generate();
        let folder = Folder {
            folder_id: FolderId::generate(),
            path: absolute.to_string_lossy().into_owned(),
            name: display,
            signing_key: Some(signer.secret_hex()),
            verifying_key: Some(signer.verifying_key_hex()),
            content_key: Some(content_key.to_base64()),
            version: 1,
            file_count: 0,
            total_size: 0,
            segment_count: 0,
            encryption_enabled: true,
            redundancy_level: self.config.redundancy_level.max(1),
            target_group: self.config.target_group.clone(),
            state: FolderState::Added,
            created_at: now_epoch(),
            last_indexed: None,
        };

        self.audited("add_folder", Some(&folder.folder_id.to_string()), async {
            self.store.insert_folder(&folder).await?;
            info!(folder_id = %folder.folder_id, path = %folder.path, "folder added");
            Ok(folder.clone())
        })
        .await
    }

    /// Index (or re-index) a folder tree. The folder version bumps only
    /// when the pass found actual changes.
    #[instrument(skip(self))]
    pub async fn index_folder(&self, folder_id: &FolderId) -> Result<IndexOutcome> {
        let folder = self.store.folder(folder_id).await?;
        self.audited("index_folder", Some(&folder_id.to_string()), async {
            self.store
                .set_folder_state(folder_id, FolderState::Indexing)
                .await?;
            let outcome = match self.indexer.index_folder(&folder, &self.progress).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.store
                        .set_folder_state(folder_id, FolderState::Error)
                        .await?;
                    return Err(e.into());
                }
            };
            if folder.last_indexed.is_some()
                && outcome.added + outcome.modified + outcome.deleted > 0
            {
                self.store.bump_folder_version(folder_id).await?;
            }
            self.store
                .update_folder_stats(
                    folder_id,
                    outcome.total_files,
                    outcome.total_bytes,
                    self.store
                        .logical_segment_count(&folder_id.to_string())
                        .await?,
                )
                .await?;
            self.store
                .set_folder_state(folder_id, FolderState::Indexed)
                .await?;
            Ok(outcome)
        })
        .await
    }

    fn segmenter_for(&self, folder: &Folder) -> Result<Segmenter> {
        let content_key = MasterKey::from_base64(
            folder
                .content_key
                .as_deref()
                .context("folder has no content key")?,
        )?;
        let subject_key = hex::decode(
            folder
                .signing_key
                .as_deref()
                .context("folder has no signing key")?,
        )?;
        Ok(Segmenter::new(
            SegmenterConfig {
                segment_size: self.config.segment_size,
                pack_threshold: self.config.pack_threshold,
                redundancy_level: folder.redundancy_level.max(1),
                compression_enabled: true,
            },
            &content_key,
            subject_key,
            folder.target_group.clone(),
        )?)
    }

    /// Cut the folder's current files into segment rows.
    #[instrument(skip(self))]
    pub async fn segment_folder(&self, folder_id: &FolderId) -> Result<u64> {
        let folder = self.store.folder(folder_id).await?;
        self.audited("segment_folder", Some(&folder_id.to_string()), async {
            self.store
                .set_folder_state(folder_id, FolderState::Segmenting)
                .await?;

            let segmenter = self.segmenter_for(&folder)?;
            let root = Path::new(&folder.path);
            let files: Vec<_> = self
                .store
                .live_files(folder_id)
                .await?
                .into_iter()
                // Only versions that never produced segments.
                .filter(|f| f.total_segments == 0)
                .map(|f| {
                    let path = root.join(&f.path);
                    (f, path)
                })
                .collect();

            let result = segmenter.segment_folder(&files)?;
            self.store.insert_segments_bulk(&result.segments).await?;
            for packed in &result.packed {
                self.store.insert_packed_segment(packed).await?;
            }
            for (file_id, total) in &result.file_totals {
                self.store
                    .set_file_segment_totals(file_id, *total, self.config.segment_size as u32)
                    .await?;
            }

            let logical = self
                .store
                .logical_segment_count(&folder_id.to_string())
                .await?;
            self.store
                .update_folder_stats(folder_id, folder.file_count, folder.total_size, logical)
                .await?;
            self.store
                .set_folder_state(folder_id, FolderState::Segmented)
                .await?;
            info!(folder_id = %folder_id, segments = result.segments.len(), "folder segmented");
            Ok(result.segments.len() as u64)
        })
        .await
    }

    /// Push every pending segment copy of the folder through the queue,
    /// synchronously.
    #[instrument(skip(self))]
    pub async fn upload_folder(&self, folder_id: &FolderId) -> Result<QueueState> {
        let folder = self.store.folder(folder_id).await?;
        self.audited("upload_folder", Some(&folder_id.to_string()), async {
            self.store
                .set_folder_state(folder_id, FolderState::Uploading)
                .await?;
            let session_id = uuid::Uuid::new_v4().to_string();
            let queue_id = self
                .uploader
                .enqueue(
                    EntityKind::Folder,
                    folder_id.to_string(),
                    PRIORITY_NORMAL,
                    // Sized at expansion time: copies multiply the bytes.
                    0,
                    Some(session_id.clone()),
                )
                .await?;
            self.uploader.process_available().await?;
            let state = self
                .uploader
                .await_item(queue_id, std::time::Duration::from_secs(3600))
                .await?;
            let session = self.uploader.session_progress(&session_id);
            info!(
                folder_id = %folder_id,
                bytes = session.bytes_transferred,
                items = session.items_completed,
                "upload session finished"
            );
            let final_state = if state == QueueState::Completed {
                FolderState::Uploaded
            } else {
                FolderState::Error
            };
            self.store.set_folder_state(folder_id, final_state).await?;
            Ok(state)
        })
        .await
    }

    /// Build the core index from the store, seal it, post it, and create
    /// the share under the requested tier.
    #[instrument(skip(self, passphrase, members))]
    pub async fn publish_folder(
        &self,
        folder_id: &FolderId,
        tier: AccessTier,
        passphrase: Option<&str>,
        members: &[(String, Vec<u8>)],
        owner_public_key: &[u8],
    ) -> Result<PublishOutcome> {
        let folder = self.store.folder(folder_id).await?;
        self.audited("publish_folder", Some(&folder_id.to_string()), async {
            if folder.total_size > self.config.max_share_size_gb * 1024 * 1024 * 1024 {
                bail!(
                    "folder exceeds max_share_size_gb ({} GiB)",
                    self.config.max_share_size_gb
                );
            }

            let expiry = self.config.expiry_default_days;
            let (share, master) = match tier {
                AccessTier::Open => {
                    self.access
                        .create_open_share(&folder, &self.owner_id, ShareKind::Full, expiry)
                        .await?
                }
                AccessTier::Member => {
                    let share = self
                        .access
                        .create_member_share(
                            &folder,
                            &self.owner_id,
                            owner_public_key,
                            members,
                            ShareKind::Full,
                            expiry,
                        )
                        .await?;
                    let master = MasterKey::from_base64(
                        folder.content_key.as_deref().context("no content key")?,
                    )?;
                    (share, master)
                }
                AccessTier::Passphrase => {
                    let passphrase = passphrase.context("passphrase tier requires a passphrase")?;
                    let share = self
                        .access
                        .create_passphrase_share(
                            &folder,
                            &self.owner_id,
                            passphrase,
                            ShareKind::Full,
                            expiry,
                        )
                        .await?;
                    let master = MasterKey::from_base64(
                        folder.content_key.as_deref().context("no content key")?,
                    )?;
                    (share, master)
                }
            };

            let manifest = self.build_manifest(&folder).await?;
            let signer = FolderSigner::from_hex(
                folder.signing_key.as_deref().context("no signing key")?,
            )?;
            let sealed = retriever::seal_manifest(&manifest, &master, &signer)?;

            // Post the index articles and record their ids on the share.
            let mut refs = Vec::new();
            for (index, chunk) in retriever::chunk_envelope(&sealed, self.config.segment_size)
                .into_iter()
                .enumerate()
            {
                let body = codec::build_body(&chunk, 0);
                let subject = codec::obfuscate_subject(
                    &hex::decode(folder.signing_key.as_deref().unwrap_or_default())?,
                    &common::SegmentId::generate(),
                    index as u8,
                );
                let message_id = codec::generate_message_id();
                let receipt = self
                    .transport
                    .post_article(&folder.target_group, &subject, &message_id, &body)
                    .await?;
                refs.push(IndexArticleRef {
                    index: index as u32,
                    message_id: receipt.message_id,
                    group: folder.target_group.clone(),
                });
            }
            self.store
                .set_share_index_refs(&share.share_id, &refs)
                .await?;
            let mut share = share;
            share.index_refs = refs;

            self.store
                .set_folder_state(folder_id, FolderState::Published)
                .await?;

            let token = match tier {
                AccessTier::Open => AccessControl::issue_token(&share, Some(&master)),
                _ => AccessControl::issue_token(&share, None),
            };
            let json_token = AccessControl::issue_json_token(&share);
            info!(share_id = %share.share_id, tier = tier.as_str(), "folder published");
            Ok(PublishOutcome {
                share,
                token,
                json_token,
            })
        })
        .await
    }

    /// Assemble the share manifest from uploaded segment rows.
    async fn build_manifest(&self, folder: &Folder) -> Result<ShareManifest> {
        let files = self.store.live_files(&folder.folder_id).await?;
        let mut manifest_files = Vec::with_capacity(files.len());
        let mut packed_ids = Vec::new();

        for file in &files {
            let rows = self.store.segments_for_file(&file.file_id).await?;
            let mut by_index: std::collections::BTreeMap<u32, Vec<&common::SegmentRecord>> =
                Default::default();
            for row in &rows {
                by_index.entry(row.segment_index).or_default().push(row);
            }

            let mut segments = Vec::new();
            for (index, copies) in by_index {
                let uploaded: Vec<&&common::SegmentRecord> = copies
                    .iter()
                    .filter(|r| {
                        r.upload_state == UploadState::Uploaded && r.message_id.is_some()
                    })
                    .collect();
                if uploaded.is_empty() {
                    bail!(
                        "{}: segment {} has no uploaded copy; upload the folder first",
                        file.path,
                        index
                    );
                }
                let first = uploaded[0];
                if let Some(packed_id) = first.packed_segment_id {
                    let id = packed_id.to_string();
                    if !packed_ids.contains(&id) {
                        packed_ids.push(id);
                    }
                }
                segments.push(ManifestSegment {
                    index,
                    size: first.size,
                    offset_start: first.offset_start,
                    offset_end: first.offset_end,
                    compressed_size: first.compressed_size,
                    packed_id: first.packed_segment_id.map(|id| id.to_string()),
                    copies: uploaded
                        .iter()
                        .map(|r| ManifestCopy {
                            redundancy_index: r.redundancy_index,
                            message_id: r.message_id.clone().expect("filtered on message_id"),
                            hash: r.hash.clone(),
                            nonce: r.nonce.clone(),
                        })
                        .collect(),
                });
            }

            manifest_files.push(ManifestFile {
                file_id: file.file_id.to_string(),
                path: file.path.clone(),
                size: file.size,
                hash: file.hash.clone(),
                segments,
            });
        }

        let mut packed = Vec::with_capacity(packed_ids.len());
        for id in packed_ids {
            let packed_id = common::PackedSegmentId::from_hex(&id).context("bad packed id")?;
            let record = self.store.packed_segment(&packed_id).await?;
            packed.push(ManifestPacked {
                packed_id: id,
                total_size: record.total_size,
                compressed: record.compressed,
            });
        }

        Ok(ShareManifest {
            folder_id: folder.folder_id.to_string(),
            folder_version: folder.version,
            folder_name: folder.name.clone(),
            verifying_key: folder.verifying_key.clone().unwrap_or_default(),
            files: manifest_files,
            packed,
        })
    }

    /// Resolve a token, unwrap the tier key, and reconstruct into `dest`.
    #[instrument(skip(self, token, passphrase, member))]
    pub async fn download_share(
        &self,
        token: &str,
        dest: &Path,
        passphrase: Option<&str>,
        member: Option<&MemberCredentials>,
    ) -> Result<DownloadSummary> {
        let parsed = access::parse(token).map_err(|e| anyhow::anyhow!(e))?;
        let share_id = parsed.share_id().clone();
        self.audited("download_share", Some(share_id.as_str()), async {
            let share = self
                .store
                .share(&share_id)
                .await?
                .ok_or(AccessError::AccessDenied)?;

            // Payload tokens carry no key; fall back to the local record
            // for open shares this node owns.
            let open_key = match share.tier {
                AccessTier::Open => Some(match parsed.embedded_key() {
                    Some(key) => key.clone(),
                    None => {
                        let stored = share
                            .master_key
                            .as_deref()
                            .ok_or(AccessError::AccessDenied)?;
                        MasterKey::from_base64(stored)?
                    }
                }),
                _ => None,
            };
            let request = match share.tier {
                AccessTier::Open => AccessRequest::Open {
                    key: open_key.as_ref().expect("open tier key resolved above"),
                },
                AccessTier::Member => {
                    let creds = member.context("member share requires user credentials")?;
                    AccessRequest::Member {
                        user_id: &creds.user_id,
                        public_key: &creds.public_key,
                    }
                }
                AccessTier::Passphrase => {
                    let passphrase =
                        passphrase.context("passphrase share requires a passphrase")?;
                    AccessRequest::Passphrase(passphrase)
                }
            };

            let master = self.access.verify_access(&share_id, request).await?;
            let folder = self.store.folder(&share.folder_id).await.ok();
            let expected_key = folder.as_ref().and_then(|f| f.verifying_key.as_deref());

            let summary = self
                .retriever
                .download(&share, &master, dest, expected_key, &self.progress)
                .await?;
            Ok(summary)
        })
        .await
    }

    pub async fn list_shares(&self) -> Result<Vec<Share>> {
        Ok(self.store.list_shares().await?)
    }

    pub async fn revoke_share(&self, share_id: &ShareId) -> Result<()> {
        Ok(self.access.revoke_share(share_id, &self.owner_id).await?)
    }

    pub async fn add_member(
        &self,
        share_id: &ShareId,
        user_id: &str,
        public_key: &[u8],
    ) -> Result<()> {
        Ok(self
            .access
            .add_member(share_id, &self.owner_id, user_id, public_key)
            .await?)
    }

    pub async fn remove_member(&self, share_id: &ShareId, user_id: &str) -> Result<()> {
        Ok(self
            .access
            .remove_member(share_id, &self.owner_id, user_id)
            .await?)
    }

    pub async fn folder_info(&self, folder_id: &FolderId) -> Result<Folder> {
        Ok(self.store.folder(folder_id).await?)
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        Ok(self.store.list_folders().await?)
    }

    pub async fn remove_folder(&self, folder_id: &FolderId) -> Result<()> {
        Ok(self.store.remove_folder(folder_id).await?)
    }

    /// Re-index, segment the delta and upload it, as one operation.
    #[instrument(skip(self))]
    pub async fn resync_folder(&self, folder_id: &FolderId) -> Result<IndexOutcome> {
        let outcome = self.index_folder(folder_id).await?;
        if outcome.added + outcome.modified > 0 {
            self.segment_folder(folder_id).await?;
            let state = self.upload_folder(folder_id).await?;
            if state != QueueState::Completed {
                warn!(folder_id = %folder_id, ?state, "resync upload did not complete");
            }
        }
        Ok(outcome)
    }
}
