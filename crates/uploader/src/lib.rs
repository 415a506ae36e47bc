//! Upload scheduler: persisted priority queue, worker pool, batching by
//! target group, progress accounting and failure routing.
//!
//! Workers lease the highest-priority queued item, expand coarse items
//! (folder, file) into segment posting units, and push them through the
//! transport. Retryable failures re-enqueue the item with its priority
//! demoted one step toward NORMAL; everything else fails the item with
//! the error preserved. Pause, resume and cancel are honoured at the
//! natural yield points: an in-flight post always completes first.

pub mod queue;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{
    demote_priority, now_epoch, ArticleRecord, Classify, EntityKind, ErrorClass, FileId, Folder,
    FolderId, PackedSegmentId, QueueId, QueueItem, QueueState, SegmentId, SegmentRecord,
    UploadState,
};
use crypto::MasterKey;
use dashmap::DashMap;
use net::ArticleTransport;
use queue::PriorityQueue;
use segmenter::{Segmenter, SegmenterConfig};
use store::Store;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum UploaderError {
    #[error("store: {0}")]
    Store(#[from] store::StoreError),

    #[error("net: {0}")]
    Net(#[from] net::NetError),

    #[error("segmenter: {0}")]
    Segmenter(#[from] segmenter::SegmenterError),

    #[error("crypto: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("upload queue is full ({depth} items); retry later")]
    QueueFull { depth: usize },

    #[error("folder {0} has no key material; index it first")]
    MissingKeys(FolderId),

    #[error("bad entity id on queue item: {0}")]
    BadEntityId(String),
}

impl Classify for UploaderError {
    fn class(&self) -> ErrorClass {
        match self {
            UploaderError::Store(e) => e.class(),
            UploaderError::Net(e) => e.class(),
            UploaderError::Segmenter(e) => e.class(),
            UploaderError::Crypto(e) => e.class(),
            UploaderError::QueueFull { .. } => ErrorClass::Capacity,
            UploaderError::MissingKeys(_) | UploaderError::BadEntityId(_) => ErrorClass::Validation,
        }
    }
}

pub type Result<T> = std::result::Result<T, UploaderError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Producers wait for room; the indexer honours this.
    Block,
    /// Producers get a capacity error immediately.
    FailFast,
}

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub worker_count: usize,
    pub max_retries: u32,
    pub high_water_mark: usize,
    pub backpressure: BackpressurePolicy,
    /// Per-session deployment cap per hour, None = uncapped.
    pub session_deploys_per_hour: Option<u32>,
    pub segmenter: SegmenterConfig,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 3,
            high_water_mark: 1000,
            backpressure: BackpressurePolicy::Block,
            session_deploys_per_hour: None,
            segmenter: SegmenterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionProgress {
    pub items_total: u64,
    pub items_completed: u64,
    pub bytes_total: u64,
    pub bytes_transferred: u64,
}

struct Inner {
    store: Store,
    transport: Arc<dyn ArticleTransport>,
    config: UploaderConfig,
    queue: PriorityQueue,
    notify: Notify,
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sessions: DashMap<String, SessionProgress>,
    session_starts: DashMap<String, Vec<i64>>,
}

#[derive(Clone)]
pub struct Uploader {
    inner: Arc<Inner>,
}

enum Payload {
    File {
        record: SegmentRecord,
        source: PathBuf,
    },
    Packed {
        members: Vec<(SegmentRecord, PathBuf)>,
        total_size: u64,
    },
}

struct PostUnit {
    subject: String,
    group: String,
    redundancy_index: u8,
    /// Rows advanced together when this article posts.
    rows: Vec<SegmentRecord>,
    bytes: u64,
    payload: Payload,
}

impl Uploader {
    pub fn new(store: Store, transport: Arc<dyn ArticleTransport>, config: UploaderConfig) -> Self {
        let (paused_tx, paused_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                config,
                queue: PriorityQueue::new(),
                notify: Notify::new(),
                paused_tx,
                paused_rx,
                shutdown_tx,
                shutdown_rx,
                sessions: DashMap::new(),
                session_starts: DashMap::new(),
            }),
        }
    }

    /// Reload persisted queue state after a restart.
    pub async fn restore(&self) -> Result<usize> {
        let items = self.inner.store.load_resumable_queue().await?;
        let count = items.len();
        for item in items {
            self.inner.queue.push(item);
        }
        if count > 0 {
            info!(count, "restored upload queue");
            self.inner.notify.notify_waiters();
        }
        Ok(count)
    }

    /// Enqueue an entity for upload, honouring the backpressure policy
    /// when the queue sits above its high-water mark.
    #[instrument(skip(self))]
    pub async fn enqueue(
        &self,
        entity_kind: EntityKind,
        entity_id: String,
        priority: u8,
        total_size: u64,
        session_id: Option<String>,
    ) -> Result<QueueId> {
        loop {
            let depth = self.inner.queue.len();
            if depth < self.inner.config.high_water_mark {
                break;
            }
            match self.inner.config.backpressure {
                BackpressurePolicy::FailFast => {
                    return Err(UploaderError::QueueFull { depth });
                }
                BackpressurePolicy::Block => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }

        let mut item = QueueItem::new(entity_id, entity_kind, priority, total_size);
        item.max_retries = self.inner.config.max_retries;
        item.session_id = session_id.clone();
        self.inner.store.insert_queue_item(&item).await?;

        if let Some(session) = session_id {
            let mut progress = self.inner.sessions.entry(session).or_default();
            progress.items_total += 1;
            progress.bytes_total += total_size;
        }

        let queue_id = item.queue_id;
        self.inner.queue.push(item);
        self.inner.notify.notify_waiters();
        Ok(queue_id)
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Stop leasing new items; in-flight items finish or yield at their
    /// next boundary.
    pub fn pause(&self) {
        let _ = self.inner.paused_tx.send(true);
        info!("uploader paused");
    }

    pub fn resume(&self) {
        let _ = self.inner.paused_tx.send(false);
        self.inner.notify.notify_waiters();
        info!("uploader resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.inner.paused_rx.borrow()
    }

    /// Cancel a queued item immediately; a running item is interrupted at
    /// its next yield point.
    pub async fn cancel(&self, queue_id: QueueId) -> Result<()> {
        self.inner.queue.mark_cancelled(queue_id);
        if let Some(mut item) = self.inner.store.queue_item(&queue_id).await? {
            if !item.state.is_terminal() && item.state != QueueState::Running {
                item.state = QueueState::Cancelled;
                item.completed_at = Some(now_epoch());
                self.inner.store.update_queue_item(&item).await?;
            }
        }
        Ok(())
    }

    pub fn session_progress(&self, session_id: &str) -> SessionProgress {
        self.inner
            .sessions
            .get(session_id)
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Spawn the background worker pool.
    pub fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.inner.config.worker_count.max(1))
            .map(|i| {
                let uploader = self.clone();
                let worker_id = format!("upload-worker-{i}");
                tokio::spawn(async move { uploader.worker_loop(worker_id).await })
            })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.notify.notify_waiters();
    }

    /// Process queued items inline until the queue is empty. The CLI path
    /// uses this for synchronous uploads.
    pub async fn process_available(&self) -> Result<()> {
        while let Some(item) = self.lease() {
            self.process_item(item, "inline").await;
        }
        Ok(())
    }

    /// Poll until an item reaches a terminal or failed state.
    pub async fn await_item(&self, queue_id: QueueId, timeout: Duration) -> Result<QueueState> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.inner.store.queue_item(&queue_id).await? {
                if item.state.is_terminal() || item.state == QueueState::Failed {
                    return Ok(item.state);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(UploaderError::Net(net::NetError::Timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn lease(&self) -> Option<QueueItem> {
        if self.is_paused() {
            return None;
        }
        self.inner.queue.pop()
    }

    async fn worker_loop(self, worker_id: String) {
        debug!(worker = %worker_id, "worker started");
        let mut paused = self.inner.paused_rx.clone();
        let mut shutdown = self.inner.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }
            if *paused.borrow() {
                tokio::select! {
                    _ = paused.changed() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
            match self.lease() {
                Some(item) => self.process_item(item, &worker_id).await,
                None => {
                    tokio::select! {
                        _ = self.inner.notify.notified() => {}
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
        debug!(worker = %worker_id, "worker stopped");
    }

    async fn process_item(&self, mut item: QueueItem, worker_id: &str) {
        if item.state.is_terminal() {
            return;
        }
        if let Err(e) = self.throttle_session(&item).await {
            warn!(error = %e, "session throttle failed");
        }

        item.state = QueueState::Running;
        item.worker_id = Some(worker_id.to_string());
        item.started_at = Some(now_epoch());
        if let Err(e) = self.inner.store.update_queue_item(&item).await {
            warn!(error = %e, "failed to persist lease");
        }

        match self.run_item(&mut item).await {
            Ok(ItemOutcome::Completed) => {
                item.state = QueueState::Completed;
                item.progress = 1.0;
                item.completed_at = Some(now_epoch());
                self.finish_item(&item, true).await;
            }
            Ok(ItemOutcome::Cancelled) => {
                item.state = QueueState::Cancelled;
                item.completed_at = Some(now_epoch());
                self.inner.queue.clear_cancelled(&item.queue_id);
                self.finish_item(&item, false).await;
            }
            Err(e) => self.route_failure(item, e).await,
        }
    }

    async fn finish_item(&self, item: &QueueItem, completed: bool) {
        if let Err(e) = self.inner.store.update_queue_item(item).await {
            warn!(error = %e, "failed to persist item state");
        }
        if let (Some(session), true) = (&item.session_id, completed) {
            if let Some(mut progress) = self.inner.sessions.get_mut(session) {
                progress.items_completed += 1;
            }
        }
    }

    /// Failure routing: retryable and under the cap goes back to the
    /// queue one priority step closer to NORMAL; the rest fail for good.
    async fn route_failure(&self, mut item: QueueItem, error: UploaderError) {
        let retryable = error.class().is_retryable();
        if retryable && item.retry_count < item.max_retries {
            item.retry_count += 1;
            item.priority = demote_priority(item.priority);
            item.state = QueueState::Retrying;
            item.worker_id = None;
            warn!(
                queue_id = %item.queue_id,
                retry = item.retry_count,
                priority = item.priority,
                error = %error,
                "item re-enqueued"
            );
            if let Err(e) = self.inner.store.update_queue_item(&item).await {
                warn!(error = %e, "failed to persist retry state");
            }
            self.inner.queue.push(item);
            self.inner.notify.notify_waiters();
        } else {
            item.state = QueueState::Failed;
            item.error = Some(error.to_string());
            item.completed_at = Some(now_epoch());
            warn!(queue_id = %item.queue_id, error = %error, "item failed");
            if let Err(e) = self.inner.store.update_queue_item(&item).await {
                warn!(error = %e, "failed to persist failure");
            }
        }
    }

    /// Per-session deployment rate cap: at most N item starts per hour.
    async fn throttle_session(&self, item: &QueueItem) -> Result<()> {
        let (Some(cap), Some(session)) = (
            self.inner.config.session_deploys_per_hour,
            item.session_id.as_ref(),
        ) else {
            return Ok(());
        };
        loop {
            let now = now_epoch();
            let wait = {
                let mut starts = self
                    .inner
                    .session_starts
                    .entry(session.clone())
                    .or_default();
                starts.retain(|t| now - *t < 3600);
                if (starts.len() as u32) < cap {
                    starts.push(now);
                    None
                } else {
                    starts.first().map(|oldest| (oldest + 3600 - now).max(1))
                }
            };
            match wait {
                None => return Ok(()),
                Some(seconds) => {
                    debug!(session = %session, seconds, "session deployment cap reached");
                    tokio::time::sleep(Duration::from_secs(seconds.min(5) as u64)).await;
                }
            }
        }
    }

    async fn run_item(&self, item: &mut QueueItem) -> Result<ItemOutcome> {
        let units = self.expand(item).await?;
        let total_bytes: u64 = units.iter().map(|u| u.bytes).sum();
        if item.total_size == 0 {
            item.total_size = total_bytes;
        }

        let mut touched_files: Vec<FileId> = Vec::new();
        let mut paused = self.inner.paused_rx.clone();

        for unit in units {
            // Yield points: cancellation and pause are observed between
            // posts; the in-flight post below always completes.
            if self.inner.queue.is_cancelled(&item.queue_id) {
                return Ok(ItemOutcome::Cancelled);
            }
            while *paused.borrow() {
                let _ = paused.changed().await;
            }

            for row in &unit.rows {
                self.inner
                    .store
                    .set_segment_state(
                        &row.segment_id,
                        row.redundancy_index,
                        UploadState::Uploading,
                        None,
                    )
                    .await?;
            }

            let ciphertext = match &unit.payload {
                Payload::File { record, source } => {
                    self.segmenter_for_rows(&unit.rows).await?.rebuild_file_segment(record, source)?
                }
                Payload::Packed { members, total_size } => self
                    .segmenter_for_rows(&unit.rows)
                    .await?
                    .rebuild_packed_segment(members, *total_size)?,
            };

            let body = codec::build_body(&ciphertext, unit.redundancy_index);
            let message_id = codec::generate_message_id();
            match self
                .inner
                .transport
                .post_article(&unit.group, &unit.subject, &message_id, &body)
                .await
            {
                Ok(receipt) => {
                    for row in &unit.rows {
                        self.inner
                            .store
                            .set_segment_state(
                                &row.segment_id,
                                row.redundancy_index,
                                UploadState::Uploaded,
                                Some(&receipt.message_id),
                            )
                            .await?;
                        if let Some(file_id) = row.file_id {
                            if !touched_files.contains(&file_id) {
                                touched_files.push(file_id);
                            }
                        }
                    }
                    self.inner
                        .store
                        .insert_article(&ArticleRecord {
                            message_id: receipt.message_id,
                            group: unit.group.clone(),
                            subject: unit.subject.clone(),
                            size: body.len() as u64,
                            lines: body.iter().filter(|&&b| b == b'\n').count() as u32,
                            server: receipt.server,
                            posted_at: now_epoch(),
                        })
                        .await?;

                    item.transferred += unit.bytes;
                    item.progress = if item.total_size > 0 {
                        item.transferred as f64 / item.total_size as f64
                    } else {
                        1.0
                    };
                    self.inner.store.update_queue_item(item).await?;
                    if let Some(session) = &item.session_id {
                        if let Some(mut progress) = self.inner.sessions.get_mut(session) {
                            progress.bytes_transferred += unit.bytes;
                        }
                    }
                }
                Err(e) => {
                    for row in &unit.rows {
                        self.inner
                            .store
                            .set_segment_state(
                                &row.segment_id,
                                row.redundancy_index,
                                UploadState::Failed,
                                None,
                            )
                            .await?;
                    }
                    return Err(e.into());
                }
            }
        }

        for file_id in touched_files {
            self.inner.store.refresh_uploaded_segments(&file_id).await?;
        }
        Ok(ItemOutcome::Completed)
    }

    /// Expand a queue item into posting units, batched so articles for
    /// the same group post together.
    async fn expand(&self, item: &QueueItem) -> Result<Vec<PostUnit>> {
        let store = &self.inner.store;
        let rows: Vec<SegmentRecord> = match item.entity_kind {
            EntityKind::Folder => {
                store
                    .pending_segments_for_folder(&item.entity_id)
                    .await?
            }
            EntityKind::File => {
                let file_id = FileId::from_hex(&item.entity_id)
                    .ok_or_else(|| UploaderError::BadEntityId(item.entity_id.clone()))?;
                store
                    .segments_for_file(&file_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.upload_state != UploadState::Uploaded)
                    .collect()
            }
            EntityKind::Segment => {
                let segment_id = SegmentId::from_hex(&item.entity_id)
                    .ok_or_else(|| UploaderError::BadEntityId(item.entity_id.clone()))?;
                store
                    .segments_by_id(&segment_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.upload_state != UploadState::Uploaded)
                    .collect()
            }
            EntityKind::PackedSegment => {
                let packed_id = PackedSegmentId::from_hex(&item.entity_id)
                    .ok_or_else(|| UploaderError::BadEntityId(item.entity_id.clone()))?;
                store
                    .segments_in_packed(&packed_id)
                    .await?
                    .into_iter()
                    .filter(|r| r.upload_state != UploadState::Uploaded)
                    .collect()
            }
        };

        // Resolve file paths once.
        let mut paths: HashMap<FileId, PathBuf> = HashMap::new();
        let mut folders: HashMap<FolderId, Folder> = HashMap::new();
        for row in &rows {
            let Some(file_id) = row.file_id else { continue };
            if paths.contains_key(&file_id) {
                continue;
            }
            let file = store.file(&file_id).await?;
            let folder = match folders.get(&file.folder_id) {
                Some(folder) => folder.clone(),
                None => {
                    let folder = store.folder(&file.folder_id).await?;
                    folders.insert(file.folder_id, folder.clone());
                    folder
                }
            };
            paths.insert(file_id, PathBuf::from(&folder.path).join(&file.path));
        }

        let mut units: Vec<PostUnit> = Vec::new();
        let mut packed_groups: HashMap<(PackedSegmentId, u8), Vec<SegmentRecord>> = HashMap::new();
        for row in rows {
            match row.packed_segment_id {
                Some(packed_id) => packed_groups
                    .entry((packed_id, row.redundancy_index))
                    .or_default()
                    .push(row),
                None => {
                    let source = row
                        .file_id
                        .and_then(|id| paths.get(&id).cloned())
                        .ok_or_else(|| UploaderError::BadEntityId(item.entity_id.clone()))?;
                    units.push(PostUnit {
                        subject: row.subject.clone(),
                        group: row.group.clone(),
                        redundancy_index: row.redundancy_index,
                        bytes: row.size,
                        payload: Payload::File {
                            record: row.clone(),
                            source,
                        },
                        rows: vec![row],
                    });
                }
            }
        }

        for ((packed_id, redundancy_index), members) in packed_groups {
            let packed = store.packed_segment(&packed_id).await?;
            let sources: Vec<(SegmentRecord, PathBuf)> = members
                .iter()
                .filter_map(|row| {
                    row.file_id
                        .and_then(|id| paths.get(&id).cloned())
                        .map(|path| (row.clone(), path))
                })
                .collect();
            let first = members.first().expect("packed group is non-empty");
            units.push(PostUnit {
                subject: first.subject.clone(),
                group: first.group.clone(),
                redundancy_index,
                bytes: packed.total_size,
                payload: Payload::Packed {
                    members: sources,
                    total_size: packed.total_size,
                },
                rows: members,
            });
        }

        // Batch by target group, stable within a group.
        units.sort_by(|a, b| {
            a.group
                .cmp(&b.group)
                .then(a.redundancy_index.cmp(&b.redundancy_index))
        });
        Ok(units)
    }

    /// Build the segmenter for the folder owning these rows.
    async fn segmenter_for_rows(&self, rows: &[SegmentRecord]) -> Result<Segmenter> {
        let file_id = rows
            .iter()
            .find_map(|r| r.file_id)
            .ok_or_else(|| UploaderError::BadEntityId("segment without file".into()))?;
        let file = self.inner.store.file(&file_id).await?;
        let folder = self.inner.store.folder(&file.folder_id).await?;
        self.segmenter_for(&folder)
    }

    fn segmenter_for(&self, folder: &Folder) -> Result<Segmenter> {
        let content_key = folder
            .content_key
            .as_deref()
            .ok_or(UploaderError::MissingKeys(folder.folder_id))?;
        let signing_key = folder
            .signing_key
            .as_deref()
            .ok_or(UploaderError::MissingKeys(folder.folder_id))?;
        let key = MasterKey::from_base64(content_key)?;
        let subject_key = hex::decode(signing_key)
            .map_err(|_| UploaderError::MissingKeys(folder.folder_id))?;
        let mut config = self.inner.config.segmenter;
        config.redundancy_level = folder.redundancy_level.max(1);
        Ok(Segmenter::new(
            config,
            &key,
            subject_key,
            folder.target_group.clone(),
        )?)
    }
}

enum ItemOutcome {
    Completed,
    Cancelled,
}
