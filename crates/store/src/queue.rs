//! Upload-queue persistence and per-file download progress.
//!
//! The in-memory queue mirrors these rows; on restart the uploader
//! reloads everything non-terminal and resumes cleanly.

use common::{EntityKind, FileId, QueueId, QueueItem, QueueState, ShareId};
use sqlx::any::AnyRow;

use crate::error::{Result, StoreError};
use crate::{col_f64, col_i64, col_opt_i64, col_opt_text, col_text, Arg, Store};

const QUEUE_COLUMNS: &str = "queue_id, entity_id, entity_kind, priority, state, progress, \
     total_size, transferred, retry_count, max_retries, session_id, worker_id, error, \
     queued_at, started_at, completed_at";

fn item_from_row(row: &AnyRow) -> Result<QueueItem> {
    let queue_id = col_text(row, "queue_id")?;
    let kind = col_text(row, "entity_kind")?;
    let state = col_text(row, "state")?;
    Ok(QueueItem {
        queue_id: QueueId::from_hex(&queue_id).ok_or(StoreError::CorruptRow {
            entity: "upload_queue",
            reason: format!("bad queue_id {queue_id}"),
        })?,
        entity_id: col_text(row, "entity_id")?,
        entity_kind: EntityKind::parse(&kind).ok_or(StoreError::CorruptRow {
            entity: "upload_queue",
            reason: format!("bad entity_kind {kind}"),
        })?,
        priority: col_i64(row, "priority")? as u8,
        state: QueueState::parse(&state).ok_or(StoreError::CorruptRow {
            entity: "upload_queue",
            reason: format!("bad state {state}"),
        })?,
        progress: col_f64(row, "progress")?,
        total_size: col_i64(row, "total_size")? as u64,
        transferred: col_i64(row, "transferred")? as u64,
        retry_count: col_i64(row, "retry_count")? as u32,
        max_retries: col_i64(row, "max_retries")? as u32,
        session_id: col_opt_text(row, "session_id")?,
        worker_id: col_opt_text(row, "worker_id")?,
        error: col_opt_text(row, "error")?,
        queued_at: col_i64(row, "queued_at")?,
        started_at: col_opt_i64(row, "started_at")?,
        completed_at: col_opt_i64(row, "completed_at")?,
    })
}

impl Store {
    pub async fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        let sql = format!(
            "INSERT INTO upload_queue ({QUEUE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)"
        );
        self.execute(
            &sql,
            &[
                Arg::from(item.queue_id.to_string()),
                Arg::from(item.entity_id.clone()),
                Arg::from(item.entity_kind.as_str()),
                Arg::from(item.priority as i64),
                Arg::from(item.state.as_str()),
                Arg::Real(item.progress),
                Arg::from(item.total_size),
                Arg::from(item.transferred),
                Arg::from(item.retry_count),
                Arg::from(item.max_retries),
                Arg::from(item.session_id.clone()),
                Arg::from(item.worker_id.clone()),
                Arg::from(item.error.clone()),
                Arg::from(item.queued_at),
                Arg::from(item.started_at),
                Arg::from(item.completed_at),
            ],
        )
        .await?;
        Ok(())
    }

    /// Persist a state transition. Terminal rows are left untouched, so a
    /// completed or cancelled item can never regress.
    pub async fn update_queue_item(&self, item: &QueueItem) -> Result<()> {
        self.execute(
            "UPDATE upload_queue SET priority = $1, state = $2, progress = $3, \
                transferred = $4, retry_count = $5, worker_id = $6, error = $7, \
                started_at = $8, completed_at = $9 \
             WHERE queue_id = $10 AND state NOT IN ('completed','cancelled')",
            &[
                Arg::from(item.priority as i64),
                Arg::from(item.state.as_str()),
                Arg::Real(item.progress),
                Arg::from(item.transferred),
                Arg::from(item.retry_count),
                Arg::from(item.worker_id.clone()),
                Arg::from(item.error.clone()),
                Arg::from(item.started_at),
                Arg::from(item.completed_at),
                Arg::from(item.queue_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Everything that survives a restart: queued, retrying, paused and
    /// running items (running ones are re-leased from scratch).
    pub async fn load_resumable_queue(&self) -> Result<Vec<QueueItem>> {
        let sql = format!(
            "SELECT {QUEUE_COLUMNS} FROM upload_queue \
             WHERE state IN ('queued','retrying','paused','running') \
             ORDER BY priority, queued_at"
        );
        let rows = self.fetch_all(&sql, &[]).await?;
        rows.iter().map(item_from_row).collect()
    }

    pub async fn queue_item(&self, queue_id: &QueueId) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {QUEUE_COLUMNS} FROM upload_queue WHERE queue_id = $1");
        match self
            .fetch_optional(&sql, &[Arg::from(queue_id.to_string())])
            .await?
        {
            Some(row) => Ok(Some(item_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Verified segment indexes already on disk for (share, file), the
    /// retriever's resume state.
    pub async fn download_progress(
        &self,
        share_id: &ShareId,
        file_id: &FileId,
    ) -> Result<Vec<u32>> {
        let row = self
            .fetch_optional(
                "SELECT verified_segments FROM download_progress \
                 WHERE share_id = $1 AND file_id = $2",
                &[
                    Arg::from(share_id.to_string()),
                    Arg::from(file_id.to_string()),
                ],
            )
            .await?;
        match row {
            Some(row) => {
                let raw = col_text(&row, "verified_segments")?;
                Ok(serde_json::from_str(&raw)?)
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn set_download_progress(
        &self,
        share_id: &ShareId,
        file_id: &FileId,
        verified_segments: &[u32],
    ) -> Result<()> {
        self.execute(
            "INSERT INTO download_progress (share_id, file_id, verified_segments, updated_at) \
             VALUES ($1,$2,$3,$4) \
             ON CONFLICT (share_id, file_id) DO UPDATE SET \
                verified_segments = EXCLUDED.verified_segments, \
                updated_at = EXCLUDED.updated_at",
            &[
                Arg::from(share_id.to_string()),
                Arg::from(file_id.to_string()),
                Arg::from(serde_json::to_string(verified_segments)?),
                Arg::from(common::now_epoch()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn clear_download_progress(&self, share_id: &ShareId) -> Result<()> {
        self.execute(
            "DELETE FROM download_progress WHERE share_id = $1",
            &[Arg::from(share_id.to_string())],
        )
        .await?;
        Ok(())
    }
}
