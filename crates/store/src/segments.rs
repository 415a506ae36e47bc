//! Segment and packed-segment rows.

use common::{
    FileId, PackedSegmentId, PackedSegmentRecord, SegmentId, SegmentRecord, UploadState,
};
use sqlx::any::AnyRow;

use crate::error::{Result, StoreError};
use crate::{col_i64, col_opt_i64, col_opt_text, col_text, insert_chunk_rows, Arg, Store};

const SEGMENT_COLUMNS: &str = "segment_id, file_id, packed_segment_id, segment_index, \
     redundancy_index, size, compressed_size, hash, offset_start, offset_end, message_id, \
     subject, target_group, nonce, upload_state, attempts, packing_index";
const SEGMENT_COLUMN_COUNT: usize = 17;

fn segment_from_row(row: &AnyRow) -> Result<SegmentRecord> {
    let segment_id = col_text(row, "segment_id")?;
    let state = col_text(row, "upload_state")?;
    Ok(SegmentRecord {
        segment_id: SegmentId::from_hex(&segment_id).ok_or(StoreError::CorruptRow {
            entity: "segments",
            reason: format!("bad segment_id {segment_id}"),
        })?,
        file_id: col_opt_text(row, "file_id")?
            .and_then(|s| FileId::from_hex(&s)),
        packed_segment_id: col_opt_text(row, "packed_segment_id")?
            .and_then(|s| PackedSegmentId::from_hex(&s)),
        segment_index: col_i64(row, "segment_index")? as u32,
        redundancy_index: col_i64(row, "redundancy_index")? as u8,
        size: col_i64(row, "size")? as u64,
        compressed_size: col_opt_i64(row, "compressed_size")?.map(|v| v as u64),
        hash: col_text(row, "hash")?,
        offset_start: col_i64(row, "offset_start")? as u64,
        offset_end: col_i64(row, "offset_end")? as u64,
        message_id: col_opt_text(row, "message_id")?,
        subject: col_text(row, "subject")?,
        group: col_text(row, "target_group")?,
        nonce: col_text(row, "nonce")?,
        upload_state: UploadState::parse(&state).ok_or(StoreError::CorruptRow {
            entity: "segments",
            reason: format!("bad upload_state {state}"),
        })?,
        attempts: col_i64(row, "attempts")? as u32,
        packing_index: col_opt_i64(row, "packing_index")?.map(|v| v as u32),
    })
}

fn push_segment_args(args: &mut Vec<Arg>, record: &SegmentRecord) {
    args.push(Arg::from(record.segment_id.to_string()));
    args.push(Arg::OptText(record.file_id.map(|id| id.to_string())));
    args.push(Arg::OptText(
        record.packed_segment_id.map(|id| id.to_string()),
    ));
    args.push(Arg::from(record.segment_index));
    args.push(Arg::from(record.redundancy_index as i64));
    args.push(Arg::from(record.size));
    args.push(Arg::OptInt(record.compressed_size.map(|v| v as i64)));
    args.push(Arg::from(record.hash.clone()));
    args.push(Arg::from(record.offset_start));
    args.push(Arg::from(record.offset_end));
    args.push(Arg::from(record.message_id.clone()));
    args.push(Arg::from(record.subject.clone()));
    args.push(Arg::from(record.group.clone()));
    args.push(Arg::from(record.nonce.clone()));
    args.push(Arg::from(record.upload_state.as_str()));
    args.push(Arg::from(record.attempts));
    args.push(Arg::OptInt(record.packing_index.map(|v| v as i64)));
}

impl Store {
    pub async fn insert_segments_bulk(&self, records: &[SegmentRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let chunk_rows = insert_chunk_rows(SEGMENT_COLUMN_COUNT);
        let mut tx = self.begin().await?;
        for chunk in records.chunks(chunk_rows) {
            let tuples: Vec<String> = (0..chunk.len())
                .map(|i| {
                    let base = i * SEGMENT_COLUMN_COUNT;
                    let cols: Vec<String> =
                        (1..=SEGMENT_COLUMN_COUNT).map(|c| format!("${}", base + c)).collect();
                    format!("({})", cols.join(","))
                })
                .collect();
            let sql = format!(
                "INSERT INTO segments ({SEGMENT_COLUMNS}) VALUES {}",
                tuples.join(",")
            );
            let mut args = Vec::with_capacity(chunk.len() * SEGMENT_COLUMN_COUNT);
            for record in chunk {
                push_segment_args(&mut args, record);
            }
            tx.execute(&sql, &args).await?;
        }
        tx.commit().await
    }

    /// All redundancy copies of all segments of one file, in index order.
    pub async fn segments_for_file(&self, file_id: &FileId) -> Result<Vec<SegmentRecord>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE file_id = $1 \
             ORDER BY segment_index, redundancy_index"
        );
        let rows = self
            .fetch_all(&sql, &[Arg::from(file_id.to_string())])
            .await?;
        rows.iter().map(segment_from_row).collect()
    }

    pub async fn segments_in_packed(
        &self,
        packed_segment_id: &PackedSegmentId,
    ) -> Result<Vec<SegmentRecord>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE packed_segment_id = $1 \
             ORDER BY packing_index, redundancy_index"
        );
        let rows = self
            .fetch_all(&sql, &[Arg::from(packed_segment_id.to_string())])
            .await?;
        rows.iter().map(segment_from_row).collect()
    }

    /// Pending segment rows for a folder, the uploader's expansion query.
    pub async fn pending_segments_for_folder(
        &self,
        folder_id: &str,
    ) -> Result<Vec<SegmentRecord>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments \
             WHERE upload_state IN ('pending','failed','uploading') AND file_id IN \
               (SELECT file_id FROM files WHERE folder_id = $1) \
             ORDER BY segment_index, redundancy_index"
        );
        let rows = self.fetch_all(&sql, &[Arg::from(folder_id)]).await?;
        rows.iter().map(segment_from_row).collect()
    }

    /// Every redundancy copy of one logical segment.
    pub async fn segments_by_id(&self, segment_id: &SegmentId) -> Result<Vec<SegmentRecord>> {
        let sql = format!(
            "SELECT {SEGMENT_COLUMNS} FROM segments WHERE segment_id = $1 \
             ORDER BY redundancy_index"
        );
        let rows = self
            .fetch_all(&sql, &[Arg::from(segment_id.to_string())])
            .await?;
        rows.iter().map(segment_from_row).collect()
    }

    /// Advance one copy's upload state. Uploaded rows are never mutated
    /// again; the guard enforces that at the SQL layer.
    pub async fn set_segment_state(
        &self,
        segment_id: &SegmentId,
        redundancy_index: u8,
        state: UploadState,
        message_id: Option<&str>,
    ) -> Result<()> {
        self.execute(
            "UPDATE segments SET upload_state = $1, \
                message_id = COALESCE($2, message_id), \
                attempts = attempts + CASE WHEN $1 = 'uploading' THEN 1 ELSE 0 END \
             WHERE segment_id = $3 AND redundancy_index = $4 \
               AND upload_state NOT IN ('uploaded','cancelled')",
            &[
                Arg::from(state.as_str()),
                Arg::OptText(message_id.map(String::from)),
                Arg::from(segment_id.to_string()),
                Arg::from(redundancy_index as i64),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn insert_packed_segment(&self, record: &PackedSegmentRecord) -> Result<()> {
        self.execute(
            "INSERT INTO packed_segments \
               (packed_segment_id, total_size, file_count, compressed, message_id) \
             VALUES ($1,$2,$3,$4,$5)",
            &[
                Arg::from(record.packed_segment_id.to_string()),
                Arg::from(record.total_size),
                Arg::from(record.file_count),
                Arg::from(record.compressed as i64),
                Arg::from(record.message_id.clone()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn packed_segment(
        &self,
        packed_segment_id: &PackedSegmentId,
    ) -> Result<PackedSegmentRecord> {
        let row = self
            .fetch_optional(
                "SELECT packed_segment_id, total_size, file_count, compressed, message_id \
                 FROM packed_segments WHERE packed_segment_id = $1",
                &[Arg::from(packed_segment_id.to_string())],
            )
            .await?
            .ok_or(StoreError::NotFound {
                entity: "packed_segment",
                key: packed_segment_id.to_string(),
            })?;
        let id = col_text(&row, "packed_segment_id")?;
        Ok(PackedSegmentRecord {
            packed_segment_id: PackedSegmentId::from_hex(&id).ok_or(StoreError::CorruptRow {
                entity: "packed_segments",
                reason: format!("bad packed_segment_id {id}"),
            })?,
            total_size: col_i64(&row, "total_size")? as u64,
            file_count: col_i64(&row, "file_count")? as u32,
            compressed: col_i64(&row, "compressed")? != 0,
            message_id: col_opt_text(&row, "message_id")?,
        })
    }

    /// Distinct logical segment count for a folder (redundancy collapsed).
    pub async fn logical_segment_count(&self, folder_id: &str) -> Result<u64> {
        let count = self
            .fetch_scalar_i64(
                "SELECT COUNT(DISTINCT segment_id) FROM segments WHERE file_id IN \
                   (SELECT file_id FROM files WHERE folder_id = $1)",
                &[Arg::from(folder_id)],
            )
            .await?;
        Ok(count as u64)
    }
}
