//! File rows: versioned records with change kinds, bulk batches and a
//! bounded-memory scan cursor for folders with millions of entries.

use std::collections::HashMap;

use common::{ChangeKind, FileId, FileRecord, FolderId};
use sqlx::any::AnyRow;

use crate::error::{Result, StoreError};
use crate::{col_i64, col_opt_i64, col_opt_text, col_text, insert_chunk_rows, Arg, Store};

const FILE_COLUMNS: &str = "file_id, folder_id, path, size, hash, mime_type, version, \
     previous_version, change_kind, segment_size, total_segments, uploaded_segments, \
     encryption_key_ref, modified_at, indexed_at";
const FILE_COLUMN_COUNT: usize = 15;

fn file_from_row(row: &AnyRow) -> Result<FileRecord> {
    let file_id = col_text(row, "file_id")?;
    let folder_id = col_text(row, "folder_id")?;
    let change_kind = col_text(row, "change_kind")?;
    Ok(FileRecord {
        file_id: FileId::from_hex(&file_id).ok_or(StoreError::CorruptRow {
            entity: "files",
            reason: format!("bad file_id {file_id}"),
        })?,
        folder_id: FolderId::from_hex(&folder_id).ok_or(StoreError::CorruptRow {
            entity: "files",
            reason: format!("bad folder_id {folder_id}"),
        })?,
        path: col_text(row, "path")?,
        size: col_i64(row, "size")? as u64,
        hash: col_text(row, "hash")?,
        mime_type: col_opt_text(row, "mime_type")?,
        version: col_i64(row, "version")? as u32,
        previous_version: col_opt_i64(row, "previous_version")?.map(|v| v as u32),
        change_kind: ChangeKind::parse(&change_kind).ok_or(StoreError::CorruptRow {
            entity: "files",
            reason: format!("bad change_kind {change_kind}"),
        })?,
        segment_size: col_i64(row, "segment_size")? as u32,
        total_segments: col_i64(row, "total_segments")? as u32,
        uploaded_segments: col_i64(row, "uploaded_segments")? as u32,
        encryption_key_ref: col_opt_text(row, "encryption_key_ref")?,
        modified_at: col_i64(row, "modified_at")?,
        indexed_at: col_i64(row, "indexed_at")?,
    })
}

fn push_file_args(args: &mut Vec<Arg>, record: &FileRecord) {
    args.push(Arg::from(record.file_id.to_string()));
    args.push(Arg::from(record.folder_id.to_string()));
    args.push(Arg::from(record.path.clone()));
    args.push(Arg::from(record.size));
    args.push(Arg::from(record.hash.clone()));
    args.push(Arg::from(record.mime_type.clone()));
    args.push(Arg::from(record.version));
    args.push(Arg::OptInt(record.previous_version.map(|v| v as i64)));
    args.push(Arg::from(record.change_kind.as_str()));
    args.push(Arg::from(record.segment_size));
    args.push(Arg::from(record.total_segments));
    args.push(Arg::from(record.uploaded_segments));
    args.push(Arg::from(record.encryption_key_ref.clone()));
    args.push(Arg::from(record.modified_at));
    args.push(Arg::from(record.indexed_at));
}

fn values_tuple(row: usize, columns: usize) -> String {
    let base = row * columns;
    let placeholders: Vec<String> = (1..=columns).map(|c| format!("${}", base + c)).collect();
    format!("({})", placeholders.join(","))
}

/// Pull-based batch cursor over a folder's file rows, keyset-paginated so
/// memory stays bounded regardless of table size.
pub struct FileScan {
    store: Store,
    folder_id: String,
    last_rowid: i64,
    batch_size: usize,
}

impl FileScan {
    /// Next batch, empty when the scan is exhausted.
    pub async fn next_batch(&mut self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT id, {FILE_COLUMNS} FROM files \
             WHERE folder_id = $1 AND id > $2 ORDER BY id LIMIT {}",
            self.batch_size
        );
        let rows = self
            .store
            .fetch_all(
                &sql,
                &[Arg::from(self.folder_id.clone()), Arg::from(self.last_rowid)],
            )
            .await?;
        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            self.last_rowid = col_i64(row, "id")?;
            batch.push(file_from_row(row)?);
        }
        Ok(batch)
    }
}

impl Store {
    /// Bulk insert in one transaction, chunked under the bind ceiling.
    pub async fn insert_files_bulk(&self, records: &[FileRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let chunk_rows = insert_chunk_rows(FILE_COLUMN_COUNT);
        let mut tx = self.begin().await?;
        for chunk in records.chunks(chunk_rows) {
            let tuples: Vec<String> = (0..chunk.len())
                .map(|i| values_tuple(i, FILE_COLUMN_COUNT))
                .collect();
            let sql = format!(
                "INSERT INTO files ({FILE_COLUMNS}) VALUES {}",
                tuples.join(",")
            );
            let mut args = Vec::with_capacity(chunk.len() * FILE_COLUMN_COUNT);
            for record in chunk {
                push_file_args(&mut args, record);
            }
            tx.execute(&sql, &args).await?;
        }
        tx.commit().await
    }

    pub async fn file(&self, file_id: &FileId) -> Result<FileRecord> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE file_id = $1");
        let row = self
            .fetch_optional(&sql, &[Arg::from(file_id.to_string())])
            .await?
            .ok_or(StoreError::NotFound {
                entity: "file",
                key: file_id.to_string(),
            })?;
        file_from_row(&row)
    }

    /// Latest version per path, the indexer's prior-state lookup.
    pub async fn latest_file_versions(
        &self,
        folder_id: &FolderId,
    ) -> Result<HashMap<String, FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files f \
             WHERE folder_id = $1 AND version = \
               (SELECT MAX(version) FROM files WHERE folder_id = f.folder_id AND path = f.path)"
        );
        let rows = self
            .fetch_all(&sql, &[Arg::from(folder_id.to_string())])
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = file_from_row(row)?;
            map.insert(record.path.clone(), record);
        }
        Ok(map)
    }

    /// Latest live (non-deleted) version of every file in a folder.
    pub async fn live_files(&self, folder_id: &FolderId) -> Result<Vec<FileRecord>> {
        let all = self.latest_file_versions(folder_id).await?;
        let mut files: Vec<FileRecord> = all
            .into_values()
            .filter(|f| f.change_kind != ChangeKind::Deleted)
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Streaming scan with a caller-chosen batch size.
    pub fn scan_files(&self, folder_id: &FolderId, batch_size: usize) -> FileScan {
        FileScan {
            store: self.clone(),
            folder_id: folder_id.to_string(),
            last_rowid: 0,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn set_file_segment_totals(
        &self,
        file_id: &FileId,
        total_segments: u32,
        segment_size: u32,
    ) -> Result<()> {
        self.execute(
            "UPDATE files SET total_segments = $1, segment_size = $2 WHERE file_id = $3",
            &[
                Arg::from(total_segments),
                Arg::from(segment_size),
                Arg::from(file_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Recount the file's fully-uploaded logical segments (every
    /// redundancy copy posted) and store the result.
    pub async fn refresh_uploaded_segments(&self, file_id: &FileId) -> Result<u32> {
        let count = self
            .fetch_scalar_i64(
                "SELECT COUNT(*) FROM ( \
                   SELECT segment_id FROM segments WHERE file_id = $1 \
                   GROUP BY segment_id \
                   HAVING SUM(CASE WHEN upload_state = 'uploaded' THEN 0 ELSE 1 END) = 0 \
                 ) done",
                &[Arg::from(file_id.to_string())],
            )
            .await?;
        self.execute(
            "UPDATE files SET uploaded_segments = $1 WHERE file_id = $2",
            &[Arg::from(count), Arg::from(file_id.to_string())],
        )
        .await?;
        Ok(count as u32)
    }

    /// Flip existing rows back to `unchanged` on re-index; the rows keep
    /// their version, only the change kind and index time move.
    pub async fn mark_files_unchanged(&self, file_ids: &[FileId], indexed_at: i64) -> Result<()> {
        if file_ids.is_empty() {
            return Ok(());
        }
        for chunk in file_ids.chunks(200) {
            let placeholders: Vec<String> =
                (0..chunk.len()).map(|i| format!("${}", i + 3)).collect();
            let sql = format!(
                "UPDATE files SET change_kind = $1, indexed_at = $2 WHERE file_id IN ({})",
                placeholders.join(",")
            );
            let mut args = vec![Arg::from("unchanged"), Arg::from(indexed_at)];
            args.extend(chunk.iter().map(|id| Arg::from(id.to_string())));
            self.execute(&sql, &args).await?;
        }
        Ok(())
    }

    /// Change-kind tally over the latest version of every path.
    pub async fn change_counts(&self, folder_id: &FolderId) -> Result<HashMap<ChangeKind, u64>> {
        let latest = self.latest_file_versions(folder_id).await?;
        let mut counts = HashMap::new();
        for record in latest.values() {
            *counts.entry(record.change_kind).or_insert(0u64) += 1;
        }
        Ok(counts)
    }
}
