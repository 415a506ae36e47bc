//! Folder rows.

use common::{now_epoch, Folder, FolderId, FolderState};
use sqlx::any::AnyRow;

use crate::error::{Result, StoreError};
use crate::{col_i64, col_opt_i64, col_opt_text, col_text, Arg, Store};

fn folder_from_row(row: &AnyRow) -> Result<Folder> {
    let folder_id = col_text(row, "folder_id")?;
    let state = col_text(row, "state")?;
    Ok(Folder {
        folder_id: FolderId::from_hex(&folder_id).ok_or(StoreError::CorruptRow {
            entity: "folders",
            reason: format!("bad folder_id {folder_id}"),
        })?,
        path: col_text(row, "path")?,
        name: col_text(row, "name")?,
        signing_key: col_opt_text(row, "signing_key")?,
        verifying_key: col_opt_text(row, "verifying_key")?,
        content_key: col_opt_text(row, "content_key")?,
        version: col_i64(row, "version")? as u32,
        file_count: col_i64(row, "file_count")? as u64,
        total_size: col_i64(row, "total_size")? as u64,
        segment_count: col_i64(row, "segment_count")? as u64,
        encryption_enabled: col_i64(row, "encryption_enabled")? != 0,
        redundancy_level: col_i64(row, "redundancy_level")? as u8,
        target_group: col_text(row, "target_group")?,
        state: FolderState::parse(&state).ok_or(StoreError::CorruptRow {
            entity: "folders",
            reason: format!("bad state {state}"),
        })?,
        created_at: col_i64(row, "created_at")?,
        last_indexed: col_opt_i64(row, "last_indexed")?,
    })
}

const FOLDER_COLUMNS: &str = "folder_id, path, name, signing_key, verifying_key, content_key, \
     version, file_count, total_size, segment_count, encryption_enabled, redundancy_level, \
     target_group, state, created_at, last_indexed";

impl Store {
    /// Register a folder. A second add with the same path is a duplicate.
    pub async fn insert_folder(&self, folder: &Folder) -> Result<()> {
        if self.folder_by_path(&folder.path).await?.is_some() {
            return Err(StoreError::Duplicate {
                entity: "folder",
                key: folder.path.clone(),
            });
        }
        let sql = format!(
            "INSERT INTO folders ({FOLDER_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)"
        );
        self.execute(
            &sql,
            &[
                Arg::from(folder.folder_id.to_string()),
                Arg::from(folder.path.clone()),
                Arg::from(folder.name.clone()),
                Arg::from(folder.signing_key.clone()),
                Arg::from(folder.verifying_key.clone()),
                Arg::from(folder.content_key.clone()),
                Arg::from(folder.version),
                Arg::from(folder.file_count),
                Arg::from(folder.total_size),
                Arg::from(folder.segment_count),
                Arg::from(folder.encryption_enabled as i64),
                Arg::from(folder.redundancy_level as i64),
                Arg::from(folder.target_group.clone()),
                Arg::from(folder.state.as_str()),
                Arg::from(folder.created_at),
                Arg::from(folder.last_indexed),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn folder(&self, folder_id: &FolderId) -> Result<Folder> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE folder_id = $1");
        let row = self
            .fetch_optional(&sql, &[Arg::from(folder_id.to_string())])
            .await?
            .ok_or(StoreError::NotFound {
                entity: "folder",
                key: folder_id.to_string(),
            })?;
        folder_from_row(&row)
    }

    pub async fn folder_by_path(&self, path: &str) -> Result<Option<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders WHERE path = $1");
        match self.fetch_optional(&sql, &[Arg::from(path)]).await? {
            Some(row) => Ok(Some(folder_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let sql = format!("SELECT {FOLDER_COLUMNS} FROM folders ORDER BY created_at");
        let rows = self.fetch_all(&sql, &[]).await?;
        rows.iter().map(folder_from_row).collect()
    }

    pub async fn set_folder_state(&self, folder_id: &FolderId, state: FolderState) -> Result<()> {
        let affected = self
            .execute(
                "UPDATE folders SET state = $1 WHERE folder_id = $2",
                &[Arg::from(state.as_str()), Arg::from(folder_id.to_string())],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "folder",
                key: folder_id.to_string(),
            });
        }
        Ok(())
    }

    /// Aggregate statistics maintained after index and segment passes.
    pub async fn update_folder_stats(
        &self,
        folder_id: &FolderId,
        file_count: u64,
        total_size: u64,
        segment_count: u64,
    ) -> Result<()> {
        self.execute(
            "UPDATE folders SET file_count = $1, total_size = $2, segment_count = $3, \
             last_indexed = $4 WHERE folder_id = $5",
            &[
                Arg::from(file_count),
                Arg::from(total_size),
                Arg::from(segment_count),
                Arg::from(now_epoch()),
                Arg::from(folder_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    /// Monotonic version bump on re-index; returns the new version.
    pub async fn bump_folder_version(&self, folder_id: &FolderId) -> Result<u32> {
        self.execute(
            "UPDATE folders SET version = version + 1 WHERE folder_id = $1",
            &[Arg::from(folder_id.to_string())],
        )
        .await?;
        let version = self
            .fetch_scalar_i64(
                "SELECT version FROM folders WHERE folder_id = $1",
                &[Arg::from(folder_id.to_string())],
            )
            .await?;
        Ok(version as u32)
    }

    /// Explicit removal cascades to files, segments, shares, commitments
    /// and queue items.
    pub async fn remove_folder(&self, folder_id: &FolderId) -> Result<()> {
        let id = folder_id.to_string();
        let mut tx = self.begin().await?;
        tx.execute(
            "DELETE FROM segments WHERE file_id IN (SELECT file_id FROM files WHERE folder_id = $1)",
            &[Arg::from(id.clone())],
        )
        .await?;
        tx.execute(
            "DELETE FROM commitments WHERE share_id IN (SELECT share_id FROM shares WHERE folder_id = $1)",
            &[Arg::from(id.clone())],
        )
        .await?;
        tx.execute(
            "DELETE FROM shares WHERE folder_id = $1",
            &[Arg::from(id.clone())],
        )
        .await?;
        tx.execute(
            "DELETE FROM files WHERE folder_id = $1",
            &[Arg::from(id.clone())],
        )
        .await?;
        let affected = tx
            .execute(
                "DELETE FROM folders WHERE folder_id = $1",
                &[Arg::from(id.clone())],
            )
            .await?;
        tx.commit().await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "folder",
                key: id,
            });
        }
        Ok(())
    }
}
