//! Share and commitment rows.

use std::collections::BTreeMap;

use common::{
    now_epoch, AccessTier, Commitment, CommitmentId, FolderId, IndexArticleRef, Share, ShareId,
    ShareKind,
};
use sqlx::any::AnyRow;

use crate::error::{Result, StoreError};
use crate::{col_i64, col_opt_i64, col_opt_text, col_text, Arg, Store};

const SHARE_COLUMNS: &str = "share_id, folder_id, folder_version, kind, tier, owner_id, \
     master_key, passphrase_hash, passphrase_salt, key_salt, wrapped_keys, allowed_users, \
     denied_users, index_refs, expires_at, revoked, created_at";

fn share_from_row(row: &AnyRow) -> Result<Share> {
    let share_id = col_text(row, "share_id")?;
    let folder_id = col_text(row, "folder_id")?;
    let kind = col_text(row, "kind")?;
    let tier = col_text(row, "tier")?;
    let wrapped_keys: BTreeMap<String, String> =
        serde_json::from_str(&col_text(row, "wrapped_keys")?)?;
    let allowed_users: Vec<String> = serde_json::from_str(&col_text(row, "allowed_users")?)?;
    let denied_users: Vec<String> = serde_json::from_str(&col_text(row, "denied_users")?)?;
    let index_refs: Vec<IndexArticleRef> = serde_json::from_str(&col_text(row, "index_refs")?)?;
    Ok(Share {
        share_id: ShareId::parse(&share_id).ok_or(StoreError::CorruptRow {
            entity: "shares",
            reason: format!("bad share_id {share_id}"),
        })?,
        folder_id: FolderId::from_hex(&folder_id).ok_or(StoreError::CorruptRow {
            entity: "shares",
            reason: format!("bad folder_id {folder_id}"),
        })?,
        folder_version: col_i64(row, "folder_version")? as u32,
        kind: ShareKind::parse(&kind).ok_or(StoreError::CorruptRow {
            entity: "shares",
            reason: format!("bad kind {kind}"),
        })?,
        tier: AccessTier::parse(&tier).ok_or(StoreError::CorruptRow {
            entity: "shares",
            reason: format!("bad tier {tier}"),
        })?,
        owner_id: col_text(row, "owner_id")?,
        master_key: col_opt_text(row, "master_key")?,
        passphrase_hash: col_opt_text(row, "passphrase_hash")?,
        passphrase_salt: col_opt_text(row, "passphrase_salt")?,
        key_salt: col_opt_text(row, "key_salt")?,
        wrapped_keys,
        allowed_users,
        denied_users,
        index_refs,
        expires_at: col_opt_i64(row, "expires_at")?,
        revoked: col_i64(row, "revoked")? != 0,
        created_at: col_i64(row, "created_at")?,
    })
}

impl Store {
    pub async fn insert_share(&self, share: &Share) -> Result<()> {
        let sql = format!(
            "INSERT INTO shares ({SHARE_COLUMNS}) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)"
        );
        self.execute(
            &sql,
            &[
                Arg::from(share.share_id.to_string()),
                Arg::from(share.folder_id.to_string()),
                Arg::from(share.folder_version),
                Arg::from(share.kind.as_str()),
                Arg::from(share.tier.as_str()),
                Arg::from(share.owner_id.clone()),
                Arg::from(share.master_key.clone()),
                Arg::from(share.passphrase_hash.clone()),
                Arg::from(share.passphrase_salt.clone()),
                Arg::from(share.key_salt.clone()),
                Arg::from(serde_json::to_string(&share.wrapped_keys)?),
                Arg::from(serde_json::to_string(&share.allowed_users)?),
                Arg::from(serde_json::to_string(&share.denied_users)?),
                Arg::from(serde_json::to_string(&share.index_refs)?),
                Arg::from(share.expires_at),
                Arg::from(share.revoked as i64),
                Arg::from(share.created_at),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn share(&self, share_id: &ShareId) -> Result<Option<Share>> {
        let sql = format!("SELECT {SHARE_COLUMNS} FROM shares WHERE share_id = $1");
        match self
            .fetch_optional(&sql, &[Arg::from(share_id.to_string())])
            .await?
        {
            Some(row) => Ok(Some(share_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_shares(&self) -> Result<Vec<Share>> {
        let sql = format!("SELECT {SHARE_COLUMNS} FROM shares ORDER BY created_at");
        let rows = self.fetch_all(&sql, &[]).await?;
        rows.iter().map(share_from_row).collect()
    }

    pub async fn update_share_wrapped_keys(
        &self,
        share_id: &ShareId,
        wrapped_keys: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.execute(
            "UPDATE shares SET wrapped_keys = $1 WHERE share_id = $2",
            &[
                Arg::from(serde_json::to_string(wrapped_keys)?),
                Arg::from(share_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn set_share_index_refs(
        &self,
        share_id: &ShareId,
        refs: &[IndexArticleRef],
    ) -> Result<()> {
        self.execute(
            "UPDATE shares SET index_refs = $1 WHERE share_id = $2",
            &[
                Arg::from(serde_json::to_string(refs)?),
                Arg::from(share_id.to_string()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn revoke_share(&self, share_id: &ShareId) -> Result<()> {
        let affected = self
            .execute(
                "UPDATE shares SET revoked = 1 WHERE share_id = $1",
                &[Arg::from(share_id.to_string())],
            )
            .await?;
        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "share",
                key: share_id.to_string(),
            });
        }
        Ok(())
    }

    /// Insert or re-activate a commitment; at most one live row per
    /// (share, user).
    pub async fn upsert_commitment(&self, commitment: &Commitment) -> Result<()> {
        self.execute(
            "INSERT INTO commitments (commitment_id, share_id, user_id, commitment_hash, \
                wrapped_key, permissions, granted_at, revoked, revoked_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) \
             ON CONFLICT (share_id, user_id) DO UPDATE SET \
                commitment_hash = EXCLUDED.commitment_hash, \
                wrapped_key = EXCLUDED.wrapped_key, \
                permissions = EXCLUDED.permissions, \
                granted_at = EXCLUDED.granted_at, \
                revoked = 0, revoked_at = NULL",
            &[
                Arg::from(commitment.commitment_id.to_string()),
                Arg::from(commitment.share_id.to_string()),
                Arg::from(commitment.user_id.clone()),
                Arg::from(commitment.commitment_hash.clone()),
                Arg::from(commitment.wrapped_key.clone()),
                Arg::from(commitment.permissions.clone()),
                Arg::from(commitment.granted_at),
                Arg::from(commitment.revoked as i64),
                Arg::from(commitment.revoked_at),
            ],
        )
        .await?;
        Ok(())
    }

    /// Live (non-revoked) commitment, if any.
    pub async fn live_commitment(
        &self,
        share_id: &ShareId,
        user_id: &str,
    ) -> Result<Option<Commitment>> {
        let row = self
            .fetch_optional(
                "SELECT commitment_id, share_id, user_id, commitment_hash, wrapped_key, \
                    permissions, granted_at, revoked, revoked_at \
                 FROM commitments WHERE share_id = $1 AND user_id = $2 AND revoked = 0",
                &[
                    Arg::from(share_id.to_string()),
                    Arg::from(user_id),
                ],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(commitment_from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn revoke_commitment(&self, share_id: &ShareId, user_id: &str) -> Result<()> {
        self.execute(
            "UPDATE commitments SET revoked = 1, revoked_at = $1 \
             WHERE share_id = $2 AND user_id = $3",
            &[
                Arg::from(now_epoch()),
                Arg::from(share_id.to_string()),
                Arg::from(user_id),
            ],
        )
        .await?;
        Ok(())
    }
}

fn commitment_from_row(row: &AnyRow) -> Result<Commitment> {
    let commitment_id = col_text(row, "commitment_id")?;
    let share_id = col_text(row, "share_id")?;
    Ok(Commitment {
        commitment_id: CommitmentId::from_hex(&commitment_id).ok_or(StoreError::CorruptRow {
            entity: "commitments",
            reason: format!("bad commitment_id {commitment_id}"),
        })?,
        share_id: ShareId::parse(&share_id).ok_or(StoreError::CorruptRow {
            entity: "commitments",
            reason: format!("bad share_id {share_id}"),
        })?,
        user_id: col_text(row, "user_id")?,
        commitment_hash: col_text(row, "commitment_hash")?,
        wrapped_key: col_text(row, "wrapped_key")?,
        permissions: col_text(row, "permissions")?,
        granted_at: col_i64(row, "granted_at")?,
        revoked: col_i64(row, "revoked")? != 0,
        revoked_at: col_opt_i64(row, "revoked_at")?,
    })
}
