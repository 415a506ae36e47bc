//! Article rows: the local projection of posted messages. Insert-only.

use common::ArticleRecord;
use sqlx::any::AnyRow;

use crate::error::Result;
use crate::{col_i64, col_text, Arg, Store};

fn article_from_row(row: &AnyRow) -> Result<ArticleRecord> {
    Ok(ArticleRecord {
        message_id: col_text(row, "message_id")?,
        group: col_text(row, "target_group")?,
        subject: col_text(row, "subject")?,
        size: col_i64(row, "size")? as u64,
        lines: col_i64(row, "lines")? as u32,
        server: col_text(row, "server")?,
        posted_at: col_i64(row, "posted_at")?,
    })
}

impl Store {
    pub async fn insert_article(&self, article: &ArticleRecord) -> Result<()> {
        self.execute(
            "INSERT INTO articles (message_id, target_group, subject, size, lines, server, posted_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) \
             ON CONFLICT (message_id) DO NOTHING",
            &[
                Arg::from(article.message_id.clone()),
                Arg::from(article.group.clone()),
                Arg::from(article.subject.clone()),
                Arg::from(article.size),
                Arg::from(article.lines),
                Arg::from(article.server.clone()),
                Arg::from(article.posted_at),
            ],
        )
        .await?;
        Ok(())
    }

    /// May be absent when a segment was fetched from cache rather than
    /// posted by this process.
    pub async fn article(&self, message_id: &str) -> Result<Option<ArticleRecord>> {
        let row = self
            .fetch_optional(
                "SELECT message_id, target_group, subject, size, lines, server, posted_at \
                 FROM articles WHERE message_id = $1",
                &[Arg::from(message_id)],
            )
            .await?;
        match row {
            Some(row) => Ok(Some(article_from_row(&row)?)),
            None => Ok(None),
        }
    }
}
