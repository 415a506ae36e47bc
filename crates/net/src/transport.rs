//! The posting/fetch seam between the pipeline and the article network.
//!
//! Production uses [`crate::pool::NntpPool`]; tests use the in-memory
//! transport below, which supports fault injection for redundancy and
//! resume scenarios.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{NetError, Result};
use crate::nntp::ServerCapabilities;

#[derive(Debug, Clone)]
pub struct FetchedArticle {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Which server satisfied the fetch.
    pub server: String,
}

#[derive(Debug, Clone)]
pub struct PostReceipt {
    /// The message id the article is retrievable under.
    pub message_id: String,
    /// Which server accepted the post.
    pub server: String,
}

#[async_trait]
pub trait ArticleTransport: Send + Sync {
    /// Post a body under (group, subject, message_id).
    async fn post_article(
        &self,
        group: &str,
        subject: &str,
        message_id: &str,
        body: &[u8],
    ) -> Result<PostReceipt>;

    async fn fetch_article(
        &self,
        message_id: &str,
        prefer_server: Option<&str>,
    ) -> Result<FetchedArticle>;

    async fn capabilities(&self) -> Result<ServerCapabilities>;
}

#[derive(Debug, Clone)]
struct StoredArticle {
    group: String,
    subject: String,
    body: Vec<u8>,
}

/// In-memory article store standing in for a news server.
#[derive(Default)]
pub struct MemoryTransport {
    articles: DashMap<String, StoredArticle>,
    /// Message ids that fail fetches until this many attempts burn off.
    fetch_failures: DashMap<String, u32>,
    /// Fail the next N posts with a transient error.
    post_failures: Mutex<u32>,
    posts: Mutex<Vec<String>>,
    fetches: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn article_count(&self) -> usize {
        self.articles.len()
    }

    pub fn posted_message_ids(&self) -> Vec<String> {
        self.posts.lock().clone()
    }

    /// Every fetch attempt seen, in order; lets tests assert a resumed
    /// session only asked for what it was missing.
    pub fn fetch_log(&self) -> Vec<String> {
        self.fetches.lock().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.articles
            .iter()
            .map(|entry| entry.value().subject.clone())
            .collect()
    }

    /// Simulate expiry: the article is gone from every server.
    pub fn drop_article(&self, message_id: &str) {
        self.articles.remove(message_id);
    }

    /// Corrupt a stored body so decode fails downstream.
    pub fn poison_article(&self, message_id: &str) {
        if let Some(mut entry) = self.articles.get_mut(message_id) {
            if let Some(byte) = entry.body.last_mut() {
                *byte = byte.wrapping_add(1);
            }
            let new_len = entry.body.len().saturating_sub(8);
            entry.body.truncate(new_len);
        }
    }

    /// The next `n` fetches of `message_id` fail transiently.
    pub fn fail_fetches(&self, message_id: &str, n: u32) {
        self.fetch_failures.insert(message_id.to_string(), n);
    }

    /// The next `n` posts fail transiently.
    pub fn fail_next_posts(&self, n: u32) {
        *self.post_failures.lock() = n;
    }
}

#[async_trait]
impl ArticleTransport for MemoryTransport {
    async fn post_article(
        &self,
        group: &str,
        subject: &str,
        message_id: &str,
        body: &[u8],
    ) -> Result<PostReceipt> {
        {
            let mut failures = self.post_failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(NetError::TryAgainLater { code: 400 });
            }
        }
        self.articles.insert(
            message_id.to_string(),
            StoredArticle {
                group: group.to_string(),
                subject: subject.to_string(),
                body: body.to_vec(),
            },
        );
        self.posts.lock().push(message_id.to_string());
        Ok(PostReceipt {
            message_id: message_id.to_string(),
            server: "memory".to_string(),
        })
    }

    async fn fetch_article(
        &self,
        message_id: &str,
        _prefer_server: Option<&str>,
    ) -> Result<FetchedArticle> {
        self.fetches.lock().push(message_id.to_string());
        if let Some(mut remaining) = self.fetch_failures.get_mut(message_id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(NetError::Timeout);
            }
        }
        let article = self
            .articles
            .get(message_id)
            .ok_or_else(|| NetError::NoSuchArticle(message_id.to_string()))?;
        Ok(FetchedArticle {
            headers: vec![
                ("Newsgroups".to_string(), article.group.clone()),
                ("Subject".to_string(), article.subject.clone()),
                ("Message-ID".to_string(), message_id.to_string()),
            ],
            body: article.body.clone(),
            server: "memory".to_string(),
        })
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        Ok(ServerCapabilities {
            posting_allowed: true,
            retention_days: None,
            max_connections: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn post_then_fetch_round_trip() {
        let transport = MemoryTransport::new();
        let receipt = transport
            .post_article("alt.binaries.test", "SUBJ", "<a@x>", b"payload")
            .await
            .unwrap();
        let fetched = transport.fetch_article(&receipt.message_id, None).await.unwrap();
        assert_eq!(fetched.body, b"payload");
        assert_eq!(transport.article_count(), 1);
    }

    #[tokio::test]
    async fn missing_article_is_distinct() {
        let transport = MemoryTransport::new();
        assert!(matches!(
            transport.fetch_article("<gone@x>", None).await,
            Err(NetError::NoSuchArticle(_))
        ));
    }

    #[tokio::test]
    async fn injected_faults_burn_off() {
        let transport = MemoryTransport::new();
        transport
            .post_article("g", "s", "<a@x>", b"body")
            .await
            .unwrap();
        transport.fail_fetches("<a@x>", 2);
        assert!(transport.fetch_article("<a@x>", None).await.is_err());
        assert!(transport.fetch_article("<a@x>", None).await.is_err());
        assert!(transport.fetch_article("<a@x>", None).await.is_ok());
    }

    #[tokio::test]
    async fn post_faults_are_transient() {
        let transport = MemoryTransport::new();
        transport.fail_next_posts(1);
        let err = transport
            .post_article("g", "s", "<b@x>", b"body")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(transport
            .post_article("g", "s", "<b@x>", b"body")
            .await
            .is_ok());
    }
}
