//! Authenticated connection pool over one or more article servers.
//!
//! The pool is the only owner of raw server connections. Acquisition is
//! bounded by per-server semaphores and an acquire timeout; connections
//! rotate out after an article/byte budget or an idle window. Server
//! selection follows the configured rotation strategy filtered by health.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::ServerConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::health::HealthTracker;
use crate::limiter::RateLimiter;
use crate::nntp::{NntpClient, ServerCapabilities, Timeouts};
use crate::retry::RetryPolicy;
use crate::transport::{ArticleTransport, FetchedArticle, PostReceipt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStrategy {
    RoundRobin,
    /// Weighted by configured priority, lowest value first.
    Weighted,
    /// Lowest recent failure rate first.
    HealthFirst,
    /// Stick to the primary; move on only when it is dead.
    Failover,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_articles_per_conn: u64,
    pub max_bytes_per_conn: u64,
    pub rotation: RotationStrategy,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
    pub upload_rate_mbps: Option<f64>,
    pub download_rate_mbps: Option<f64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_articles_per_conn: 1000,
            max_bytes_per_conn: 512 * 1024 * 1024,
            rotation: RotationStrategy::Weighted,
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            upload_rate_mbps: None,
            download_rate_mbps: None,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ServerStats {
    pub connections_created: u64,
    pub connections_reused: u64,
    pub posts_ok: u64,
    pub posts_failed: u64,
    pub fetches_ok: u64,
    pub fetches_failed: u64,
}

struct ServerSlot {
    config: ServerConfig,
    idle: Mutex<VecDeque<NntpClient>>,
    permits: Arc<Semaphore>,
    health: HealthTracker,
}

pub struct NntpPool {
    slots: Vec<Arc<ServerSlot>>,
    cursor: AtomicUsize,
    config: PoolConfig,
    stats: DashMap<String, ServerStats>,
    pub upload_limiter: RateLimiter,
    pub download_limiter: RateLimiter,
}

impl NntpPool {
    pub fn new(servers: Vec<ServerConfig>, config: PoolConfig) -> Self {
        let slots = servers
            .into_iter()
            .map(|server| {
                Arc::new(ServerSlot {
                    permits: Arc::new(Semaphore::new(server.max_connections.max(1) as usize)),
                    idle: Mutex::new(VecDeque::new()),
                    health: HealthTracker::new(),
                    config: server,
                })
            })
            .collect();
        Self {
            slots,
            cursor: AtomicUsize::new(0),
            upload_limiter: RateLimiter::from_mbps(config.upload_rate_mbps),
            download_limiter: RateLimiter::from_mbps(config.download_rate_mbps),
            stats: DashMap::new(),
            config,
        }
    }

    pub fn server_ids(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| slot.config.server_id())
            .collect()
    }

    pub fn stats(&self, server_id: &str) -> ServerStats {
        self.stats
            .get(server_id)
            .map(|entry| entry.clone())
            .unwrap_or_default()
    }

    pub fn health(&self, server_id: &str) -> Option<crate::health::HealthSnapshot> {
        self.slots
            .iter()
            .find(|slot| slot.config.server_id() == server_id)
            .map(|slot| slot.health.snapshot())
    }

    /// Candidate servers in rotation order, unhealthy ones pushed out
    /// unless nothing healthy remains.
    fn ordered_slots(&self, prefer: Option<&str>) -> Vec<Arc<ServerSlot>> {
        let mut order: Vec<Arc<ServerSlot>> = self.slots.to_vec();
        match self.config.rotation {
            RotationStrategy::RoundRobin => {
                if !order.is_empty() {
                    let shift = self.cursor.fetch_add(1, Ordering::Relaxed) % order.len();
                    order.rotate_left(shift);
                }
            }
            RotationStrategy::Weighted => {
                order.sort_by_key(|slot| slot.config.priority);
            }
            RotationStrategy::HealthFirst => {
                order.sort_by(|a, b| {
                    a.health
                        .failure_rate()
                        .partial_cmp(&b.health.failure_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            RotationStrategy::Failover => {}
        }

        if let Some(prefer) = prefer {
            if let Some(pos) = order
                .iter()
                .position(|slot| slot.config.server_id() == prefer)
            {
                let preferred = order.remove(pos);
                order.insert(0, preferred);
            }
        }

        let healthy: Vec<Arc<ServerSlot>> = order
            .iter()
            .filter(|slot| slot.health.is_available())
            .cloned()
            .collect();
        if healthy.is_empty() {
            order
        } else {
            healthy
        }
    }

    async fn acquire_from(&self, slot: &Arc<ServerSlot>) -> Result<(NntpClient, OwnedSemaphorePermit)> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&slot.permits).acquire_owned(),
        )
        .await
        .map_err(|_| NetError::AcquireTimeout)?
        .expect("pool semaphore never closes");

        let server_id = slot.config.server_id();

        // Reuse a warm connection if one is still within its budgets.
        loop {
            let candidate = slot.idle.lock().pop_front();
            match candidate {
                Some(client) => {
                    if client.idle_for() > self.config.idle_timeout
                        || client.articles_posted >= self.config.max_articles_per_conn
                        || client.bytes_posted >= self.config.max_bytes_per_conn
                    {
                        debug!(server = %server_id, "rotating connection out");
                        client.quit().await;
                        continue;
                    }
                    self.stats.entry(server_id).or_default().connections_reused += 1;
                    return Ok((client, permit));
                }
                None => break,
            }
        }

        // Connection layer: one retry on connect/authenticate transients.
        let client = match NntpClient::connect(&slot.config, self.config.timeouts).await {
            Ok(client) => client,
            Err(e) if e.is_retryable() => {
                warn!(server = %server_id, error = %e, "connect failed, retrying once");
                NntpClient::connect(&slot.config, self.config.timeouts).await?
            }
            Err(e) => return Err(e),
        };
        self.stats.entry(server_id).or_default().connections_created += 1;
        Ok((client, permit))
    }

    fn release(&self, slot: &Arc<ServerSlot>, client: NntpClient) {
        slot.idle.lock().push_back(client);
    }

    async fn post_on_slot(
        &self,
        slot: &Arc<ServerSlot>,
        group: &str,
        subject: &str,
        message_id: &str,
        body: &[u8],
    ) -> Result<String> {
        let (mut client, _permit) = self.acquire_from(slot).await?;
        let headers = codec_headers(subject, group, message_id);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeouts.operation(),
            client.post(&headers, body, message_id),
        )
        .await
        .unwrap_or(Err(NetError::Timeout));

        let server_id = slot.config.server_id();
        match outcome {
            Ok(id) => {
                slot.health.record_success(started.elapsed());
                self.stats.entry(server_id).or_default().posts_ok += 1;
                self.release(slot, client);
                Ok(id)
            }
            Err(e) => {
                slot.health.record_failure();
                self.stats.entry(server_id).or_default().posts_failed += 1;
                // Failed connection is torn down, not returned.
                Err(e)
            }
        }
    }

    async fn fetch_on_slot(
        &self,
        slot: &Arc<ServerSlot>,
        message_id: &str,
    ) -> Result<FetchedArticle> {
        let (mut client, _permit) = self.acquire_from(slot).await?;
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.timeouts.operation(),
            client.fetch(message_id),
        )
        .await
        .unwrap_or(Err(NetError::Timeout));

        let server_id = slot.config.server_id();
        match outcome {
            Ok((headers, body)) => {
                slot.health.record_success(started.elapsed());
                self.stats.entry(server_id.clone()).or_default().fetches_ok += 1;
                self.release(slot, client);
                Ok(FetchedArticle {
                    headers,
                    body,
                    server: server_id,
                })
            }
            Err(e) => {
                // A missing article is not the server's fault.
                if matches!(e, NetError::NoSuchArticle(_)) {
                    slot.health.record_success(started.elapsed());
                    self.release(slot, client);
                } else {
                    slot.health.record_failure();
                }
                self.stats.entry(server_id).or_default().fetches_failed += 1;
                Err(e)
            }
        }
    }
}

fn codec_headers(subject: &str, group: &str, message_id: &str) -> Vec<(String, String)> {
    vec![
        (
            "From".to_string(),
            "poster <poster@usenetsync.local>".to_string(),
        ),
        ("Newsgroups".to_string(), group.to_string()),
        ("Subject".to_string(), subject.to_string()),
        ("Message-ID".to_string(), message_id.to_string()),
    ]
}

#[async_trait]
impl ArticleTransport for NntpPool {
    /// Post with the two-layer retry policy: every attempt walks the
    /// rotation order, so a failed post tries a different server before a
    /// backoff delay is ever consumed.
    async fn post_article(
        &self,
        group: &str,
        subject: &str,
        message_id: &str,
        body: &[u8],
    ) -> Result<PostReceipt> {
        if self.slots.is_empty() {
            return Err(NetError::AllServersFailed("no servers configured".into()));
        }
        self.upload_limiter.acquire(body.len() as u64).await;

        let mut last: Option<NetError> = None;
        for attempt in 0..=self.config.retry.max_retries {
            for slot in self.ordered_slots(None) {
                match self.post_on_slot(&slot, group, subject, message_id, body).await {
                    Ok(id) => {
                        return Ok(PostReceipt {
                            message_id: id,
                            server: slot.config.server_id(),
                        })
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(server = %slot.config.server_id(), error = %e, "post failed");
                        last = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if attempt < self.config.retry.max_retries {
                tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
            }
        }
        Err(NetError::RetriesExhausted {
            attempts: self.config.retry.max_retries + 1,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Fetch, preferred server first, rotating through the rest.
    async fn fetch_article(
        &self,
        message_id: &str,
        prefer_server: Option<&str>,
    ) -> Result<FetchedArticle> {
        if self.slots.is_empty() {
            return Err(NetError::AllServersFailed("no servers configured".into()));
        }
        self.download_limiter.acquire(1).await;

        let mut last: Option<NetError> = None;
        for attempt in 0..=self.config.retry.max_retries {
            for slot in self.ordered_slots(prefer_server) {
                match self.fetch_on_slot(&slot, message_id).await {
                    Ok(article) => {
                        self.download_limiter.acquire(article.body.len() as u64).await;
                        return Ok(article);
                    }
                    Err(e) if e.is_retryable() => {
                        last = Some(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            if attempt < self.config.retry.max_retries {
                tokio::time::sleep(self.config.retry.delay_for(attempt)).await;
            }
        }
        Err(NetError::RetriesExhausted {
            attempts: self.config.retry.max_retries + 1,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        let slots = self.ordered_slots(None);
        let slot = slots
            .first()
            .ok_or_else(|| NetError::AllServersFailed("no servers configured".into()))?;
        let (mut client, _permit) = self.acquire_from(slot).await?;
        let caps = client.capabilities().await?;
        self.release(slot, client);
        info!(server = %slot.config.server_id(), posting = caps.posting_allowed, "capabilities");
        Ok(caps)
    }
}
