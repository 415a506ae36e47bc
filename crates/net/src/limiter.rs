//! Token-bucket bandwidth limiters, one per direction.
//!
//! Consumers request N tokens (bytes) before transmitting N bytes; a
//! refused request sleeps until refill. Buckets are lock-free on the hot
//! path; waiting happens on the tokio timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: AtomicU64,
    /// Tokens per second.
    refill_rate: f64,
    /// Nanosecond timestamp of the last refill.
    last_refill: AtomicU64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
            refill_rate,
            last_refill: AtomicU64::new(Self::now_nanos()),
        }
    }

    fn now_nanos() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }

    fn refill(&self) {
        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::Acquire);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1e9;
        let add = (elapsed_secs * self.refill_rate) as u64;
        if add == 0 {
            return;
        }
        if self
            .last_refill
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let current = self.tokens.load(Ordering::Acquire);
            let next = current.saturating_add(add).min(self.capacity);
            self.tokens.store(next, Ordering::Release);
        }
    }

    /// Take `n` tokens if available.
    pub fn try_acquire(&self, n: u64) -> bool {
        self.refill();
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            if current < n {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - n,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// How long until `n` tokens could be available.
    pub fn time_until(&self, n: u64) -> Duration {
        let available = self.tokens.load(Ordering::Acquire);
        if available >= n || self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        let missing = (n - available) as f64;
        Duration::from_secs_f64(missing / self.refill_rate)
    }

    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Acquire)
    }
}

/// Optional async limiter: `None` rate means unlimited.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Option<TokenBucket>,
}

impl RateLimiter {
    /// `mbps` is megabits per second, matching the configuration unit.
    pub fn from_mbps(mbps: Option<f64>) -> Self {
        let bucket = mbps.filter(|rate| *rate > 0.0).map(|rate| {
            let bytes_per_sec = rate * 1_000_000.0 / 8.0;
            // One second of burst.
            TokenBucket::new(bytes_per_sec as u64, bytes_per_sec)
        });
        Self { bucket }
    }

    pub fn unlimited() -> Self {
        Self { bucket: None }
    }

    /// Acquire `n` byte-tokens, sleeping through refills as needed. This
    /// is a cooperative suspension point for upload/download workers.
    pub async fn acquire(&self, n: u64) {
        let Some(bucket) = &self.bucket else { return };
        // Requests larger than the bucket are drained in capacity slices.
        let mut remaining = n;
        while remaining > 0 {
            let slice = remaining.min(bucket.capacity);
            while !bucket.try_acquire(slice) {
                let wait = bucket.time_until(slice).max(Duration::from_millis(5));
                tokio::time::sleep(wait).await;
            }
            remaining -= slice;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_honours_capacity() {
        let bucket = TokenBucket::new(100, 1000.0);
        assert!(bucket.try_acquire(60));
        assert!(bucket.try_acquire(40));
        assert!(!bucket.try_acquire(10));
    }

    #[test]
    fn bucket_refills_over_time() {
        let bucket = TokenBucket::new(100, 10_000.0);
        assert!(bucket.try_acquire(100));
        assert!(!bucket.try_acquire(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(bucket.available() > 0);
    }

    #[tokio::test]
    async fn unlimited_limiter_never_blocks() {
        let limiter = RateLimiter::from_mbps(None);
        limiter.acquire(u64::MAX / 2).await;
    }

    #[tokio::test]
    async fn limiter_paces_large_requests() {
        // 80 mbps = 10 MB/s capacity; a 1 KB acquire is instant.
        let limiter = RateLimiter::from_mbps(Some(80.0));
        let started = std::time::Instant::now();
        limiter.acquire(1024).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn time_until_scales_with_deficit() {
        let bucket = TokenBucket::new(10, 10.0);
        assert!(bucket.try_acquire(10));
        let wait = bucket.time_until(10);
        assert!(wait > Duration::from_millis(500), "wait was {wait:?}");
    }
}
