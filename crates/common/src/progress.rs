use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Scanning,
    Hashing,
    Committing,
    Segmenting,
    Uploading,
    Downloading,
    Verifying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: u64,
    pub current_path: Option<String>,
}

pub type ProgressFn = Arc<dyn Fn(Progress) + Send + Sync>;

pub fn noop_progress() -> ProgressFn {
    Arc::new(|_| {})
}

/// Caps emission cadence: an event goes out every `every_n` observations
/// or after `interval`, whichever comes first.
pub struct ProgressThrottle {
    every_n: u64,
    interval: Duration,
    seen: u64,
    last_emit: Instant,
}

impl ProgressThrottle {
    pub fn new(every_n: u64, interval: Duration) -> Self {
        Self {
            every_n,
            interval,
            seen: 0,
            last_emit: Instant::now().checked_sub(interval).unwrap_or_else(Instant::now),
        }
    }

    pub fn observe(&mut self, progress: Progress, emit: &ProgressFn) {
        self.seen += 1;
        if self.seen % self.every_n == 0 || self.last_emit.elapsed() >= self.interval {
            self.last_emit = Instant::now();
            emit(progress);
        }
    }

    /// Unconditional emission, used at phase boundaries.
    pub fn flush(&mut self, progress: Progress, emit: &ProgressFn) {
        self.last_emit = Instant::now();
        emit(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn progress(current: u64) -> Progress {
        Progress {
            phase: ProgressPhase::Hashing,
            current,
            total: 100,
            current_path: None,
        }
    }

    #[test]
    fn throttle_emits_every_n() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        let emit: ProgressFn = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        // Long interval so only the modulo path fires.
        let mut throttle = ProgressThrottle::new(10, Duration::from_secs(3600));
        // Consume the "interval already elapsed" initial emission.
        throttle.observe(progress(0), &emit);
        let initial = counter.load(Ordering::SeqCst);

        for i in 1..100 {
            throttle.observe(progress(i), &emit);
        }
        let emitted = counter.load(Ordering::SeqCst) - initial;
        assert!(emitted >= 9 && emitted <= 11, "emitted {emitted}");
    }

    #[test]
    fn flush_always_emits() {
        let counter = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&counter);
        let emit: ProgressFn = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let mut throttle = ProgressThrottle::new(1000, Duration::from_secs(3600));
        throttle.flush(progress(1), &emit);
        throttle.flush(progress(2), &emit);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
