//! Per-server health tracking.
//!
//! Exponential moving averages of response time and failure rate. A
//! server whose failure rate stays above the threshold for the sustained
//! window is marked unhealthy and skipped until a cooldown passes.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

const EMA_ALPHA: f64 = 0.2;
const FAILURE_THRESHOLD: f64 = 0.5;
const SUSTAIN_WINDOW: Duration = Duration::from_secs(30);
const COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub response_time_ms: f64,
    pub failure_rate: f64,
    pub healthy: bool,
}

#[derive(Debug, Default)]
struct HealthInner {
    response_time_ms: f64,
    failure_rate: f64,
    /// When the failure rate first crossed the threshold.
    degraded_since: Option<Instant>,
    /// Set while the server sits out its cooldown.
    unhealthy_until: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct HealthTracker {
    inner: Mutex<HealthInner>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let ms = elapsed.as_secs_f64() * 1000.0;
        inner.response_time_ms = if inner.response_time_ms == 0.0 {
            ms
        } else {
            EMA_ALPHA * ms + (1.0 - EMA_ALPHA) * inner.response_time_ms
        };
        inner.failure_rate = (1.0 - EMA_ALPHA) * inner.failure_rate;
        if inner.failure_rate < FAILURE_THRESHOLD {
            inner.degraded_since = None;
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_rate = EMA_ALPHA + (1.0 - EMA_ALPHA) * inner.failure_rate;
        if inner.failure_rate >= FAILURE_THRESHOLD {
            let degraded = inner.degraded_since.get_or_insert_with(Instant::now);
            if degraded.elapsed() >= SUSTAIN_WINDOW && inner.unhealthy_until.is_none() {
                inner.unhealthy_until = Some(Instant::now() + COOLDOWN);
            }
        }
    }

    /// Whether the pool should hand out connections to this server.
    pub fn is_available(&self) -> bool {
        let mut inner = self.inner.lock();
        if let Some(until) = inner.unhealthy_until {
            if Instant::now() < until {
                return false;
            }
            // Cooldown over: give the server a fresh chance.
            inner.unhealthy_until = None;
            inner.degraded_since = None;
            inner.failure_rate = 0.0;
        }
        true
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock();
        HealthSnapshot {
            response_time_ms: inner.response_time_ms,
            failure_rate: inner.failure_rate,
            healthy: inner.unhealthy_until.is_none(),
        }
    }

    /// Recent failure rate, the health-first rotation key.
    pub fn failure_rate(&self) -> f64 {
        self.inner.lock().failure_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_tracks_response_times() {
        let tracker = HealthTracker::new();
        tracker.record_success(Duration::from_millis(100));
        tracker.record_success(Duration::from_millis(200));
        let snapshot = tracker.snapshot();
        assert!(snapshot.response_time_ms > 100.0);
        assert!(snapshot.response_time_ms < 200.0);
    }

    #[test]
    fn failures_raise_the_rate_and_successes_decay_it() {
        let tracker = HealthTracker::new();
        for _ in 0..10 {
            tracker.record_failure();
        }
        let after_failures = tracker.failure_rate();
        assert!(after_failures > 0.5);

        for _ in 0..10 {
            tracker.record_success(Duration::from_millis(50));
        }
        assert!(tracker.failure_rate() < after_failures);
    }

    #[test]
    fn short_failure_bursts_do_not_trip_the_breaker() {
        let tracker = HealthTracker::new();
        for _ in 0..20 {
            tracker.record_failure();
        }
        // Threshold crossed but the sustain window has not elapsed.
        assert!(tracker.is_available());
    }
}
