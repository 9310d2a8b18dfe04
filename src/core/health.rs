use std::time::Duration;

use hdrhistogram::Histogram;
use tokio::time::Instant;

use super::circular_buffer::CircularBuffer;
use super::types::FailureReason;

const MAX_RECENT_ERRORS: usize = 100;
const MAX_ERROR_TEXT_BYTES: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct RecentError {
    pub at: Instant,
    pub operation: String,
    pub kind: &'static str,
    pub message: String,
}

fn truncate_string(s: &str) -> String {
    if s.len() <= MAX_ERROR_TEXT_BYTES {
        return s.to_string();
    }

    let mut end = MAX_ERROR_TEXT_BYTES;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

/// Request counters snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStats {
    pub uptime: Duration,
    pub total_attempts: u64,
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
    pub expired: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub reconnects: u64,
    /// Heartbeats issued and answered over the actor's lifetime.
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub pending: usize,
    pub in_flight: usize,
    pub last_success_age: Option<Duration>,
    pub last_failure_age: Option<Duration>,
    pub recent_errors: usize,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub latency_samples: u64,
}

/// Counts request outcomes and keeps a latency histogram. Owned by the link actor, so no
/// interior mutability.
#[derive(Debug)]
pub struct LinkHealthMonitor {
    started_at: Instant,
    total_attempts: u64,
    successful: u64,
    failed: u64,
    retries: u64,
    expired: u64,
    cancelled: u64,
    rejected: u64,
    reconnects: u64,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    recent_errors: CircularBuffer<RecentError>,
    latency_histogram: Option<Histogram<u64>>,
}

impl Default for LinkHealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkHealthMonitor {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_attempts: 0,
            successful: 0,
            failed: 0,
            retries: 0,
            expired: 0,
            cancelled: 0,
            rejected: 0,
            reconnects: 0,
            last_success: None,
            last_failure: None,
            recent_errors: CircularBuffer::new(MAX_RECENT_ERRORS),
            latency_histogram: Histogram::new_with_bounds(1, 3_600_000_000, 3).ok(),
        }
    }

    pub fn record_attempt(&mut self) {
        self.total_attempts = self.total_attempts.saturating_add(1);
    }

    pub fn record_success(&mut self, now: Instant, latency: Duration) {
        self.successful = self.successful.saturating_add(1);
        self.last_success = Some(now);
        if let Some(histogram) = self.latency_histogram.as_mut() {
            let micros = latency.as_micros().clamp(1, u64::MAX as u128) as u64;
            let _ = histogram.saturating_record(micros);
        }
    }

    /// Every failed attempt counts, including ones that go on to be retried.
    pub fn record_failure(&mut self, now: Instant, operation: &str, reason: &FailureReason) {
        self.failed = self.failed.saturating_add(1);
        self.last_failure = Some(now);
        self.push_error(now, operation, reason);
    }

    pub fn record_retry(&mut self) {
        self.retries = self.retries.saturating_add(1);
    }

    pub fn record_expired(&mut self, now: Instant, operation: &str, reason: &FailureReason) {
        self.expired = self.expired.saturating_add(1);
        self.push_error(now, operation, reason);
    }

    pub fn record_cancelled(&mut self, count: u64) {
        self.cancelled = self.cancelled.saturating_add(count);
    }

    pub fn record_rejected(&mut self) {
        self.rejected = self.rejected.saturating_add(1);
    }

    pub fn increment_reconnect(&mut self) {
        self.reconnects = self.reconnects.saturating_add(1);
    }

    fn push_error(&mut self, now: Instant, operation: &str, reason: &FailureReason) {
        self.recent_errors.push(RecentError {
            at: now,
            operation: truncate_string(operation),
            kind: reason.label(),
            message: truncate_string(&reason.to_string()),
        });
    }

    pub fn recent_errors(&self) -> impl Iterator<Item = &RecentError> {
        self.recent_errors.iter()
    }

    pub fn clear_errors(&mut self) {
        self.recent_errors.clear();
    }

    pub fn get_stats(&self, now: Instant, pending: usize, in_flight: usize) -> LinkStats {
        let (latency_samples, p50, p99) = match self.latency_histogram.as_ref() {
            Some(h) if !h.is_empty() => (
                h.len(),
                h.value_at_percentile(50.0),
                h.value_at_percentile(99.0),
            ),
            _ => (0, 0, 0),
        };

        LinkStats {
            uptime: now.saturating_duration_since(self.started_at),
            total_attempts: self.total_attempts,
            successful: self.successful,
            failed: self.failed,
            retries: self.retries,
            expired: self.expired,
            cancelled: self.cancelled,
            rejected: self.rejected,
            reconnects: self.reconnects,
            heartbeats_sent: 0,
            heartbeats_received: 0,
            pending,
            in_flight,
            last_success_age: self.last_success.map(|t| now.saturating_duration_since(t)),
            last_failure_age: self.last_failure.map(|t| now.saturating_duration_since(t)),
            recent_errors: self.recent_errors.len(),
            p50_latency_us: p50,
            p99_latency_us: p99,
            latency_samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TransportErrorKind;

    fn refused() -> FailureReason {
        FailureReason::Transport {
            kind: TransportErrorKind::ConnectionRefused,
            message: "connection refused".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn latency_percentiles_follow_recorded_successes() {
        let mut monitor = LinkHealthMonitor::new();
        let now = Instant::now();
        monitor.record_success(now, Duration::from_micros(100));
        monitor.record_success(now, Duration::from_micros(200));
        monitor.record_success(now, Duration::from_micros(300));

        let stats = monitor.get_stats(now, 0, 0);
        assert_eq!(stats.successful, 3);
        assert_eq!(stats.latency_samples, 3);
        assert_eq!(stats.p50_latency_us, 200);
        assert_eq!(stats.p99_latency_us, 300);
        assert_eq!(stats.last_success_age, Some(Duration::ZERO));
        assert_eq!(stats.last_failure_age, None);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_errors_are_bounded() {
        let mut monitor = LinkHealthMonitor::new();
        let now = Instant::now();
        for i in 0..105 {
            monitor.record_failure(now, &format!("op-{i}"), &refused());
        }

        let stats = monitor.get_stats(now, 0, 0);
        assert_eq!(stats.failed, 105);
        assert_eq!(stats.recent_errors, 100);
        assert_eq!(
            monitor.recent_errors().next().map(|e| e.operation.as_str()),
            Some("op-5")
        );

        monitor.clear_errors();
        assert_eq!(monitor.get_stats(now, 0, 0).recent_errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn error_text_is_capped() {
        let mut monitor = LinkHealthMonitor::new();
        let huge = FailureReason::Decode("x".repeat(MAX_ERROR_TEXT_BYTES * 2));
        monitor.record_expired(Instant::now(), "op", &huge);
        let rec = monitor.recent_errors().next().unwrap();
        assert_eq!(rec.message.len(), MAX_ERROR_TEXT_BYTES);
        assert_eq!(rec.kind, "decode");
    }
}
