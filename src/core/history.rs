use std::time::Duration;

use tokio::time::Instant;

use super::circular_buffer::CircularBuffer;
use super::quality::{QualityLevel, QualityScorer};

/// One scored observation of the link.
#[derive(Debug, Clone, PartialEq)]
pub struct QualitySample {
    pub timestamp: Instant,
    pub latency_ms: u64,
    pub packet_loss_pct: f64,
    pub bandwidth_kbps: u64,
    pub score: u8,
    pub level: QualityLevel,
}

/// Bounded, time-evicted sample history.
///
/// Bounded twice: by age (samples older than `retention` are dropped by [`HistoryWindow::trim`])
/// and by count, at one sample per second of retention. Heartbeats and recorded samples share
/// the buffer, so the count bound is not tied to the heartbeat interval.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    samples: CircularBuffer<QualitySample>,
    retention: Duration,
}

fn capacity_for(retention: Duration) -> usize {
    usize::try_from(retention.as_secs())
        .unwrap_or(usize::MAX)
        .max(1)
}

impl HistoryWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: CircularBuffer::new(capacity_for(retention)),
            retention,
        }
    }

    pub fn set_retention(&mut self, retention: Duration) {
        self.retention = retention;
        self.samples.resize(capacity_for(retention));
    }

    pub fn push(&mut self, sample: QualitySample) {
        self.samples.push(sample);
    }

    /// Drop samples older than the retention window. Returns how many were removed.
    pub fn trim(&mut self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return 0;
        };
        self.samples.drain_front_while(|s| s.timestamp < cutoff)
    }

    /// Samples taken within `window` of `now`, oldest first.
    pub fn since(&self, now: Instant, window: Duration) -> Vec<QualitySample> {
        match now.checked_sub(window) {
            Some(cutoff) => self
                .samples
                .iter()
                .filter(|s| s.timestamp >= cutoff)
                .cloned()
                .collect(),
            None => self.samples.iter().cloned().collect(),
        }
    }

    pub fn latest(&self) -> Option<&QualitySample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.samples.capacity()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Aggregate view over everything recorded since monitoring started (or since the last reset).
#[derive(Debug, Clone, PartialEq)]
pub struct QualityStats {
    pub samples: u64,
    pub average_latency_ms: f64,
    pub average_packet_loss_pct: f64,
    pub average_bandwidth_kbps: f64,
    pub current_score: Option<u8>,
    pub current_level: Option<QualityLevel>,
    pub monitoring_for: Duration,
    pub last_sample_age: Option<Duration>,
    pub history_len: usize,
}

/// Result of recording one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityUpdate {
    pub sample: QualitySample,
    pub previous_level: Option<QualityLevel>,
}

impl QualityUpdate {
    /// First sample, or the level moved.
    pub fn level_changed(&self) -> bool {
        self.previous_level != Some(self.sample.level)
    }

    pub fn degraded(&self) -> bool {
        self.previous_level
            .is_some_and(|previous| self.sample.level < previous)
    }
}

/// Scores raw observations, keeps the history window and the running averages.
#[derive(Debug, Clone)]
pub struct QualityMonitor {
    scorer: QualityScorer,
    history: HistoryWindow,
    current: Option<QualitySample>,
    started_at: Instant,
    samples: u64,
    latency_sum: f64,
    loss_sum: f64,
    bandwidth_sum: f64,
}

impl QualityMonitor {
    pub fn new(scorer: QualityScorer, history: HistoryWindow) -> Self {
        Self {
            scorer,
            history,
            current: None,
            started_at: Instant::now(),
            samples: 0,
            latency_sum: 0.0,
            loss_sum: 0.0,
            bandwidth_sum: 0.0,
        }
    }

    pub fn scorer(&self) -> &QualityScorer {
        &self.scorer
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryWindow {
        &mut self.history
    }

    pub fn record(
        &mut self,
        now: Instant,
        latency_ms: u64,
        packet_loss_pct: f64,
        bandwidth_kbps: u64,
    ) -> QualityUpdate {
        let packet_loss_pct = if packet_loss_pct.is_finite() {
            packet_loss_pct.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let (score, level) = self.scorer.assess(latency_ms, packet_loss_pct, bandwidth_kbps);
        let sample = QualitySample {
            timestamp: now,
            latency_ms,
            packet_loss_pct,
            bandwidth_kbps,
            score,
            level,
        };

        self.samples = self.samples.saturating_add(1);
        self.latency_sum += latency_ms as f64;
        self.loss_sum += packet_loss_pct;
        self.bandwidth_sum += bandwidth_kbps as f64;

        let previous_level = self.current.as_ref().map(|s| s.level);
        self.history.push(sample.clone());
        self.current = Some(sample.clone());

        QualityUpdate {
            sample,
            previous_level,
        }
    }

    pub fn trim(&mut self, now: Instant) -> usize {
        self.history.trim(now)
    }

    pub fn current(&self) -> Option<&QualitySample> {
        self.current.as_ref()
    }

    pub fn level(&self) -> Option<QualityLevel> {
        self.current.as_ref().map(|s| s.level)
    }

    pub fn score(&self) -> Option<u8> {
        self.current.as_ref().map(|s| s.score)
    }

    pub fn stats(&self, now: Instant) -> QualityStats {
        let n = self.samples.max(1) as f64;
        let (avg_latency, avg_loss, avg_bandwidth) = if self.samples == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (self.latency_sum / n, self.loss_sum / n, self.bandwidth_sum / n)
        };

        QualityStats {
            samples: self.samples,
            average_latency_ms: avg_latency,
            average_packet_loss_pct: avg_loss,
            average_bandwidth_kbps: avg_bandwidth,
            current_score: self.score(),
            current_level: self.level(),
            monitoring_for: now.saturating_duration_since(self.started_at),
            last_sample_age: self
                .current
                .as_ref()
                .map(|s| now.saturating_duration_since(s.timestamp)),
            history_len: self.history.len(),
        }
    }

    /// Clear averages and history. The current level is kept so the next sample only reports a
    /// change when the level actually moves.
    pub fn reset_stats(&mut self, now: Instant) {
        self.started_at = now;
        self.samples = 0;
        self.latency_sum = 0.0;
        self.loss_sum = 0.0;
        self.bandwidth_sum = 0.0;
        self.history.clear();
    }
}
