use std::time::Duration;

use super::circular_buffer::CircularBuffer;

/// Raw metrics derived from one heartbeat outcome, ready for scoring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatObservation {
    pub latency_ms: u64,
    pub packet_loss_pct: f64,
    pub bandwidth_kbps: u64,
    pub missed_streak: u32,
}

/// Heartbeat bookkeeping: rolling loss window, missed-heartbeat streak and last known bandwidth.
///
/// Timing lives in the link actor; this type only turns outcomes into observations.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    outcomes: CircularBuffer<bool>,
    missed_streak: u32,
    max_missed: u32,
    last_bandwidth_kbps: Option<u64>,
    assumed_bandwidth_kbps: u64,
    sent: u64,
    received: u64,
}

impl HeartbeatMonitor {
    pub fn new(loss_window: usize, max_missed: u32, assumed_bandwidth_kbps: u64) -> Self {
        Self {
            outcomes: CircularBuffer::new(loss_window.max(1)),
            missed_streak: 0,
            max_missed: max_missed.max(1),
            last_bandwidth_kbps: None,
            assumed_bandwidth_kbps,
            sent: 0,
            received: 0,
        }
    }

    pub fn record_sent(&mut self) {
        self.sent = self.sent.saturating_add(1);
    }

    pub fn record_success(
        &mut self,
        latency: Duration,
        bandwidth_kbps: Option<u64>,
    ) -> HeartbeatObservation {
        self.received = self.received.saturating_add(1);
        self.missed_streak = 0;
        self.outcomes.push(true);
        if bandwidth_kbps.is_some() {
            self.last_bandwidth_kbps = bandwidth_kbps;
        }
        self.observation(duration_ms(latency))
    }

    /// A missed heartbeat is scored as if it took the full `timeout`.
    pub fn record_failure(&mut self, timeout: Duration) -> HeartbeatObservation {
        self.missed_streak = self.missed_streak.saturating_add(1);
        self.outcomes.push(false);
        self.observation(duration_ms(timeout))
    }

    fn observation(&self, latency_ms: u64) -> HeartbeatObservation {
        HeartbeatObservation {
            latency_ms,
            packet_loss_pct: self.packet_loss_pct(),
            bandwidth_kbps: self.bandwidth_kbps(),
            missed_streak: self.missed_streak,
        }
    }

    pub fn packet_loss_pct(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 * 100.0 / self.outcomes.len() as f64
    }

    pub fn bandwidth_kbps(&self) -> u64 {
        self.last_bandwidth_kbps
            .unwrap_or(self.assumed_bandwidth_kbps)
    }

    pub fn missed_streak(&self) -> u32 {
        self.missed_streak
    }

    pub fn threshold_reached(&self) -> bool {
        self.missed_streak >= self.max_missed
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Start a fresh connection session. Bandwidth knowledge survives reconnects.
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.missed_streak = 0;
    }
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loss_is_the_failure_share_of_the_window() {
        let mut hb = HeartbeatMonitor::new(10, 3, 5000);
        for _ in 0..8 {
            hb.record_success(Duration::from_millis(20), None);
        }
        hb.record_failure(Duration::from_secs(30));
        let obs = hb.record_failure(Duration::from_secs(30));
        assert_eq!(obs.packet_loss_pct, 20.0);
        assert_eq!(obs.latency_ms, 30_000);
        assert_eq!(obs.missed_streak, 2);

        // Window slides: ten more successes push both failures out.
        for _ in 0..10 {
            hb.record_success(Duration::from_millis(20), None);
        }
        assert_eq!(hb.packet_loss_pct(), 0.0);
        assert_eq!(hb.missed_streak(), 0);
    }

    #[test]
    fn streak_threshold_and_reset() {
        let mut hb = HeartbeatMonitor::new(10, 3, 5000);
        hb.record_failure(Duration::from_secs(1));
        hb.record_failure(Duration::from_secs(1));
        assert!(!hb.threshold_reached());
        hb.record_failure(Duration::from_secs(1));
        assert!(hb.threshold_reached());

        hb.reset();
        assert!(!hb.threshold_reached());
        assert_eq!(hb.packet_loss_pct(), 0.0);
    }

    #[test]
    fn bandwidth_falls_back_to_last_known_then_assumed() {
        let mut hb = HeartbeatMonitor::new(10, 3, 5000);
        assert_eq!(hb.bandwidth_kbps(), 5000);

        let obs = hb.record_success(Duration::from_millis(15), Some(800));
        assert_eq!(obs.bandwidth_kbps, 800);

        let obs = hb.record_success(Duration::from_millis(15), None);
        assert_eq!(obs.bandwidth_kbps, 800);

        hb.reset();
        assert_eq!(hb.bandwidth_kbps(), 800);
    }
}
