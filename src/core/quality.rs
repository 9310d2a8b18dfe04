//! Link quality scoring.
//!
//! A score starts at 100 and loses a graduated penalty for each of latency, packet loss and
//! bandwidth. The score is then bucketed into a [`QualityLevel`] against configurable thresholds.

use std::fmt;

use serde::Deserialize;

use super::types::{LinkError, LinkResult};

/// Discrete quality bucket. Ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
pub enum QualityLevel {
    VeryPoor = 1,
    Poor = 2,
    Fair = 3,
    Good = 4,
    Excellent = 5,
}

impl QualityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityLevel::VeryPoor => "very_poor",
            QualityLevel::Poor => "poor",
            QualityLevel::Fair => "fair",
            QualityLevel::Good => "good",
            QualityLevel::Excellent => "excellent",
        }
    }

    /// User-facing text attached to a degradation warning when the link drops to this level.
    pub fn degradation_message(self) -> &'static str {
        match self {
            QualityLevel::VeryPoor => "Network quality is very poor. Connection may be unstable.",
            QualityLevel::Poor => "Network quality is poor. You may experience connection issues.",
            QualityLevel::Fair => "Network quality is fair. Some features may be affected.",
            QualityLevel::Good => "Network quality has degraded but remains good.",
            QualityLevel::Excellent => "Network quality is excellent.",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum score for each level. Anything below `poor` is `VeryPoor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    pub excellent: u8,
    pub good: u8,
    pub fair: u8,
    pub poor: u8,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            excellent: 90,
            good: 70,
            fair: 50,
            poor: 30,
        }
    }
}

impl QualityThresholds {
    pub fn validate(&self) -> LinkResult<()> {
        let ordered =
            self.excellent >= self.good && self.good >= self.fair && self.fair >= self.poor;
        if !ordered || self.excellent > 100 {
            return Err(LinkError::Config(format!(
                "quality thresholds must be non-increasing and <= 100 (got {}/{}/{}/{})",
                self.excellent, self.good, self.fair, self.poor
            )));
        }
        Ok(())
    }

    pub fn classify(&self, score: u8) -> QualityLevel {
        if score >= self.excellent {
            QualityLevel::Excellent
        } else if score >= self.good {
            QualityLevel::Good
        } else if score >= self.fair {
            QualityLevel::Fair
        } else if score >= self.poor {
            QualityLevel::Poor
        } else {
            QualityLevel::VeryPoor
        }
    }
}

/// One row of a penalty table: `penalty` applies when the metric crosses `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PenaltyBand {
    pub limit: f64,
    pub penalty: u8,
}

const fn band(limit: f64, penalty: u8) -> PenaltyBand {
    PenaltyBand { limit, penalty }
}

/// Penalty tables. Only the first matching row of each table applies.
///
/// Latency and loss rows match when the metric is strictly above `limit` and must be listed
/// from the highest limit down. Bandwidth rows match when the metric is strictly below `limit`
/// and must be listed from the lowest limit up.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ScoringBands {
    pub latency_ms: Vec<PenaltyBand>,
    pub packet_loss_pct: Vec<PenaltyBand>,
    pub bandwidth_kbps: Vec<PenaltyBand>,
}

impl Default for ScoringBands {
    fn default() -> Self {
        Self {
            latency_ms: vec![band(500.0, 40), band(200.0, 30), band(100.0, 20), band(50.0, 10)],
            packet_loss_pct: vec![band(10.0, 30), band(5.0, 20), band(2.0, 10), band(1.0, 5)],
            bandwidth_kbps: vec![
                band(100.0, 30),
                band(500.0, 20),
                band(1000.0, 10),
                band(2000.0, 5),
            ],
        }
    }
}

impl ScoringBands {
    pub fn validate(&self) -> LinkResult<()> {
        let descending = |rows: &[PenaltyBand]| rows.windows(2).all(|w| w[0].limit >= w[1].limit);
        let ascending = |rows: &[PenaltyBand]| rows.windows(2).all(|w| w[0].limit <= w[1].limit);

        if !descending(&self.latency_ms) {
            return Err(LinkError::Config(
                "latency bands must be ordered by descending limit".to_string(),
            ));
        }
        if !descending(&self.packet_loss_pct) {
            return Err(LinkError::Config(
                "packet loss bands must be ordered by descending limit".to_string(),
            ));
        }
        if !ascending(&self.bandwidth_kbps) {
            return Err(LinkError::Config(
                "bandwidth bands must be ordered by ascending limit".to_string(),
            ));
        }
        Ok(())
    }
}

fn penalty_above(rows: &[PenaltyBand], value: f64) -> u32 {
    rows.iter()
        .find(|row| value > row.limit)
        .map_or(0, |row| u32::from(row.penalty))
}

fn penalty_below(rows: &[PenaltyBand], value: f64) -> u32 {
    rows.iter()
        .find(|row| value < row.limit)
        .map_or(0, |row| u32::from(row.penalty))
}

/// Pure scoring function over the configured bands and thresholds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityScorer {
    bands: ScoringBands,
    thresholds: QualityThresholds,
}

impl QualityScorer {
    pub fn new(bands: ScoringBands, thresholds: QualityThresholds) -> Self {
        Self { bands, thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Score in `[0, 100]`. NaN metrics incur no penalty.
    pub fn score(&self, latency_ms: u64, packet_loss_pct: f64, bandwidth_kbps: u64) -> u8 {
        let penalty = penalty_above(&self.bands.latency_ms, latency_ms as f64)
            + penalty_above(&self.bands.packet_loss_pct, packet_loss_pct)
            + penalty_below(&self.bands.bandwidth_kbps, bandwidth_kbps as f64);
        100u32.saturating_sub(penalty).min(100) as u8
    }

    pub fn classify(&self, score: u8) -> QualityLevel {
        self.thresholds.classify(score)
    }

    pub fn assess(
        &self,
        latency_ms: u64,
        packet_loss_pct: f64,
        bandwidth_kbps: u64,
    ) -> (u8, QualityLevel) {
        let score = self.score(latency_ms, packet_loss_pct, bandwidth_kbps);
        (score, self.classify(score))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_link_scores_full_marks() {
        let scorer = QualityScorer::default();
        assert_eq!(scorer.assess(30, 0.0, 5000), (100, QualityLevel::Excellent));
    }

    #[test]
    fn only_first_matching_band_applies() {
        let scorer = QualityScorer::default();
        // 600ms hits the >500 row only.
        assert_eq!(scorer.score(600, 0.0, 5000), 60);
        // Band edges are strict.
        assert_eq!(scorer.score(500, 0.0, 5000), 70);
        assert_eq!(scorer.score(50, 1.0, 2000), 100);
        assert_eq!(scorer.score(51, 1.5, 1999), 80);
    }

    #[test]
    fn worst_case_clamps_to_zero_floor() {
        let scorer = QualityScorer::default();
        // 40 + 30 + 30 = 100 penalty.
        assert_eq!(scorer.assess(5000, 50.0, 10), (0, QualityLevel::VeryPoor));

        let harsh = ScoringBands {
            latency_ms: vec![band(0.0, 90)],
            packet_loss_pct: vec![band(0.0, 90)],
            bandwidth_kbps: Vec::new(),
        };
        let scorer = QualityScorer::new(harsh, QualityThresholds::default());
        assert_eq!(scorer.score(10, 1.0, 0), 0);
    }

    #[test]
    fn classify_is_monotonic_in_score() {
        let thresholds = QualityThresholds::default();
        let mut previous = thresholds.classify(0);
        for score in 1..=100u8 {
            let level = thresholds.classify(score);
            assert!(level >= previous, "score {score} classified below {previous}");
            previous = level;
        }
        assert_eq!(thresholds.classify(90), QualityLevel::Excellent);
        assert_eq!(thresholds.classify(89), QualityLevel::Good);
        assert_eq!(thresholds.classify(50), QualityLevel::Fair);
        assert_eq!(thresholds.classify(30), QualityLevel::Poor);
        assert_eq!(thresholds.classify(29), QualityLevel::VeryPoor);
    }

    #[test]
    fn misordered_thresholds_are_rejected() {
        let thresholds = QualityThresholds {
            excellent: 60,
            good: 70,
            fair: 50,
            poor: 30,
        };
        assert!(matches!(thresholds.validate(), Err(LinkError::Config(_))));
        assert!(QualityThresholds::default().validate().is_ok());
        assert!(ScoringBands::default().validate().is_ok());

        let bands = ScoringBands {
            bandwidth_kbps: vec![band(1000.0, 10), band(100.0, 30)],
            ..ScoringBands::default()
        };
        assert!(bands.validate().is_err());
    }

    #[test]
    fn levels_order_from_worst_to_best() {
        assert!(QualityLevel::VeryPoor < QualityLevel::Poor);
        assert!(QualityLevel::Good < QualityLevel::Excellent);
        assert_eq!(QualityLevel::Fair as u8, 3);
    }
}
