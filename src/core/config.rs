use std::time::Duration;

use serde::Deserialize;

use super::quality::{QualityThresholds, ScoringBands};
use super::types::{LinkError, LinkResult};

/// Requests are never given less than this to complete.
pub const MIN_TIMEOUT_MS: u64 = 1000;

/// Quality scoring and history settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub thresholds: QualityThresholds,
    pub bands: ScoringBands,
    pub history_retention_minutes: u64,
    /// Number of recent heartbeat outcomes packet loss is computed over.
    pub loss_window: usize,
    /// Used until a transport reports bandwidth.
    pub assumed_bandwidth_kbps: u64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            thresholds: QualityThresholds::default(),
            bands: ScoringBands::default(),
            history_retention_minutes: 60,
            loss_window: 10,
            assumed_bandwidth_kbps: 5000,
        }
    }
}

impl QualityConfig {
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_minutes.saturating_mul(60))
    }
}

/// Client configuration, injected at construction.
///
/// Every field has a default, so a partial JSON document is a valid configuration:
///
/// ```
/// let cfg = shared_net::core::LinkConfig::from_json(r#"{"server_url":"https://meet.example.org"}"#)
///     .unwrap();
/// assert_eq!(cfg.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub server_url: Option<String>,
    pub api_base_path: String,
    pub passthrough_endpoints: Vec<String>,
    pub health_endpoint: String,
    pub heartbeat_endpoint: String,

    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_pending: usize,

    pub heartbeat_interval_ms: u64,
    pub connection_check_interval_ms: u64,
    pub max_missed_heartbeats: u32,

    pub sweep_interval_ms: u64,
    pub max_request_age_ms: u64,

    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_jitter: bool,

    pub quality: QualityConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_base_path: "/api/v1".to_string(),
            passthrough_endpoints: vec!["/health".to_string(), "/info".to_string()],
            health_endpoint: "/health".to_string(),
            heartbeat_endpoint: "/ping".to_string(),
            timeout_ms: 30_000,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_pending: 100,
            heartbeat_interval_ms: 60_000,
            connection_check_interval_ms: 30_000,
            max_missed_heartbeats: 3,
            sweep_interval_ms: 300_000,
            max_request_age_ms: 300_000,
            auto_reconnect: true,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 5,
            reconnect_jitter: false,
            quality: QualityConfig::default(),
        }
    }
}

fn require_positive(name: &str, value: u64) -> LinkResult<()> {
    if value == 0 {
        return Err(LinkError::Config(format!("{name} must be greater than zero")));
    }
    Ok(())
}

impl LinkConfig {
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    /// Parse a JSON document, apply clamps and validate.
    pub fn from_json(raw: &str) -> LinkResult<Self> {
        let mut cfg: LinkConfig = sonic_rs::from_str(raw)
            .map_err(|err| LinkError::Config(format!("invalid configuration JSON: {err}")))?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply clamps that are corrections rather than errors.
    pub fn normalize(&mut self) {
        self.timeout_ms = self.timeout_ms.max(MIN_TIMEOUT_MS);
        if self
            .server_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            self.server_url = None;
        }
    }

    pub fn validate(&self) -> LinkResult<()> {
        require_positive("heartbeat_interval_ms", self.heartbeat_interval_ms)?;
        require_positive("connection_check_interval_ms", self.connection_check_interval_ms)?;
        require_positive("sweep_interval_ms", self.sweep_interval_ms)?;
        require_positive("max_request_age_ms", self.max_request_age_ms)?;
        if self.max_pending == 0 {
            return Err(LinkError::Config("max_pending must be greater than zero".to_string()));
        }
        if self.max_missed_heartbeats == 0 {
            return Err(LinkError::Config(
                "max_missed_heartbeats must be greater than zero".to_string(),
            ));
        }
        if self.quality.loss_window == 0 {
            return Err(LinkError::Config(
                "quality.loss_window must be greater than zero".to_string(),
            ));
        }
        if self.health_endpoint.trim().is_empty() || self.heartbeat_endpoint.trim().is_empty() {
            return Err(LinkError::Config(
                "health and heartbeat endpoints must not be empty".to_string(),
            ));
        }
        self.quality.thresholds.validate()?;
        self.quality.bands.validate()?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(MIN_TIMEOUT_MS))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connection_check_interval(&self) -> Duration {
        Duration::from_millis(self.connection_check_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::from_millis(self.max_request_age_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Partial runtime update applied through `configure`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkSettings {
    pub server_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub heartbeat_interval_ms: Option<u64>,
    pub connection_check_interval_ms: Option<u64>,
}

impl LinkSettings {
    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = Some(ms);
        self
    }

    pub fn connection_check_interval_ms(mut self, ms: u64) -> Self {
        self.connection_check_interval_ms = Some(ms);
        self
    }

    /// Apply onto a copy of `base` and validate the result. `base` is untouched on error.
    pub fn apply_to(&self, base: &LinkConfig) -> LinkResult<LinkConfig> {
        let mut cfg = base.clone();
        if let Some(url) = &self.server_url {
            cfg.server_url = Some(url.clone());
        }
        if let Some(ms) = self.timeout_ms {
            cfg.timeout_ms = ms;
        }
        if let Some(retries) = self.max_retries {
            cfg.max_retries = retries;
        }
        if let Some(ms) = self.heartbeat_interval_ms {
            cfg.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.connection_check_interval_ms {
            cfg.connection_check_interval_ms = ms;
        }
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }
}
