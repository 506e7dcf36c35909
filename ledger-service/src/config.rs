use ledger_client::domain::CalculationMethod;
use serde::Deserialize;
use std::{fs, time::Duration};
use time::UtcOffset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default)]
    pub uri: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            uri: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_bind")]
    pub http_bind_addr: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_request_records")]
    pub max_request_records: usize,
    #[serde(default = "default_drift_threshold_secs")]
    pub drift_threshold_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_gap_heartbeat_multiple")]
    pub gap_heartbeat_multiple: u32,
    /// Attempts per telemetry append after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            http_bind_addr: default_ingest_bind(),
            channel_capacity: default_channel_capacity(),
            workers: default_workers(),
            max_request_records: default_max_request_records(),
            drift_threshold_secs: default_drift_threshold_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            gap_heartbeat_multiple: default_gap_heartbeat_multiple(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl IngestConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Rate applied when no cost version is effective for an entry.
    #[serde(default = "default_cost_per_kwh")]
    pub default_cost_per_kwh: f64,
    /// Open intervals of heartbeating devices silent for longer than this are
    /// force-closed. Disabled when unset.
    #[serde(default)]
    pub offline_timeout_secs: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
            default_cost_per_kwh: default_cost_per_kwh(),
            offline_timeout_secs: None,
        }
    }
}

impl LedgerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Fixed offset defining local day and month boundaries, e.g. "+05:30".
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_aggregation_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_catchup_days")]
    pub catchup_days: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            interval_secs: default_aggregation_interval_secs(),
            catchup_days: default_catchup_days(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl AggregationConfig {
    pub fn offset(&self) -> anyhow::Result<UtcOffset> {
        parse_utc_offset(&self.utc_offset)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_gap_threshold_secs")]
    pub gap_threshold_secs: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            gap_threshold_secs: default_gap_threshold_secs(),
            lookback_days: default_lookback_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_api_bind(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    pub switch_id: String,
    /// Rated power of the connected load.
    #[serde(default)]
    pub power_w: Option<f64>,
    #[serde(default = "default_method")]
    pub method: CalculationMethod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub classroom: Option<String>,
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("LEDGER_CONFIG").unwrap_or_else(|_| "ledger-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let mut cfg = Self::from_toml_str(&contents)?;

        if let Ok(url) = env::var("DATABASE_URL") {
            cfg.store.uri = url;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.aggregation.offset()?;
        if !self.ledger.default_cost_per_kwh.is_finite() || self.ledger.default_cost_per_kwh < 0.0 {
            anyhow::bail!("ledger.default_cost_per_kwh must be a non-negative number");
        }
        for device in &self.devices {
            for switch in &device.switches {
                if let Some(p) = switch.power_w {
                    if !p.is_finite() || p < 0.0 {
                        anyhow::bail!(
                            "device {} switch {}: power_w must be a non-negative number",
                            device.device_id,
                            switch.switch_id
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parses `+HH:MM` / `-HH:MM` (or `Z`).
pub fn parse_utc_offset(s: &str) -> anyhow::Result<UtcOffset> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
        return Ok(UtcOffset::UTC);
    }

    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1i8, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1i8, rest)
    } else {
        anyhow::bail!("invalid utc offset '{s}': expected +HH:MM or -HH:MM");
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("invalid utc offset '{s}': expected +HH:MM or -HH:MM"))?;
    let hours: i8 = hours
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid utc offset hours in '{s}': {e}"))?;
    let minutes: i8 = minutes
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid utc offset minutes in '{s}': {e}"))?;

    UtcOffset::from_hms(sign * hours, sign * minutes, 0)
        .map_err(|e| anyhow::anyhow!("invalid utc offset '{s}': {e}"))
}

fn default_max_connections() -> u32 {
    8
}

fn default_ingest_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_max_request_records() -> usize {
    500
}

fn default_drift_threshold_secs() -> u64 {
    300
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_gap_heartbeat_multiple() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_cost_per_kwh() -> f64 {
    7.5
}

fn default_utc_offset() -> String {
    "+05:30".to_string()
}

fn default_aggregation_interval_secs() -> u64 {
    60
}

fn default_catchup_days() -> u32 {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_reconcile_interval_secs() -> u64 {
    3600
}

fn default_gap_threshold_secs() -> u64 {
    6 * 3600
}

fn default_lookback_days() -> u32 {
    7
}

fn default_api_bind() -> String {
    "0.0.0.0:8081".to_string()
}

fn default_method() -> CalculationMethod {
    CalculationMethod::PowerIntegration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = AppConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.store.kind, StoreKind::Memory);
        assert_eq!(cfg.ledger.default_cost_per_kwh, 7.5);
        assert_eq!(cfg.ingest.heartbeat_interval_secs, 60);
        assert_eq!(cfg.aggregation.offset().unwrap(), UtcOffset::from_hms(5, 30, 0).unwrap());
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn devices_and_switches_parse() {
        let cfg = AppConfig::from_toml_str(
            r#"
            [store]
            kind = "postgres"
            uri = "postgres://localhost/ledger"

            [[devices]]
            device_id = "esp-101"
            classroom = "room-101"

            [[devices.switches]]
            switch_id = "1"
            power_w = 60.0

            [[devices.switches]]
            switch_id = "2"
            method = "cumulative_meter"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.store.kind, StoreKind::Postgres);
        assert_eq!(cfg.devices.len(), 1);
        let switches = &cfg.devices[0].switches;
        assert_eq!(switches[0].power_w, Some(60.0));
        assert_eq!(switches[0].method, CalculationMethod::PowerIntegration);
        assert_eq!(switches[1].method, CalculationMethod::CumulativeMeter);
        assert_eq!(switches[1].power_w, None);
    }

    #[test]
    fn negative_ratings_are_refused() {
        let err = AppConfig::from_toml_str(
            r#"
            [[devices]]
            device_id = "esp-1"
            [[devices.switches]]
            switch_id = "1"
            power_w = -5.0
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn offsets_parse_with_sign() {
        assert_eq!(parse_utc_offset("-03:30").unwrap(), UtcOffset::from_hms(-3, -30, 0).unwrap());
        assert_eq!(parse_utc_offset("Z").unwrap(), UtcOffset::UTC);
        assert!(parse_utc_offset("0530").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }
}
