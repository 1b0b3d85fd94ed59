//! Configuration management for the momentum services.
//!
//! All services share one configuration directory at `~/.momentum/`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (MOMENTUM_* prefix)
//! 2. Explicit config file values (`config.json`, `secrets.json`)
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `MOMENTUM_LOG_LEVEL` → observability.log_level
//! - `MOMENTUM_LOG_FORMAT` → observability.log_format
//! - `MOMENTUM_API_BASE_URL` → market_data.base_url
//! - `MOMENTUM_REDIS_URL` → cache.redis_url
//! - `MOMENTUM_DB_PATH` → storage.db_path
//! - `MOMENTUM_PRICE_THRESHOLD` → qualification.price_threshold_pct
//! - `MOMENTUM_OI_THRESHOLD` → qualification.oi_threshold_pct
//! - `MOMENTUM_SNAPSHOT_CUTOFF` → snapshot.cutoff_time

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_loader::load_modular_config;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".momentum"),
        |dirs| dirs.home_dir().join(".momentum"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration shared by every momentum service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Upstream market data API configuration
    #[serde(default)]
    pub market_data: MarketDataConfig,

    /// Qualification thresholds
    #[serde(default)]
    pub qualification: QualificationConfig,

    /// Daily snapshot configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Two-tier cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Relational storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Credential resolution configuration
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

impl Config {
    /// Load configuration from the default directory.
    pub fn load() -> Result<Self> {
        let dir = config_dir();
        if !dir.join("config.json").exists() && !dir.join("secrets.json").exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }

        let value = load_modular_config(Some(dir.clone()))?;
        serde_json::from_value(value)
            .with_context(|| format!("Failed to parse config from {}", dir.display()))
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("MOMENTUM_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("MOMENTUM_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(url) = std::env::var("MOMENTUM_API_BASE_URL") {
            self.market_data.base_url = url;
        }
        if let Ok(url) = std::env::var("MOMENTUM_REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Ok(path) = std::env::var("MOMENTUM_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Ok(value) = std::env::var("MOMENTUM_PRICE_THRESHOLD") {
            if let Ok(v) = value.parse() {
                self.qualification.price_threshold_pct = v;
            }
        }
        if let Ok(value) = std::env::var("MOMENTUM_OI_THRESHOLD") {
            if let Ok(v) = value.parse() {
                self.qualification.oi_threshold_pct = v;
            }
        }
        if let Ok(cutoff) = std::env::var("MOMENTUM_SNAPSHOT_CUTOFF") {
            self.snapshot.cutoff_time = cutoff;
        }
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.qualification.price_threshold_pct <= 0.0 {
            bail!("qualification.price_threshold_pct must be positive");
        }
        if self.qualification.oi_threshold_pct <= 0.0 {
            bail!("qualification.oi_threshold_pct must be positive");
        }
        if self.market_data.batch_size == 0 {
            bail!("market_data.batch_size must be at least 1");
        }
        if self.market_data.max_attempts == 0 {
            bail!("market_data.max_attempts must be at least 1");
        }
        self.snapshot.cutoff()?;
        Ok(())
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Market Data
// ============================================================================

/// Upstream market data API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    /// API base URL (no trailing slash)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Minimum spacing between quote-class calls, in milliseconds
    #[serde(default = "default_quote_interval_ms")]
    pub quote_interval_ms: u64,

    /// Minimum spacing between historical chart calls, in milliseconds
    #[serde(default = "default_historical_interval_ms")]
    pub historical_interval_ms: u64,

    /// Total attempts per outbound call (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay in milliseconds, doubled on every further retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum identifiers per quote call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Transport timeout per request, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Calendar days to walk back when looking for the previous session
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Intraday candle interval (minutes) used for the lookback
    #[serde(default = "default_intraday_interval")]
    pub intraday_interval: String,
}

impl MarketDataConfig {
    pub fn quote_interval(&self) -> Duration {
        Duration::from_millis(self.quote_interval_ms)
    }

    pub fn historical_interval(&self) -> Duration {
        Duration::from_millis(self.historical_interval_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            quote_interval_ms: default_quote_interval_ms(),
            historical_interval_ms: default_historical_interval_ms(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            batch_size: default_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            lookback_days: default_lookback_days(),
            intraday_interval: default_intraday_interval(),
        }
    }
}

// ============================================================================
// Qualification
// ============================================================================

/// Thresholds applied by the sector and stock engines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualificationConfig {
    /// Minimum absolute price move (percent)
    #[serde(default = "default_price_threshold")]
    pub price_threshold_pct: f64,

    /// Minimum absolute open-interest change versus previous day (percent)
    #[serde(default = "default_oi_threshold")]
    pub oi_threshold_pct: f64,

    /// Fetch previous-day OHLC and classify breakouts for price-qualified stocks
    #[serde(default = "default_true")]
    pub breakout_enrichment: bool,
}

impl Default for QualificationConfig {
    fn default() -> Self {
        Self {
            price_threshold_pct: default_price_threshold(),
            oi_threshold_pct: default_oi_threshold(),
            breakout_enrichment: true,
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Daily snapshot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Local (IST) time after which a completed snapshot is served frozen, "HH:MM"
    #[serde(default = "default_cutoff_time")]
    pub cutoff_time: String,

    /// Days of snapshots to keep
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Cron expression (IST) for snapshot creation
    #[serde(default = "default_create_cron")]
    pub create_cron: String,

    /// Cron expression (IST) for snapshot cleanup
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,
}

impl SnapshotConfig {
    /// Parse the configured cutoff time.
    pub fn cutoff(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.cutoff_time, "%H:%M")
            .with_context(|| format!("Invalid snapshot.cutoff_time: {}", self.cutoff_time))
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            cutoff_time: default_cutoff_time(),
            retention_days: default_retention_days(),
            create_cron: default_create_cron(),
            cleanup_cron: default_cleanup_cron(),
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Two-tier cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL for the L2 tier (L2 disabled when absent)
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix applied to every L2 key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Maximum L1 entries
    #[serde(default = "default_l1_capacity")]
    pub l1_capacity: usize,

    /// TTL used when a caller does not pass one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Ceiling applied to every L1 write
    #[serde(default = "default_l1_max_ttl_secs")]
    pub l1_max_ttl_secs: u64,

    /// Ceiling applied when an L2 hit is copied into L1
    #[serde(default = "default_l1_backfill_ttl_secs")]
    pub l1_backfill_ttl_secs: u64,

    #[serde(default = "default_ttl_secs")]
    pub sectors_ttl_secs: u64,

    #[serde(default = "default_ttl_secs")]
    pub stocks_ttl_secs: u64,

    /// Completed snapshots are immutable, so they can live for a day
    #[serde(default = "default_snapshot_ttl_secs")]
    pub snapshot_ttl_secs: u64,

    #[serde(default = "default_ohlc_ttl_secs")]
    pub ohlc_ttl_secs: u64,

    /// Upper bound on any single L2 command, connect included
    #[serde(default = "default_l2_timeout_ms")]
    pub l2_timeout_ms: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn l1_max_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_max_ttl_secs)
    }

    pub fn l1_backfill_ttl(&self) -> Duration {
        Duration::from_secs(self.l1_backfill_ttl_secs)
    }

    pub fn sectors_ttl(&self) -> Duration {
        Duration::from_secs(self.sectors_ttl_secs)
    }

    pub fn stocks_ttl(&self) -> Duration {
        Duration::from_secs(self.stocks_ttl_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs)
    }

    pub fn ohlc_ttl(&self) -> Duration {
        Duration::from_secs(self.ohlc_ttl_secs)
    }

    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            l1_capacity: default_l1_capacity(),
            default_ttl_secs: default_ttl_secs(),
            l1_max_ttl_secs: default_l1_max_ttl_secs(),
            l1_backfill_ttl_secs: default_l1_backfill_ttl_secs(),
            sectors_ttl_secs: default_ttl_secs(),
            stocks_ttl_secs: default_ttl_secs(),
            snapshot_ttl_secs: default_snapshot_ttl_secs(),
            ohlc_ttl_secs: default_ohlc_ttl_secs(),
            l2_timeout_ms: default_l2_timeout_ms(),
        }
    }
}

// ============================================================================
// Storage & Credentials
// ============================================================================

/// Relational storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Credential resolution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// How long a resolved credential is reused before the store is re-read
    #[serde(default = "default_credentials_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl CredentialsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_credentials_ttl_secs(),
        }
    }
}

// ============================================================================
// Defaults
// ============================================================================

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
fn default_base_url() -> String {
    "https://api.dhan.co".into()
}
fn default_quote_interval_ms() -> u64 {
    1100
}
fn default_historical_interval_ms() -> u64 {
    250
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_batch_size() -> usize {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_lookback_days() -> u32 {
    5
}
fn default_intraday_interval() -> String {
    "1".into()
}
fn default_price_threshold() -> f64 {
    1.0
}
fn default_oi_threshold() -> f64 {
    7.0
}
fn default_true() -> bool {
    true
}
fn default_cutoff_time() -> String {
    "09:25".into()
}
fn default_retention_days() -> u32 {
    7
}
fn default_create_cron() -> String {
    "0 25 9 * * 1-5".into()
}
fn default_cleanup_cron() -> String {
    "0 0 18 * * *".into()
}
fn default_key_prefix() -> String {
    "momentum:".into()
}
fn default_l1_capacity() -> usize {
    500
}
fn default_ttl_secs() -> u64 {
    60
}
fn default_l1_max_ttl_secs() -> u64 {
    300
}
fn default_l1_backfill_ttl_secs() -> u64 {
    30
}
fn default_snapshot_ttl_secs() -> u64 {
    86_400
}
fn default_ohlc_ttl_secs() -> u64 {
    43_200
}
fn default_l2_timeout_ms() -> u64 {
    500
}
fn default_db_path() -> PathBuf {
    config_dir().join("momentum.db")
}
fn default_credentials_ttl_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.market_data.quote_interval_ms, 1100);
        assert_eq!(config.market_data.max_attempts, 3);
        assert_eq!(config.market_data.backoff_base(), Duration::from_secs(1));
        assert_eq!(config.market_data.batch_size, 1000);
        assert!((config.qualification.price_threshold_pct - 1.0).abs() < f64::EPSILON);
        assert!((config.qualification.oi_threshold_pct - 7.0).abs() < f64::EPSILON);
        assert_eq!(config.snapshot.retention_days, 7);
        assert_eq!(config.cache.l1_capacity, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cutoff_parse() {
        let config = SnapshotConfig::default();
        assert_eq!(
            config.cutoff().unwrap(),
            NaiveTime::from_hms_opt(9, 25, 0).unwrap()
        );

        let bad = SnapshotConfig {
            cutoff_time: "9.25am".into(),
            ..Default::default()
        };
        assert!(bad.cutoff().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "qualification": { "price_threshold_pct": 2.5 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!((config.qualification.price_threshold_pct - 2.5).abs() < f64::EPSILON);
        assert!((config.qualification.oi_threshold_pct - 7.0).abs() < f64::EPSILON);
        assert!(config.qualification.breakout_enrichment);
        assert_eq!(config.snapshot.cutoff_time, "09:25");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.market_data.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.qualification.oi_threshold_pct = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "cache": { "redis_url": "redis://127.0.0.1:6379" } }"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
        assert_eq!(config.cache.snapshot_ttl(), Duration::from_secs(86_400));
    }
}
