// =============================================================================
// Runtime Configuration - pipeline settings with atomic save
// =============================================================================
//
// Every tunable of the pipeline lives here: instrument, endpoints, paging and
// retry budget, stream reconnect delay, level-detection defaults and the HTTP
// bind address.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry a serde default so an older or partial config file
// still loads.
//
// =============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::fetcher::{is_supported_bar, RetryPolicy, MAX_PAGE_LIMIT, SUPPORTED_BARS};
use crate::indicators::LevelParams;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_inst_id() -> String {
    "ETH-USDT".to_string()
}

fn default_bar() -> String {
    "1m".to_string()
}

fn default_rest_url() -> String {
    "https://www.okx.com/api/v5/market/candles".to_string()
}

fn default_ws_url() -> String {
    "wss://ws.okx.com:8443/ws/v5/market".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_page_limit() -> usize {
    MAX_PAGE_LIMIT
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    20
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_eps_multiplier() -> f64 {
    1.2
}

fn default_min_hits() -> usize {
    2
}

fn default_second_bar_capacity() -> usize {
    300
}

fn default_backfill_days() -> u32 {
    30
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Instrument ---------------------------------------------------------

    /// Instrument id, e.g. `ETH-USDT`.
    #[serde(default = "default_inst_id")]
    pub inst_id: String,

    /// Candle interval for the historical series, e.g. `1m`.
    #[serde(default = "default_bar")]
    pub bar: String,

    // --- Endpoints ----------------------------------------------------------

    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    /// Optional proxy URL for REST requests only.
    #[serde(default)]
    pub rest_proxy: Option<String>,

    // --- Historical fetch ---------------------------------------------------

    /// Directory holding one cache file per (instrument, interval).
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Rows requested per page, 1..=300.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// Attempts per page before the fetch is aborted.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Fetch the last `backfill_days` days when the process starts.
    #[serde(default = "default_true")]
    pub backfill_on_start: bool,

    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,

    // --- Streams ------------------------------------------------------------

    /// Delay before a dropped stream reconnects.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Completed one-second bars retained for readers.
    #[serde(default = "default_second_bar_capacity")]
    pub second_bar_capacity: usize,

    // --- Levels -------------------------------------------------------------

    #[serde(default = "default_eps_multiplier")]
    pub eps_multiplier: f64,

    #[serde(default = "default_min_hits")]
    pub min_hits: usize,

    // --- HTTP API -----------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            inst_id: default_inst_id(),
            bar: default_bar(),
            rest_url: default_rest_url(),
            ws_url: default_ws_url(),
            rest_proxy: None,
            cache_dir: default_cache_dir(),
            page_limit: default_page_limit(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            backfill_on_start: true,
            backfill_days: default_backfill_days(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            second_bar_capacity: default_second_bar_capacity(),
            eps_multiplier: default_eps_multiplier(),
            min_hits: default_min_hits(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            inst_id = %config.inst_id,
            bar = %config.bar,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Apply `PIPELINE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = lookup("PIPELINE_INST_ID") {
            self.inst_id = v;
        }
        if let Some(v) = lookup("PIPELINE_BAR") {
            self.bar = v;
        }
        if let Some(v) = lookup("PIPELINE_REST_PROXY") {
            self.rest_proxy = Some(v);
        }
        if let Some(v) = lookup("PIPELINE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PIPELINE_BIND_ADDR") {
            self.bind_addr = v;
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.inst_id.is_empty(), "inst_id must not be empty");
        anyhow::ensure!(
            is_supported_bar(&self.bar),
            "bar must be one of {SUPPORTED_BARS:?}, got {:?}",
            self.bar
        );
        anyhow::ensure!(
            (1..=MAX_PAGE_LIMIT).contains(&self.page_limit),
            "page_limit must be within 1..={MAX_PAGE_LIMIT}, got {}",
            self.page_limit
        );
        anyhow::ensure!(self.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(self.request_timeout_secs >= 1, "request_timeout_secs must be at least 1");
        anyhow::ensure!(self.second_bar_capacity >= 1, "second_bar_capacity must be at least 1");
        anyhow::ensure!(self.backfill_days >= 1, "backfill_days must be at least 1");
        self.level_params()
            .validate()
            .context("invalid level detection defaults")?;
        self.socket_addr()?;
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn level_params(&self) -> LevelParams {
        LevelParams {
            eps_multiplier: self.eps_multiplier,
            min_hits: self.min_hits,
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.bind_addr
            .parse()
            .with_context(|| format!("invalid bind_addr {}", self.bind_addr))
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.inst_id, "ETH-USDT");
        assert_eq!(cfg.bar, "1m");
        assert_eq!(cfg.page_limit, 300);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.request_timeout_secs, 20);
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(cfg.second_bar_capacity, 300);
        assert_eq!(cfg.backfill_days, 30);
        assert_eq!(cfg.level_params(), LevelParams::default());
        assert!(cfg.rest_proxy.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "inst_id": "BTC-USDT", "min_hits": 3 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.inst_id, "BTC-USDT");
        assert_eq!(cfg.min_hits, 3);
        assert_eq!(cfg.bar, "1m");
        assert!(cfg.backfill_on_start);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline_config.json");

        let cfg = RuntimeConfig {
            inst_id: "SOL-USDT".into(),
            retry_delay_ms: 250,
            ..RuntimeConfig::default()
        };
        cfg.save(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(RuntimeConfig::load(&path).unwrap(), cfg);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RuntimeConfig::load(dir.path().join("nope.json")).is_err());
    }

    #[test]
    fn env_overrides_apply_non_empty_values() {
        let env: HashMap<&str, &str> = [
            ("PIPELINE_INST_ID", "BTC-USDT"),
            ("PIPELINE_BAR", " "),
            ("PIPELINE_REST_PROXY", "http://127.0.0.1:7890"),
            ("PIPELINE_BIND_ADDR", "0.0.0.0:8080"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.inst_id, "BTC-USDT");
        assert_eq!(cfg.bar, "1m");
        assert_eq!(cfg.rest_proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(cfg.cache_dir, PathBuf::from("cache"));
        assert_eq!(cfg.socket_addr().unwrap().port(), 8080);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let bad = [
            RuntimeConfig { page_limit: 0, ..Default::default() },
            RuntimeConfig { page_limit: 301, ..Default::default() },
            RuntimeConfig { max_attempts: 0, ..Default::default() },
            RuntimeConfig { eps_multiplier: 0.0, ..Default::default() },
            RuntimeConfig { min_hits: 0, ..Default::default() },
            RuntimeConfig { bind_addr: "localhost".into(), ..Default::default() },
            RuntimeConfig { inst_id: String::new(), ..Default::default() },
            RuntimeConfig { bar: "../1m".into(), ..Default::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "{cfg:?} should be rejected");
        }
    }

    #[test]
    fn retry_policy_from_config() {
        let cfg = RuntimeConfig { max_attempts: 5, retry_delay_ms: 20, ..Default::default() };
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay, Duration::from_millis(20));
    }
}
