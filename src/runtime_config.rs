// =============================================================================
// Runtime Configuration: relay settings from file and environment
// =============================================================================
//
// Resolution order (later wins):
//
//   1. Built-in defaults.
//   2. `candle_relay.json` (if present). All fields carry `#[serde(default)]`
//      so a partial file only overrides what it names.
//   3. Environment variables (`.env` is loaded by main before this runs):
//        RELAY_SYMBOLS, RELAY_INTERVALS   comma-separated lists
//        USE_MEMORY_STORE                 1 | true | yes → memory backend
//        REDIS_URL, RELAY_BUFFER_SIZE, RELAY_BIND_ADDR
//
// After resolution every symbol and interval is normalised exactly like a
// `SeriesKey`, and intervals without a known duration are dropped.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::binance::client::DEFAULT_REST_BASE;
use crate::market_data::candle::{interval_seconds, normalize_interval, normalize_symbol};
use crate::market_data::kline_stream::{IngestSettings, DEFAULT_WS_BASE};
use crate::market_data::store::DEFAULT_CAPACITY;
use crate::market_data::SeriesKey;
use crate::types::StoreBackend;

/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "candle_relay.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    [
        "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "LTCUSDT", "ADAUSDT", "ALGOUSDT",
        "ATOMUSDT", "MATICUSDT",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_intervals() -> Vec<String> {
    ["1m", "5m", "15m", "1h", "4h", "1d"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_buffer_size() -> usize {
    DEFAULT_CAPACITY
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_BASE.to_string()
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE.to_string()
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Series -------------------------------------------------------------

    /// Instruments to ingest.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Intervals ingested for every symbol.
    #[serde(default = "default_intervals")]
    pub intervals: Vec<String>,

    /// Candles kept per series.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    // --- Storage ------------------------------------------------------------

    #[serde(default)]
    pub store_backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    // --- Upstream -----------------------------------------------------------

    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// Extra silence tolerated after a missed ping interval.
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,

    // --- API ----------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            intervals: default_intervals(),
            buffer_size: default_buffer_size(),
            store_backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "runtime config loaded");
        Ok(config)
    }

    /// File (or defaults) + process environment, normalised.
    pub fn resolve(path: impl AsRef<Path>) -> Self {
        let mut config = match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "using default runtime config");
                Self::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        config.normalise();
        config
    }

    /// Apply environment-style overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("RELAY_SYMBOLS") {
            self.symbols = split_list(&list);
        }
        if let Some(list) = lookup("RELAY_INTERVALS") {
            self.intervals = split_list(&list);
        }
        if let Some(flag) = lookup("USE_MEMORY_STORE") {
            match flag.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" => self.store_backend = StoreBackend::Memory,
                "0" | "false" | "no" | "" => self.store_backend = StoreBackend::Redis,
                other => warn!(value = %other, "ignoring unrecognised USE_MEMORY_STORE"),
            }
        }
        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        }
        if let Some(size) = lookup("RELAY_BUFFER_SIZE") {
            match size.trim().parse::<usize>() {
                Ok(size) => self.buffer_size = size,
                Err(e) => warn!(value = %size, error = %e, "ignoring invalid RELAY_BUFFER_SIZE"),
            }
        }
        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }

    /// Normalise symbols and intervals; drop unknown intervals and duplicates.
    pub fn normalise(&mut self) {
        let mut symbols: Vec<String> = Vec::new();
        for symbol in self.symbols.iter().map(|s| normalize_symbol(s)) {
            if !symbol.is_empty() && !symbols.contains(&symbol) {
                symbols.push(symbol);
            }
        }
        self.symbols = symbols;

        let mut intervals: Vec<String> = Vec::new();
        for interval in self.intervals.iter().map(|s| normalize_interval(s)) {
            if interval_seconds(&interval).is_none() {
                warn!(interval = %interval, "dropping unsupported interval");
                continue;
            }
            if !intervals.contains(&interval) {
                intervals.push(interval);
            }
        }
        self.intervals = intervals;

        if self.buffer_size == 0 {
            warn!("buffer_size of 0 raised to 1");
            self.buffer_size = 1;
        }
    }

    /// Every configured `(symbol, interval)` pair.
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.symbols
            .iter()
            .flat_map(|symbol| {
                self.intervals
                    .iter()
                    .map(move |interval| SeriesKey::new(symbol, interval))
            })
            .collect()
    }

    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            ws_base: self.ws_base_url.clone(),
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs),
        }
    }
}

fn split_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 10);
        assert_eq!(cfg.symbols[0], "BTCUSDT");
        assert_eq!(cfg.symbols[9], "MATICUSDT");
        assert_eq!(cfg.intervals, vec!["1m", "5m", "15m", "1h", "4h", "1d"]);
        assert_eq!(cfg.buffer_size, 1000);
        assert_eq!(cfg.store_backend, StoreBackend::Redis);
        assert_eq!(cfg.redis_url, "redis://localhost:6379");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");

        let settings = cfg.ingest_settings();
        assert_eq!(settings.reconnect_delay, Duration::from_secs(5));
        assert_eq!(settings.ping_interval, Duration::from_secs(20));
        assert_eq!(settings.ping_timeout, Duration::from_secs(10));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 10);
        assert_eq!(cfg.buffer_size, 1000);
        assert_eq!(cfg.rest_base_url, "https://api.binance.com");
        assert_eq!(cfg.ws_base_url, "wss://stream.binance.com:9443");
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "store_backend": "Memory", "symbols": ["ETHUSDT"] }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.intervals.len(), 6);
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(env(&[
            ("RELAY_SYMBOLS", "btcusdt, ethusdt ,"),
            ("RELAY_INTERVALS", "1m,5m"),
            ("USE_MEMORY_STORE", "Yes"),
            ("REDIS_URL", "redis://cache:6380"),
            ("RELAY_BUFFER_SIZE", "250"),
            ("RELAY_BIND_ADDR", "127.0.0.1:9000"),
        ]));
        assert_eq!(cfg.symbols, vec!["btcusdt", "ethusdt"]);
        assert_eq!(cfg.intervals, vec!["1m", "5m"]);
        assert_eq!(cfg.store_backend, StoreBackend::Memory);
        assert_eq!(cfg.redis_url, "redis://cache:6380");
        assert_eq!(cfg.buffer_size, 250);
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
    }

    #[test]
    fn invalid_buffer_size_is_ignored() {
        let mut cfg = RuntimeConfig::default();
        cfg.apply_overrides(env(&[("RELAY_BUFFER_SIZE", "lots")]));
        assert_eq!(cfg.buffer_size, 1000);
    }

    #[test]
    fn normalise_drops_unknown_intervals_and_duplicates() {
        let mut cfg = RuntimeConfig {
            symbols: vec!["btcusdt".into(), "BTCUSDT ".into(), "".into()],
            intervals: vec!["1M".into(), "7m".into(), "1m".into(), "1D".into()],
            buffer_size: 0,
            ..RuntimeConfig::default()
        };
        cfg.normalise();
        assert_eq!(cfg.symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.intervals, vec!["1m", "1d"]);
        assert_eq!(cfg.buffer_size, 1);
    }

    #[test]
    fn series_keys_cover_every_pair() {
        let cfg = RuntimeConfig {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            intervals: vec!["1m".into(), "1h".into()],
            ..RuntimeConfig::default()
        };
        let keys: Vec<String> = cfg.series_keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["BTCUSDT@1m", "BTCUSDT@1h", "ETHUSDT@1m", "ETHUSDT@1h"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/nonexistent/candle_relay.json").is_err());
    }
}
