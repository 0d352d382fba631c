// =============================================================================
// Candle & Series Key: the unit of data and its routing identity
// =============================================================================
//
// Every path that touches a series (store writes, store reads, stream routing,
// client subscriptions) builds its key through `SeriesKey::new`, so the symbol
// and interval are normalised identically everywhere:
//
//   symbol   → trimmed, upper-case   ("btcusdt " → "BTCUSDT")
//   interval → trimmed, lower-case   ("1D" → "1d", "" → "1m")
//
// Candle times are bucket starts in **seconds** since the UNIX epoch. The
// millisecond representation only exists at the wire boundary.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Prefix of every store key (`candles:<SYMBOL>:<interval>`).
pub const STORE_KEY_PREFIX: &str = "candles";

/// Interval used when a caller passes an empty interval token.
pub const DEFAULT_INTERVAL: &str = "1m";

/// Interval token → bucket duration in seconds.
const INTERVAL_SECONDS: &[(&str, i64)] = &[
    ("1m", 60),
    ("3m", 180),
    ("5m", 300),
    ("15m", 900),
    ("30m", 1_800),
    ("1h", 3_600),
    ("2h", 7_200),
    ("4h", 14_400),
    ("6h", 21_600),
    ("8h", 28_800),
    ("12h", 43_200),
    ("1d", 86_400),
    ("3d", 259_200),
    ("1w", 604_800),
];

fn default_closed() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV bar. `time` is the natural key inside a series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    /// `false` while the bucket is still forming upstream.
    #[serde(rename = "is_closed", default = "default_closed")]
    pub closed: bool,
}

impl Candle {
    pub fn new(
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        closed: bool,
    ) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            closed,
        }
    }

    /// Bucket start in milliseconds, for millisecond-based consumers.
    pub fn time_ms(&self) -> i64 {
        self.time * 1000
    }
}

// ---------------------------------------------------------------------------
// Series key
// ---------------------------------------------------------------------------

/// Normalised `(symbol, interval)` identity of a candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(symbol: &str, interval: &str) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            interval: normalize_interval(interval),
        }
    }

    /// Bucket duration of this key's interval, if the interval is known.
    pub fn step_secs(&self) -> Option<i64> {
        interval_seconds(&self.interval)
    }

    /// Store key: `candles:BTCUSDT:1m`.
    pub fn store_key(&self) -> String {
        format!("{STORE_KEY_PREFIX}:{}:{}", self.symbol, self.interval)
    }

    /// Upstream stream name: `btcusdt@kline_1m`.
    pub fn stream_name(&self) -> String {
        format!("{}@kline_{}", self.symbol.to_lowercase(), self.interval)
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

pub fn normalize_interval(interval: &str) -> String {
    let iv = interval.trim();
    if iv.is_empty() {
        DEFAULT_INTERVAL.to_string()
    } else {
        iv.to_lowercase()
    }
}

/// Duration in seconds of a (normalised) interval token.
pub fn interval_seconds(interval: &str) -> Option<i64> {
    INTERVAL_SECONDS
        .iter()
        .find(|(token, _)| *token == interval)
        .map(|(_, secs)| *secs)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalisation_is_shared_by_all_paths() {
        let a = SeriesKey::new(" btcusdt", "1D");
        let b = SeriesKey::new("BTCUSDT", "1d ");
        assert_eq!(a, b);
        assert_eq!(a.store_key(), "candles:BTCUSDT:1d");
        assert_eq!(a.stream_name(), "btcusdt@kline_1d");
        assert_eq!(a.to_string(), "BTCUSDT@1d");
    }

    #[test]
    fn empty_interval_defaults_to_one_minute() {
        let key = SeriesKey::new("ethusdt", "");
        assert_eq!(key.interval, "1m");
        assert_eq!(key.step_secs(), Some(60));
    }

    #[test]
    fn interval_table_lookups() {
        assert_eq!(interval_seconds("5m"), Some(300));
        assert_eq!(interval_seconds("4h"), Some(14_400));
        assert_eq!(interval_seconds("1w"), Some(604_800));
        assert_eq!(interval_seconds("7m"), None);
    }

    #[test]
    fn missing_closed_flag_reads_as_closed() {
        let json = r#"{"time":60,"open":1.0,"high":2.0,"low":0.5,"close":1.5,"volume":10.0}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert!(candle.closed);
        assert_eq!(candle.time_ms(), 60_000);

        let out = serde_json::to_value(&candle).unwrap();
        assert_eq!(out["is_closed"], serde_json::json!(true));
        assert!(out.get("closed").is_none());
    }
}
