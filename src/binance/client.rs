// =============================================================================
// Binance REST Client: public kline history
// =============================================================================
//
// Only the unsigned market-data endpoint is used:
//
//   GET /api/v3/klines?symbol=&interval=[&startTime=&endTime=]&limit=
//
// The endpoint returns at most 1 000 rows per call; paging is the caller's
// job (see `market_data::backfill`).
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::market_data::backfill::{HistorySource, KlineWindow};
use crate::market_data::{Candle, SeriesKey};

/// Default REST base used when the config does not override it.
pub const DEFAULT_REST_BASE: &str = "https://api.binance.com";

/// Per-request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Binance public REST client.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client against `base_url` (e.g. `https://api.binance.com`).
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");
        Ok(Self { base_url, client })
    }

    /// Full request URL for one kline window.
    fn klines_url(&self, key: &SeriesKey, window: KlineWindow) -> String {
        match window {
            KlineWindow::Recent { limit } => format!(
                "{}/api/v3/klines?symbol={}&interval={}&limit={}",
                self.base_url, key.symbol, key.interval, limit
            ),
            KlineWindow::Range {
                start_sec,
                end_sec,
                limit,
            } => format!(
                "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
                self.base_url,
                key.symbol,
                key.interval,
                start_sec * 1000,
                end_sec * 1000,
                limit
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public, no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, ...
    #[instrument(skip(self), name = "binance::get_klines", fields(key = %key))]
    pub async fn get_klines(&self, key: &SeriesKey, window: KlineWindow) -> Result<Vec<Candle>> {
        let url = self.klines_url(key, window);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_kline_rows(&body, chrono::Utc::now().timestamp_millis())?;
        debug!(count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

#[async_trait]
impl HistorySource for BinanceClient {
    async fn fetch_klines(&self, key: &SeriesKey, window: KlineWindow) -> Result<Vec<Candle>> {
        self.get_klines(key, window).await
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Row decoding
// -----------------------------------------------------------------------------

/// Decode the array-of-arrays kline response into candles. A row whose close
/// time is still in the future (relative to `now_ms`) is the forming bucket.
pub fn parse_kline_rows(body: &serde_json::Value, now_ms: i64) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let arr = entry.as_array().context("kline entry is not an array")?;

        if arr.len() < 6 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time_ms = arr[0].as_i64().context("kline openTime is not an integer")?;
        let open = parse_str_f64(&arr[1])?;
        let high = parse_str_f64(&arr[2])?;
        let low = parse_str_f64(&arr[3])?;
        let close = parse_str_f64(&arr[4])?;
        let volume = parse_str_f64(&arr[5])?;
        let closed = arr
            .get(6)
            .and_then(serde_json::Value::as_i64)
            .map_or(true, |close_time_ms| close_time_ms <= now_ms);

        candles.push(Candle::new(
            open_time_ms.div_euclid(1000),
            open,
            high,
            low,
            close,
            volume,
            closed,
        ));
    }
    Ok(candles)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_convert_to_second_candles() {
        let body = json!([
            [1700000000000_i64, "37000.10", "37050.00", "36990.00", "37020.00", "123.4", 1700000059999_i64, "0", 10],
            [1700000060000_i64, 37020.0, 37030.0, 37000.0, 37010.0, 5.5, 1700000119999_i64, "0", 3]
        ]);
        let candles = parse_kline_rows(&body, 1700000100000).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1_700_000_000);
        assert!((candles[0].open - 37000.10).abs() < 1e-9);
        assert!(candles[0].closed);
        assert_eq!(candles[1].time, 1_700_000_060);
        assert!((candles[1].volume - 5.5).abs() < 1e-9);
        // closeTime is after "now", so still forming.
        assert!(!candles[1].closed);
    }

    #[test]
    fn short_rows_are_skipped_and_missing_close_time_is_closed() {
        let body = json!([[1, "1"], [120000, "1", "2", "0.5", "1.5", "9"]]);
        let candles = parse_kline_rows(&body, 0).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].time, 120);
        assert!(candles[0].closed);
    }

    #[test]
    fn non_array_body_is_an_error() {
        let body = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_kline_rows(&body, 0).is_err());
        assert!(parse_kline_rows(&json!([["x", "1", "2", "3", "4", "5"]]), 0).is_err());
    }

    #[test]
    fn urls_carry_millisecond_bounds() {
        let client = BinanceClient::new("https://api.binance.com/").unwrap();
        let key = SeriesKey::new("btcusdt", "1m");

        let url = client.klines_url(
            &key,
            KlineWindow::Range {
                start_sec: 280,
                end_sec: 340,
                limit: 2,
            },
        );
        assert_eq!(
            url,
            "https://api.binance.com/api/v3/klines?symbol=BTCUSDT&interval=1m&startTime=280000&endTime=340000&limit=2"
        );

        let url = client.klines_url(&key, KlineWindow::Recent { limit: 1000 });
        assert!(url.ends_with("symbol=BTCUSDT&interval=1m&limit=1000"));
    }
}
