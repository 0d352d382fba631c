// =============================================================================
// Backfill Client: historical candles for bootstrap and gap repair
// =============================================================================
//
// Wraps a `HistorySource` (the Binance REST client in production, a fake in
// tests) and adds the behaviour every caller relies on:
//
//   - Range requests are split into pages of at most `MAX_PAGE_ROWS` buckets.
//   - Rows outside the requested range are dropped; the result is sorted and
//     holds one candle per bucket time.
//   - Failures never escape: they are logged and whatever pages already
//     arrived are returned (an empty list when the first page fails).
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::market_data::candle::{Candle, SeriesKey};
use crate::market_data::store::replace_series;

/// Upstream history endpoint page cap.
pub const MAX_PAGE_ROWS: usize = 1000;

/// One request against the history endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlineWindow {
    /// The newest `limit` buckets.
    Recent { limit: usize },
    /// Buckets whose start lies in `[start_sec, end_sec]`.
    Range {
        start_sec: i64,
        end_sec: i64,
        limit: usize,
    },
}

/// Anything that can serve one page of kline history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_klines(&self, key: &SeriesKey, window: KlineWindow) -> Result<Vec<Candle>>;
}

pub struct BackfillClient {
    source: Arc<dyn HistorySource>,
    page_rows: usize,
}

impl BackfillClient {
    pub fn new(source: Arc<dyn HistorySource>) -> Self {
        Self {
            source,
            page_rows: MAX_PAGE_ROWS,
        }
    }

    /// Override the page size (never above the endpoint cap).
    pub fn with_page_rows(mut self, page_rows: usize) -> Self {
        self.page_rows = page_rows.clamp(1, MAX_PAGE_ROWS);
        self
    }

    /// The most recent `count` candles, clamped to one page.
    pub async fn recent(&self, key: &SeriesKey, count: usize) -> Vec<Candle> {
        let limit = count.clamp(1, self.page_rows);
        if limit < count {
            warn!(key = %key, requested = count, limit, "recent backfill clamped to page size");
        }

        match self
            .source
            .fetch_klines(key, KlineWindow::Recent { limit })
            .await
        {
            Ok(candles) => {
                debug!(key = %key, count = candles.len(), "recent backfill fetched");
                normalise(candles)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "recent backfill failed");
                Vec::new()
            }
        }
    }

    /// Every candle with bucket start in `[start_sec, end_sec]`.
    pub async fn range(&self, key: &SeriesKey, start_sec: i64, end_sec: i64) -> Vec<Candle> {
        if end_sec < start_sec {
            return Vec::new();
        }

        let windows = match key.step_secs() {
            Some(step) => page_windows(start_sec, end_sec, step, self.page_rows),
            None => vec![KlineWindow::Range {
                start_sec,
                end_sec,
                limit: self.page_rows,
            }],
        };

        let pages = windows.len();
        let mut fetched = Vec::new();
        for (page_no, window) in windows.into_iter().enumerate() {
            match self.source.fetch_klines(key, window).await {
                Ok(mut page) => fetched.append(&mut page),
                Err(e) => {
                    // Pages are consecutive, so what arrived so far is a
                    // contiguous prefix of the range.
                    warn!(
                        key = %key,
                        start = start_sec,
                        end = end_sec,
                        page = page_no + 1,
                        pages,
                        kept = fetched.len(),
                        error = %e,
                        "range backfill failed"
                    );
                    break;
                }
            }
        }

        fetched.retain(|c| c.time >= start_sec && c.time <= end_sec);
        debug!(key = %key, start = start_sec, end = end_sec, count = fetched.len(), "range backfill fetched");
        normalise(fetched)
    }
}

/// Sorted, one candle per time.
fn normalise(candles: Vec<Candle>) -> Vec<Candle> {
    replace_series(candles, usize::MAX).into()
}

/// Split `[start, end]` into consecutive windows of at most `page_rows`
/// buckets of `step` seconds each.
pub fn page_windows(start: i64, end: i64, step: i64, page_rows: usize) -> Vec<KlineWindow> {
    let step = step.max(1);
    let page_rows = page_rows.max(1);
    let span = step * (page_rows as i64 - 1);

    let mut windows = Vec::new();
    let mut chunk_start = start;
    while chunk_start <= end {
        let chunk_end = (chunk_start + span).min(end);
        let rows = ((chunk_end - chunk_start) / step + 1) as usize;
        windows.push(KlineWindow::Range {
            start_sec: chunk_start,
            end_sec: chunk_end,
            limit: rows,
        });
        chunk_start = chunk_end + step;
    }
    windows
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::testing::FakeHistory;
    use super::*;
    use crate::market_data::store::candle_at;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", "1m")
    }

    fn minute_candles(from: i64, to: i64) -> Vec<Candle> {
        (from..=to).step_by(60).map(|t| candle_at(t, 1.0)).collect()
    }

    #[test]
    fn page_windows_respect_row_cap() {
        let windows = page_windows(0, 60 * 2499, 60, 1000);
        assert_eq!(
            windows,
            vec![
                KlineWindow::Range { start_sec: 0, end_sec: 59_940, limit: 1000 },
                KlineWindow::Range { start_sec: 60_000, end_sec: 119_940, limit: 1000 },
                KlineWindow::Range { start_sec: 120_000, end_sec: 149_940, limit: 500 },
            ]
        );
        assert_eq!(
            page_windows(280, 340, 60, 1000),
            vec![KlineWindow::Range { start_sec: 280, end_sec: 340, limit: 2 }]
        );
        assert!(page_windows(400, 340, 60, 1000).is_empty());
    }

    #[tokio::test]
    async fn range_is_paged_and_concatenated() {
        let fake = Arc::new(FakeHistory::new());
        fake.serve(&key(), minute_candles(0, 60 * 24));
        let client = BackfillClient::new(fake.clone()).with_page_rows(10);

        let candles = client.range(&key(), 60, 60 * 24).await;
        assert_eq!(candles.len(), 24);
        assert_eq!(candles.first().map(|c| c.time), Some(60));
        assert_eq!(candles.last().map(|c| c.time), Some(1440));
        assert_eq!(fake.calls().len(), 3);
    }

    #[tokio::test]
    async fn failure_yields_empty_list() {
        let fake = Arc::new(FakeHistory::new());
        fake.fail(&key());
        let client = BackfillClient::new(fake.clone());

        assert!(client.range(&key(), 60, 600).await.is_empty());
        assert!(client.recent(&key(), 100).await.is_empty());
    }

    #[tokio::test]
    async fn later_page_failure_keeps_the_prefix() {
        let fake = Arc::new(FakeHistory::new());
        fake.serve(&key(), minute_candles(0, 60 * 24));
        fake.fail_after(1);
        let client = BackfillClient::new(fake.clone()).with_page_rows(10);

        let candles = client.range(&key(), 60, 60 * 24).await;
        let times: Vec<i64> = candles.iter().map(|c| c.time).collect();
        assert_eq!(times, (1..=10).map(|i| i * 60).collect::<Vec<_>>());
        // The failing second page ends the walk; the third is never requested.
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test]
    async fn recent_is_clamped_to_one_page() {
        let fake = Arc::new(FakeHistory::new());
        fake.serve(&key(), minute_candles(0, 60 * 50));
        let client = BackfillClient::new(fake.clone()).with_page_rows(20);

        let candles = client.recent(&key(), 5000).await;
        assert_eq!(candles.len(), 20);
        assert_eq!(fake.calls(), vec![(key(), KlineWindow::Recent { limit: 20 })]);
    }

    #[tokio::test]
    async fn empty_range_makes_no_request() {
        let fake = Arc::new(FakeHistory::new());
        let client = BackfillClient::new(fake.clone());
        assert!(client.range(&key(), 400, 340).await.is_empty());
        assert!(fake.calls().is_empty());
    }
}
