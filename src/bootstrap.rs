// =============================================================================
// Bootstrap: initial history load for every configured series
// =============================================================================
//
// Runs once at startup, before the live stream is attached. Every key is
// loaded concurrently; one key failing never affects another. There are no
// retries here: a series left empty is bootstrapped lazily by the reconciler
// when its first live candle arrives.
// =============================================================================

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::market_data::backfill::BackfillClient;
use crate::market_data::store::CandleStore;
use crate::market_data::SeriesKey;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapSummary {
    pub filled: usize,
    pub empty: usize,
}

async fn bootstrap_key(key: &SeriesKey, backfill: &BackfillClient, store: &dyn CandleStore) -> bool {
    let history = backfill.recent(key, store.capacity()).await;
    if history.is_empty() {
        warn!(key = %key, "no history fetched — series left empty");
        return false;
    }

    let fetched = history.len();
    match store.replace(key, history).await {
        Ok(()) => {
            info!(key = %key, fetched, "series bootstrapped");
            true
        }
        Err(e) => {
            warn!(key = %key, error = %e, "failed to store bootstrap history");
            false
        }
    }
}

/// Fill every key with its most recent `capacity` candles.
pub async fn bootstrap_all(
    keys: &[SeriesKey],
    backfill: &BackfillClient,
    store: &dyn CandleStore,
) -> BootstrapSummary {
    info!(keys = keys.len(), "bootstrapping candle history");

    let results = join_all(keys.iter().map(|key| bootstrap_key(key, backfill, store))).await;

    let mut summary = BootstrapSummary::default();
    for ok in &results {
        if *ok {
            summary.filled += 1;
        } else {
            summary.empty += 1;
        }
    }

    // Verification pass: what actually landed in the store.
    for key in keys {
        match store.read(key, store.capacity()).await {
            Ok(candles) => info!(
                key = %key,
                stored = candles.len(),
                last_close = candles.last().map(|c| c.close),
                "bootstrap verification"
            ),
            Err(e) => warn!(key = %key, error = %e, "bootstrap verification read failed"),
        }
    }

    info!(filled = summary.filled, empty = summary.empty, "bootstrap complete");
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::market_data::backfill::testing::FakeHistory;
    use crate::market_data::backfill::KlineWindow;
    use crate::market_data::store::{candle_at, MemoryStore};

    #[tokio::test]
    async fn failures_are_isolated_per_key() {
        let btc = SeriesKey::new("BTCUSDT", "1m");
        let eth = SeriesKey::new("ETHUSDT", "1m");
        let sol = SeriesKey::new("SOLUSDT", "5m");

        let fake = Arc::new(FakeHistory::new());
        fake.serve(&btc, (0..30).map(|i| candle_at(i * 60, i as f64)).collect());
        fake.fail(&eth);
        fake.serve(&sol, (0..5).map(|i| candle_at(i * 300, 1.0)).collect());

        let store = MemoryStore::new(20);
        let backfill = BackfillClient::new(fake.clone());
        let keys = vec![btc.clone(), eth.clone(), sol.clone()];

        let summary = bootstrap_all(&keys, &backfill, &store).await;
        assert_eq!(summary, BootstrapSummary { filled: 2, empty: 1 });

        let stored = store.read(&btc, 100).await.unwrap();
        assert_eq!(stored.len(), 20);
        assert_eq!(stored.last().map(|c| c.time), Some(29 * 60));
        assert!(store.read(&eth, 100).await.unwrap().is_empty());
        assert_eq!(store.read(&sol, 100).await.unwrap().len(), 5);

        // One recent-window request per key, sized to the store.
        let calls = fake.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls
            .iter()
            .all(|(_, w)| *w == KlineWindow::Recent { limit: 20 }));
    }

    #[tokio::test]
    async fn no_keys_is_a_no_op() {
        let fake = Arc::new(FakeHistory::new());
        let store = MemoryStore::new(10);
        let summary = bootstrap_all(&[], &BackfillClient::new(fake), &store).await;
        assert_eq!(summary, BootstrapSummary::default());
    }
}
