use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    replace_series, tail_copy, upsert_into, CandleStore, KeyInfo, UpsertEffect, WriteClock,
};
use crate::market_data::candle::{Candle, SeriesKey};

// ---------------------------------------------------------------------------
// MemoryStore -- process-local ring buffers per series key
// ---------------------------------------------------------------------------

/// In-process candle store. A single `RwLock` covers the map; every write
/// completes without awaiting, so the lock is never held across a suspension
/// point and each upsert is atomic for its key.
pub struct MemoryStore {
    series: RwLock<HashMap<SeriesKey, VecDeque<Candle>>>,
    capacity: usize,
    clock: WriteClock,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            clock: WriteClock::default(),
        }
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn read(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>> {
        let map = self.series.read();
        Ok(map
            .get(key)
            .map(|series| tail_copy(series, limit))
            .unwrap_or_default())
    }

    async fn upsert(&self, key: &SeriesKey, candle: Candle) -> Result<UpsertEffect> {
        let effect = {
            let mut map = self.series.write();
            let series = map
                .entry(key.clone())
                .or_insert_with(|| VecDeque::with_capacity(self.capacity + 1));
            upsert_into(series, candle, self.capacity)
        };
        self.clock.touch();
        Ok(effect)
    }

    async fn replace(&self, key: &SeriesKey, candles: Vec<Candle>) -> Result<()> {
        let series = replace_series(candles, self.capacity);
        self.series.write().insert(key.clone(), series);
        self.clock.touch();
        Ok(())
    }

    async fn keys_info(&self) -> Result<BTreeMap<String, KeyInfo>> {
        let map = self.series.read();
        Ok(map
            .iter()
            .map(|(key, series)| (key.store_key(), KeyInfo::of(series)))
            .collect())
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn last_write_ms(&self) -> Option<i64> {
        self.clock.get()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::market_data::store::candle_at;

    fn key() -> SeriesKey {
        SeriesKey::new("BTCUSDT", "1m")
    }

    #[tokio::test]
    async fn read_returns_independent_copy() {
        let store = MemoryStore::new(10);
        store.upsert(&key(), candle_at(60, 1.0)).await.unwrap();
        store.upsert(&key(), candle_at(120, 2.0)).await.unwrap();

        let before = store.read(&key(), 10).await.unwrap();
        store.upsert(&key(), candle_at(120, 50.0)).await.unwrap();
        store.upsert(&key(), candle_at(180, 3.0)).await.unwrap();

        assert_eq!(before.len(), 2);
        assert_eq!(before[1].close, 2.0);
        assert_eq!(store.read(&key(), 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn read_limit_and_unknown_key() {
        let store = MemoryStore::new(10);
        for i in 1..=4 {
            store.upsert(&key(), candle_at(i * 60, i as f64)).await.unwrap();
        }
        let last_two: Vec<i64> = store
            .read(&key(), 2)
            .await
            .unwrap()
            .iter()
            .map(|c| c.time)
            .collect();
        assert_eq!(last_two, vec![180, 240]);

        let other = SeriesKey::new("ETHUSDT", "1h");
        assert!(store.read(&other, 5).await.unwrap().is_empty());
        assert_eq!(store.last(&other).await.unwrap(), None);
        assert_eq!(store.last(&key()).await.unwrap().map(|c| c.time), Some(240));
    }

    #[tokio::test]
    async fn concurrent_upserts_on_one_key_never_duplicate() {
        let store = Arc::new(MemoryStore::new(1000));
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    // Overlapping times across workers.
                    let t = ((worker * 25 + i) % 120) * 60;
                    store.upsert(&key(), candle_at(t, worker as f64)).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let series = store.read(&key(), 1000).await.unwrap();
        assert_eq!(series.len(), 120);
        assert!(series.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[tokio::test]
    async fn replace_truncates_to_capacity_from_the_end() {
        let store = MemoryStore::new(3);
        let candles = (1..=6).map(|i| candle_at(i * 60, i as f64)).collect();
        store.replace(&key(), candles).await.unwrap();

        let times: Vec<i64> = store.read(&key(), 10).await.unwrap().iter().map(|c| c.time).collect();
        assert_eq!(times, vec![240, 300, 360]);
    }

    #[tokio::test]
    async fn keys_info_reports_every_series() {
        let store = MemoryStore::new(10);
        assert!(store.last_write_ms().is_none());

        store.upsert(&key(), candle_at(60, 1.0)).await.unwrap();
        store.upsert(&key(), candle_at(180, 1.0)).await.unwrap();
        store
            .replace(&SeriesKey::new("ethusdt", "1D"), vec![candle_at(86_400, 1.0)])
            .await
            .unwrap();

        let info = store.keys_info().await.unwrap();
        assert_eq!(info.len(), 2);
        assert_eq!(
            info["candles:BTCUSDT:1m"],
            KeyInfo {
                count: 2,
                first_time: Some(60),
                last_time: Some(180)
            }
        );
        assert_eq!(info["candles:ETHUSDT:1d"].count, 1);
        assert!(store.last_write_ms().is_some());
    }
}
