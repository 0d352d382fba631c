// =============================================================================
// Candle Store: bounded, ordered, deduplicating series per key
// =============================================================================
//
// Two interchangeable backends implement `CandleStore`:
//   - `MemoryStore`: process-local map guarded by a parking_lot lock.
//   - `RedisStore` : one JSON array per key in a shared Redis instance.
//
// Both run the same series arithmetic (`upsert_into` / `replace_series`), so
// the invariants hold regardless of backend:
//   - times strictly increasing and unique,
//   - length never above capacity (oldest evicted first),
//   - an equal-time upsert replaces in place.
// =============================================================================

pub mod memory;
pub mod redis_cache;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::market_data::candle::{Candle, SeriesKey};

pub use memory::MemoryStore;
pub use redis_cache::RedisStore;

/// Default number of candles kept per series.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Diagnostic summary of one stored series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyInfo {
    pub count: usize,
    pub first_time: Option<i64>,
    pub last_time: Option<i64>,
}

impl KeyInfo {
    fn of(series: &VecDeque<Candle>) -> Self {
        Self {
            count: series.len(),
            first_time: series.front().map(|c| c.time),
            last_time: series.back().map(|c| c.time),
        }
    }
}

/// What an upsert did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertEffect {
    /// A candle with the same time was overwritten.
    Replaced,
    /// A new time was inserted; `evicted` oldest candles were dropped.
    Inserted { evicted: usize },
}

/// Backend-agnostic interface used by the ingestor, bootstrap and API.
#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Most recent `min(limit, len)` candles, oldest first. The returned
    /// vector is a copy; later writes are never visible through it.
    async fn read(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>>;

    /// Insert or replace one candle by time. Atomic per key.
    async fn upsert(&self, key: &SeriesKey, candle: Candle) -> Result<UpsertEffect>;

    /// Replace the whole series, keeping the most recent `capacity` candles.
    async fn replace(&self, key: &SeriesKey, candles: Vec<Candle>) -> Result<()>;

    /// `{count, first_time, last_time}` for every known store key.
    async fn keys_info(&self) -> Result<BTreeMap<String, KeyInfo>>;

    /// Maximum series length.
    fn capacity(&self) -> usize;

    /// Wall-clock time (ms) of the last successful write, if any.
    fn last_write_ms(&self) -> Option<i64>;

    /// Tail candle of a series, if any.
    async fn last(&self, key: &SeriesKey) -> Result<Option<Candle>> {
        Ok(self.read(key, 1).await?.pop())
    }
}

// ---------------------------------------------------------------------------
// Series arithmetic shared by both backends
// ---------------------------------------------------------------------------

/// Upsert `candle` into an ordered series bounded by `capacity`.
pub fn upsert_into(series: &mut VecDeque<Candle>, candle: Candle, capacity: usize) -> UpsertEffect {
    match series.binary_search_by_key(&candle.time, |c| c.time) {
        Ok(idx) => {
            series[idx] = candle;
            UpsertEffect::Replaced
        }
        Err(idx) => {
            series.insert(idx, candle);
            let mut evicted = 0;
            while series.len() > capacity {
                series.pop_front();
                evicted += 1;
            }
            UpsertEffect::Inserted { evicted }
        }
    }
}

/// Build a series from an arbitrary candle list: sorted, one candle per time
/// (the later entry wins), truncated to the newest `capacity`.
pub fn replace_series(mut candles: Vec<Candle>, capacity: usize) -> VecDeque<Candle> {
    candles.sort_by_key(|c| c.time);
    let mut series: VecDeque<Candle> = VecDeque::with_capacity(candles.len().min(capacity));
    for candle in candles {
        match series.back_mut() {
            Some(last) if last.time == candle.time => *last = candle,
            _ => series.push_back(candle),
        }
    }
    while series.len() > capacity {
        series.pop_front();
    }
    series
}

/// Copy of the newest `limit` candles, oldest first.
pub fn tail_copy(series: &VecDeque<Candle>, limit: usize) -> Vec<Candle> {
    let start = series.len().saturating_sub(limit);
    series.iter().skip(start).cloned().collect()
}

/// Last-write timestamp shared by both backends. Zero means "never written".
#[derive(Debug, Default)]
pub(crate) struct WriteClock(AtomicI64);

impl WriteClock {
    pub(crate) fn touch(&self) {
        self.0
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> Option<i64> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-key async locks
// ---------------------------------------------------------------------------

/// One async mutex per series key. Guards are owned, so they can be held
/// across awaits and are released on drop even when the holder is cancelled.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<SeriesKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &SeriesKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock();
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn candle_at(time: i64, close: f64) -> Candle {
    Candle::new(time, close, close + 1.0, close - 1.0, close, 10.0, true)
}
