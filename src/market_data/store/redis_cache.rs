// =============================================================================
// Redis Candle Store: shared external cache backend
// =============================================================================
//
// Layout: one string value per series holding the JSON array of candles,
// stored under `candles:<SYMBOL>:<interval>`.
//
// An upsert is a read-modify-write of that value. Per-key `KeyedLocks` make it
// atomic with respect to every other writer in this process; the connection
// manager reconnects on its own after a dropped link.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use super::{
    replace_series, tail_copy, upsert_into, CandleStore, KeyInfo, KeyedLocks, UpsertEffect,
    WriteClock,
};
use crate::market_data::candle::{Candle, SeriesKey, STORE_KEY_PREFIX};

pub struct RedisStore {
    conn: ConnectionManager,
    locks: KeyedLocks,
    capacity: usize,
    clock: WriteClock,
}

impl RedisStore {
    /// Connect to `url` and return a ready store.
    pub async fn connect(url: &str, capacity: usize) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("invalid redis url {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to redis at {url}"))?;

        info!(url = %url, capacity, "redis candle store connected");
        Ok(Self {
            conn,
            locks: KeyedLocks::new(),
            capacity: capacity.max(1),
            clock: WriteClock::default(),
        })
    }

    async fn load(&self, store_key: &str) -> Result<VecDeque<Candle>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(store_key)
            .await
            .with_context(|| format!("GET {store_key} failed"))?;
        match raw {
            Some(json) => decode_series(&json)
                .with_context(|| format!("corrupt series stored at {store_key}")),
            None => Ok(VecDeque::new()),
        }
    }

    async fn save(&self, store_key: &str, series: &VecDeque<Candle>) -> Result<()> {
        let payload = serde_json::to_string(series).context("failed to serialise series")?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(store_key, payload)
            .await
            .with_context(|| format!("SET {store_key} failed"))?;
        self.clock.touch();
        Ok(())
    }
}

/// Decode a stored JSON array. A value that is not an array of candles is
/// reported as an error rather than silently treated as empty.
fn decode_series(json: &str) -> Result<VecDeque<Candle>> {
    let series: VecDeque<Candle> = serde_json::from_str(json)?;
    Ok(series)
}

fn key_pattern() -> String {
    format!("{STORE_KEY_PREFIX}:*")
}

#[async_trait]
impl CandleStore for RedisStore {
    async fn read(&self, key: &SeriesKey, limit: usize) -> Result<Vec<Candle>> {
        let series = self.load(&key.store_key()).await?;
        Ok(tail_copy(&series, limit))
    }

    async fn upsert(&self, key: &SeriesKey, candle: Candle) -> Result<UpsertEffect> {
        let _guard = self.locks.lock(key).await;
        let store_key = key.store_key();

        let mut series = self.load(&store_key).await?;
        let effect = upsert_into(&mut series, candle, self.capacity);
        self.save(&store_key, &series).await?;

        debug!(key = %store_key, len = series.len(), ?effect, "redis upsert");
        Ok(effect)
    }

    async fn replace(&self, key: &SeriesKey, candles: Vec<Candle>) -> Result<()> {
        let _guard = self.locks.lock(key).await;
        let series = replace_series(candles, self.capacity);
        self.save(&key.store_key(), &series).await
    }

    async fn keys_info(&self) -> Result<BTreeMap<String, KeyInfo>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(key_pattern())
            .query_async(&mut conn)
            .await
            .context("KEYS candles:* failed")?;

        let mut out = BTreeMap::new();
        for store_key in keys {
            match self.load(&store_key).await {
                Ok(series) => {
                    out.insert(store_key, KeyInfo::of(&series));
                }
                Err(e) => warn!(key = %store_key, error = %e, "skipping unreadable series"),
            }
        }
        Ok(out)
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
