// =============================================================================
// Central Application State: candle relay
// =============================================================================
//
// Ties the service objects together for the API layer. Every subsystem is
// constructed once in main and shared via `Arc`; AppState itself holds no
// mutable state beyond what those subsystems manage internally.
//
// The snapshot builders here read the store per configured series. Store
// errors are logged and the series reported as empty; API readers always get
// a best-effort view.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::broadcast::Broadcaster;
use crate::market_data::store::CandleStore;
use crate::market_data::stream_status::{ConnectionState, StatusSnapshot};
use crate::market_data::{Candle, SeriesKey, StreamStatus};
use crate::runtime_config::RuntimeConfig;

/// Shared state handed to every axum handler via `Arc<AppState>`.
pub struct AppState {
    pub config: RuntimeConfig,
    pub store: Arc<dyn CandleStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub stream_status: Arc<StreamStatus>,
    pub started_at: DateTime<Utc>,
}

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEntry {
    pub symbol: String,
    pub interval: String,
    pub count: usize,
    pub first_time: Option<i64>,
    pub last_time: Option<i64>,
    pub last_candle: Option<Candle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub series: Vec<PipelineEntry>,
    pub stream: StatusSnapshot,
    pub subscriber_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairStatus {
    pub symbol: String,
    pub interval: String,
    pub count: usize,
    pub last_candle_time: Option<i64>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    /// Connections currently subscribed to this pair.
    pub subscribers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamingStatus {
    pub pairs: Vec<PairStatus>,
    pub last_store_update_ts: Option<i64>,
    pub stream_state: ConnectionState,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn CandleStore>,
        broadcaster: Arc<Broadcaster>,
        stream_status: Arc<StreamStatus>,
    ) -> Self {
        Self {
            config,
            store,
            broadcaster,
            stream_status,
            started_at: Utc::now(),
        }
    }

    /// Full stored series, or empty on store failure.
    pub async fn series_or_empty(&self, key: &SeriesKey, limit: usize) -> Vec<Candle> {
        match self.store.read(key, limit).await {
            Ok(candles) => candles,
            Err(e) => {
                warn!(key = %key, error = %e, "store read failed — reporting empty series");
                Vec::new()
            }
        }
    }

    pub async fn build_pipeline_snapshot(&self) -> PipelineSnapshot {
        let mut series = Vec::new();
        for key in self.config.series_keys() {
            let candles = self.series_or_empty(&key, self.store.capacity()).await;
            series.push(PipelineEntry {
                count: candles.len(),
                first_time: candles.first().map(|c| c.time),
                last_time: candles.last().map(|c| c.time),
                last_candle: candles.last().cloned(),
                symbol: key.symbol,
                interval: key.interval,
            });
        }

        PipelineSnapshot {
            series,
            stream: self.stream_status.snapshot(),
            subscriber_connections: self.broadcaster.connection_count(),
        }
    }

    pub async fn build_streaming_status(&self) -> StreamingStatus {
        let mut pairs = Vec::new();
        for key in self.config.series_keys() {
            let candles = self.series_or_empty(&key, self.store.capacity()).await;
            let last = candles.last();
            pairs.push(PairStatus {
                count: candles.len(),
                last_candle_time: last.map(|c| c.time),
                open: last.map(|c| c.open),
                high: last.map(|c| c.high),
                low: last.map(|c| c.low),
                close: last.map(|c| c.close),
                subscribers: self.broadcaster.subscriber_count(&key),
                symbol: key.symbol,
                interval: key.interval,
            });
        }

        StreamingStatus {
            pairs,
            last_store_update_ts: self.store.last_write_ms(),
            stream_state: self.stream_status.state(),
        }
    }
}
