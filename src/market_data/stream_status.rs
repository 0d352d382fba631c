// =============================================================================
// Stream Status: diagnostic view of the upstream ingestor
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

use crate::market_data::candle::{Candle, SeriesKey};

/// Number of recently decoded candles kept for inspection.
pub const RECENT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentCandle {
    pub symbol: String,
    pub interval: String,
    pub time: i64,
    /// Receive time in ms.
    pub received_at: i64,
    pub candle: Candle,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub connected_since: Option<i64>,
    pub last_received_at: Option<i64>,
    pub messages_received: u64,
    pub reconnects: u64,
    pub recent: Vec<RecentCandle>,
}

struct Inner {
    state: ConnectionState,
    connected_since: Option<i64>,
    last_received_at: Option<i64>,
    recent: VecDeque<RecentCandle>,
}

pub struct StreamStatus {
    inner: RwLock<Inner>,
    messages_received: AtomicU64,
    sessions: AtomicU64,
}

impl Default for StreamStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamStatus {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: ConnectionState::Disconnected,
                connected_since: None,
                last_received_at: None,
                recent: VecDeque::with_capacity(RECENT_CAPACITY),
            }),
            messages_received: AtomicU64::new(0),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        let mut inner = self.inner.write();
        match state {
            ConnectionState::Connected => {
                inner.connected_since = Some(chrono::Utc::now().timestamp_millis());
                self.sessions.fetch_add(1, Ordering::Relaxed);
            }
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => inner.connected_since = None,
        }
        inner.state = state;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.read().state
    }

    /// Any frame arrived from upstream.
    pub fn record_frame(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.inner.write().last_received_at = Some(chrono::Utc::now().timestamp_millis());
    }

    /// A candle was decoded and routed.
    pub fn record_candle(&self, key: &SeriesKey, candle: &Candle) {
        let entry = RecentCandle {
            symbol: key.symbol.clone(),
            interval: key.interval.clone(),
            time: candle.time,
            received_at: chrono::Utc::now().timestamp_millis(),
            candle: candle.clone(),
        };
        let mut inner = self.inner.write();
        if inner.recent.len() == RECENT_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(entry);
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let inner = self.inner.read();
        StatusSnapshot {
            state: inner.state,
            connected_since: inner.connected_since,
            last_received_at: inner.last_received_at,
            messages_received: self.messages_received(),
            reconnects: self.sessions.load(Ordering::Relaxed).saturating_sub(1),
            recent: inner.recent.iter().cloned().collect(),
        }
    }
}
