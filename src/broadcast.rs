// =============================================================================
// Subscription Registry & Broadcaster: fan-out of candle updates
// =============================================================================
//
// Each client connection registers once (`connect`) and receives an outbound
// queue. The registry keeps both directions of the mapping:
//
//   series key → connection ids        (used by `publish`)
//   connection → feed, queue, keys      (used by unsubscribe / replacement)
//
// Thread safety: a single parking_lot::Mutex covers the registry. It is only
// held for map bookkeeping; `publish` snapshots the target queues under the
// lock and enqueues after releasing it. Enqueueing never waits: a closed or
// full queue counts as a failed delivery and that connection is removed, which
// closes its queue and ends its socket task.
// =============================================================================

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::market_data::{Candle, SeriesKey};

/// Identity of one registered client connection.
pub type ConnectionId = Uuid;

/// Default per-connection outbound queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Message format a connection receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    /// `{type:"candle", symbol, interval, candle}` with times in seconds.
    Candle,
    /// `{type:"live_candle", symbol, time, ...}` with time in milliseconds.
    LiveCandle,
}

/// Outbound push frames.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PushMessage<'a> {
    Candle {
        symbol: &'a str,
        interval: &'a str,
        candle: &'a Candle,
    },
    LiveCandle {
        symbol: &'a str,
        time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        is_closed: bool,
    },
}

fn encode(feed: Feed, key: &SeriesKey, candle: &Candle) -> serde_json::Result<String> {
    let msg = match feed {
        Feed::Candle => PushMessage::Candle {
            symbol: &key.symbol,
            interval: &key.interval,
            candle,
        },
        Feed::LiveCandle => PushMessage::LiveCandle {
            symbol: &key.symbol,
            time: candle.time_ms(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            is_closed: candle.closed,
        },
    };
    serde_json::to_string(&msg)
}

/// Outcome of one `publish` call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct Connection {
    feed: Feed,
    tx: mpsc::Sender<String>,
    keys: HashSet<SeriesKey>,
}

#[derive(Default)]
struct Registry {
    subscribers: HashMap<SeriesKey, HashSet<ConnectionId>>,
    connections: HashMap<ConnectionId, Connection>,
}

impl Registry {
    fn detach_keys(&mut self, id: ConnectionId, keys: &HashSet<SeriesKey>) {
        for key in keys {
            if let Some(ids) = self.subscribers.get_mut(key) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.subscribers.remove(key);
                }
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(conn) => {
                self.detach_keys(id, &conn.keys);
                true
            }
            None => false,
        }
    }
}

pub struct Broadcaster {
    registry: Mutex<Registry>,
    queue_depth: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a connection. The receiver yields encoded frames; it ends
    /// once the connection is removed from the registry.
    pub fn connect(&self, feed: Feed) -> (ConnectionId, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let id = Uuid::new_v4();
        self.registry.lock().connections.insert(
            id,
            Connection {
                feed,
                tx,
                keys: HashSet::new(),
            },
        );
        debug!(conn = %id, ?feed, "connection registered");
        (id, rx)
    }

    /// Add one subscription. Returns `false` if the connection is unknown
    /// (already removed).
    pub fn subscribe(&self, conn: ConnectionId, key: SeriesKey) -> bool {
        let mut reg = self.registry.lock();
        let Some(connection) = reg.connections.get_mut(&conn) else {
            return false;
        };
        connection.keys.insert(key.clone());
        debug!(conn = %conn, key = %key, "subscribed");
        reg.subscribers.entry(key).or_default().insert(conn);
        true
    }

    /// Atomically replace every subscription of `conn` with `keys`.
    pub fn set_subscriptions<I>(&self, conn: ConnectionId, keys: I) -> bool
    where
        I: IntoIterator<Item = SeriesKey>,
    {
        let new_keys: HashSet<SeriesKey> = keys.into_iter().collect();
        let mut reg = self.registry.lock();
        let Some(connection) = reg.connections.get_mut(&conn) else {
            return false;
        };
        let old_keys = std::mem::replace(&mut connection.keys, new_keys.clone());
        reg.detach_keys(conn, &old_keys);
        for key in &new_keys {
            reg.subscribers.entry(key.clone()).or_default().insert(conn);
        }
        debug!(conn = %conn, count = new_keys.len(), "subscriptions replaced");
        true
    }

    /// Forget `conn` and all of its subscriptions.
    pub fn unsubscribe_all(&self, conn: ConnectionId) {
        if self.registry.lock().remove_connection(conn) {
            debug!(conn = %conn, "connection unregistered");
        }
    }

    /// Deliver `candle` to every connection subscribed to `key`.
    pub fn publish(&self, key: &SeriesKey, candle: &Candle) -> PublishReport {
        let targets: Vec<(ConnectionId, Feed, mpsc::Sender<String>)> = {
            let reg = self.registry.lock();
            match reg.subscribers.get(key) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        reg.connections
                            .get(id)
                            .map(|c| (*id, c.feed, c.tx.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut report = PublishReport::default();
        if targets.is_empty() {
            return report;
        }

        let mut frames: HashMap<Feed, String> = HashMap::new();
        let mut failed = Vec::new();
        for (id, feed, tx) in targets {
            let frame = match frames.get(&feed) {
                Some(frame) => frame.clone(),
                None => match encode(feed, key, candle) {
                    Ok(frame) => {
                        frames.insert(feed, frame.clone());
                        frame
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to encode push frame");
                        return report;
                    }
                },
            };

            match tx.try_send(frame) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %id, key = %key, "subscriber queue full — dropping connection");
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => failed.push(id),
            }
        }

        if !failed.is_empty() {
            let mut reg = self.registry.lock();
            for id in &failed {
                reg.remove_connection(*id);
            }
            report.dropped = failed.len();
            info!(key = %key, dropped = report.dropped, "removed unreachable subscribers");
        }

        debug!(key = %key, delivered = report.delivered, close = candle.close, "broadcast");
        report
    }

    pub fn subscriber_count(&self, key: &SeriesKey) -> usize {
        self.registry.lock().subscribers.get(key).map_or(0, HashSet::len)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.lock().connections.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
