// =============================================================================
// Kline Stream Ingestor: one combined upstream connection for every series
// =============================================================================
//
// Connection state machine:
//
//   Disconnected → Connecting → Connected → (event loop) → Disconnected
//        ↑                                                      │
//        └──────────── fixed reconnect delay (or none) ─────────┘
//
// Every session ends in an `IngestError`; its `Recovery` category decides
// whether to reconnect at once, after the delay, or give up. Shutdown
// cancellation is the only clean exit.
//
// Events are handled strictly in receipt order: each routed candle is fully
// reconciled, stored and published before the next frame is read.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{de, Deserialize, Deserializer};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{IngestError, Recovery};
use crate::market_data::candle::{Candle, SeriesKey};
use crate::market_data::stream_status::{ConnectionState, StreamStatus};
use crate::reconcile::GapReconciler;

/// Default upstream stream base.
pub const DEFAULT_WS_BASE: &str = "wss://stream.binance.com:9443";

/// Throughput is logged once per window.
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// One decoded upstream text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    RoutedKlineUpdate { key: SeriesKey, candle: Candle },
    Unrecognized { reason: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient {
    Int(i64),
    Float(f64),
    Text(String),
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(i) => Ok(i as f64),
        Lenient::Float(f) => Ok(f),
        Lenient::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Lenient::deserialize(d)? {
        Lenient::Int(i) => Ok(i),
        Lenient::Float(f) => Ok(f as i64),
        Lenient::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

fn default_true() -> bool {
    true
}

/// The `k` object of a kline event. Only the fields the relay uses.
#[derive(Deserialize)]
struct RawKline {
    #[serde(deserialize_with = "lenient_i64")]
    t: i64,
    #[serde(default)]
    i: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    o: f64,
    #[serde(deserialize_with = "lenient_f64")]
    h: f64,
    #[serde(deserialize_with = "lenient_f64")]
    l: f64,
    #[serde(deserialize_with = "lenient_f64")]
    c: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    v: f64,
    #[serde(default = "default_true")]
    x: bool,
}

#[derive(Deserialize)]
struct EventBody {
    #[serde(default)]
    s: Option<String>,
    #[serde(default)]
    k: Option<RawKline>,
}

/// Combined-stream envelope `{stream, data:{k}}`, or a bare event `{s, k}`.
#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    stream: Option<String>,
    #[serde(default)]
    data: Option<EventBody>,
    #[serde(flatten)]
    bare: EventBody,
}

/// `btcusdt@kline_1m` → `BTCUSDT@1m`.
pub fn parse_stream_name(stream: &str) -> Option<SeriesKey> {
    let (symbol, interval) = stream.split_once("@kline_")?;
    if symbol.trim().is_empty() || interval.trim().is_empty() {
        return None;
    }
    Some(SeriesKey::new(symbol, interval))
}

/// Decode one text frame. Never fails: anything that is not a routable kline
/// event comes back as `Unrecognized`.
pub fn decode_message(text: &str) -> UpstreamMessage {
    let unrecognized = |reason: String| UpstreamMessage::Unrecognized { reason };

    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => return unrecognized(format!("invalid kline payload: {e}")),
    };

    let (body_symbol, kline) = match envelope.data {
        Some(EventBody { s, k: Some(k) }) => (s, k),
        _ => match envelope.bare {
            EventBody { s, k: Some(k) } => (s, k),
            _ => return unrecognized("no kline payload".to_string()),
        },
    };

    let key = match envelope.stream.as_deref() {
        Some(stream) => match parse_stream_name(stream) {
            Some(key) => key,
            None => return unrecognized(format!("unexpected stream name '{stream}'")),
        },
        None => match (body_symbol.as_deref(), kline.i.as_deref()) {
            (Some(symbol), Some(interval)) if !symbol.trim().is_empty() => {
                SeriesKey::new(symbol, interval)
            }
            _ => return unrecognized("kline without routing information".to_string()),
        },
    };

    let candle = Candle::new(
        kline.t.div_euclid(1000),
        kline.o,
        kline.h,
        kline.l,
        kline.c,
        kline.v,
        kline.x,
    );
    UpstreamMessage::RoutedKlineUpdate { key, candle }
}

/// Combined-stream URL for every key, or `None` when there is nothing to
/// subscribe to.
pub fn build_stream_url(ws_base: &str, keys: &[SeriesKey]) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let streams: Vec<String> = keys.iter().map(SeriesKey::stream_name).collect();
    Some(format!(
        "{}/stream?streams={}",
        ws_base.trim_end_matches('/'),
        streams.join("/")
    ))
}

// ---------------------------------------------------------------------------
// Ingestor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub ws_base: String,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            ws_base: DEFAULT_WS_BASE.to_string(),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

pub struct Ingestor {
    keys: Vec<SeriesKey>,
    settings: IngestSettings,
    reconciler: Arc<GapReconciler>,
    status: Arc<StreamStatus>,
}

impl Ingestor {
    pub fn new(
        keys: Vec<SeriesKey>,
        settings: IngestSettings,
        reconciler: Arc<GapReconciler>,
        status: Arc<StreamStatus>,
    ) -> Self {
        Self {
            keys,
            settings,
            reconciler,
            status,
        }
    }

    /// Keep the upstream session alive until `cancel` fires. Returns an error
    /// only for failures categorised as `Recovery::Abort`.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), IngestError> {
        let Some(url) = build_stream_url(&self.settings.ws_base, &self.keys) else {
            let err = IngestError::NoStreams;
            error!(error = %err, "kline ingestor cannot start");
            return Err(err);
        };

        loop {
            self.status.set_state(ConnectionState::Connecting);
            let err = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                err = self.session(&url) => err,
            };
            self.status.set_state(ConnectionState::Disconnected);

            match err.recovery() {
                Recovery::Abort => {
                    error!(error = %err, "kline ingestor aborting");
                    return Err(err);
                }
                Recovery::RetryImmediately => {
                    warn!(error = %err, "kline stream rotated by upstream — reconnecting now");
                }
                Recovery::RetryAfterDelay => {
                    warn!(
                        error = %err,
                        delay_secs = self.settings.reconnect_delay.as_secs(),
                        "kline stream failed — reconnecting after delay"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.reconnect_delay) => {}
                    }
                }
            }
        }

        self.status.set_state(ConnectionState::Disconnected);
        info!("kline ingestor stopped");
        Ok(())
    }

    /// One connected session. Runs until something goes wrong.
    async fn session(&self, url: &str) -> IngestError {
        info!(url = %url, streams = self.keys.len(), "connecting to kline stream");
        let ws_stream = match connect_async(url).await {
            Ok((ws_stream, _response)) => ws_stream,
            Err(source) => {
                return IngestError::Connect {
                    url: url.to_string(),
                    source,
                }
            }
        };
        self.status.set_state(ConnectionState::Connected);
        let connected_at = Instant::now();
        info!(streams = self.keys.len(), "kline stream connected");

        let (mut write, mut read) = ws_stream.split();

        let ping_every = self.settings.ping_interval;
        let silence_limit = ping_every + self.settings.ping_timeout;
        let mut ping = interval_at(Instant::now() + ping_every, ping_every);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut report = interval_at(Instant::now() + THROUGHPUT_WINDOW, THROUGHPUT_WINDOW);

        let mut last_frame = Instant::now();
        let mut window_messages: u64 = 0;

        loop {
            tokio::select! {
                frame = read.next() => {
                    let msg = match frame {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => return IngestError::Transport(e),
                        None => return IngestError::StreamEnded,
                    };
                    last_frame = Instant::now();
                    self.status.record_frame();

                    match msg {
                        Message::Text(text) => {
                            window_messages += 1;
                            self.handle_text(&text).await;
                            // Reconcile time is not upstream silence.
                            last_frame = Instant::now();
                        }
                        Message::Close(frame) => {
                            let reason = frame
                                .map(|f| f.reason.to_string())
                                .unwrap_or_else(|| "no close frame".to_string());
                            return IngestError::ServerClosed {
                                reason,
                                uptime_secs: connected_at.elapsed().as_secs(),
                            };
                        }
                        // Pong replies to upstream pings are sent by tungstenite.
                        _ => {}
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return IngestError::Transport(e);
                    }
                    debug!("keepalive ping sent");
                }
                _ = report.tick() => {
                    info!(
                        messages = window_messages,
                        total = self.status.messages_received(),
                        "kline stream throughput (last 60s)"
                    );
                    window_messages = 0;
                }
                _ = sleep_until(last_frame + silence_limit) => {
                    return IngestError::HeartbeatTimeout {
                        silent_secs: silence_limit.as_secs(),
                    };
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match decode_message(text) {
            UpstreamMessage::RoutedKlineUpdate { key, candle } => {
                debug!(
                    key = %key,
                    time = candle.time,
                    close = candle.close,
                    closed = candle.closed,
                    "candle update"
                );
                self.status.record_candle(&key, &candle);
                let outcome = self.reconciler.apply(&key, candle).await;
                debug!(key = %key, ?outcome, "candle reconciled");
            }
            UpstreamMessage::Unrecognized { reason } => {
                warn!(reason = %reason, "dropping unrecognised upstream message");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
