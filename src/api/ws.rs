// =============================================================================
// WebSocket Handlers: subscriber feeds
// =============================================================================
//
// Three endpoints share one connection loop:
//
//   /ws/candles          Client-driven subscriptions. Frames:
//                          {symbol, interval}                 add one
//                          {subscriptions:[{symbol,interval}]} replace all
//                        Pushes {type:"candle", symbol, interval, candle}.
//   /ws/candles/:symbol  Fixed subscription to (symbol, 1m), same frames.
//   /ws/:symbol          Sends {type:"historical", symbol, data:[ms candles]}
//                        on connect, then {type:"live_candle", ...} updates.
//
// Each connection runs two concurrent halves via `tokio::select!`:
//   1. **Push**: forward frames from the broadcaster queue to the socket.
//      The queue closing means the broadcaster dropped this connection.
//   2. **Recv**: process client frames (commands, Ping, Close).
// On exit every subscription of the connection is removed.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::rest::{ms_view, MsCandle};
use crate::app_state::AppState;
use crate::broadcast::{ConnectionId, Feed};
use crate::market_data::candle::DEFAULT_INTERVAL;
use crate::market_data::SeriesKey;

/// History sent on connect to `/ws/:symbol` (12 h of 1m buckets).
const LIVE_HISTORY_CANDLES: usize = 720;

// =============================================================================
// Client commands
// =============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCommand {
    Replace {
        subscriptions: Vec<serde_json::Value>,
    },
    Add {
        symbol: String,
        interval: String,
    },
}

/// A validated subscription command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Subscribe(SeriesKey),
    Replace(Vec<SeriesKey>),
}

fn entry_key(entry: &serde_json::Value) -> Option<SeriesKey> {
    let symbol = entry.get("symbol")?.as_str()?.trim();
    let interval = entry.get("interval")?.as_str()?.trim();
    if symbol.is_empty() || interval.is_empty() {
        return None;
    }
    Some(SeriesKey::new(symbol, interval))
}

/// Parse one client text frame. Malformed frames, and replacement lists with
/// no usable entry, yield `None` and are ignored by the caller.
pub fn parse_command(text: &str) -> Option<ClientCommand> {
    match serde_json::from_str::<RawCommand>(text).ok()? {
        RawCommand::Replace { subscriptions } => {
            let keys: Vec<SeriesKey> = subscriptions.iter().filter_map(entry_key).collect();
            if keys.is_empty() {
                None
            } else {
                Some(ClientCommand::Replace(keys))
            }
        }
        RawCommand::Add { symbol, interval } => {
            if symbol.trim().is_empty() || interval.trim().is_empty() {
                None
            } else {
                Some(ClientCommand::Subscribe(SeriesKey::new(&symbol, &interval)))
            }
        }
    }
}

fn apply_command(state: &AppState, conn: ConnectionId, text: &str) {
    match parse_command(text) {
        Some(ClientCommand::Subscribe(key)) => {
            state.broadcaster.subscribe(conn, key);
        }
        Some(ClientCommand::Replace(keys)) => {
            state.broadcaster.set_subscriptions(conn, keys);
        }
        None => debug!(conn = %conn, "ignoring malformed client frame"),
    }
}

// =============================================================================
// Upgrade handlers
// =============================================================================

pub async fn candles_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (conn, outbound) = state.broadcaster.connect(Feed::Candle);
        info!(conn = %conn, "subscriber connected to /ws/candles");
        run_connection(socket, state, conn, outbound, true).await;
    })
}

pub async fn single_symbol_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let key = SeriesKey::new(&symbol, DEFAULT_INTERVAL);
        let (conn, outbound) = state.broadcaster.connect(Feed::Candle);
        state.broadcaster.subscribe(conn, key.clone());
        info!(conn = %conn, key = %key, "subscriber connected to /ws/candles/:symbol");
        run_connection(socket, state, conn, outbound, false).await;
    })
}

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    interval: Option<String>,
}

pub async fn live_candle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<LiveQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket| async move {
        let key = SeriesKey::new(&symbol, query.interval.as_deref().unwrap_or_default());

        // Subscribe before reading history so no update falls in between;
        // queued updates are forwarded once the history frame is out.
        let (conn, outbound) = state.broadcaster.connect(Feed::LiveCandle);
        state.broadcaster.subscribe(conn, key.clone());

        let history = state.series_or_empty(&key, LIVE_HISTORY_CANDLES).await;
        let frame = HistoricalFrame {
            kind: "historical",
            symbol: &key.symbol,
            data: ms_view(&history),
        };
        let sent = match serde_json::to_string(&frame) {
            Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialise history frame");
                false
            }
        };
        if !sent {
            state.broadcaster.unsubscribe_all(conn);
            return;
        }

        info!(conn = %conn, key = %key, history = history.len(), "subscriber connected to /ws/:symbol");
        run_connection(socket, state, conn, outbound, false).await;
    })
}

#[derive(serde::Serialize)]
struct HistoricalFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    symbol: &'a str,
    data: Vec<MsCandle>,
}

// =============================================================================
// Connection loop
// =============================================================================

async fn run_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    conn: ConnectionId,
    mut outbound: mpsc::Receiver<String>,
    accept_commands: bool,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            // ── Push: broadcaster queue → socket ────────────────────────
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if let Err(e) = sender.send(Message::Text(text)).await {
                            debug!(conn = %conn, error = %e, "send failed — disconnecting");
                            break;
                        }
                    }
                    None => {
                        info!(conn = %conn, "dropped by broadcaster — closing");
                        break;
                    }
                }
            }

            // ── Recv: client frames ─────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if accept_commands {
                            apply_command(&state, conn, &text);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            debug!(conn = %conn, error = %e, "failed to send Pong — disconnecting");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(conn = %conn, error = %e, "receive error — disconnecting");
                        break;
                    }
                }
            }
        }
    }

    state.broadcaster.unsubscribe_all(conn);
    info!(conn = %conn, "subscriber disconnected");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_subscription_is_normalised() {
        assert_eq!(
            parse_command(r#"{"symbol":"btcusdt","interval":"1D"}"#),
            Some(ClientCommand::Subscribe(SeriesKey::new("BTCUSDT", "1d")))
        );
    }

    #[test]
    fn replacement_skips_incomplete_entries() {
        let cmd = parse_command(
            r#"{"subscriptions":[{"symbol":"ethusdt","interval":"5m"},{"symbol":"BTCUSDT"},{"interval":"1m"},42,{"symbol":"solusdt","interval":"1h"}]}"#,
        );
        assert_eq!(
            cmd,
            Some(ClientCommand::Replace(vec![
                SeriesKey::new("ETHUSDT", "5m"),
                SeriesKey::new("SOLUSDT", "1h"),
            ]))
        );
    }

    #[test]
    fn empty_or_malformed_frames_are_ignored() {
        assert_eq!(parse_command(r#"{"subscriptions":[]}"#), None);
        assert_eq!(parse_command(r#"{"subscriptions":[{"symbol":"BTCUSDT"}]}"#), None);
        assert_eq!(parse_command(r#"{"symbol":"BTCUSDT"}"#), None);
        assert_eq!(parse_command(r#"{"symbol":"","interval":"1m"}"#), None);
        assert_eq!(parse_command("ping"), None);
        assert_eq!(parse_command("[1,2,3]"), None);
    }

    #[test]
    fn history_frame_shape() {
        use crate::market_data::store::candle_at;

        let candles = vec![candle_at(60, 1.0)];
        let frame = HistoricalFrame {
            kind: "historical",
            symbol: "BTCUSDT",
            data: ms_view(&candles),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "historical");
        assert_eq!(value["data"][0]["time"], 60_000);
    }
}
