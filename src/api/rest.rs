// =============================================================================
// REST API Endpoints: Axum 0.7
// =============================================================================
//
// Thin, read-only JSON boundary over the candle store plus the WebSocket
// upgrade routes (handled in the `ws` module but mounted here).
//
// Reads are best-effort: a failing store read yields an empty series, never
// an error. Only malformed requests (bad query types, unknown intervals where
// a duration is required) produce 4xx responses.
//
// CORS is configured permissively; the relay serves public market data only.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::api::ws;
use crate::app_state::AppState;
use crate::market_data::candle::DEFAULT_INTERVAL;
use crate::market_data::{Candle, SeriesKey};

/// Default and maximum `limit` for `/candles`.
const DEFAULT_CANDLES_LIMIT: usize = 500;
const MAX_CANDLES_LIMIT: usize = 1000;

/// Default look-back for `/api/historical`.
const DEFAULT_HISTORICAL_HOURS: i64 = 12;

const DEFAULT_DETAIL_LIMIT: usize = 5;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & discovery ──────────────────────────────────────
        .route("/health", get(health))
        .route("/symbols", get(symbols))
        .route("/api/symbols", get(api_symbols))
        // ── Candle reads ────────────────────────────────────────────
        .route("/candles/:symbol/:interval", get(candles))
        .route("/api/historical/:symbol", get(historical))
        // ── Diagnostics ─────────────────────────────────────────────
        .route("/debug/store-keys", get(store_keys))
        .route("/debug/pipeline", get(pipeline))
        .route("/streaming/status", get(streaming_status))
        .route("/debug/candle-details/:symbol/:interval", get(candle_details))
        .route("/validate/candles", get(validate_candles))
        .route("/verify/status", get(verify_status))
        // ── WebSocket feeds ─────────────────────────────────────────
        .route("/ws/candles", get(ws::candles_ws))
        .route("/ws/candles/:symbol", get(ws::single_symbol_ws))
        .route("/ws/:symbol", get(ws::live_candle_ws))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

fn bad_request(message: String) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

// =============================================================================
// Millisecond candle view
// =============================================================================

/// Candle with `time` in milliseconds, for chart clients.
#[derive(Debug, Clone, Serialize)]
pub struct MsCandle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl From<&Candle> for MsCandle {
    fn from(c: &Candle) -> Self {
        Self {
            time: c.time_ms(),
            open: c.open,
            high: c.high,
            low: c.low,
            close: c.close,
            volume: c.volume,
            is_closed: c.closed,
        }
    }
}

pub fn ms_view(candles: &[Candle]) -> Vec<MsCandle> {
    candles.iter().map(MsCandle::from).collect()
}

// =============================================================================
// Health & discovery
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = chrono::Utc::now();
    Json(HealthResponse {
        status: "ok",
        server_time: now.timestamp_millis(),
        uptime_secs: (now - state.started_at).num_seconds(),
    })
}

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "symbols": state.config.symbols,
        "intervals": state.config.intervals,
    }))
}

async fn api_symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "symbols": state.config.symbols,
        "count": state.config.symbols.len(),
    }))
}

// =============================================================================
// Candle reads
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    limit: Option<i64>,
}

/// `limit` outside `1..=1000` falls back to the default.
fn effective_limit(limit: Option<i64>) -> usize {
    match limit {
        Some(n) if n >= 1 && n as usize <= MAX_CANDLES_LIMIT => n as usize,
        _ => DEFAULT_CANDLES_LIMIT,
    }
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<CandlesQuery>,
) -> impl IntoResponse {
    let key = SeriesKey::new(&symbol, &interval);
    let limit = effective_limit(query.limit);
    let data = state.series_or_empty(&key, limit).await;
    debug!(key = %key, limit, count = data.len(), "candles served");

    Json(serde_json::json!({
        "symbol": key.symbol,
        "interval": key.interval,
        "candles": data,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    interval: Option<String>,
    hours: Option<i64>,
}

/// Number of buckets covering `hours`, clamped to one page.
fn historical_limit(hours: i64, step_secs: i64) -> usize {
    let buckets = hours.saturating_mul(3600) / step_secs.max(1);
    buckets.clamp(1, MAX_CANDLES_LIMIT as i64) as usize
}

async fn historical(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoricalQuery>,
) -> axum::response::Response {
    let key = SeriesKey::new(&symbol, query.interval.as_deref().unwrap_or_default());
    let Some(step) = key.step_secs() else {
        warn!(interval = %key.interval, "historical request with unknown interval");
        return bad_request(format!("unsupported interval '{}'", key.interval));
    };

    let hours = query.hours.unwrap_or(DEFAULT_HISTORICAL_HOURS);
    let limit = historical_limit(hours, step);
    let data = ms_view(&state.series_or_empty(&key, limit).await);

    Json(serde_json::json!({
        "symbol": key.symbol,
        "interval": key.interval,
        "hours": hours,
        "count": data.len(),
        "data": data,
    }))
    .into_response()
}

// =============================================================================
// Diagnostics
// =============================================================================

async fn store_keys(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match state.store.keys_info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => {
            warn!(error = %e, "failed to list store keys");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn pipeline(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_pipeline_snapshot().await)
}

async fn streaming_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_streaming_status().await)
}

#[derive(Debug, Deserialize)]
pub struct DetailsQuery {
    limit: Option<usize>,
}

async fn candle_details(
    State(state): State<Arc<AppState>>,
    Path((symbol, interval)): Path<(String, String)>,
    Query(query): Query<DetailsQuery>,
) -> impl IntoResponse {
    let key = SeriesKey::new(&symbol, &interval);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DETAIL_LIMIT)
        .clamp(1, MAX_CANDLES_LIMIT);
    let candles = state.series_or_empty(&key, limit).await;
    let close_prices: Vec<f64> = candles.iter().map(|c| c.close).collect();

    Json(serde_json::json!({
        "key": key.store_key(),
        "symbol": key.symbol,
        "interval": key.interval,
        "count": candles.len(),
        "candles": candles,
        "close_prices": close_prices,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ValidateQuery {
    interval: Option<String>,
}

/// PASS when the configured symbols do not all share one last close, i.e.
/// every series carries its own data.
async fn validate_candles(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ValidateQuery>,
) -> impl IntoResponse {
    let interval = query.interval.as_deref().unwrap_or(DEFAULT_INTERVAL);

    let mut last_closes: BTreeMap<String, f64> = BTreeMap::new();
    for symbol in &state.config.symbols {
        let key = SeriesKey::new(symbol, interval);
        if let Some(last) = state.series_or_empty(&key, 1).await.last() {
            last_closes.insert(key.symbol.clone(), last.close);
        }
    }

    let closes: Vec<f64> = last_closes.values().copied().collect();
    let (result, reason) = if closes.len() < 2 {
        ("FAIL", "insufficient data: fewer than 2 symbols have candles")
    } else if closes.windows(2).all(|w| w[0] == w[1]) {
        ("FAIL", "every symbol has the same last close")
    } else {
        ("PASS", "last close differs per symbol")
    };
    debug!(interval, result, symbols = closes.len(), "candle validation");

    Json(serde_json::json!({
        "result": result,
        "reason": reason,
        "last_closes": last_closes,
    }))
}

/// Ready once the first configured series holds data.
async fn verify_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let ready = match state.config.series_keys().first() {
        Some(key) => !state.series_or_empty(key, 1).await.is_empty(),
        None => false,
    };
    let message = if ready {
        "relay up and history loaded"
    } else {
        "bootstrap not ready or no candle data"
    };
    Json(serde_json::json!({ "ok": ready, "message": message }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::broadcast::Broadcaster;
    use crate::market_data::store::{candle_at, CandleStore, MemoryStore};
    use crate::market_data::StreamStatus;
    use crate::runtime_config::RuntimeConfig;

    async fn app_with(candles: Vec<Candle>) -> Router {
        app_with_series(vec![(SeriesKey::new("BTCUSDT", "1m"), candles)]).await
    }

    async fn app_with_series(series: Vec<(SeriesKey, Vec<Candle>)>) -> Router {
        let store = Arc::new(MemoryStore::new(1000));
        for (key, candles) in series {
            store.replace(&key, candles).await.unwrap();
        }
        let config = RuntimeConfig {
            symbols: vec!["BTCUSDT".into(), "ETHUSDT".into()],
            intervals: vec!["1m".into()],
            ..RuntimeConfig::default()
        };
        let state = Arc::new(AppState::new(
            config,
            store,
            Arc::new(Broadcaster::default()),
            Arc::new(StreamStatus::new()),
        ));
        router(state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    fn minutes(n: i64) -> Vec<Candle> {
        (1..=n).map(|i| candle_at(i * 60, i as f64)).collect()
    }

    #[test]
    fn limit_outside_range_falls_back() {
        assert_eq!(effective_limit(None), 500);
        assert_eq!(effective_limit(Some(0)), 500);
        assert_eq!(effective_limit(Some(1001)), 500);
        assert_eq!(effective_limit(Some(-5)), 500);
        assert_eq!(effective_limit(Some(1)), 1);
        assert_eq!(effective_limit(Some(1000)), 1000);
    }

    #[test]
    fn historical_limit_is_clamped() {
        assert_eq!(historical_limit(12, 60), 720);
        assert_eq!(historical_limit(48, 60), 1000);
        assert_eq!(historical_limit(0, 60), 1);
        assert_eq!(historical_limit(1, 14_400), 1);
        assert_eq!(historical_limit(24, 3_600), 24);
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = get_json(app_with(Vec::new()).await, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert!(body["server_time"].as_i64().is_some());
    }

    #[tokio::test]
    async fn candles_are_normalised_and_limited() {
        let app = app_with(minutes(10)).await;
        let (status, body) = get_json(app, "/candles/btcusdt/1M?limit=3").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["symbol"], "BTCUSDT");
        assert_eq!(body["interval"], "1m");
        let candles = body["candles"].as_array().unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[0]["time"], 480);
        assert_eq!(candles[2]["time"], 600);
    }

    #[tokio::test]
    async fn unknown_series_is_empty_not_an_error() {
        let (status, body) = get_json(app_with(minutes(3)).await, "/candles/DOGEUSDT/1m").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["candles"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn historical_uses_milliseconds() {
        let app = app_with(minutes(5)).await;
        let (status, body) = get_json(app, "/api/historical/BTCUSDT?interval=1m&hours=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 5);
        assert_eq!(body["hours"], 1);
        assert_eq!(body["data"][0]["time"], 60_000);
        assert_eq!(body["data"][0]["is_closed"], true);
    }

    #[tokio::test]
    async fn historical_rejects_unknown_interval() {
        let (status, body) =
            get_json(app_with(Vec::new()).await, "/api/historical/BTCUSDT?interval=7m").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("7m"));
    }

    #[tokio::test]
    async fn store_keys_and_status_report_contents() {
        let (_, keys) = get_json(app_with(minutes(4)).await, "/debug/store-keys").await;
        assert_eq!(keys["candles:BTCUSDT:1m"]["count"], 4);
        assert_eq!(keys["candles:BTCUSDT:1m"]["last_time"], 240);

        let (_, status) = get_json(app_with(minutes(4)).await, "/streaming/status").await;
        let pairs = status["pairs"].as_array().unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0]["count"], 4);
        assert_eq!(pairs[0]["close"], 4.0);
        assert_eq!(pairs[1]["count"], 0);
        assert!(status["last_store_update_ts"].as_i64().is_some());

        let (_, pipeline) = get_json(app_with(minutes(4)).await, "/debug/pipeline").await;
        assert_eq!(pipeline["series"][0]["first_time"], 60);
        assert_eq!(pipeline["stream"]["state"], "disconnected");
    }

    #[tokio::test]
    async fn symbols_lists_configuration() {
        let (_, body) = get_json(app_with(Vec::new()).await, "/symbols").await;
        assert_eq!(body["symbols"], serde_json::json!(["BTCUSDT", "ETHUSDT"]));
        assert_eq!(body["intervals"], serde_json::json!(["1m"]));
    }

    #[tokio::test]
    async fn candle_details_lists_recent_closes() {
        let app = app_with(minutes(10)).await;
        let (status, body) = get_json(app, "/debug/candle-details/btcusdt/1m?limit=2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key"], "candles:BTCUSDT:1m");
        assert_eq!(body["count"], 2);
        assert_eq!(body["close_prices"], serde_json::json!([9.0, 10.0]));

        let (_, body) = get_json(app_with(minutes(10)).await, "/debug/candle-details/BTCUSDT/1m").await;
        assert_eq!(body["count"], 5);
    }

    #[tokio::test]
    async fn validation_compares_last_closes() {
        let btc = SeriesKey::new("BTCUSDT", "1m");
        let eth = SeriesKey::new("ETHUSDT", "1m");

        let (_, body) = get_json(app_with(minutes(3)).await, "/validate/candles").await;
        assert_eq!(body["result"], "FAIL");
        assert_eq!(body["last_closes"]["BTCUSDT"], 3.0);

        let same = app_with_series(vec![
            (btc.clone(), vec![candle_at(60, 5.0)]),
            (eth.clone(), vec![candle_at(60, 5.0)]),
        ])
        .await;
        let (_, body) = get_json(same, "/validate/candles?interval=1m").await;
        assert_eq!(body["result"], "FAIL");

        let distinct = app_with_series(vec![
            (btc, vec![candle_at(60, 37_000.0)]),
            (eth, vec![candle_at(60, 2_000.0)]),
        ])
        .await;
        let (_, body) = get_json(distinct, "/validate/candles").await;
        assert_eq!(body["result"], "PASS");
        assert_eq!(body["last_closes"]["ETHUSDT"], 2_000.0);
    }

    #[tokio::test]
    async fn verify_status_tracks_bootstrap() {
        let (_, body) = get_json(app_with(Vec::new()).await, "/verify/status").await;
        assert_eq!(body["ok"], false);

        let (_, body) = get_json(app_with(minutes(1)).await, "/verify/status").await;
        assert_eq!(body["ok"], true);
    }
}
