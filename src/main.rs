// =============================================================================
// Candle Relay: Main Entry Point
// =============================================================================
//
// Startup order matters: the store is filled by bootstrap before the live
// stream attaches, so the first live candle for each series finds history to
// reconcile against. Ctrl+C cancels the ingestor and drains the API server.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod bootstrap;
mod broadcast;
mod error;
mod market_data;
mod reconcile;
mod runtime_config;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::broadcast::Broadcaster;
use crate::market_data::backfill::BackfillClient;
use crate::market_data::kline_stream::Ingestor;
use crate::market_data::store::{CandleStore, MemoryStore, RedisStore};
use crate::market_data::StreamStatus;
use crate::reconcile::GapReconciler;
use crate::runtime_config::{RuntimeConfig, DEFAULT_CONFIG_PATH};
use crate::types::StoreBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Candle Relay — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::resolve(DEFAULT_CONFIG_PATH);
    let keys = config.series_keys();
    info!(
        symbols = ?config.symbols,
        intervals = ?config.intervals,
        series = keys.len(),
        backend = %config.store_backend,
        buffer_size = config.buffer_size,
        "Configured candle series"
    );

    // ── 2. Candle store ──────────────────────────────────────────────────
    let store: Arc<dyn CandleStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(config.buffer_size)),
        StoreBackend::Redis => Arc::new(
            RedisStore::connect(&config.redis_url, config.buffer_size)
                .await
                .context("redis store unavailable (set USE_MEMORY_STORE=1 to run without it)")?,
        ),
    };

    // ── 3. Upstream history & fan-out ────────────────────────────────────
    let binance_client = Arc::new(BinanceClient::new(config.rest_base_url.clone())?);
    let backfill = Arc::new(BackfillClient::new(binance_client));
    let broadcaster = Arc::new(Broadcaster::default());
    let stream_status = Arc::new(StreamStatus::new());

    // ── 4. Bootstrap history ─────────────────────────────────────────────
    let summary = bootstrap::bootstrap_all(&keys, &backfill, store.as_ref()).await;
    if summary.empty > 0 {
        warn!(
            empty = summary.empty,
            "some series start empty — they will fill on their first live candle"
        );
    }

    // ── 5. Live ingestion ────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let reconciler = Arc::new(GapReconciler::new(
        store.clone(),
        backfill.clone(),
        broadcaster.clone(),
    ));
    let ingestor = Ingestor::new(
        keys,
        config.ingest_settings(),
        reconciler,
        stream_status.clone(),
    );
    let ingest_cancel = cancel.clone();
    let ingest_task = tokio::spawn(async move {
        if let Err(e) = ingestor.run(ingest_cancel).await {
            error!(error = %e, "kline ingestor stopped with an error");
        }
    });

    // ── 6. API server ────────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(config, store, broadcaster, stream_status));
    let app = api::rest::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let shutdown = cancel.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for shutdown signal");
        }
        warn!("Shutdown signal received — stopping gracefully");
        shutdown.cancel();
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    let served = server.await.context("API server failed");
    cancel.cancel();
    if let Err(e) = ingest_task.await {
        error!(error = %e, "ingestor task panicked");
    }

    info!("Candle Relay shut down complete.");
    served
}
