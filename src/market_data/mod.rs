pub mod backfill;
pub mod candle;
pub mod kline_stream;
pub mod store;
pub mod stream_status;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{Candle, SeriesKey};
pub use stream_status::StreamStatus;
