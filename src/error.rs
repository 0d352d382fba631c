// =============================================================================
// Ingest errors: typed failure categories of the upstream session
// =============================================================================

use std::time::Duration;

use thiserror::Error;

/// A server close after at least this much connected time is treated as the
/// exchange's scheduled rotation and redialled at once.
pub const ROTATION_MIN_UPTIME: Duration = Duration::from_secs(3600);

/// Why an upstream session ended.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no streams configured")]
    NoStreams,

    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("stream transport failed: {0}")]
    Transport(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("upstream closed the connection after {uptime_secs}s ({reason})")]
    ServerClosed { reason: String, uptime_secs: u64 },

    #[error("no frame received for {silent_secs}s")]
    HeartbeatTimeout { silent_secs: u64 },

    #[error("stream ended")]
    StreamEnded,
}

/// What the connection loop does after a failed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    RetryImmediately,
    RetryAfterDelay,
    Abort,
}

impl IngestError {
    pub fn recovery(&self) -> Recovery {
        match self {
            IngestError::NoStreams => Recovery::Abort,
            // Only a long-lived session closing looks like the 24 h rotation. A
            // close soon after connecting (rejected streams, rate limits) waits.
            IngestError::ServerClosed { uptime_secs, .. }
                if *uptime_secs >= ROTATION_MIN_UPTIME.as_secs() =>
            {
                Recovery::RetryImmediately
            }
            IngestError::ServerClosed { .. }
            | IngestError::Connect { .. }
            | IngestError::Transport(_)
            | IngestError::HeartbeatTimeout { .. }
            | IngestError::StreamEnded => Recovery::RetryAfterDelay,
        }
    }
}
