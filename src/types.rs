// =============================================================================
// Shared types used across the candle relay
// =============================================================================

use serde::{Deserialize, Serialize};

/// Which candle store backend the process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Redis
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "Memory"),
            Self::Redis => write!(f, "Redis"),
        }
    }
}
