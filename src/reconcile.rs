// =============================================================================
// Gap Reconciler: continuity check, backfill and write for each live update
// =============================================================================
//
// For every candle routed from the upstream stream:
//
//   1. Take the per-key lock.
//   2. Read the series tail.
//        empty               → fetch the most recent `capacity` candles and
//                              replace the series first.
//        new > last + step   → fetch [last + step, new - step] and upsert
//                              every returned candle. The start is clamped
//                              so no more than `capacity - 1` buckets are
//                              requested.
//   3. Upsert the triggering candle.
//   4. Release the lock, then publish the triggering candle.
//
// Holding the lock across check → fill → write means two updates for the same
// key can never trigger overlapping backfills. A failed fill is logged and the
// triggering candle is written regardless.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::broadcast::Broadcaster;
use crate::market_data::backfill::BackfillClient;
use crate::market_data::store::{CandleStore, KeyedLocks};
use crate::market_data::{Candle, SeriesKey};

/// What reconciliation did before writing the triggering candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Series was contiguous (or the update revised an existing bucket).
    Appended,
    /// Series was empty; `fetched` historical candles were loaded first.
    Bootstrapped { fetched: usize },
    /// `missing` buckets were requested; `fetched` of them were recovered.
    GapFilled { missing: usize, fetched: usize },
}

pub struct GapReconciler {
    store: Arc<dyn CandleStore>,
    backfill: Arc<BackfillClient>,
    broadcaster: Arc<Broadcaster>,
    locks: KeyedLocks,
}

impl GapReconciler {
    pub fn new(
        store: Arc<dyn CandleStore>,
        backfill: Arc<BackfillClient>,
        broadcaster: Arc<Broadcaster>,
    ) -> Self {
        Self {
            store,
            backfill,
            broadcaster,
            locks: KeyedLocks::new(),
        }
    }

    /// Reconcile, store and publish one live candle.
    pub async fn apply(&self, key: &SeriesKey, candle: Candle) -> ReconcileOutcome {
        let outcome = {
            let _guard = self.locks.lock(key).await;
            let outcome = self.fill_before(key, &candle).await;
            if let Err(e) = self.store.upsert(key, candle.clone()).await {
                warn!(key = %key, time = candle.time, error = %e, "failed to store live candle");
            }
            outcome
        };

        self.broadcaster.publish(key, &candle);
        outcome
    }

    /// Make the series contiguous up to (but excluding) `candle`.
    async fn fill_before(&self, key: &SeriesKey, candle: &Candle) -> ReconcileOutcome {
        let last = match self.store.last(key).await {
            Ok(last) => last,
            Err(e) => {
                warn!(key = %key, error = %e, "store read failed — treating series as empty");
                None
            }
        };

        let Some(last) = last else {
            let history = self.backfill.recent(key, self.store.capacity()).await;
            let fetched = history.len();
            if fetched > 0 {
                if let Err(e) = self.store.replace(key, history).await {
                    warn!(key = %key, error = %e, "failed to store bootstrap history");
                }
            }
            info!(key = %key, fetched, "empty series bootstrapped from history");
            return ReconcileOutcome::Bootstrapped { fetched };
        };

        let Some(step) = key.step_secs() else {
            warn!(key = %key, "unknown interval — skipping gap check");
            return ReconcileOutcome::Appended;
        };

        if candle.time <= last.time + step {
            return ReconcileOutcome::Appended;
        }

        let gap_start = last.time + step;
        let end = candle.time - step;
        if end < gap_start {
            // Misaligned timestamp: no whole bucket lies between the two.
            return ReconcileOutcome::Appended;
        }

        // Buckets older than `capacity - 1` before the update would be evicted
        // as soon as they were written; never fetch them.
        let keep = self.store.capacity().saturating_sub(1) as i64;
        let start = gap_start.max(candle.time - keep * step);
        if end < start {
            return ReconcileOutcome::Appended;
        }

        let missing = ((end - start) / step + 1) as usize;
        let skipped = (start - gap_start) / step;
        warn!(
            key = %key,
            last = last.time,
            incoming = candle.time,
            missing,
            skipped,
            "gap detected — backfilling"
        );

        let gap = self.backfill.range(key, start, end).await;
        let fetched = gap.len();
        for filler in gap {
            if let Err(e) = self.store.upsert(key, filler).await {
                warn!(key = %key, error = %e, "failed to store backfilled candle");
            }
        }

        if fetched < missing {
            warn!(key = %key, missing, fetched, "gap only partially filled");
        } else {
            debug!(key = %key, fetched, "gap filled");
        }
        ReconcileOutcome::GapFilled { missing, fetched }
    }
}

// =============================================================================
// Tests
// =============================================================================
