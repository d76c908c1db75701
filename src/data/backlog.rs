/// Calculation backlog tracking
///
/// The store is the source of truth: every count is a live query, nothing
/// is cached between calls. A bar is pending while it is uncalculated or
/// was calculated at a version older than the target.
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::data::store::BarStore;
use crate::error::{PipelineError, Result};
use crate::time::Clock;
use crate::types::{Bar, BacklogSnapshot, BacklogStatus, ResetScope, Timeframe};

pub struct BacklogTracker {
    pair: String,
    store: Arc<dyn BarStore>,
    clock: Arc<dyn Clock>,
    target_version: u32,
    batch_size: usize,
}

impl BacklogTracker {
    pub fn new(
        pair: String,
        store: Arc<dyn BarStore>,
        clock: Arc<dyn Clock>,
        target_version: u32,
        batch_size: usize,
    ) -> Self {
        BacklogTracker {
            pair,
            store,
            clock,
            target_version,
            batch_size: batch_size.max(1),
        }
    }

    pub fn target_version(&self) -> u32 {
        self.target_version
    }

    /// Pending bars per timeframe
    pub async fn detect_differences(&self) -> Result<BTreeMap<Timeframe, usize>> {
        let mut pending = BTreeMap::new();

        for timeframe in Timeframe::all() {
            let snapshot = self.snapshot(timeframe).await?;
            pending.insert(timeframe, snapshot.uncalculated);
        }

        Ok(pending)
    }

    /// Oldest-first pending bars, at most `limit`
    pub async fn get_uncalculated(&self, timeframe: Timeframe, limit: usize) -> Result<Vec<Bar>> {
        self.store
            .find_pending(&self.pair, timeframe, self.target_version, limit)
            .await
    }

    /// Flag `bars` as calculated at `version` in one atomic batch.
    ///
    /// Bars already calculated at exactly `version` are left alone. Fails
    /// with `StaleVersion` if any stored bar was calculated at a newer
    /// version, and returns false if a bar no longer exists or its OHLCV was
    /// replaced since it was read; in both cases nothing is written.
    pub async fn mark_calculated(&self, bars: &[Bar], version: u32) -> Result<bool> {
        let now = self.clock.now();
        let mut updates = Vec::with_capacity(bars.len());

        for bar in bars {
            let stored = match self
                .store
                .find_by_timestamp_and_source(bar.timestamp, &bar.pair, &bar.source)
                .await?
            {
                Some(stored) if stored.same_ohlcv(bar) => stored,
                Some(_) => {
                    warn!(
                        "Cannot mark {} {} @ {}: bar was replaced",
                        bar.pair, bar.source, bar.timestamp
                    );
                    return Ok(false);
                }
                None => {
                    warn!(
                        "Cannot mark {} {} @ {}: bar no longer stored",
                        bar.pair, bar.source, bar.timestamp
                    );
                    return Ok(false);
                }
            };

            if stored.calculated && stored.calculated_version > version {
                return Err(PipelineError::StaleVersion(format!(
                    "{} {} @ {} is at version {}, refusing {}",
                    stored.pair, stored.source, stored.timestamp, stored.calculated_version, version
                )));
            }

            if stored.calculated && stored.calculated_version == version {
                continue;
            }

            let mut update = stored;
            update.calculated = true;
            update.calculated_at = Some(now);
            update.calculated_version = version;
            updates.push(update);
        }

        if updates.is_empty() {
            return Ok(true);
        }

        let applied = self.store.update_flags_batch(&updates).await?;
        if applied {
            debug!(
                "Marked {} of {} bars calculated at v{}",
                updates.len(),
                bars.len(),
                version
            );
        }
        Ok(applied)
    }

    /// Clear calculation flags so the scope is recomputed. Returns the number of bars cleared.
    pub async fn reset(&self, scope: ResetScope) -> Result<usize> {
        let mut cleared = 0;

        for timeframe in scope.timeframes() {
            let mut cursor = DateTime::<Utc>::MIN_UTC;

            loop {
                let page = self
                    .store
                    .find_calculated_after(&self.pair, timeframe, cursor, self.batch_size)
                    .await?;
                let Some(last) = page.last() else {
                    break;
                };
                cursor = last.timestamp;

                let updates: Vec<Bar> = page
                    .iter()
                    .cloned()
                    .map(|mut bar| {
                        bar.clear_calculation();
                        bar
                    })
                    .collect();

                if !self.store.update_flags_batch(&updates).await? {
                    return Err(PipelineError::Store(format!(
                        "Reset of {} {} interrupted: bars changed underneath",
                        self.pair, timeframe
                    )));
                }
                cleared += updates.len();

                if page.len() < self.batch_size {
                    break;
                }
            }
        }

        info!("Reset {} bars for {} ({:?})", cleared, self.pair, scope);
        Ok(cleared)
    }

    async fn snapshot(&self, timeframe: Timeframe) -> Result<BacklogSnapshot> {
        let total = self.store.count_bars(&self.pair, timeframe).await?;
        let calculated = self
            .store
            .count_calculated(&self.pair, timeframe, self.target_version)
            .await?;
        Ok(BacklogSnapshot::new(total, calculated))
    }

    pub async fn get_status(&self) -> Result<BacklogStatus> {
        let mut timeframes = BTreeMap::new();
        let mut overall = BacklogSnapshot::new(0, 0);

        for timeframe in Timeframe::all() {
            let snapshot = self.snapshot(timeframe).await?;
            overall = overall.merge(&snapshot);
            timeframes.insert(timeframe, snapshot);
        }

        Ok(BacklogStatus {
            pair: self.pair.clone(),
            target_version: self.target_version,
            generated_at: self.clock.now(),
            timeframes,
            overall,
        })
    }

    /// Calculated bars newer than `last_seen`, ascending. Downstream consumers
    /// page through by passing the last timestamp they saw.
    pub async fn get_calculated_since(
        &self,
        timeframe: Timeframe,
        last_seen: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        self.store
            .find_calculated_after(&self.pair, timeframe, last_seen, limit)
            .await
    }
}
